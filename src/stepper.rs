//! Server-authoritative simulation seam.
//!
//! In server-authoritative scenes the tick loop feeds each tick's actions
//! to a researcher-supplied [`Stepper`] and broadcasts the returned render
//! state. The simulator is a pluggable collaborator, never dynamically
//! evaluated source.

use std::collections::HashMap;

use crate::protocol::{GameId, PlayerIndex};

/// Result of stepping the simulation by one tick.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// Authoritative render state broadcast to every member.
    pub render_state: serde_json::Value,
    /// The running episode is finished.
    pub episode_done: bool,
    /// Optional HUD payload attached to the tick broadcast.
    pub hud: Option<serde_json::Value>,
}

/// One step of a researcher-supplied environment. Implementations must be
/// deterministic given the game seed and the action sequence.
pub trait Stepper: Send + Sync {
    fn step(
        &self,
        game_id: GameId,
        tick: u64,
        actions: &HashMap<PlayerIndex, serde_json::Value>,
    ) -> anyhow::Result<StepOutcome>;

    /// Reset for the next episode. The default is stateless.
    fn reset(&self, _game_id: GameId, _episode: u32) {}
}
