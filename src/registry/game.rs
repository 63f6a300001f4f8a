use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::group::PlayerGroup;
use crate::protocol::{GameId, PlayerIndex, SceneId, ServerMessage, TerminationReason};

/// Game status. Transitions are one-way except `Active` <-> `Resetting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Inactive,
    Active,
    Resetting,
    Done,
}

impl GameStatus {
    /// Whether the status machine admits this edge.
    pub fn can_transition(self, to: GameStatus) -> bool {
        use GameStatus as S;
        matches!(
            (self, to),
            (S::Inactive, S::Active)
                | (S::Active, S::Resetting)
                | (S::Resetting, S::Active)
                | (S::Active, S::Done)
                | (S::Resetting, S::Done)
                | (S::Inactive, S::Done)
        )
    }
}

/// One action drained by the tick loop.
#[derive(Debug, Clone)]
pub struct QueuedAction {
    pub tick: u64,
    pub action: serde_json::Value,
    pub episode_done: bool,
}

/// A state hash divergence between peers at one sampled tick.
#[derive(Debug, Clone)]
pub struct DesyncEvent {
    pub tick: u64,
    pub hashes: HashMap<PlayerIndex, u64>,
}

/// Peer-coordination state attached to a game when the scene opts into a
/// peer mode. Lifecycle coincides with the game.
#[derive(Debug, Default)]
pub struct PeerSessionState {
    /// Signaling payloads parked for members with no live connection,
    /// oldest first. Flushed on restore, dropped at teardown.
    pub signaling_buffer: HashMap<PlayerIndex, VecDeque<ServerMessage>>,
    /// Recent sampled hashes by tick, pruned once every member has
    /// confirmed past that tick.
    pub hash_ring: BTreeMap<u64, HashMap<PlayerIndex, u64>>,
    /// Actions flow through the broker while any member reports its direct
    /// channel as degraded or unestablished.
    pub fallback_relay_enabled: bool,
    /// Incremented on every authoritative resync broadcast.
    pub validation_epoch: u64,
    /// Tick of the resync currently awaiting a `resync_state` reply.
    pub resync_in_flight: Option<u64>,
}

impl PeerSessionState {
    /// Record one member's sample. When every expected member has reported
    /// for that tick the entry is compared, pruned, and a [`DesyncEvent`] is
    /// returned on mismatch.
    pub fn record_hash(
        &mut self,
        tick: u64,
        player_index: PlayerIndex,
        hash: u64,
        expected: usize,
    ) -> Option<DesyncEvent> {
        let samples = self.hash_ring.entry(tick).or_default();
        samples.insert(player_index, hash);
        if samples.len() < expected {
            return None;
        }

        let samples = self.hash_ring.remove(&tick)?;
        // All members confirmed past this tick; older partial entries are
        // stale and will never complete.
        self.hash_ring.retain(|&t, _| t > tick);

        let mut values = samples.values();
        let first = *values.next()?;
        if values.all(|&h| h == first) {
            None
        } else {
            Some(DesyncEvent {
                tick,
                hashes: samples,
            })
        }
    }

    pub fn buffer_signaling(&mut self, player_index: PlayerIndex, message: ServerMessage) {
        self.signaling_buffer
            .entry(player_index)
            .or_default()
            .push_back(message);
    }

    pub fn drain_signaling(&mut self, player_index: PlayerIndex) -> Vec<ServerMessage> {
        self.signaling_buffer
            .remove(&player_index)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }
}

/// Mutable game state, guarded by the per-game lock (last in the lock
/// order; nothing else is acquired while it is held).
#[derive(Debug)]
pub struct GameState {
    pub status: GameStatus,
    /// Strictly monotonic across the whole game, including across resets.
    pub tick_seq: u64,
    /// 0-based episode counter.
    pub episode: u32,
    pub episode_start_tick: u64,
    pub queued_actions: HashMap<PlayerIndex, VecDeque<QueuedAction>>,
    pub last_actions: HashMap<PlayerIndex, serde_json::Value>,
    pub reset_acks: HashSet<PlayerIndex>,
    /// Members currently inside their disconnect grace window.
    pub disconnected: HashSet<PlayerIndex>,
    /// A peer or the stepper flagged the running episode as finished.
    pub episode_done_requested: bool,
    /// Malformed/ill-timed message count per member inside this game;
    /// crossing the threshold marks the member for exclusion.
    pub member_errors: HashMap<PlayerIndex, u32>,
    pub partial: bool,
    pub termination_reason: Option<TerminationReason>,
    pub peer: Option<PeerSessionState>,
}

impl GameState {
    fn new(peer_enabled: bool) -> Self {
        Self {
            status: GameStatus::Inactive,
            tick_seq: 0,
            episode: 0,
            episode_start_tick: 0,
            queued_actions: HashMap::new(),
            last_actions: HashMap::new(),
            reset_acks: HashSet::new(),
            disconnected: HashSet::new(),
            episode_done_requested: false,
            member_errors: HashMap::new(),
            partial: false,
            termination_reason: None,
            peer: peer_enabled.then(PeerSessionState::default),
        }
    }

    /// Apply a status edge, logging and refusing anything off the table.
    pub fn set_status(&mut self, game_id: GameId, to: GameStatus) -> bool {
        if self.status.can_transition(to) {
            tracing::debug!(%game_id, from = ?self.status, to = ?to, "game status transition");
            self.status = to;
            true
        } else {
            tracing::warn!(
                %game_id,
                from = ?self.status,
                to = ?to,
                "rejected invalid game status transition"
            );
            false
        }
    }
}

/// One run of an interactive scene for a single group. The registry owns the
/// entity; subsystems reach mutable state through [`Game::state`].
#[derive(Debug)]
pub struct Game {
    pub id: GameId,
    pub scene_id: SceneId,
    pub scene_index: usize,
    pub group: PlayerGroup,
    pub created_at: DateTime<Utc>,
    /// Uniform random 64-bit seed, fixed for the game's lifetime. Episode
    /// resets never regenerate it.
    pub seed: u64,
    /// Group size including synthetic bot slots.
    pub expected_player_count: usize,
    /// Player indices backed by bots rather than humans.
    pub bot_slots: Vec<PlayerIndex>,
    /// Cancelling stops the tick loop.
    pub cancel: CancellationToken,
    /// Wakes a tick blocked on missing actions.
    pub action_notify: Notify,
    pub state: Mutex<GameState>,
}

impl Game {
    pub fn new(
        scene_id: SceneId,
        scene_index: usize,
        group: PlayerGroup,
        seed: u64,
        bot_slots: Vec<PlayerIndex>,
        peer_enabled: bool,
    ) -> Self {
        let expected_player_count = group.len() + bot_slots.len();
        Self {
            id: Uuid::new_v4(),
            scene_id,
            scene_index,
            group,
            created_at: Utc::now(),
            seed,
            expected_player_count,
            bot_slots,
            cancel: CancellationToken::new(),
            action_notify: Notify::new(),
            state: Mutex::new(GameState::new(peer_enabled)),
        }
    }

    pub fn is_bot_slot(&self, index: PlayerIndex) -> bool {
        self.bot_slots.contains(&index)
    }

    /// Human member count (bot slots excluded).
    pub fn human_count(&self) -> usize {
        self.group.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ParticipantId;

    fn two_player_game() -> Game {
        let group = PlayerGroup::new(
            SceneId::from("scene"),
            [ParticipantId::from("a"), ParticipantId::from("b")],
        );
        Game::new(SceneId::from("scene"), 1, group, 42, Vec::new(), true)
    }

    #[test]
    fn status_edges_follow_the_table() {
        use GameStatus as S;
        assert!(S::Inactive.can_transition(S::Active));
        assert!(S::Active.can_transition(S::Resetting));
        assert!(S::Resetting.can_transition(S::Active));
        assert!(S::Active.can_transition(S::Done));
        assert!(!S::Done.can_transition(S::Active));
        assert!(!S::Resetting.can_transition(S::Inactive));
        assert!(!S::Done.can_transition(S::Resetting));
    }

    #[tokio::test]
    async fn invalid_status_transition_is_refused() {
        let game = two_player_game();
        let mut state = game.state.lock().await;
        assert!(state.set_status(game.id, GameStatus::Active));
        assert!(state.set_status(game.id, GameStatus::Done));
        assert!(!state.set_status(game.id, GameStatus::Active));
        assert_eq!(state.status, GameStatus::Done);
    }

    #[test]
    fn matching_hashes_prune_without_desync() {
        let mut peer = PeerSessionState::default();
        assert!(peer.record_hash(30, 0, 0xABCD, 2).is_none());
        assert!(peer.record_hash(30, 1, 0xABCD, 2).is_none());
        assert!(peer.hash_ring.is_empty());
    }

    #[test]
    fn mismatched_hashes_report_desync() {
        let mut peer = PeerSessionState::default();
        assert!(peer.record_hash(60, 0, 0xAAAA, 2).is_none());
        let event = peer.record_hash(60, 1, 0xBBBB, 2).expect("desync");
        assert_eq!(event.tick, 60);
        assert_eq!(event.hashes[&0], 0xAAAA);
        assert_eq!(event.hashes[&1], 0xBBBB);
    }

    #[test]
    fn completed_tick_prunes_stale_partials() {
        let mut peer = PeerSessionState::default();
        peer.record_hash(30, 0, 1, 2);
        peer.record_hash(60, 0, 2, 2);
        peer.record_hash(60, 1, 2, 2);
        // Tick 30 can never complete once 60 is confirmed by everyone.
        assert!(peer.hash_ring.is_empty());
    }

    #[test]
    fn bot_slots_extend_expected_count() {
        let group = PlayerGroup::new(SceneId::from("scene"), [ParticipantId::from("a")]);
        let game = Game::new(SceneId::from("scene"), 0, group, 7, vec![1], true);
        assert_eq!(game.expected_player_count, 2);
        assert!(game.is_bot_slot(1));
        assert!(!game.is_bot_slot(0));
        assert_eq!(game.human_count(), 1);
    }
}
