use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngExt as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Reserved globals keys owned by the server. Client writes to these are
/// ignored during `sync_globals` merging.
pub const RESERVED_GLOBAL_KEYS: &[&str] = &["participant_id", "session_id", "scene_index"];

/// Unique identifier for live transport connections
pub type ConnectionId = Uuid;
/// Unique identifier for game instances
pub type GameId = Uuid;
/// Unique identifier for probe sessions
pub type ProbeId = Uuid;

/// Zero-based slot of a participant inside a group's ordered member list
pub type PlayerIndex = u8;

/// Stable opaque identifier for a participant. Survives reconnects for the
/// whole server lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Allocate a fresh participant id when the client did not claim one.
    pub fn generate() -> Self {
        Self(format!("p_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Per-experiment session identifier: 16 random bytes, base64url without
/// padding. One-to-one with a participant and immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        let mut raw = [0u8; 16];
        rand::rng().fill(&mut raw[..]);
        Self(URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque key for a scene, used for data bucketing and waitroom partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SceneId(pub String);

impl SceneId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SceneId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Researcher-visible key/value bag attached to a session.
pub type Globals = HashMap<String, serde_json::Value>;

/// Lifecycle state of a participant. Transitions follow [`ParticipantEvent`];
/// anything else is rejected and logged, never panicked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    #[default]
    Idle,
    InWaitroom,
    InGame,
    GameEnded,
    Ended,
}

/// Events that drive the participant state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantEvent {
    EnterWaitroom,
    Matched,
    WaitroomTimeout,
    WaitroomDropout,
    GameEndedNormally,
    ExcludedSelf,
    Advance,
    FinalSceneAcknowledged,
}

impl ParticipantState {
    /// Apply one event, returning the successor state or `None` when the
    /// transition is not in the table.
    #[must_use]
    pub fn apply(self, event: ParticipantEvent) -> Option<Self> {
        use ParticipantEvent as E;
        use ParticipantState as S;

        // The final scene ack ends the session from any state.
        if event == E::FinalSceneAcknowledged {
            return Some(S::Ended);
        }

        match (self, event) {
            (S::Idle, E::EnterWaitroom) => Some(S::InWaitroom),
            (S::InWaitroom, E::Matched) => Some(S::InGame),
            (S::InWaitroom, E::WaitroomTimeout | E::WaitroomDropout) => Some(S::Ended),
            (S::InGame, E::GameEndedNormally) => Some(S::GameEnded),
            (S::InGame, E::ExcludedSelf) => Some(S::Ended),
            (S::GameEnded, E::Advance) => Some(S::Idle),
            _ => None,
        }
    }

    /// Terminal states admit no further scene activation.
    pub fn is_terminal(self) -> bool {
        self == Self::Ended
    }
}

/// Why a game stopped before (or at) its natural end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// All configured episodes completed.
    Natural,
    /// A member disconnected and the grace window expired.
    PartnerDropout,
    /// A member reported itself excluded (latency, focus loss).
    PartnerExclusion,
    /// Unrecoverable tick-loop or relay error.
    Fatal,
    /// Process-level graceful shutdown.
    ServerShutdown,
}

impl TerminationReason {
    /// Participant-facing wording. Internal detail never leaks here.
    pub fn neutral_message(&self) -> &'static str {
        match self {
            Self::Natural => "The game has ended.",
            Self::PartnerDropout | Self::PartnerExclusion => {
                "Your partner experienced a technical issue, so this game has ended."
            }
            Self::Fatal => "A technical issue ended this game early.",
            Self::ServerShutdown => "The study server is shutting down.",
        }
    }

    /// Non-natural endings mark the affected session data as partial.
    pub fn is_partial(&self) -> bool {
        !matches!(self, Self::Natural)
    }
}

/// Snapshot of a scene's queue shared over the wire in `waiting_room_status`
/// updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitroomStatus {
    pub scene_id: SceneId,
    pub waiting_count: usize,
    pub group_size: usize,
    pub elapsed_sec: u64,
    pub max_wait_sec: u64,
}

/// STUN/TURN credentials handed to peers at registration so they can attempt
/// a direct channel.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_16_bytes_base64url() {
        let id = SessionId::generate();
        let decoded = URL_SAFE_NO_PAD.decode(id.as_str()).unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(SessionId::generate(), id);
    }

    #[test]
    fn state_machine_accepts_table_transitions() {
        use ParticipantEvent as E;
        use ParticipantState as S;

        assert_eq!(S::Idle.apply(E::EnterWaitroom), Some(S::InWaitroom));
        assert_eq!(S::InWaitroom.apply(E::Matched), Some(S::InGame));
        assert_eq!(S::InWaitroom.apply(E::WaitroomTimeout), Some(S::Ended));
        assert_eq!(S::InGame.apply(E::GameEndedNormally), Some(S::GameEnded));
        assert_eq!(S::InGame.apply(E::ExcludedSelf), Some(S::Ended));
        assert_eq!(S::GameEnded.apply(E::Advance), Some(S::Idle));
    }

    #[test]
    fn state_machine_rejects_off_table_transitions() {
        use ParticipantEvent as E;
        use ParticipantState as S;

        assert_eq!(S::Idle.apply(E::Matched), None);
        assert_eq!(S::InGame.apply(E::EnterWaitroom), None);
        assert_eq!(S::Ended.apply(E::Advance), None);
        assert_eq!(S::GameEnded.apply(E::Matched), None);
    }

    #[test]
    fn final_scene_ack_ends_from_any_state() {
        use ParticipantEvent as E;
        use ParticipantState as S;

        for state in [S::Idle, S::InWaitroom, S::InGame, S::GameEnded, S::Ended] {
            assert_eq!(state.apply(E::FinalSceneAcknowledged), Some(S::Ended));
        }
    }

    #[test]
    fn non_natural_terminations_are_partial() {
        assert!(!TerminationReason::Natural.is_partial());
        assert!(TerminationReason::PartnerDropout.is_partial());
        assert!(TerminationReason::PartnerExclusion.is_partial());
        assert!(TerminationReason::Fatal.is_partial());
    }
}
