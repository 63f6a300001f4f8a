use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error_codes::ErrorCode;
use super::types::{
    GameId, Globals, IceServerConfig, ParticipantId, ParticipantState, PlayerIndex, ProbeId,
    SceneId, SessionId, WaitroomStatus,
};
use crate::config::SceneKind;

/// Device/browser/latency context shipped with `submit_screening`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScreeningContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Client-measured round trip to the server, milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measured_rtt_ms: Option<u32>,
    /// Researcher-defined extras, passed to the screening callback untouched.
    #[serde(default)]
    pub extra: Globals,
}

/// Message types sent from client to server. Variant names are the wire
/// opcodes (snake_case).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to a participant (MUST be first message).
    /// A claimed id without a matching token is treated as unknown.
    Register {
        #[serde(skip_serializing_if = "Option::is_none")]
        claimed_participant_id: Option<ParticipantId>,
        /// HMAC token issued with the original session, required to restore.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        /// Client-side globals shipped at connect time.
        #[serde(default)]
        globals: Globals,
    },
    /// Entry screening answers for experiment admission.
    SubmitScreening {
        session_id: SessionId,
        context: ScreeningContext,
    },
    /// Acknowledge the current scene and move to the next one. When
    /// `scene_index` is present and trails the session's current scene the
    /// message is a replay and ignored.
    Advance {
        session_id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        scene_index: Option<usize>,
    },
    /// Merge client key/values into the server-side globals bag.
    SyncGlobals {
        session_id: SessionId,
        globals: Globals,
    },
    /// Form data collected from a static scene, keyed by element id.
    StaticSceneData {
        session_id: SessionId,
        scene_id: SceneId,
        elements: HashMap<String, serde_json::Value>,
    },
    /// Join the waiting room of the session's current scene.
    EnqueueForScene {
        session_id: SessionId,
        /// Opaque matcher attributes (skill rating, condition arm, ...).
        #[serde(default)]
        attributes: Globals,
    },
    /// Voluntarily leave the waiting room.
    LeaveWaitroom { session_id: SessionId },
    /// The transient probe channel is ready on this side.
    ProbeReady {
        session_id: SessionId,
        probe_id: ProbeId,
    },
    /// Measured pairwise RTT for a probe, or failure.
    ProbeResult {
        session_id: SessionId,
        probe_id: ProbeId,
        #[serde(skip_serializing_if = "Option::is_none")]
        rtt_ms: Option<u32>,
        success: bool,
    },
    /// One game action for a tick. Relayed to peers when the direct channel
    /// is down; stepped when the scene is server-authoritative.
    Action {
        session_id: SessionId,
        game_id: GameId,
        tick: u64,
        action: serde_json::Value,
        /// Peer-authoritative environments may end the episode explicitly.
        #[serde(default)]
        episode_done: bool,
    },
    /// Compact hash of the peer's confirmed state at a tick.
    StateHashSample {
        session_id: SessionId,
        game_id: GameId,
        tick: u64,
        hash: u64,
    },
    /// Reset acknowledged; the peer is ready for the next episode.
    ResetComplete {
        session_id: SessionId,
        game_id: GameId,
        episode: u32,
    },
    /// Opaque signaling blob for direct peer channel setup. Forwarded to all
    /// other members in order; never parsed.
    Signaling {
        session_id: SessionId,
        game_id: GameId,
        payload: serde_json::Value,
    },
    /// Full-state reply to a `resync_request` (authoritative-resync scenes).
    ResyncState {
        session_id: SessionId,
        game_id: GameId,
        tick: u64,
        state: serde_json::Value,
    },
    /// Self-reported mid-game exclusion (latency threshold, tab hidden).
    SelfExclude {
        session_id: SessionId,
        game_id: GameId,
        reason: String,
    },
    /// Heartbeat to maintain connection.
    Ping,
}

/// Payload for the SessionRestored server message.
/// Boxed in ServerMessage to reduce enum size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRestoredPayload {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub scene_index: usize,
    pub scene_id: SceneId,
    pub state: ParticipantState,
    /// Scene-local state persisted across the disconnect.
    pub scene_state: serde_json::Value,
}

/// Payload for the ExperimentConfig server message.
/// Boxed in ServerMessage to reduce enum size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfigPayload {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    /// Token the client must present to restore this session later.
    pub session_token: String,
    pub scene_count: usize,
    /// Whether entry screening must run before the first scene.
    pub screening_required: bool,
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
    /// Runtime asset peers must pre-load (external-runtime scenes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_preload: Option<String>,
}

/// Payload for the ActivateScene server message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateScenePayload {
    pub scene_id: SceneId,
    pub scene_index: usize,
    pub kind: SceneKind,
    /// Static content / survey elements; null for interactive scenes.
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Payload for the PlayerAssigned server message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerAssignedPayload {
    pub game_id: GameId,
    pub scene_id: SceneId,
    /// 0-based, derived from the group's ordered member list.
    pub player_index: PlayerIndex,
    /// Deterministic-replay seed shared by every member. Never regenerated
    /// across episode resets.
    pub seed: u64,
    pub expected_player_count: usize,
}

/// Message types sent from server to client. Variant names are the wire
/// opcodes (snake_case).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An existing session was rebound to this connection (boxed to reduce
    /// enum size).
    SessionRestored(Box<SessionRestoredPayload>),
    /// Experiment-level config delivered on admission (boxed to reduce enum
    /// size).
    ExperimentConfig(Box<ExperimentConfigPayload>),
    /// Outcome of entry screening.
    ScreeningResult {
        admitted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Activate a scene. Idempotent under reconnect: re-activation of the
    /// current scene must be safe for the client.
    ActivateScene(Box<ActivateScenePayload>),
    /// The current scene ended server-side (timeout, dropout, redirect).
    TerminateScene {
        scene_id: SceneId,
        scene_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        redirect_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Periodic queue snapshot while waiting for a match.
    WaitingRoomStatus(WaitroomStatus),
    /// A confirmed group is counting down to game start.
    MatchCountdown { scene_id: SceneId, seconds: u64 },
    /// Set up a transient direct channel for RTT probing.
    ProbePrepare {
        probe_id: ProbeId,
        scene_id: SceneId,
        /// Exactly one side of each pair initiates the channel.
        is_initiator: bool,
    },
    /// Both sides are ready; start exchanging probe payloads.
    ProbeStart { probe_id: ProbeId },
    /// Game membership, player index, and seed (boxed to reduce enum size).
    PlayerAssigned(Box<PlayerAssignedPayload>),
    /// Per-tick broadcast from the game loop.
    TickBroadcast {
        game_id: GameId,
        tick: u64,
        /// Collected per-tick payloads (score/HUD updates), if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        hud: Option<serde_json::Value>,
        /// Set on sampling ticks; peers reply with `state_hash_sample`.
        #[serde(default)]
        request_hash: bool,
    },
    /// Authoritative render state (server-authoritative scenes only).
    AuthoritativeState {
        game_id: GameId,
        tick: u64,
        state: serde_json::Value,
    },
    /// A relayed peer action (direct-channel fallback).
    RelayAction {
        game_id: GameId,
        player_index: PlayerIndex,
        tick: u64,
        action: serde_json::Value,
    },
    /// A relayed signaling blob from another member.
    Signaling {
        game_id: GameId,
        from_player_index: PlayerIndex,
        payload: serde_json::Value,
    },
    /// Episode boundary: freeze, reset local state, ack with
    /// `reset_complete`.
    ResetGame {
        game_id: GameId,
        episode: u32,
        freeze_sec: u64,
    },
    /// The game is over. `request_export` asks the client for a final data
    /// export through `static_scene_data`.
    EndGame {
        game_id: GameId,
        reason: String,
        partial: bool,
        request_export: bool,
    },
    /// A partner left the game; wording is always neutral.
    PartnerExcluded { game_id: GameId, message: String },
    /// Ask the lowest-indexed peer for full state after a desync
    /// (authoritative-resync scenes).
    ResyncRequest { game_id: GameId, tick: u64 },
    /// This connection was evicted by a newer one for the same participant.
    DuplicateSession { message: String },
    /// The referenced session does not exist; the connection will close.
    InvalidSession { error_code: ErrorCode },
    /// Error message
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
    /// Pong response to ping
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_opcodes_are_snake_case() {
        let msg = ClientMessage::EnqueueForScene {
            session_id: SessionId("abc".into()),
            attributes: Globals::new(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "enqueue_for_scene");

        let msg = ClientMessage::StateHashSample {
            session_id: SessionId("abc".into()),
            game_id: GameId::new_v4(),
            tick: 60,
            hash: 0xAAAA,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "state_hash_sample");
        assert_eq!(value["data"]["tick"], 60);
    }

    #[test]
    fn outbound_opcodes_are_snake_case() {
        let msg = ServerMessage::MatchCountdown {
            scene_id: SceneId::from("game_scene"),
            seconds: 3,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "match_countdown");

        let msg = ServerMessage::PlayerAssigned(Box::new(PlayerAssignedPayload {
            game_id: GameId::new_v4(),
            scene_id: SceneId::from("game_scene"),
            player_index: 1,
            seed: 42,
            expected_player_count: 2,
        }));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "player_assigned");
        assert_eq!(value["data"]["player_index"], 1);
    }

    #[test]
    fn register_defaults_optional_fields() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"register","data":{}}"#).unwrap();
        match msg {
            ClientMessage::Register {
                claimed_participant_id,
                session_token,
                globals,
            } => {
                assert!(claimed_participant_id.is_none());
                assert!(session_token.is_none());
                assert!(globals.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn ping_round_trips_as_unit_variant() {
        let json = serde_json::to_string(&ClientMessage::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ClientMessage::Ping));
    }
}
