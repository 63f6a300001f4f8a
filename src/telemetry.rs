//! Structured telemetry events.
//!
//! Every noteworthy decision is emitted as a `tracing` event with
//! `target: "telemetry"` carrying the ids it concerns. The default durable
//! sink is the rolling log file configured in [`crate::logging`]; operators
//! can filter with `RUST_LOG=telemetry=info`.

use std::fmt;

use crate::protocol::{GameId, ParticipantId, SceneId, SessionId};

/// Event vocabulary. Kinds mirror the decisions the core makes, not the
/// messages it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryKind {
    ConnectionOpened,
    ConnectionClosed,
    ParticipantRegistered,
    SessionRestored,
    DuplicateSessionEvicted,
    AdmissionDenied,
    ScreeningDecision,
    StateTransition,
    SceneAdvanced,
    WaitroomJoined,
    WaitroomLeft,
    MatchDecision,
    MatchTimeout,
    ProbeStarted,
    ProbeFailed,
    GameCreated,
    GameReset,
    GameTerminated,
    ActionDeadlineExceeded,
    DesyncDetected,
    ResyncRequested,
    Exclusion,
    GraceExpired,
    SinkOverflow,
    MalformedMessage,
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One telemetry event. Timestamping is handled by the tracing layer.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub kind: TelemetryKind,
    pub participant_id: Option<ParticipantId>,
    pub session_id: Option<SessionId>,
    pub game_id: Option<GameId>,
    pub scene_id: Option<SceneId>,
    pub details: serde_json::Value,
}

impl TelemetryEvent {
    pub fn new(kind: TelemetryKind) -> Self {
        Self {
            kind,
            participant_id: None,
            session_id: None,
            game_id: None,
            scene_id: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn participant(mut self, id: &ParticipantId) -> Self {
        self.participant_id = Some(id.clone());
        self
    }

    pub fn session(mut self, id: &SessionId) -> Self {
        self.session_id = Some(id.clone());
        self
    }

    pub fn game(mut self, id: GameId) -> Self {
        self.game_id = Some(id);
        self
    }

    pub fn scene(mut self, id: &SceneId) -> Self {
        self.scene_id = Some(id.clone());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Emit the event. Infallible: telemetry must never take a handler
    /// down.
    pub fn emit(self) {
        let game_id = self
            .game_id
            .map(|g| g.to_string())
            .unwrap_or_default();
        tracing::info!(
            target: "telemetry",
            kind = %self.kind,
            participant_id = self.participant_id.as_ref().map(ParticipantId::as_str).unwrap_or(""),
            session_id = self.session_id.as_ref().map(SessionId::as_str).unwrap_or(""),
            game_id = %game_id,
            scene_id = self.scene_id.as_ref().map(SceneId::as_str).unwrap_or(""),
            details = %self.details,
        );
    }
}

/// Shorthand used all over the handlers.
pub fn emit(kind: TelemetryKind) -> TelemetryEvent {
    TelemetryEvent::new(kind)
}
