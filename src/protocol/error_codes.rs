use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for structured error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Session errors
    UnknownSession,
    DuplicateSession,
    AdmissionDenied,
    SessionEnded,
    InvalidSessionToken,

    // Dispatch / validation errors
    MalformedMessage,
    MessageTooLarge,
    InvalidSceneKind,
    UnknownScene,

    // Waitroom errors
    AlreadyWaiting,
    NotWaiting,
    WaitroomTimeout,
    ProbeFailed,

    // Game errors
    GameNotFound,
    NotAGameMember,
    ActionDeadlineExceeded,
    DesyncDetected,
    PeerExcluded,

    // Server errors
    InternalError,
    ServerShuttingDown,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code. These are
    /// developer-facing strings; participant-facing wording stays neutral
    /// (see `TerminationReason::neutral_message`).
    pub fn description(&self) -> &'static str {
        match self {
            Self::UnknownSession => {
                "The referenced session does not exist or has already ended."
            }
            Self::DuplicateSession => {
                "A newer connection claimed this participant; this connection was evicted."
            }
            Self::AdmissionDenied => {
                "The experiment is not admitting participants (capacity reached or screening failed)."
            }
            Self::SessionEnded => "This session has ended and accepts no further scene activity.",
            Self::InvalidSessionToken => {
                "The supplied session token does not match the claimed participant."
            }
            Self::MalformedMessage => "The message could not be parsed; it was dropped.",
            Self::MessageTooLarge => "The message exceeds the configured size limit.",
            Self::InvalidSceneKind => "The current scene does not support this operation.",
            Self::UnknownScene => "The referenced scene is not part of this experiment.",
            Self::AlreadyWaiting => "The participant is already queued in a waiting room.",
            Self::NotWaiting => "The participant is not queued in any waiting room.",
            Self::WaitroomTimeout => "No match formed within the scene's waiting window.",
            Self::ProbeFailed => "Pre-match latency probing failed or timed out.",
            Self::GameNotFound => "The referenced game does not exist or has been torn down.",
            Self::NotAGameMember => "The participant is not a member of the referenced game.",
            Self::ActionDeadlineExceeded => {
                "An action arrived after the tick deadline and was populated by policy."
            }
            Self::DesyncDetected => "Peers reported differing state hashes for the same tick.",
            Self::PeerExcluded => "A peer in this game was excluded mid-run.",
            Self::InternalError => "An internal server error occurred.",
            Self::ServerShuttingDown => "The server is shutting down and not accepting new work.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_as_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::UnknownSession).unwrap();
        assert_eq!(json, "\"UNKNOWN_SESSION\"");
        let json = serde_json::to_string(&ErrorCode::ActionDeadlineExceeded).unwrap();
        assert_eq!(json, "\"ACTION_DEADLINE_EXCEEDED\"");
    }

    #[test]
    fn descriptions_are_nonempty() {
        for code in [
            ErrorCode::UnknownSession,
            ErrorCode::DuplicateSession,
            ErrorCode::AdmissionDenied,
            ErrorCode::MalformedMessage,
            ErrorCode::ProbeFailed,
            ErrorCode::InternalError,
        ] {
            assert!(!code.description().is_empty());
        }
    }
}
