use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    ConnectionId, ParticipantEvent, ParticipantId, ParticipantState, SessionId,
};

/// One row per participant for the whole server lifetime. Survives
/// reconnects; only destroyed at server stop.
#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    /// Live connection, if any. At most one at a time; a duplicate claim
    /// evicts the older connection.
    pub connection: Option<ConnectionId>,
    pub session_id: Option<SessionId>,
    pub state: ParticipantState,
    pub first_seen: DateTime<Utc>,
    /// Everyone this participant has ever been grouped with.
    pub prior_partners: HashSet<ParticipantId>,
    /// Client focus flag, updated through `sync_globals`.
    pub in_focus: bool,
    /// Most recent client-reported round trip to the server (ms).
    pub rtt_to_server_ms: Option<u32>,
    /// Cancels the grace timer armed at disconnect, if one is running.
    pub grace_timer: Option<CancellationToken>,
}

impl Participant {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            connection: None,
            session_id: None,
            state: ParticipantState::Idle,
            first_seen: Utc::now(),
            prior_partners: HashSet::new(),
            in_focus: true,
            rtt_to_server_ms: None,
            grace_timer: None,
        }
    }

    /// Drive the state machine. Off-table transitions are rejected with a
    /// warning and leave the state untouched; they never panic.
    pub fn transition(&mut self, event: ParticipantEvent) -> bool {
        match self.state.apply(event) {
            Some(next) => {
                tracing::debug!(
                    participant_id = %self.id,
                    from = ?self.state,
                    to = ?next,
                    event = ?event,
                    "participant state transition"
                );
                self.state = next;
                true
            }
            None => {
                tracing::warn!(
                    participant_id = %self.id,
                    state = ?self.state,
                    event = ?event,
                    "rejected invalid participant state transition"
                );
                false
            }
        }
    }

    /// Session-level termination outside the event table: screening denial
    /// and admission capacity both land here.
    pub fn end_session(&mut self, why: &str) {
        if self.state != ParticipantState::Ended {
            tracing::debug!(
                participant_id = %self.id,
                from = ?self.state,
                why,
                "ending participant session"
            );
            self.state = ParticipantState::Ended;
        }
    }

    /// Cancel and clear any pending grace timer (reconnect arrived in time).
    pub fn cancel_grace(&mut self) {
        if let Some(token) = self.grace_timer.take() {
            token.cancel();
        }
    }
}
