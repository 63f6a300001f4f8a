//! The registry exclusively owns all entities: participants, sessions,
//! waiting rooms, groups, and games. References between entities are by id,
//! never pointer graphs, and each entity's fields are mutated only by the
//! subsystem responsible for it.
//!
//! Locking is partitioned by coarse domain. When more than one must be
//! held, the order is:
//!
//! `participants` -> `waiting` -> `games` -> per-game `Game::state`
//!
//! Paths that would acquire out of order must release and re-acquire. No
//! lock is held across an outbound send or a collaborator call.

pub mod game;
pub mod group;
pub mod participant;
pub mod session;
pub mod waiting;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

pub use game::{DesyncEvent, Game, GameState, GameStatus, PeerSessionState, QueuedAction};
pub use group::PlayerGroup;
pub use participant::Participant;
pub use session::{AssignmentRecord, ScreeningOutcome, Session, SessionMetadata};
pub use waiting::{
    PendingGroup, PendingPhase, ProbeSession, WaitingEntry, WaitingRoom, WaitingRooms,
};

use crate::protocol::{ConnectionId, GameId, ParticipantId, SessionId};

/// Participants and their sessions, one lock domain. Sessions are
/// one-to-one with participants and the binding is immutable.
#[derive(Debug, Default)]
pub struct ParticipantTable {
    participants: HashMap<ParticipantId, Participant>,
    sessions: HashMap<SessionId, Session>,
    by_connection: HashMap<ConnectionId, ParticipantId>,
}

impl ParticipantTable {
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants.get_mut(id)
    }

    pub fn insert(&mut self, participant: Participant) {
        self.participants.insert(participant.id.clone(), participant);
    }

    pub fn by_connection(&self, connection_id: &ConnectionId) -> Option<&ParticipantId> {
        self.by_connection.get(connection_id)
    }

    /// Bind a live connection, returning the evicted connection if the
    /// participant already had one (duplicate-session handling).
    pub fn bind_connection(
        &mut self,
        participant_id: &ParticipantId,
        connection_id: ConnectionId,
    ) -> Option<ConnectionId> {
        let participant = self.participants.get_mut(participant_id)?;
        let evicted = participant.connection.replace(connection_id);
        if let Some(old) = evicted {
            self.by_connection.remove(&old);
        }
        self.by_connection
            .insert(connection_id, participant_id.clone());
        evicted
    }

    /// Unbind a dropped connection. Leaves the participant row intact.
    pub fn unbind_connection(&mut self, connection_id: &ConnectionId) -> Option<ParticipantId> {
        let participant_id = self.by_connection.remove(connection_id)?;
        if let Some(participant) = self.participants.get_mut(&participant_id) {
            if participant.connection == Some(*connection_id) {
                participant.connection = None;
            }
        }
        Some(participant_id)
    }

    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn session_of(&self, participant_id: &ParticipantId) -> Option<&Session> {
        let sid = self.participants.get(participant_id)?.session_id.as_ref()?;
        self.sessions.get(sid)
    }

    pub fn session_of_mut(&mut self, participant_id: &ParticipantId) -> Option<&mut Session> {
        let sid = self
            .participants
            .get(participant_id)?
            .session_id
            .clone()?;
        self.sessions.get_mut(&sid)
    }

    /// Insert a session and bind it to its participant. The session <->
    /// participant pairing is immutable from here on.
    pub fn insert_session(&mut self, session: Session) {
        if let Some(participant) = self.participants.get_mut(&session.participant_id) {
            participant.session_id = Some(session.id.clone());
        }
        self.sessions.insert(session.id.clone(), session);
    }

    /// Resolve a session id to its owning participant id.
    pub fn participant_of_session(&self, session_id: &SessionId) -> Option<&ParticipantId> {
        self.sessions.get(session_id).map(|s| &s.participant_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}

/// Games and the participant -> game index, one lock domain.
#[derive(Debug, Default)]
pub struct GameTable {
    games: HashMap<GameId, Arc<Game>>,
    by_participant: HashMap<ParticipantId, GameId>,
}

impl GameTable {
    /// Insert a game and index its human members. A participant can be in
    /// at most one game at any instant.
    pub fn insert(&mut self, game: Arc<Game>) {
        for member in &game.group.ordered_members {
            let previous = self.by_participant.insert(member.clone(), game.id);
            if let Some(previous) = previous {
                tracing::warn!(
                    participant_id = %member,
                    previous_game = %previous,
                    new_game = %game.id,
                    "participant indexed in two games; evicting stale index"
                );
            }
        }
        self.games.insert(game.id, game);
    }

    pub fn get(&self, id: &GameId) -> Option<Arc<Game>> {
        self.games.get(id).cloned()
    }

    pub fn game_of(&self, participant_id: &ParticipantId) -> Option<Arc<Game>> {
        let id = self.by_participant.get(participant_id)?;
        self.games.get(id).cloned()
    }

    /// Remove a game and unindex its members.
    pub fn remove(&mut self, id: &GameId) -> Option<Arc<Game>> {
        let game = self.games.remove(id)?;
        for member in &game.group.ordered_members {
            if self.by_participant.get(member) == Some(id) {
                self.by_participant.remove(member);
            }
        }
        Some(game)
    }

    pub fn active_count(&self) -> usize {
        self.games.len()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Game>> {
        self.games.values()
    }
}

/// The single registry value owned by the process root and passed into
/// handlers by reference.
#[derive(Debug, Default)]
pub struct Registry {
    pub participants: RwLock<ParticipantTable>,
    pub waiting: Mutex<WaitingRooms>,
    pub games: RwLock<GameTable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SceneSpec;
    use crate::protocol::Globals;
    use crate::protocol::SceneId;
    use uuid::Uuid;

    #[test]
    fn duplicate_bind_evicts_older_connection() {
        let mut table = ParticipantTable::default();
        let pid = ParticipantId::from("p1");
        table.insert(Participant::new(pid.clone()));

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert_eq!(table.bind_connection(&pid, first), None);
        assert_eq!(table.bind_connection(&pid, second), Some(first));
        assert_eq!(table.by_connection(&second), Some(&pid));
        assert_eq!(table.by_connection(&first), None);
    }

    #[test]
    fn unbind_ignores_stale_connection() {
        let mut table = ParticipantTable::default();
        let pid = ParticipantId::from("p1");
        table.insert(Participant::new(pid.clone()));

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        table.bind_connection(&pid, first);
        table.bind_connection(&pid, second);

        // The evicted connection detaches later; it must not clear the
        // newer binding.
        table.unbind_connection(&first);
        assert_eq!(
            table.get(&pid).unwrap().connection,
            Some(second),
            "stale unbind must not clear the live connection"
        );
    }

    #[test]
    fn session_binding_is_discoverable_both_ways() {
        let mut table = ParticipantTable::default();
        let pid = ParticipantId::from("p1");
        table.insert(Participant::new(pid.clone()));

        let session = Session::new(
            pid.clone(),
            vec![SceneSpec::static_scene("intro")],
            Globals::new(),
        );
        let sid = session.id.clone();
        table.insert_session(session);

        assert_eq!(table.participant_of_session(&sid), Some(&pid));
        assert_eq!(table.session_of(&pid).unwrap().id, sid);
        assert_eq!(table.get(&pid).unwrap().session_id, Some(sid));
    }

    #[test]
    fn game_removal_unindexes_members() {
        let mut table = GameTable::default();
        let group = PlayerGroup::new(
            SceneId::from("scene"),
            [ParticipantId::from("a"), ParticipantId::from("b")],
        );
        let game = Arc::new(Game::new(
            SceneId::from("scene"),
            0,
            group,
            1,
            Vec::new(),
            false,
        ));
        let id = game.id;
        table.insert(game);

        assert!(table.game_of(&ParticipantId::from("a")).is_some());
        table.remove(&id);
        assert!(table.game_of(&ParticipantId::from("a")).is_none());
        assert_eq!(table.active_count(), 0);
    }
}
