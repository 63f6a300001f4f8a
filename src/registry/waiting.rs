use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::group::PlayerGroup;
use crate::protocol::{Globals, ParticipantId, ProbeId, SceneId};

/// A queued participant awaiting matchmaking. Present if and only if the
/// participant's state is `InWaitroom`.
#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub participant_id: ParticipantId,
    pub scene_id: SceneId,
    pub arrived_at: Instant,
    pub arrived_wall: DateTime<Utc>,
    /// Opaque matcher attributes carried from `enqueue_for_scene`.
    pub attributes: Globals,
    pub rtt_to_server_ms: Option<u32>,
    pub prior_partners: HashSet<ParticipantId>,
    /// Cancels the per-entry waitroom timeout timer.
    pub timeout_timer: CancellationToken,
}

impl WaitingEntry {
    pub fn new(
        participant_id: ParticipantId,
        scene_id: SceneId,
        attributes: Globals,
        rtt_to_server_ms: Option<u32>,
        prior_partners: HashSet<ParticipantId>,
    ) -> Self {
        Self {
            participant_id,
            scene_id,
            arrived_at: Instant::now(),
            arrived_wall: Utc::now(),
            attributes,
            rtt_to_server_ms,
            prior_partners,
            timeout_timer: CancellationToken::new(),
        }
    }
}

/// RTT measurement between one pair of matched members. At most one active
/// probe per participant.
#[derive(Debug)]
pub struct ProbeSession {
    pub probe_id: ProbeId,
    pub pair: (ParticipantId, ParticipantId),
    pub started_at: Instant,
    /// Members whose transient channel is up.
    pub ready: HashSet<ParticipantId>,
    pub measured_rtt_ms: Option<u32>,
    pub failed: bool,
}

impl ProbeSession {
    pub fn new(a: ParticipantId, b: ParticipantId) -> Self {
        Self {
            probe_id: Uuid::new_v4(),
            pair: (a, b),
            started_at: Instant::now(),
            ready: HashSet::new(),
            measured_rtt_ms: None,
            failed: false,
        }
    }

    pub fn involves(&self, participant_id: &ParticipantId) -> bool {
        &self.pair.0 == participant_id || &self.pair.1 == participant_id
    }

    pub fn both_ready(&self) -> bool {
        self.ready.contains(&self.pair.0) && self.ready.contains(&self.pair.1)
    }
}

/// Phase of a formed-but-not-yet-started group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingPhase {
    /// Pairwise RTT probes are running.
    Probing,
    /// Probes passed (or were not required); the start countdown is running.
    Countdown,
}

/// A matched group parked between formation and game creation. Lives in the
/// waitroom domain so dissolution can re-enqueue members atomically.
#[derive(Debug)]
pub struct PendingGroup {
    pub group: PlayerGroup,
    pub phase: PendingPhase,
    pub probes: Vec<ProbeSession>,
    /// Original entries, kept so a dissolved group can restore them.
    pub entries: Vec<WaitingEntry>,
    /// Synthetic member count appended for bot backfill.
    pub bot_slots: usize,
    /// Cancels the probe timeout / countdown timer.
    pub timer: CancellationToken,
}

impl PendingGroup {
    pub fn probe_by_id(&mut self, probe_id: &ProbeId) -> Option<&mut ProbeSession> {
        self.probes.iter_mut().find(|p| &p.probe_id == probe_id)
    }

    pub fn all_probes_succeeded(&self, max_peer_rtt_ms: Option<u32>) -> bool {
        self.probes.iter().all(|p| {
            !p.failed
                && match (p.measured_rtt_ms, max_peer_rtt_ms) {
                    (Some(rtt), Some(max)) => rtt <= max,
                    (Some(_), None) => true,
                    (None, _) => false,
                }
        })
    }

    pub fn any_probe_failed(&self, max_peer_rtt_ms: Option<u32>) -> bool {
        self.probes.iter().any(|p| {
            p.failed
                || matches!((p.measured_rtt_ms, max_peer_rtt_ms), (Some(rtt), Some(max)) if rtt > max)
        })
    }
}

/// Per-scene waiting room: the queue plus groups parked in probing or
/// countdown. All mutation happens under the scene's waitroom lock so that
/// find+remove is atomic under concurrent arrivals.
#[derive(Debug, Default)]
pub struct WaitingRoom {
    pub entries: Vec<WaitingEntry>,
    pub pending: Vec<PendingGroup>,
}

impl WaitingRoom {
    pub fn position_of(&self, participant_id: &ParticipantId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.participant_id == participant_id)
    }

    pub fn remove(&mut self, participant_id: &ParticipantId) -> Option<WaitingEntry> {
        let idx = self.position_of(participant_id)?;
        let entry = self.entries.remove(idx);
        entry.timeout_timer.cancel();
        Some(entry)
    }

    /// Remove a whole matched set from the queue. Callers hold the waitroom
    /// lock across find+remove, preventing double assignment.
    pub fn remove_all(&mut self, members: &[ParticipantId]) -> Vec<WaitingEntry> {
        let mut removed = Vec::with_capacity(members.len());
        for member in members {
            if let Some(entry) = self.remove(member) {
                removed.push(entry);
            }
        }
        removed
    }

    pub fn pending_group_of(&mut self, participant_id: &ParticipantId) -> Option<&mut PendingGroup> {
        self.pending
            .iter_mut()
            .find(|pg| pg.group.contains(participant_id))
    }

    pub fn pending_with_probe(&mut self, probe_id: &ProbeId) -> Option<&mut PendingGroup> {
        self.pending
            .iter_mut()
            .find(|pg| pg.probes.iter().any(|p| &p.probe_id == probe_id))
    }

    pub fn take_pending_group(&mut self, group_id: &Uuid) -> Option<PendingGroup> {
        let idx = self.pending.iter().position(|pg| &pg.group.group_id == group_id)?;
        Some(self.pending.remove(idx))
    }
}

/// All waiting rooms, keyed by scene.
#[derive(Debug, Default)]
pub struct WaitingRooms {
    pub rooms: HashMap<SceneId, WaitingRoom>,
}

impl WaitingRooms {
    pub fn room_mut(&mut self, scene_id: &SceneId) -> &mut WaitingRoom {
        self.rooms.entry(scene_id.clone()).or_default()
    }

    /// Locate a participant across every scene queue. Enforces the global
    /// at-most-one-waiting-entry invariant.
    pub fn find_participant(&self, participant_id: &ParticipantId) -> Option<&SceneId> {
        self.rooms
            .iter()
            .find(|(_, room)| room.position_of(participant_id).is_some())
            .map(|(scene_id, _)| scene_id)
    }

    pub fn total_waiting(&self) -> usize {
        self.rooms.values().map(|r| r.entries.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> WaitingEntry {
        WaitingEntry::new(
            ParticipantId::from(id),
            SceneId::from("scene"),
            Globals::new(),
            None,
            HashSet::new(),
        )
    }

    #[test]
    fn remove_all_cancels_timers() {
        let mut room = WaitingRoom::default();
        room.entries.push(entry("a"));
        room.entries.push(entry("b"));
        let timer = room.entries[0].timeout_timer.clone();

        let removed = room.remove_all(&[ParticipantId::from("a"), ParticipantId::from("b")]);
        assert_eq!(removed.len(), 2);
        assert!(timer.is_cancelled());
        assert!(room.entries.is_empty());
    }

    #[test]
    fn find_participant_spans_scenes() {
        let mut rooms = WaitingRooms::default();
        rooms.room_mut(&SceneId::from("a")).entries.push(entry("p1"));

        assert_eq!(
            rooms.find_participant(&ParticipantId::from("p1")),
            Some(&SceneId::from("a"))
        );
        assert_eq!(rooms.find_participant(&ParticipantId::from("p2")), None);
    }

    #[test]
    fn probe_requires_both_sides_ready() {
        let mut probe = ProbeSession::new(ParticipantId::from("a"), ParticipantId::from("b"));
        assert!(!probe.both_ready());
        probe.ready.insert(ParticipantId::from("a"));
        assert!(!probe.both_ready());
        probe.ready.insert(ParticipantId::from("b"));
        assert!(probe.both_ready());
    }

    #[test]
    fn pending_group_probe_thresholds() {
        let group = PlayerGroup::new(
            SceneId::from("scene"),
            [ParticipantId::from("a"), ParticipantId::from("b")],
        );
        let mut probe = ProbeSession::new(ParticipantId::from("a"), ParticipantId::from("b"));
        probe.measured_rtt_ms = Some(80);
        let pending = PendingGroup {
            group,
            phase: PendingPhase::Probing,
            probes: vec![probe],
            entries: Vec::new(),
            bot_slots: 0,
            timer: CancellationToken::new(),
        };

        assert!(pending.all_probes_succeeded(Some(100)));
        assert!(pending.any_probe_failed(Some(50)));
        assert!(pending.all_probes_succeeded(None));
    }
}
