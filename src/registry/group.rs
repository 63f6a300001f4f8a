use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::protocol::{ParticipantId, PlayerIndex, SceneId};

/// A fixed-size tuple of participants bound to a single game. Membership is
/// immutable once formed.
#[derive(Debug, Clone)]
pub struct PlayerGroup {
    pub group_id: Uuid,
    pub scene_id: SceneId,
    /// Member order determines `player_index` (0-based arrival order).
    pub ordered_members: SmallVec<[ParticipantId; 4]>,
    pub formed_at: DateTime<Utc>,
}

impl PlayerGroup {
    pub fn new(scene_id: SceneId, members: impl IntoIterator<Item = ParticipantId>) -> Self {
        Self {
            group_id: Uuid::new_v4(),
            scene_id,
            ordered_members: members.into_iter().collect(),
            formed_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.ordered_members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_members.is_empty()
    }

    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.ordered_members.iter().any(|m| m == participant_id)
    }

    /// The member's 0-based slot, derived from arrival order.
    pub fn index_of(&self, participant_id: &ParticipantId) -> Option<PlayerIndex> {
        self.ordered_members
            .iter()
            .position(|m| m == participant_id)
            .map(|i| i as PlayerIndex)
    }

    pub fn member_at(&self, index: PlayerIndex) -> Option<&ParticipantId> {
        self.ordered_members.get(index as usize)
    }

    /// Every member except the given one, with their indices.
    pub fn others(
        &self,
        participant_id: &ParticipantId,
    ) -> impl Iterator<Item = (PlayerIndex, &ParticipantId)> {
        let participant_id = participant_id.clone();
        self.ordered_members
            .iter()
            .enumerate()
            .filter(move |(_, m)| **m != participant_id)
            .map(|(i, m)| (i as PlayerIndex, m))
    }

    /// All unordered member pairs, used for pairwise probing.
    pub fn pairs(&self) -> Vec<(ParticipantId, ParticipantId)> {
        let mut out = Vec::new();
        for (i, a) in self.ordered_members.iter().enumerate() {
            for b in self.ordered_members.iter().skip(i + 1) {
                out.push((a.clone(), b.clone()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_of(n: usize) -> PlayerGroup {
        PlayerGroup::new(
            SceneId::from("scene"),
            (0..n).map(|i| ParticipantId(format!("p{i}"))),
        )
    }

    #[test]
    fn player_index_follows_arrival_order() {
        let group = group_of(3);
        assert_eq!(group.index_of(&ParticipantId::from("p0")), Some(0));
        assert_eq!(group.index_of(&ParticipantId::from("p2")), Some(2));
        assert_eq!(group.index_of(&ParticipantId::from("px")), None);
    }

    #[test]
    fn pairs_cover_all_combinations() {
        let group = group_of(3);
        assert_eq!(group.pairs().len(), 3);
        let group = group_of(2);
        assert_eq!(group.pairs().len(), 1);
    }

    #[test]
    fn others_excludes_self() {
        let group = group_of(2);
        let others: Vec<_> = group.others(&ParticipantId::from("p0")).collect();
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].0, 1);
    }
}
