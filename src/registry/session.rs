use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SceneSpec;
use crate::protocol::{Globals, ParticipantId, SceneId, SessionId, RESERVED_GLOBAL_KEYS};

/// Screening outcome recorded on the session.
#[derive(Debug, Clone, Serialize)]
pub struct ScreeningOutcome {
    pub admitted: bool,
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// One entry of the session's assignment log: which group this participant
/// landed in and when.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentRecord {
    pub scene_id: SceneId,
    pub game_id: String,
    pub player_index: u8,
    pub partners: Vec<ParticipantId>,
    pub assigned_at: DateTime<Utc>,
}

/// Metadata flushed through `write_session_metadata` on scene boundaries and
/// at termination (last-write-wins).
#[derive(Debug, Clone, Serialize, Default)]
pub struct SessionMetadata {
    pub started_at: Option<DateTime<Utc>>,
    pub screening: Option<ScreeningOutcome>,
    pub assignments: Vec<AssignmentRecord>,
    /// Set when any game this session took part in ended non-naturally.
    pub partial: bool,
    pub termination_reason: Option<String>,
    /// (scene_id, entered_at) pairs in traversal order.
    pub scene_entries: Vec<(SceneId, DateTime<Utc>)>,
}

/// A participant's per-experiment state: scene progression, scene-local
/// data, and the globals bag. One-to-one with a participant and immutable
/// in that binding.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub participant_id: ParticipantId,
    /// Per-participant clone of the researcher-supplied scene graph.
    pub scene_graph: Vec<SceneSpec>,
    /// Monotonic except when scene logic explicitly resets it.
    pub current_scene_index: usize,
    /// Highest index ever activated; re-activation below this is refused.
    pub highest_activated_index: usize,
    /// Scene-local data preserved across reconnects.
    pub scene_state: serde_json::Value,
    pub globals: Globals,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new(
        participant_id: ParticipantId,
        scene_graph: Vec<SceneSpec>,
        initial_globals: Globals,
    ) -> Self {
        let mut session = Self {
            id: SessionId::generate(),
            participant_id,
            scene_graph,
            current_scene_index: 0,
            highest_activated_index: 0,
            scene_state: serde_json::Value::Null,
            globals: Globals::new(),
            metadata: SessionMetadata {
                started_at: Some(Utc::now()),
                ..SessionMetadata::default()
            },
        };
        session.merge_globals(initial_globals);
        session
    }

    pub fn current_scene(&self) -> Option<&SceneSpec> {
        self.scene_graph.get(self.current_scene_index)
    }

    pub fn is_on_final_scene(&self) -> bool {
        self.current_scene_index + 1 >= self.scene_graph.len()
    }

    /// Merge client key/values. Reserved keys stay server-authoritative;
    /// researcher keys merge last-writer-wins. Idempotent by construction.
    pub fn merge_globals(&mut self, incoming: Globals) {
        for (key, value) in incoming {
            if RESERVED_GLOBAL_KEYS.contains(&key.as_str()) {
                tracing::debug!(
                    session_id = %self.id,
                    key = %key,
                    "ignoring client write to reserved globals key"
                );
                continue;
            }
            self.globals.insert(key, value);
        }
        self.refresh_reserved_globals();
    }

    fn refresh_reserved_globals(&mut self) {
        self.globals.insert(
            "participant_id".to_string(),
            serde_json::Value::String(self.participant_id.0.clone()),
        );
        self.globals.insert(
            "session_id".to_string(),
            serde_json::Value::String(self.id.0.clone()),
        );
        self.globals.insert(
            "scene_index".to_string(),
            serde_json::Value::from(self.current_scene_index),
        );
    }

    /// Advance to the next scene, recording the entry timestamp. Returns the
    /// new index, or `None` when already past the end.
    pub fn advance_scene(&mut self) -> Option<usize> {
        let next = self.current_scene_index + 1;
        if next >= self.scene_graph.len() {
            return None;
        }
        self.current_scene_index = next;
        self.highest_activated_index = self.highest_activated_index.max(next);
        self.scene_state = serde_json::Value::Null;
        if let Some(scene) = self.scene_graph.get(next) {
            self.metadata
                .scene_entries
                .push((scene.scene_id.clone(), Utc::now()));
        }
        self.refresh_reserved_globals();
        Some(next)
    }
}
