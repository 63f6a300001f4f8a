//! Experiment and scene configuration, the researcher-facing tree.
//!
//! The tree is supplied once at startup, validated, and immutable
//! thereafter. Optional behavior is expressed with `Option` fields and
//! explicit enums rather than sentinel values.

use serde::{Deserialize, Serialize};

use super::defaults::{
    default_countdown_secs, default_episodes, default_group_size, default_hash_sampling_every,
    default_matcher, default_reset_freeze_secs, default_tick_rate,
    default_waitroom_max_wait_secs,
};
use crate::protocol::SceneId;

/// Which orchestrator activation path a scene takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    /// Instructions, surveys, completion pages. Content is shipped to the
    /// client; form data comes back by declared element id.
    #[default]
    Static,
    /// Interactive multiplayer scene driven by the game lifecycle manager.
    Gym,
    /// Client-hosted runtime; the core only mediates start/end signaling.
    External,
}

/// Coordination model for multi-participant games.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeerMode {
    /// Single-participant or no game coordination at all.
    #[default]
    None,
    /// Simulation runs in the browsers; the core relays and samples hashes.
    PeerAuthoritative,
    /// The core steps a pluggable simulator and broadcasts render state.
    ServerAuthoritative,
}

/// How the tick loop fills in a member's missing action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionPopulationPolicy {
    /// Substitute the scene's configured default action.
    #[default]
    DefaultAction,
    /// Repeat the member's last seen action.
    PreviousAction,
    /// Stall the tick until all actions arrive or 2x the tick period
    /// elapses, then fall back to PreviousAction.
    Block,
}

/// What happens when a waitroom entry times out before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitroomTimeoutBehavior {
    /// End the scene and send the participant to `redirect_url`.
    #[default]
    Redirect,
    /// Keep the entry queued and re-arm the timer.
    Continue,
    /// Form a group padded with synthetic members.
    PairWithBots,
}

/// Entry screening rules evaluated at experiment admission.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScreeningConfig {
    /// Whether screening must pass before the first scene activates.
    #[serde(default)]
    pub required: bool,
    /// Allowed browser names (substring match on the reported browser);
    /// empty means any browser.
    #[serde(default)]
    pub allowed_browsers: Vec<String>,
    /// Reject participants reporting a mobile device.
    #[serde(default)]
    pub block_mobile: bool,
    /// Reject participants whose reported server RTT exceeds this (ms).
    #[serde(default)]
    pub max_server_rtt_ms: Option<u32>,
    /// Identifier of a researcher callback consulted after the rules.
    /// Callback failure is treated as admit and logged.
    #[serde(default)]
    pub callback_id: Option<String>,
}

/// Which elements/events a scene persists through the data sink.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DataCollectionConfig {
    /// Element ids collected from static scene form data.
    #[serde(default)]
    pub elements: Vec<String>,
    /// Event kinds persisted during interactive scenes.
    #[serde(default)]
    pub events: Vec<String>,
}

/// One stage of the experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneSpec {
    /// Opaque key for data bucketing.
    pub scene_id: SceneId,
    #[serde(default)]
    pub kind: SceneKind,
    /// Static content / survey elements shipped on activation.
    #[serde(default)]
    pub content: serde_json::Value,
    /// Required group cardinality for gym scenes.
    #[serde(default = "default_group_size")]
    pub group_size: usize,
    /// Matcher implementation name; "fifo" is built in.
    #[serde(default = "default_matcher")]
    pub matcher: String,
    #[serde(default = "default_waitroom_max_wait_secs")]
    pub waitroom_max_wait_sec: u64,
    #[serde(default)]
    pub waitroom_timeout_behavior: WaitroomTimeoutBehavior,
    /// Where timed-out participants are redirected.
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default = "default_countdown_secs")]
    pub countdown_seconds: u64,
    /// Game loop Hz.
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,
    #[serde(default = "default_episodes")]
    pub episodes: u32,
    /// Optional per-episode tick horizon; the loop ends the episode when it
    /// is reached.
    #[serde(default)]
    pub episode_max_ticks: Option<u64>,
    #[serde(default = "default_reset_freeze_secs")]
    pub reset_freeze_sec: u64,
    #[serde(default)]
    pub action_population_policy: ActionPopulationPolicy,
    /// Action substituted under `DefaultAction` policy.
    #[serde(default)]
    pub default_action: serde_json::Value,
    #[serde(default)]
    pub peer_mode: PeerMode,
    /// Tick stride between state-hash sampling requests.
    #[serde(default = "default_hash_sampling_every")]
    pub hash_sampling_every: u64,
    /// On desync, request full state from the lowest-index peer and
    /// rebroadcast instead of only logging.
    #[serde(default)]
    pub authoritative_resync: bool,
    /// Run the pre-match RTT probe before confirming a group.
    #[serde(default)]
    pub probe_required: bool,
    /// Pairwise peer RTT admission threshold for probing (ms).
    #[serde(default)]
    pub max_peer_rtt_ms: Option<u32>,
    /// Server RTT admission threshold while enqueued (ms).
    #[serde(default)]
    pub max_server_rtt_ms: Option<u32>,
    /// Disconnect grace override, seconds. Defaults come from the core
    /// config (game vs non-game).
    #[serde(default)]
    pub grace_seconds: Option<u64>,
    #[serde(default)]
    pub data_collection: DataCollectionConfig,
}

impl SceneSpec {
    /// Minimal static scene used by tests and as a template.
    pub fn static_scene(scene_id: impl Into<String>) -> Self {
        Self {
            scene_id: SceneId(scene_id.into()),
            kind: SceneKind::Static,
            content: serde_json::Value::Null,
            group_size: 1,
            matcher: default_matcher(),
            waitroom_max_wait_sec: default_waitroom_max_wait_secs(),
            waitroom_timeout_behavior: WaitroomTimeoutBehavior::default(),
            redirect_url: None,
            countdown_seconds: default_countdown_secs(),
            tick_rate: default_tick_rate(),
            episodes: default_episodes(),
            episode_max_ticks: None,
            reset_freeze_sec: default_reset_freeze_secs(),
            action_population_policy: ActionPopulationPolicy::default(),
            default_action: serde_json::Value::Null,
            peer_mode: PeerMode::None,
            hash_sampling_every: default_hash_sampling_every(),
            authoritative_resync: false,
            probe_required: false,
            max_peer_rtt_ms: None,
            max_server_rtt_ms: None,
            grace_seconds: None,
            data_collection: DataCollectionConfig::default(),
        }
    }

    /// Minimal gym scene used by tests and as a template.
    pub fn gym_scene(scene_id: impl Into<String>, group_size: usize) -> Self {
        Self {
            kind: SceneKind::Gym,
            group_size,
            peer_mode: PeerMode::PeerAuthoritative,
            ..Self::static_scene(scene_id)
        }
    }

    pub fn is_multiplayer_game(&self) -> bool {
        self.kind == SceneKind::Gym && self.group_size > 1
    }
}

/// The researcher-defined experiment: an ordered scene graph plus
/// experiment-level admission rules.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExperimentConfig {
    /// Name used in telemetry and data paths.
    #[serde(default)]
    pub experiment_id: String,
    /// Hard cap on concurrently admitted participants; `None` is unlimited.
    #[serde(default)]
    pub participant_cap: Option<usize>,
    /// Ordered scene graph each participant traverses.
    #[serde(default)]
    pub scenes: Vec<SceneSpec>,
    #[serde(default)]
    pub screening: ScreeningConfig,
    /// Runtime asset peers must pre-load (external-runtime scenes).
    #[serde(default)]
    pub runtime_preload: Option<String>,
}

/// Structured validation failure for the experiment tree.
#[derive(Debug, thiserror::Error)]
pub enum SceneConfigError {
    #[error("experiment has no scenes")]
    NoScenes,
    #[error("duplicate scene_id `{0}`")]
    DuplicateSceneId(SceneId),
    #[error("scene `{0}`: group_size must be at least 1")]
    ZeroGroupSize(SceneId),
    #[error("scene `{0}`: tick_rate must be between 1 and 120 Hz")]
    BadTickRate(SceneId),
    #[error("scene `{0}`: probing is only supported for 2-player groups")]
    ProbeGroupTooLarge(SceneId),
    #[error("scene `{0}`: gym scenes with group_size > 1 need a peer_mode")]
    MissingPeerMode(SceneId),
    #[error("scene `{0}`: timeout behavior is redirect but no redirect_url is set")]
    MissingRedirect(SceneId),
}

impl ExperimentConfig {
    /// Validate the whole tree. Called once at load; the tree is immutable
    /// afterwards.
    pub fn validate(&self) -> Result<(), SceneConfigError> {
        if self.scenes.is_empty() {
            return Err(SceneConfigError::NoScenes);
        }

        let mut seen = std::collections::HashSet::new();
        for scene in &self.scenes {
            if !seen.insert(scene.scene_id.clone()) {
                return Err(SceneConfigError::DuplicateSceneId(scene.scene_id.clone()));
            }

            if scene.group_size == 0 {
                return Err(SceneConfigError::ZeroGroupSize(scene.scene_id.clone()));
            }

            if scene.kind == SceneKind::Gym {
                if scene.tick_rate == 0 || scene.tick_rate > 120 {
                    return Err(SceneConfigError::BadTickRate(scene.scene_id.clone()));
                }
                if scene.probe_required && scene.group_size > 2 {
                    return Err(SceneConfigError::ProbeGroupTooLarge(scene.scene_id.clone()));
                }
                if scene.group_size > 1 && scene.peer_mode == PeerMode::None {
                    return Err(SceneConfigError::MissingPeerMode(scene.scene_id.clone()));
                }
                if scene.waitroom_timeout_behavior == WaitroomTimeoutBehavior::Redirect
                    && scene.redirect_url.is_none()
                    && scene.group_size > 1
                {
                    return Err(SceneConfigError::MissingRedirect(scene.scene_id.clone()));
                }
            }
        }

        Ok(())
    }

    pub fn scene_at(&self, index: usize) -> Option<&SceneSpec> {
        self.scenes.get(index)
    }

    pub fn scene_by_id(&self, scene_id: &SceneId) -> Option<(usize, &SceneSpec)> {
        self.scenes
            .iter()
            .enumerate()
            .find(|(_, s)| &s.scene_id == scene_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_player_gym() -> SceneSpec {
        let mut scene = SceneSpec::gym_scene("coop_game", 2);
        scene.redirect_url = Some("https://example.org/sorry".to_string());
        scene
    }

    #[test]
    fn valid_tree_passes() {
        let config = ExperimentConfig {
            experiment_id: "demo".into(),
            scenes: vec![
                SceneSpec::static_scene("intro"),
                two_player_gym(),
                SceneSpec::static_scene("outro"),
            ],
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn empty_tree_is_rejected() {
        let config = ExperimentConfig::default();
        assert!(matches!(config.validate(), Err(SceneConfigError::NoScenes)));
    }

    #[test]
    fn duplicate_scene_ids_are_rejected() {
        let config = ExperimentConfig {
            scenes: vec![
                SceneSpec::static_scene("intro"),
                SceneSpec::static_scene("intro"),
            ],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SceneConfigError::DuplicateSceneId(_))
        ));
    }

    #[test]
    fn probing_large_groups_is_rejected() {
        let mut scene = SceneSpec::gym_scene("foursome", 4);
        scene.probe_required = true;
        scene.redirect_url = Some("https://example.org".to_string());
        let config = ExperimentConfig {
            scenes: vec![scene],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SceneConfigError::ProbeGroupTooLarge(_))
        ));
    }

    #[test]
    fn gym_without_peer_mode_is_rejected() {
        let mut scene = SceneSpec::gym_scene("coop", 2);
        scene.peer_mode = PeerMode::None;
        scene.redirect_url = Some("https://example.org".to_string());
        let config = ExperimentConfig {
            scenes: vec![scene],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SceneConfigError::MissingPeerMode(_))
        ));
    }

    #[test]
    fn scene_tree_round_trips_through_json() {
        let config = ExperimentConfig {
            experiment_id: "rt".into(),
            scenes: vec![SceneSpec::static_scene("intro"), two_player_gym()],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ExperimentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.scenes.len(), 2);
        assert_eq!(back.scenes[1].group_size, 2);
        assert_eq!(back.scenes[1].kind, SceneKind::Gym);
    }
}
