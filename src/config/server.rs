//! Core server behavior configuration.

use serde::{Deserialize, Serialize};

use super::defaults::{
    default_cors_origins, default_data_dir, default_game_grace_secs, default_grace_secs,
    default_maintenance_interval_secs, default_max_message_size, default_ping_timeout_secs,
    default_probe_timeout_secs, default_reset_ack_timeout_secs, default_shutdown_drain_secs,
    default_sink_queue_capacity, default_teardown_drain_ms,
    default_waitroom_status_interval_secs,
};
use crate::protocol::IceServerConfig;

/// Process-level settings: capacities, timeouts, secrets, persistence.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CoreConfig {
    /// Maximum inbound frame size in bytes; larger frames are rejected.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Connections silent for this long are reaped (seconds).
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    /// Interval of the background prune task (seconds).
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    /// Disconnect grace for non-game scenes (seconds).
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Disconnect grace while a multiplayer game is active (seconds).
    #[serde(default = "default_game_grace_secs")]
    pub game_grace_secs: u64,
    /// Probe RTT measurement timeout (seconds).
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// How long to wait for every `reset_complete` ack (seconds).
    #[serde(default = "default_reset_ack_timeout_secs")]
    pub reset_ack_timeout_secs: u64,
    /// Drain period between termination and registry deletion (ms).
    #[serde(default = "default_teardown_drain_ms")]
    pub teardown_drain_ms: u64,
    /// Interval between waiting room status heartbeats (seconds).
    #[serde(default = "default_waitroom_status_interval_secs")]
    pub waitroom_status_interval_secs: u64,
    /// Bound on outbound-queue draining at shutdown (seconds).
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
    /// Secret used to sign session tokens. Generated at boot when absent,
    /// in which case tokens do not survive a restart.
    #[serde(default)]
    pub session_secret: Option<String>,
    /// Password gating the read-only admin snapshot; disabled when absent.
    #[serde(default)]
    pub admin_password: Option<String>,
    /// Directory the JSON-lines data sink writes under.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Bound on the background sink queue; overflow drops oldest.
    #[serde(default = "default_sink_queue_capacity")]
    pub sink_queue_capacity: usize,
    /// STUN/TURN servers handed to peers in `experiment_config`.
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
    /// Comma-separated allowed CORS origins, or "*".
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            ping_timeout_secs: default_ping_timeout_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            grace_secs: default_grace_secs(),
            game_grace_secs: default_game_grace_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            reset_ack_timeout_secs: default_reset_ack_timeout_secs(),
            teardown_drain_ms: default_teardown_drain_ms(),
            waitroom_status_interval_secs: default_waitroom_status_interval_secs(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
            session_secret: None,
            admin_password: None,
            data_dir: default_data_dir(),
            sink_queue_capacity: default_sink_queue_capacity(),
            ice_servers: Vec::new(),
            cors_origins: default_cors_origins(),
        }
    }
}
