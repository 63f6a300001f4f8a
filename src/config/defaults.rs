//! Default value functions for configuration fields.
//!
//! All defaults used by serde's `#[serde(default = ...)]` attributes live
//! here, grouped by category.

use super::logging::LogFormat;

// =============================================================================
// Port & Root Config
// =============================================================================

pub const fn default_port() -> u16 {
    8090
}

// =============================================================================
// Core Server Defaults
// =============================================================================

pub const fn default_max_message_size() -> usize {
    65536 // 64KB
}

pub const fn default_ping_timeout_secs() -> u64 {
    30
}

pub const fn default_maintenance_interval_secs() -> u64 {
    60
}

/// Disconnect grace for non-game scenes (seconds).
pub const fn default_grace_secs() -> u64 {
    15
}

/// Disconnect grace while a multiplayer game is active (seconds).
pub const fn default_game_grace_secs() -> u64 {
    30
}

pub const fn default_probe_timeout_secs() -> u64 {
    5
}

pub const fn default_reset_ack_timeout_secs() -> u64 {
    10
}

/// Drain period between game termination and registry deletion (ms).
pub const fn default_teardown_drain_ms() -> u64 {
    100
}

/// Interval between `waiting_room_status` heartbeats (seconds).
pub const fn default_waitroom_status_interval_secs() -> u64 {
    5
}

pub const fn default_shutdown_drain_secs() -> u64 {
    5
}

pub fn default_data_dir() -> String {
    "data".to_string()
}

pub const fn default_sink_queue_capacity() -> usize {
    1024
}

pub fn default_cors_origins() -> String {
    "*".to_string()
}

// =============================================================================
// Scene Defaults
// =============================================================================

pub const fn default_group_size() -> usize {
    2
}

pub fn default_matcher() -> String {
    "fifo".to_string()
}

pub const fn default_waitroom_max_wait_secs() -> u64 {
    120
}

pub const fn default_countdown_secs() -> u64 {
    3
}

pub const fn default_tick_rate() -> u32 {
    10
}

pub const fn default_episodes() -> u32 {
    1
}

pub const fn default_reset_freeze_secs() -> u64 {
    0
}

pub const fn default_hash_sampling_every() -> u64 {
    30
}

// =============================================================================
// Logging Defaults
// =============================================================================

pub fn default_log_dir() -> String {
    "logs".to_string()
}

pub fn default_log_filename() -> String {
    "server.log".to_string()
}

pub fn default_rotation() -> String {
    "daily".to_string()
}

pub const fn default_enable_file_logging() -> bool {
    false
}

pub const fn default_log_format() -> LogFormat {
    LogFormat::Text
}
