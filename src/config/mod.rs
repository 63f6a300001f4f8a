//! Configuration module for the coordination server.
//!
//! Supports JSON configuration files, environment variable overrides, and
//! compiled-in defaults. The experiment/scene tree is validated once at
//! load and immutable thereafter.
//!
//! # Module Structure
//!
//! - [`types`]: Root `Config` struct
//! - [`server`]: Process-level behavior (timeouts, secrets, persistence)
//! - [`scene`]: Experiment and scene configuration tree
//! - [`logging`]: Logging configuration
//! - [`loader`]: Configuration loading functions
//! - [`defaults`]: Default value functions

// Submodules
pub mod defaults;
pub mod loader;
pub mod logging;
pub mod scene;
pub mod server;
pub mod types;

// Re-exports for convenience
pub use loader::load;

pub use logging::{LogFormat, LogLevel, LoggingConfig};

pub use scene::{
    ActionPopulationPolicy, DataCollectionConfig, ExperimentConfig, PeerMode, SceneConfigError,
    SceneKind, SceneSpec, ScreeningConfig, WaitroomTimeoutBehavior,
};

pub use server::CoreConfig;

pub use types::Config;
