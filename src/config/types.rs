//! Root configuration types.

use serde::{Deserialize, Serialize};

use super::defaults::default_port;
use super::logging::LoggingConfig;
use super::scene::ExperimentConfig;
use super::server::CoreConfig;

/// Root configuration struct for the coordination server.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub server: CoreConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            server: CoreConfig::default(),
            experiment: ExperimentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
