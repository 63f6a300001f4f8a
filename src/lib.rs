#![cfg_attr(not(test), deny(clippy::panic))]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_excessive_bools,
    clippy::too_many_arguments,
    clippy::too_many_lines,
    clippy::similar_names
)]

//! # Cohort Server
//!
//! A lightweight, in-memory WebSocket coordination server for browser-based
//! multi-participant experiments.
//!
//! Participants are routed through a researcher-defined scene graph; when a
//! scene needs real-time multiplayer interaction the server groups them,
//! brokers their peer channels, and synchronizes actions with
//! deterministic-replay guarantees. No database, no cloud services: run the
//! binary and connect over WebSocket.

/// Server configuration and the experiment/scene tree
pub mod config;

/// Structured logging configuration
pub mod logging;

/// Pluggable matchmaking strategies
pub mod matchmaker;

/// Research data persistence (JSON-lines sink, background writer)
pub mod persistence;

/// WebSocket message protocol definitions
pub mod protocol;

/// Entity registry: participants, sessions, waiting rooms, groups, games
pub mod registry;

/// Main server orchestration
pub mod server;

/// Server-authoritative simulation seam
pub mod stepper;

/// Structured telemetry events
pub mod telemetry;

/// WebSocket connection handling
pub mod websocket;
