//! WebSocket transport adapter.
//!
//! The core itself is transport-agnostic: this module adapts axum
//! WebSocket connections into the `(connection_id, message)` pairs the
//! dispatcher consumes, and drains each connection's outbound queue onto
//! the socket.

mod connection;
mod handler;
mod routes;

pub use routes::create_router;
