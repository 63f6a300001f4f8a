use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::server::ExperimentServer;

use super::handler::ws_handler;

/// Build the adapter router: the WebSocket endpoint, a liveness probe, and
/// the password-gated read-only admin snapshot.
pub fn create_router(cors_origins: &str) -> Router<Arc<ExperimentServer>> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/admin/state", get(admin_state_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
}

/// Cross-origin policy. `*` opts into fully permissive CORS; anything else
/// is a strict comma-separated allowlist. A malformed entry is dropped
/// with an error, and an empty usable set refuses cross-origin browsers
/// outright: misconfiguration never widens access.
fn cors_layer(cors_origins: &str) -> CorsLayer {
    if cors_origins.trim() == "*" {
        return CorsLayer::permissive();
    }

    let mut origins: Vec<HeaderValue> = Vec::new();
    for raw in cors_origins.split(',').map(str::trim) {
        if raw.is_empty() {
            continue;
        }
        match raw.parse::<HeaderValue>() {
            Ok(origin) => origins.push(origin),
            Err(_) => {
                tracing::error!(origin = raw, "dropping unparseable CORS origin");
            }
        }
    }

    if origins.is_empty() {
        tracing::error!(
            configured = cors_origins,
            "no usable CORS origins; cross-origin requests will be refused"
        );
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct AdminQuery {
    password: Option<String>,
}

/// Read-only counters for operators. Disabled entirely unless an admin
/// password is configured.
async fn admin_state_handler(
    State(server): State<Arc<ExperimentServer>>,
    Query(query): Query<AdminQuery>,
) -> impl IntoResponse {
    let Some(expected) = server.config().admin_password.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let presented = query.password.unwrap_or_default();
    let matches: bool = expected
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .into();
    if !matches {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    Json(server.admin_state().await).into_response()
}
