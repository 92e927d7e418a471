//! Debug / introspection endpoints.
//!
//! - `GET /debug/status`: service name, version, uptime, outstanding units
//! - `GET /metrics`: Prometheus text, when a recorder is installed

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::config::DebugConfig;
use crate::lifecycle::UnitTracker;
use crate::observability::metrics;
use crate::server::http::HttpListener;

#[derive(Clone)]
struct DebugState {
    name: Arc<str>,
    started: Instant,
    tracker: UnitTracker,
}

#[derive(Debug, Serialize)]
struct Status<'a> {
    name: &'a str,
    version: &'static str,
    uptime_secs: u64,
    outstanding_units: usize,
}

/// Router serving the debug endpoints.
pub fn router(name: &str, tracker: UnitTracker) -> Router {
    let state = DebugState {
        name: Arc::from(name),
        started: Instant::now(),
        tracker,
    };
    Router::new()
        .route("/debug/status", get(status))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

/// The debug endpoints as a listener.
pub fn listener(config: &DebugConfig, name: &str, tracker: UnitTracker) -> HttpListener {
    HttpListener::new(
        "debug",
        config.bind_address.as_str(),
        config.grace_period(),
        router(name, tracker),
    )
}

async fn status(State(state): State<DebugState>) -> Response {
    Json(Status {
        name: &state.name,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
        outstanding_units: state.tracker.outstanding(),
    })
    .into_response()
}

async fn render_metrics() -> Response {
    match metrics::handle() {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
