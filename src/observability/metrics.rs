//! Metrics collection and exposition.
//!
//! # Metrics
//! - `broker_deliveries_total` (counter): deliveries by routing key and outcome
//!   (`ok`, `error`, `unhandled`)
//! - `broker_publishes_total` (counter): publishes by exchange and outcome
//! - `broker_reconnects_total` (counter): re-established broker links
//! - `listener_forced_stops_total` (counter): listeners stopped past their grace period
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed
//! - The Prometheus recorder is installed at most once per process; the debug
//!   listener renders it

use std::sync::OnceLock;

use metrics::counter;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder.
///
/// Calling it again returns the handle installed first.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(HANDLE.get_or_init(|| handle).clone())
}

/// The installed recorder, if any.
pub fn handle() -> Option<&'static PrometheusHandle> {
    HANDLE.get()
}

pub fn record_delivery(routing_key: &str, outcome: &'static str) {
    counter!(
        "broker_deliveries_total",
        "routing_key" => routing_key.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_publish(exchange: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!(
        "broker_publishes_total",
        "exchange" => exchange.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_reconnect() {
    counter!("broker_reconnects_total").increment(1);
}

pub fn record_forced_stop(listener: &str) {
    counter!("listener_forced_stops_total", "listener" => listener.to_string()).increment(1);
}
