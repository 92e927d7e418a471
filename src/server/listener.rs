//! Listener contract shared by every transport.
//!
//! # Responsibilities
//! - Bind one network endpoint and serve until the shared token fires
//! - Report readiness after bind, and bind failures as fatal
//! - Stop within a bounded grace period, forcing termination past it
//!
//! # Design Decisions
//! - The unit guard travels inside [`ServeContext`]; dropping the context on
//!   any exit path releases the unit, including the bind-failure path
//! - A bind failure is reported to the orchestrator rather than exiting the
//!   process here, so teardown stays ordered

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::UnitGuard;
use crate::observability::metrics;
use crate::server::health::HealthSink;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("listener '{listener}' failed to bind {address}: {source}")]
    Bind {
        listener: String,
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener '{listener}' stopped serving: {reason}")]
    Serve { listener: String, reason: String },
}

/// Status a listener reports back to the orchestrator.
#[derive(Debug)]
pub enum ListenerReport {
    /// The endpoint is bound and serving.
    Ready(String),
    /// The listener cannot serve; the process must stop.
    Fatal(ListenerError),
}

/// Sending half of the listener report channel.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<ListenerReport>,
}

impl Reporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ListenerReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn ready(&self, listener: &str) {
        let _ = self.tx.send(ListenerReport::Ready(listener.to_string()));
    }

    pub fn fatal(&self, error: ListenerError) {
        tracing::error!(error = %error, "Listener failed");
        let _ = self.tx.send(ListenerReport::Fatal(error));
    }
}

/// Everything a listener needs while serving.
pub struct ServeContext {
    /// Shared cancellation token; serving stops when it fires.
    pub shutdown: CancellationToken,
    /// This listener's unit; released when the context is dropped.
    pub unit: UnitGuard,
    /// Optional health-reporting sink.
    pub health: Option<Arc<dyn HealthSink>>,
    /// Channel back to the orchestrator.
    pub reporter: Reporter,
}

/// One network endpoint.
#[async_trait]
pub trait Listener: Send + 'static {
    /// Name used for logs, health reporting and unit tracking.
    fn name(&self) -> &str;

    /// Bind, serve until `ctx.shutdown` fires, then stop within the grace period.
    async fn serve(self: Box<Self>, ctx: ServeContext);
}

/// How a listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The clean stop finished within the grace period.
    Graceful,
    /// The grace period elapsed; the serving task was aborted.
    Forced,
}

/// Wait up to `grace` for `task` to finish its clean stop, aborting it otherwise.
pub async fn stop_within<T>(name: &str, grace: Duration, mut task: JoinHandle<T>) -> StopOutcome {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(_) => {
            tracing::info!(listener = name, "Listener stopped gracefully");
            StopOutcome::Graceful
        }
        Err(_) => {
            task.abort();
            metrics::record_forced_stop(name);
            tracing::warn!(
                listener = name,
                grace_period = ?grace,
                "Listener did not stop within grace period, forcing shutdown"
            );
            StopOutcome::Forced
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopping_after(delay: Duration) -> JoinHandle<()> {
        tokio::spawn(async move { tokio::time::sleep(delay).await })
    }

    #[tokio::test]
    async fn fast_stop_is_graceful() {
        let outcome = stop_within(
            "fast",
            Duration::from_millis(100),
            stopping_after(Duration::from_millis(10)),
        )
        .await;
        assert_eq!(outcome, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn slow_stop_is_forced() {
        let started = std::time::Instant::now();
        let outcome = stop_within(
            "slow",
            Duration::from_millis(50),
            stopping_after(Duration::from_millis(200)),
        )
        .await;
        assert_eq!(outcome, StopOutcome::Forced);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn reporter_delivers_in_order() {
        let (reporter, mut rx) = Reporter::channel();
        reporter.ready("a");
        reporter.fatal(ListenerError::Serve {
            listener: "b".into(),
            reason: "gone".into(),
        });

        assert!(matches!(rx.recv().await, Some(ListenerReport::Ready(name)) if name == "a"));
        assert!(matches!(rx.recv().await, Some(ListenerReport::Fatal(_))));
    }
}
