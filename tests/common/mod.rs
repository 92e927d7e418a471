//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use multiserve::config::BrokerConfig;
use multiserve::server::{stop_within, HealthSink, Listener, ServeContext, StopOutcome};

/// Reserve a local address by binding port 0 and releasing it.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Broker settings for the in-memory transport with fast backoff.
pub fn memory_broker_config(queue: &str) -> BrokerConfig {
    BrokerConfig {
        address: "memory://test".into(),
        subscriber_queue: queue.into(),
        reconnect_base_ms: 5,
        reconnect_max_ms: 20,
        drain_timeout_ms: 500,
        ..Default::default()
    }
}

/// Shared log of what scripted listeners did.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
    outcomes: Arc<Mutex<Vec<(String, StopOutcome)>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn outcomes(&self) -> Vec<(String, StopOutcome)> {
        self.outcomes.lock().unwrap().clone()
    }
}

/// A listener that binds nothing: it reports ready, waits for cancellation
/// and then takes `stop_delay` to stop cleanly.
pub struct ScriptedListener {
    pub name: String,
    pub stop_delay: Duration,
    pub grace_period: Duration,
    pub journal: Journal,
}

impl ScriptedListener {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            stop_delay: Duration::from_millis(1),
            grace_period: Duration::from_millis(200),
            journal: journal.clone(),
        }
    }

    pub fn stopping(mut self, stop_delay: Duration, grace_period: Duration) -> Self {
        self.stop_delay = stop_delay;
        self.grace_period = grace_period;
        self
    }
}

#[async_trait]
impl Listener for ScriptedListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(self: Box<Self>, ctx: ServeContext) {
        self.journal.record(format!("{}:started", self.name));
        if let Some(health) = &ctx.health {
            health.set_serving(&self.name).await;
        }
        ctx.reporter.ready(&self.name);

        ctx.shutdown.cancelled().await;

        if let Some(health) = &ctx.health {
            health.set_not_serving(&self.name).await;
        }
        let delay = self.stop_delay;
        let stopping = tokio::spawn(async move { tokio::time::sleep(delay).await });
        let outcome = stop_within(&self.name, self.grace_period, stopping).await;
        self.journal.record(format!("{}:stopped", self.name));
        self.journal
            .outcomes
            .lock()
            .unwrap()
            .push((self.name.clone(), outcome));
    }
}

/// Health sink recording every status change in order.
#[derive(Debug, Clone, Default)]
pub struct RecordingHealth {
    changes: Arc<Mutex<Vec<(String, bool)>>>,
}

impl RecordingHealth {
    pub fn changes(&self) -> Vec<(String, bool)> {
        self.changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthSink for RecordingHealth {
    async fn set_serving(&self, service: &str) {
        self.changes.lock().unwrap().push((service.to_string(), true));
    }

    async fn set_not_serving(&self, service: &str) {
        self.changes.lock().unwrap().push((service.to_string(), false));
    }
}
