//! Process orchestration.
//!
//! # Responsibilities
//! - Own the listeners and the optional broker engine
//! - Sequence startup: debug listener, broker init, consumer, listeners
//! - Block until termination, then sequence shutdown
//!
//! # State Transitions
//! ```text
//! Registering ──run()──▶ Starting ──all listeners ready──▶ Running
//!      │                    │                                 │
//!      │          broker init failed                 signal / fatal report
//!      │                    ▼                                 ▼
//!      │               return Err                       Draining ──units == 0──▶ return
//! ```
//!
//! # Design Decisions
//! - Broker disconnect strictly precedes cancelling the shared token
//! - A listener bind failure ends the run with an error after a full teardown
//! - `run` consumes the orchestrator, so registration cannot race with it

use std::sync::Arc;

use crate::broker::{Broker, BrokerError};
use crate::config::DebugConfig;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::SignalSource;
use crate::lifecycle::tracker::UnitTracker;
use crate::server::{debug, HealthSink, Listener, ListenerError, ListenerReport, Reporter, ServeContext};

/// Error type for orchestrated runs.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to initialize broker: {0}")]
    Broker(#[source] BrokerError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Runs listeners and a broker engine as one service.
pub struct Orchestrator {
    name: String,
    signals: SignalSource,
    listeners: Vec<Box<dyn Listener>>,
    broker: Option<Broker>,
    debug: Option<DebugConfig>,
    shutdown: Shutdown,
    tracker: UnitTracker,
}

impl Orchestrator {
    pub fn new(name: impl Into<String>, signals: SignalSource) -> Self {
        Self {
            name: name.into(),
            signals,
            listeners: Vec::new(),
            broker: None,
            debug: None,
            shutdown: Shutdown::new(),
            tracker: UnitTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a listener. Listeners start in registration order.
    pub fn add_server(&mut self, listener: impl Listener) -> &mut Self {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Register the broker engine, replacing any earlier one.
    pub fn add_broker(&mut self, broker: Broker) -> &mut Self {
        if self.broker.replace(broker).is_some() {
            tracing::warn!("Replacing previously registered broker");
        }
        self
    }

    /// Serve the debug endpoints when `config.enabled`.
    pub fn with_debug(&mut self, config: DebugConfig) -> &mut Self {
        self.debug = config.enabled.then_some(config);
        self
    }

    /// The tracker counting this orchestrator's concurrent units.
    pub fn tracker(&self) -> UnitTracker {
        self.tracker.clone()
    }

    /// Start everything, block until termination, then shut down.
    ///
    /// Returns after every unit has completed.
    pub async fn run(self, health: Option<Arc<dyn HealthSink>>) -> Result<(), OrchestratorError> {
        let Orchestrator {
            name,
            signals,
            mut listeners,
            broker,
            debug,
            shutdown,
            tracker,
        } = self;

        tracing::info!(service = %name, "Starting service");

        if let Some(config) = &debug {
            listeners.push(Box::new(debug::listener(config, &name, tracker.clone())));
        }

        if let Some(broker) = &broker {
            broker.initialize().await.map_err(OrchestratorError::Broker)?;

            if broker.has_consumer() {
                let unit = tracker.register("broker-consumer");
                let consumer = broker.clone();
                tokio::spawn(async move { consumer.consume(unit).await });
            } else if broker.config().track_publisher_unit {
                broker.hold_unit(tracker.register("broker-publisher"));
            }
        }

        let (reporter, mut reports) = Reporter::channel();
        let total = listeners.len();
        for listener in listeners {
            let ctx = ServeContext {
                shutdown: shutdown.token(),
                unit: tracker.register(listener.name()),
                health: health.clone(),
                reporter: reporter.clone(),
            };
            tokio::spawn(listener.serve(ctx));
        }

        let mut pending = total;
        if pending == 0 {
            tracing::info!(service = %name, "Service running");
        }
        let failure = loop {
            tokio::select! {
                _ = signals.wait() => {
                    tracing::info!(service = %name, "Termination requested, shutting down");
                    break None;
                }
                report = reports.recv() => match report {
                    Some(ListenerReport::Ready(listener)) => {
                        tracing::debug!(listener = %listener, "Listener ready");
                        pending = pending.saturating_sub(1);
                        if pending == 0 {
                            tracing::info!(service = %name, listeners = total, "Service running");
                        }
                    }
                    Some(ListenerReport::Fatal(e)) => {
                        tracing::error!(service = %name, error = %e, "Listener failure, shutting down");
                        break Some(e);
                    }
                    // `reporter` is held here, so the channel stays open.
                    None => break None,
                },
            }
        };

        if let Some(broker) = &broker {
            if let Err(e) = broker.disconnect().await {
                tracing::error!(error = %e, "Broker disconnect failed");
            }
        }
        shutdown.trigger();
        drop(reporter);

        tracing::debug!(outstanding = tracker.outstanding(), "Waiting for units to finish");
        tracker.wait().await;
        tracing::info!(service = %name, "Shutdown complete");

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
