//! OS signal handling.
//!
//! # Responsibilities
//! - Register termination handlers (SIGINT, SIGTERM, Ctrl+C)
//! - Expose a single-fire notification the orchestrator reads once
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The source is constructed explicitly and passed to the orchestrator;
//!   there is no process-global channel
//! - Only the first termination request fires; later ones are logged and ignored

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Latch {
    fired: AtomicBool,
    token: CancellationToken,
}

impl Latch {
    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }
}

/// Single-fire termination notification.
#[derive(Debug)]
pub struct SignalSource {
    latch: Arc<Latch>,
}

/// Handle that fires a [`SignalSource`] by hand.
#[derive(Debug, Clone)]
pub struct SignalTrigger {
    latch: Arc<Latch>,
}

impl SignalSource {
    /// Listen for OS termination signals.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_os() -> std::io::Result<Self> {
        let (source, trigger) = Self::manual();
        let mut requests = os::TerminationRequests::register()?;

        tokio::spawn(async move {
            loop {
                let signal = requests.next().await;
                if trigger.fire() {
                    tracing::info!(signal, "Termination signal received");
                } else {
                    tracing::warn!(signal, "Termination signal received again, shutdown already in progress");
                }
            }
        });

        Ok(source)
    }

    /// A source that only fires through the returned trigger.
    pub fn manual() -> (Self, SignalTrigger) {
        let latch = Arc::new(Latch::default());
        (
            Self {
                latch: Arc::clone(&latch),
            },
            SignalTrigger { latch },
        )
    }

    /// Wait until the source fires.
    pub async fn wait(&self) {
        self.latch.token.cancelled().await
    }

    /// Whether the source has fired.
    pub fn has_fired(&self) -> bool {
        self.latch.fired.load(Ordering::SeqCst)
    }
}

impl SignalTrigger {
    /// Fire the source. Returns `true` only for the first call.
    pub fn fire(&self) -> bool {
        self.latch.fire()
    }
}

#[cfg(unix)]
mod os {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    pub(super) struct TerminationRequests {
        interrupt: Signal,
        terminate: Signal,
    }

    impl TerminationRequests {
        pub(super) fn register() -> std::io::Result<Self> {
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        pub(super) async fn next(&mut self) -> &'static str {
            tokio::select! {
                _ = self.interrupt.recv() => "SIGINT",
                _ = self.terminate.recv() => "SIGTERM",
            }
        }
    }
}

#[cfg(not(unix))]
mod os {
    pub(super) struct TerminationRequests;

    impl TerminationRequests {
        pub(super) fn register() -> std::io::Result<Self> {
            Ok(Self)
        }

        pub(super) async fn next(&mut self) -> &'static str {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            "ctrl-c"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_at_most_once() {
        let (source, trigger) = SignalSource::manual();
        assert!(!source.has_fired());

        assert!(trigger.fire());
        assert!(!trigger.fire());
        assert!(!trigger.clone().fire());
        assert!(source.has_fired());
    }

    #[tokio::test]
    async fn wait_resolves_after_fire() {
        let (source, trigger) = SignalSource::manual();

        let pending = tokio::time::timeout(Duration::from_millis(50), source.wait()).await;
        assert!(pending.is_err());

        trigger.fire();
        tokio::time::timeout(Duration::from_millis(100), source.wait())
            .await
            .expect("fired source should resolve");
        // Reading again after firing stays resolved.
        source.wait().await;
    }
}
