//! Tracking of outstanding concurrent units.
//!
//! # Responsibilities
//! - Count every spawned unit (listener, broker consumer)
//! - Release each unit exactly once when it exits
//! - Let the orchestrator wait until the count drops to zero
//!
//! # Design Decisions
//! - Registration returns a guard; the guard's `Drop` is the only release path,
//!   so a unit can neither leak its slot nor release it twice

use std::sync::Arc;
use tokio::sync::watch;

/// Counter of outstanding concurrent units.
#[derive(Debug, Clone)]
pub struct UnitTracker {
    outstanding: Arc<watch::Sender<usize>>,
}

impl UnitTracker {
    /// Create a tracker with no outstanding units.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            outstanding: Arc::new(tx),
        }
    }

    /// Register a new unit. Returns a guard that releases the unit on drop.
    pub fn register(&self, name: impl Into<String>) -> UnitGuard {
        let name = name.into();
        self.outstanding.send_modify(|n| *n += 1);
        tracing::trace!(unit = %name, outstanding = self.outstanding(), "Unit registered");
        UnitGuard {
            outstanding: Arc::clone(&self.outstanding),
            name,
        }
    }

    /// Current number of outstanding units.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Wait until every registered unit has been released.
    pub async fn wait(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for UnitTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard representing one outstanding unit.
#[derive(Debug)]
pub struct UnitGuard {
    outstanding: Arc<watch::Sender<usize>>,
    name: String,
}

impl UnitGuard {
    /// Name the unit was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        tracing::trace!(unit = %self.name, "Unit completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tracker_counts() {
        let tracker = UnitTracker::new();
        assert_eq!(tracker.outstanding(), 0);

        let g1 = tracker.register("a");
        assert_eq!(tracker.outstanding(), 1);

        let g2 = tracker.register("b");
        assert_eq!(tracker.outstanding(), 2);
        assert_eq!(g2.name(), "b");

        drop(g1);
        assert_eq!(tracker.outstanding(), 1);

        drop(g2);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let tracker = UnitTracker::new();
        tokio::time::timeout(Duration::from_millis(100), tracker.wait())
            .await
            .expect("idle tracker should not block");
    }

    #[tokio::test]
    async fn wait_blocks_until_all_released() {
        let tracker = UnitTracker::new();
        let guard = tracker.register("slow");

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
