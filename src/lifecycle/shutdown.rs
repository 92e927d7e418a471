//! Shutdown coordination.

use tokio_util::sync::CancellationToken;

/// An owned cancellation handle.
///
/// Long-running tasks hold a token obtained from [`Shutdown::token`] and exit
/// once it fires. Triggering is idempotent: only the first call has an effect.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Create a new shutdown handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that fires when this handle is triggered.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger the shutdown signal. Returns `true` on the first call only.
    pub fn trigger(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the signal fires.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        assert!(!token.is_cancelled());

        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(token.is_cancelled());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn clones_share_the_signal() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        other.trigger();
        shutdown.triggered().await;
    }
}
