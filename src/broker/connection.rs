//! Broker connection state machine.
//!
//! # States
//! - Disconnected: no usable link
//! - Connecting: a dial is in progress
//! - Connected: link established, sessions can be opened
//!
//! # State Transitions
//! ```text
//! Disconnected → Connecting: connect() or reconnect attempt
//! Connecting → Connected: dial succeeded
//! Connecting → Disconnected: dial failed
//! Connected → Disconnected: link error detected, or shutdown()
//! ```
//!
//! # Design Decisions
//! - After the first successful connect a supervisor task watches the link
//!   and redials with jittered exponential backoff until it succeeds
//! - shutdown() is final: it stops the supervisor and releases the link
//! - State changes and link installs happen under the link slot's lock, and a
//!   link dialed after shutdown() started is closed instead of installed

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broker::error::{BrokerError, Result};
use crate::broker::transport::{Dialer, Link, Session};
use crate::observability::metrics;
use crate::resilience::Backoff;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    address: String,
    dialer: Arc<dyn Dialer>,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    link: RwLock<Option<Arc<dyn Link>>>,
    supervising: AtomicBool,
    stop: CancellationToken,
}

/// One logical connection to the broker.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a disconnected connection to `address`.
    pub fn new(address: impl Into<String>, dialer: Arc<dyn Dialer>, backoff: Backoff) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                address: address.into(),
                dialer,
                backoff,
                state,
                link: RwLock::new(None),
                supervising: AtomicBool::new(false),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Non-blocking point query.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Establish the link.
    ///
    /// Succeeds immediately when already connected.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.stop.is_cancelled() {
            return Err(BrokerError::NotConnected);
        }
        if self.is_connected() {
            return Ok(());
        }

        if !self.transition(ConnectionState::Connecting) {
            return Err(BrokerError::NotConnected);
        }
        let link = match self.inner.dialer.dial(&self.inner.address).await {
            Ok(link) => link,
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                return Err(BrokerError::Connect {
                    address: self.inner.address.clone(),
                    source: Box::new(e),
                });
            }
        };

        if !self.install(Arc::clone(&link)).await {
            return Err(BrokerError::NotConnected);
        }
        if !self.inner.supervising.swap(true, Ordering::SeqCst) {
            let this = self.clone();
            tokio::spawn(async move { this.supervise(link).await });
        }
        Ok(())
    }

    /// Block until the state is `Connected`.
    pub async fn wait_for_connection(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|state| *state == ConnectionState::Connected).await;
    }

    /// Open a new session on the current link.
    pub async fn session(&self) -> Result<Box<dyn Session>> {
        let link = self.current_link().ok_or(BrokerError::NotConnected)?;
        link.open_session().await
    }

    /// Release the link and stop reconnecting. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.stop.cancel();
        let link = {
            let mut slot = self.slot();
            self.inner.state.send_replace(ConnectionState::Disconnected);
            slot.take()
        };
        if let Some(link) = link {
            link.close().await;
        }
    }

    /// Make `link` current and move to `Connected`.
    ///
    /// Returns false, closing `link`, once shutdown has started.
    async fn install(&self, link: Arc<dyn Link>) -> bool {
        {
            let mut slot = self.slot();
            if !self.inner.stop.is_cancelled() {
                *slot = Some(link);
                self.inner.state.send_replace(ConnectionState::Connected);
                return true;
            }
            self.inner.state.send_replace(ConnectionState::Disconnected);
        }
        tracing::debug!(address = %self.inner.address, "Discarding link dialed during shutdown");
        link.close().await;
        false
    }

    /// Move to `state` unless shutdown has started. Returns whether it moved.
    fn transition(&self, state: ConnectionState) -> bool {
        let _slot = self.slot();
        if self.inner.stop.is_cancelled() {
            return false;
        }
        self.inner.state.send_replace(state);
        true
    }

    fn slot(&self) -> RwLockWriteGuard<'_, Option<Arc<dyn Link>>> {
        // The slot holds a plain Option; a poisoned lock leaves it consistent.
        self.inner
            .link
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_link(&self) -> Option<Arc<dyn Link>> {
        self.inner
            .link
            .read()
            .map(|slot| slot.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Watch the link; on loss, redial until connected again or stopped.
    async fn supervise(self, mut link: Arc<dyn Link>) {
        loop {
            tokio::select! {
                _ = self.inner.stop.cancelled() => return,
                _ = link.closed() => {}
            }
            if self.inner.stop.is_cancelled() {
                return;
            }

            {
                let mut slot = self.slot();
                slot.take();
                if !self.inner.stop.is_cancelled() {
                    self.inner.state.send_replace(ConnectionState::Disconnected);
                }
            }
            tracing::warn!(address = %self.inner.address, "Broker link lost, reconnecting");

            match self.redial().await {
                Some(new_link) => {
                    if !self.install(Arc::clone(&new_link)).await {
                        return;
                    }
                    metrics::record_reconnect();
                    tracing::info!(address = %self.inner.address, "Broker link re-established");
                    link = new_link;
                }
                None => return,
            }
        }
    }

    async fn redial(&self) -> Option<Arc<dyn Link>> {
        let mut attempt: u32 = 0;
        loop {
            if !self.transition(ConnectionState::Connecting) {
                return None;
            }
            match self.inner.dialer.dial(&self.inner.address).await {
                Ok(link) => return Some(link),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    self.transition(ConnectionState::Disconnected);
                    let delay = self.inner.backoff.delay(attempt);
                    if Backoff::should_warn(attempt) {
                        tracing::warn!(
                            address = %self.inner.address,
                            attempt,
                            delay = ?delay,
                            error = %e,
                            "Reconnect failed"
                        );
                    } else {
                        tracing::debug!(attempt, delay = ?delay, error = %e, "Reconnect failed");
                    }
                    tokio::select! {
                        _ = self.inner.stop.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}
