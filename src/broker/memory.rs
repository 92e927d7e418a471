//! In-process broker.
//!
//! Implements the transport traits without a network. Used for local runs
//! (`memory://` addresses) and for exercising the engine in tests: links can
//! be severed and dials refused to simulate an unreliable broker.
//!
//! Routing: a message published to an exchange is copied to every queue bound
//! with an equal routing key, or with `#` (matches everything).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::error::{BrokerError, Result};
use crate::broker::transport::{
    Acker, Delivery, DeliveryStream, Dialer, Envelope, ExchangeKind, Link, Session,
};
use crate::metadata::Metadata;

/// A message as stored in a queue or the publish log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub headers: Metadata,
    pub payload: Bytes,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckCounts {
    pub acked: usize,
    pub rejected: usize,
}

struct Queue {
    tx: mpsc::UnboundedSender<StoredMessage>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<StoredMessage>>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<(String, String, String)>,
    queues: HashMap<String, Queue>,
    links: HashMap<u64, CancellationToken>,
    next_link: u64,
    open_sessions: usize,
    refuse_dials: bool,
    dial_count: usize,
    published: Vec<StoredMessage>,
    acks: AckCounts,
    prefetch: Option<u16>,
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dialer connecting to this broker.
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(MemoryDialer {
            broker: self.clone(),
        })
    }

    /// Make subsequent dials fail (or succeed again).
    pub fn refuse_dials(&self, refuse: bool) {
        self.lock().refuse_dials = refuse;
    }

    /// Drop every open link, as a broker restart would.
    pub fn sever_links(&self) {
        let links = std::mem::take(&mut self.lock().links);
        for link in links.into_values() {
            link.cancel();
        }
    }

    /// Links dialed and neither closed nor severed.
    pub fn open_links(&self) -> usize {
        self.lock().links.len()
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    /// Number of dial attempts so far, successful or not.
    pub fn dial_count(&self) -> usize {
        self.lock().dial_count
    }

    /// Every message published so far, routed or not.
    pub fn published(&self) -> Vec<StoredMessage> {
        self.lock().published.clone()
    }

    pub fn ack_counts(&self) -> AckCounts {
        self.lock().acks
    }

    /// Last prefetch limit set by a consumer.
    pub fn prefetch(&self) -> Option<u16> {
        self.lock().prefetch
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|(q, e, k)| q == queue && e == exchange && k == routing_key)
    }

    /// Route a message through `exchange`, as a remote publisher would.
    pub fn publish(&self, exchange: &str, routing_key: &str, headers: Metadata, payload: impl Into<Bytes>) -> Result<()> {
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            headers,
            payload: payload.into(),
        };
        self.route(message)
    }

    fn route(&self, message: StoredMessage) -> Result<()> {
        let mut state = self.lock();
        if !state.exchanges.contains_key(&message.exchange) {
            return Err(BrokerError::Transport(format!(
                "no exchange '{}'",
                message.exchange
            )));
        }
        // One copy per queue, however many of its bindings match.
        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(_, e, k)| *e == message.exchange && (k == "#" || *k == message.routing_key))
            .map(|(q, _, _)| q.clone())
            .collect();
        targets.sort();
        targets.dedup();
        for queue in targets {
            if let Some(q) = state.queues.get(&queue) {
                let _ = q.tx.send(message.clone());
            }
        }
        state.published.push(message);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-update; the state is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct MemoryDialer {
    broker: MemoryBroker,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Link>> {
        let mut state = self.broker.lock();
        state.dial_count += 1;
        if state.refuse_dials {
            return Err(BrokerError::Transport(format!("connection refused: {}", address)));
        }
        let id = state.next_link;
        state.next_link += 1;
        let closed = CancellationToken::new();
        state.links.insert(id, closed.clone());
        Ok(Arc::new(MemoryLink {
            id,
            broker: self.broker.clone(),
            closed,
        }))
    }
}

struct MemoryLink {
    id: u64,
    broker: MemoryBroker,
    closed: CancellationToken,
}

#[async_trait]
impl Link for MemoryLink {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn open_session(&self) -> Result<Box<dyn Session>> {
        if !self.is_open() {
            return Err(BrokerError::LinkClosed);
        }
        self.broker.lock().open_sessions += 1;
        Ok(Box::new(MemorySession {
            broker: self.broker.clone(),
            closed: self.closed.clone(),
            released: AtomicBool::new(false),
        }))
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) {
        self.broker.lock().links.remove(&self.id);
        self.closed.cancel();
    }
}

struct MemorySession {
    broker: MemoryBroker,
    closed: CancellationToken,
    released: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if !self.is_open() {
            Err(BrokerError::LinkClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.released.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.broker.lock().open_sessions -= 1;
        }
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if let Some(existing) = state.exchanges.get(name).copied() {
            if existing != kind {
                return Err(BrokerError::Transport(format!(
                    "exchange '{}' already declared as {:?}",
                    name, existing
                )));
            }
        }
        state.exchanges.insert(name.to_string(), kind);
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .lock()
            .queues
            .entry(name.to_string())
            .or_insert_with(Queue::new);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Transport(format!("no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Transport(format!("no exchange '{}'", exchange)));
        }
        let binding = (queue.to_string(), exchange.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.broker.lock().prefetch = Some(count);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let rx = self
            .broker
            .lock()
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.rx))
            .ok_or_else(|| BrokerError::Transport(format!("no queue '{}'", queue)))?;

        let receiver = rx.lock_owned().await;
        let broker = self.broker.clone();
        let closed = self.closed.clone();

        let deliveries = stream::unfold(Some((receiver, closed)), move |state| {
            let broker = broker.clone();
            async move {
                let (mut receiver, closed) = state?;
                let next = tokio::select! {
                    _ = closed.cancelled() => None,
                    message = receiver.recv() => Some(message),
                };
                match next {
                    None => Some((Err(BrokerError::LinkClosed), None)),
                    Some(message) => message.map(|m| {
                        let delivery = Delivery {
                            routing_key: m.routing_key,
                            headers: m.headers,
                            payload: m.payload,
                            acker: Box::new(MemoryAcker {
                                broker,
                                settled: AtomicBool::new(false),
                            }) as Box<dyn Acker>,
                        };
                        (Ok(delivery), Some((receiver, closed)))
                    }),
                }
            }
        });
        Ok(deliveries.boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<()> {
        self.ensure_open()?;
        self.broker.route(StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            headers: envelope.headers,
            payload: envelope.payload,
        })
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    settled: AtomicBool,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.broker.lock().acks.acked += 1;
        }
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.broker.lock().acks.rejected += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn session(broker: &MemoryBroker) -> Box<dyn Session> {
        let link = broker.dialer().dial("memory://").await.unwrap();
        link.open_session().await.unwrap()
    }

    #[tokio::test]
    async fn routes_by_binding() {
        let broker = MemoryBroker::new();
        let session = session(&broker).await;
        session.declare_exchange("orders", ExchangeKind::Topic).await.unwrap();
        session.declare_queue("svc").await.unwrap();
        session.bind_queue("svc", "orders", "order.created").await.unwrap();

        let mut stream = session.consume("svc", "test").await.unwrap();
        broker.publish("orders", "order.deleted", Metadata::new(), "skip").unwrap();
        broker.publish("orders", "order.created", Metadata::new(), "keep").unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.routing_key, "order.created");
        assert_eq!(delivery.payload, Bytes::from("keep"));
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn severed_link_ends_stream_with_error() {
        let broker = MemoryBroker::new();
        let session = session(&broker).await;
        session.declare_queue("svc").await.unwrap();
        let mut stream = session.consume("svc", "test").await.unwrap();

        broker.sever_links();
        let next = stream.next().await.unwrap();
        assert!(matches!(next, Err(BrokerError::LinkClosed)));
        assert!(stream.next().await.is_none());
        assert!(matches!(session.declare_queue("other").await, Err(BrokerError::LinkClosed)));
    }

    #[tokio::test]
    async fn unknown_exchange_is_an_error() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("nope", "k", Metadata::new(), "x").is_err());
    }

    #[tokio::test]
    async fn closed_links_are_forgotten() {
        let broker = MemoryBroker::new();
        for _ in 0..3 {
            let link = broker.dialer().dial("memory://").await.unwrap();
            assert_eq!(broker.open_links(), 1);
            link.close().await;
            link.close().await;
        }
        assert_eq!(broker.open_links(), 0);
        assert_eq!(broker.dial_count(), 3);
    }

    #[tokio::test]
    async fn session_close_is_counted_once() {
        let broker = MemoryBroker::new();
        let session = session(&broker).await;
        assert_eq!(broker.open_sessions(), 1);

        session.close().await;
        session.close().await;
        assert_eq!(broker.open_sessions(), 0);
        assert!(!session.is_open());
        assert!(matches!(session.declare_queue("q").await, Err(BrokerError::LinkClosed)));
    }
}
