//! Broker engine: connections, declarations, subscriptions and the delivery loop.
//!
//! # Lifecycle
//! ```text
//! subscribe()* / declare_for_producer()*     registration phase
//!     → initialize()                         connect, declare, freeze registry
//!     → consume(unit)                        delivery loop (own task)
//!     → publish()*                           any time after initialize
//!     → disconnect()                         stop loop, close connections
//! ```
//!
//! # Design Decisions
//! - Producer and consumer use separate connections; a busy consumer must not
//!   stall publishing
//! - The delivery loop owns its unit guard, so completion is reported only
//!   when the loop actually exits
//! - Transient channel/stream failures back off before retrying
//! - Publishing reuses one producer session, replaced only once it fails or
//!   its link goes away; every other session is closed by whoever opened it

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::broker::connection::Connection;
use crate::broker::declaration::{Declaration, Declarations};
use crate::broker::error::{BrokerError, Result, Side};
use crate::broker::event::{Event, Message};
use crate::broker::middleware::{handler_fn, HandlerResult, Layer, DEFAULT_CHAIN};
use crate::broker::registry::{Registry, RegistryBuilder};
use crate::broker::transport::{Delivery, DeliveryStream, Dialer, Envelope, Session};
use crate::config::BrokerConfig;
use crate::lifecycle::{Shutdown, UnitGuard};
use crate::metadata::{Metadata, REQUEST_ID_HEADER};
use crate::observability::metrics;
use crate::resilience::Backoff;

/// Content type set on every published envelope.
pub const CONTENT_TYPE: &str = "application/octet-stream";

/// Registration-phase state; consumed by `initialize`.
struct Setup {
    consumer_decls: Declarations,
    producer_decls: Declarations,
    registry: RegistryBuilder,
}

/// Connected state, fixed after `initialize`.
struct Runtime {
    producer: Connection,
    publisher: tokio::sync::Mutex<Option<Arc<dyn Session>>>,
    consumer: Option<Connection>,
    registry: Registry,
}

struct Inner {
    config: BrokerConfig,
    dialer: Arc<dyn Dialer>,
    setup: Mutex<Option<Setup>>,
    has_consumer: AtomicBool,
    runtime: OnceLock<Runtime>,
    stop_consuming: Shutdown,
    consume_started: AtomicBool,
    consume_stopped: CancellationToken,
    publisher_unit: Mutex<Option<UnitGuard>>,
    disconnected: AtomicBool,
}

/// Message broker engine. Clones share the same engine.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

enum StreamEnd {
    Cancelled,
    Closed,
    Failed(BrokerError),
}

impl Broker {
    /// Create an engine with the standard subscriber middleware chain.
    pub fn new(config: BrokerConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self::with_middleware(config, dialer, &DEFAULT_CHAIN)
    }

    /// Create an engine whose handlers are wrapped with `layers`.
    pub fn with_middleware(config: BrokerConfig, dialer: Arc<dyn Dialer>, layers: &[Layer]) -> Self {
        let setup = Setup {
            consumer_decls: Declarations::new(Side::Consumer),
            producer_decls: Declarations::new(Side::Producer),
            registry: RegistryBuilder::new(config.duplicate_subscriptions, layers),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                dialer,
                setup: Mutex::new(Some(setup)),
                has_consumer: AtomicBool::new(false),
                runtime: OnceLock::new(),
                stop_consuming: Shutdown::new(),
                consume_started: AtomicBool::new(false),
                consume_stopped: CancellationToken::new(),
                publisher_unit: Mutex::new(None),
                disconnected: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// True iff at least one subscription was registered.
    pub fn has_consumer(&self) -> bool {
        self.inner.has_consumer.load(Ordering::SeqCst)
    }

    /// Whether `initialize` has completed.
    pub fn is_initialized(&self) -> bool {
        self.inner.runtime.get().is_some()
    }

    /// Subscribe `handler` to messages with `routing_key` on `exchange`.
    ///
    /// Declares the exchange, the engine's subscriber queue and the binding
    /// between them. Only valid before `initialize`.
    pub fn subscribe<F, Fut>(&self, exchange: &str, routing_key: &str, handler: F) -> Result<()>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let queue = &self.inner.config.subscriber_queue;
        self.with_setup(|setup| {
            setup.registry.insert(routing_key, handler_fn(handler))?;
            setup
                .consumer_decls
                .push(Declaration::exchange(exchange, self.inner.config.exchange_kind));
            setup.consumer_decls.push(Declaration::queue(queue.as_str()));
            setup
                .consumer_decls
                .push(Declaration::binding(queue.as_str(), exchange, routing_key));
            Ok(())
        })?;
        self.inner.has_consumer.store(true, Ordering::SeqCst);

        tracing::info!(
            routing_key,
            exchange,
            queue = %queue,
            "Subscribed to events"
        );
        Ok(())
    }

    /// Queue a declaration applied on the producer connection at `initialize`.
    pub fn declare_for_producer(&self, declaration: Declaration) -> Result<()> {
        self.with_setup(|setup| {
            setup.producer_decls.push(declaration);
            Ok(())
        })
    }

    /// Connect, apply declarations and freeze the subscription registry.
    pub async fn initialize(&self) -> Result<()> {
        let setup = self
            .take_setup()
            .ok_or(BrokerError::AlreadyInitialized)?;
        let backoff = Backoff::new(
            self.inner.config.reconnect_base_ms,
            self.inner.config.reconnect_max_ms,
        );
        let address = &self.inner.config.address;

        let consumer = if setup.registry.is_empty() {
            None
        } else {
            let conn = Connection::new(address.as_str(), Arc::clone(&self.inner.dialer), backoff);
            conn.connect().await?;
            tracing::debug!("Broker consumer connection established");
            Some(conn)
        };

        let producer = Connection::new(address.as_str(), Arc::clone(&self.inner.dialer), backoff);
        if let Err(e) = producer.connect().await {
            if let Some(conn) = &consumer {
                conn.shutdown().await;
            }
            return Err(e);
        }
        tracing::debug!("Broker producer connection established");

        let declared = Self::declare(&setup, consumer.as_ref(), &producer).await;
        if let Err(e) = declared {
            if let Some(conn) = &consumer {
                conn.shutdown().await;
            }
            producer.shutdown().await;
            return Err(e);
        }

        let runtime = Runtime {
            producer,
            publisher: tokio::sync::Mutex::new(None),
            consumer,
            registry: setup.registry.freeze(),
        };
        if self.inner.runtime.set(runtime).is_err() {
            return Err(BrokerError::AlreadyInitialized);
        }

        tracing::info!(address = %address, "Broker session alive");
        Ok(())
    }

    async fn declare(setup: &Setup, consumer: Option<&Connection>, producer: &Connection) -> Result<()> {
        if let Some(conn) = consumer {
            if !setup.consumer_decls.is_empty() {
                let session = conn.session().await.map_err(|e| BrokerError::Declare {
                    side: Side::Consumer,
                    source: Box::new(e),
                })?;
                let applied = setup.consumer_decls.apply_all(session.as_ref()).await;
                session.close().await;
                applied?;
            }
        }
        if !setup.producer_decls.is_empty() {
            let session = producer.session().await.map_err(|e| BrokerError::Declare {
                side: Side::Producer,
                source: Box::new(e),
            })?;
            let applied = setup.producer_decls.apply_all(session.as_ref()).await;
            session.close().await;
            applied?;
        }
        Ok(())
    }

    /// Run the delivery loop until `disconnect` is called.
    ///
    /// `unit` is released when the loop exits.
    pub async fn consume(&self, unit: UnitGuard) {
        let _unit = unit;
        let Some(runtime) = self.inner.runtime.get() else {
            tracing::error!("Broker consume called before initialize");
            return;
        };
        let Some(conn) = runtime.consumer.as_ref() else {
            tracing::warn!("Broker has no subscriptions, nothing to consume");
            return;
        };
        if self.inner.consume_started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Broker delivery loop already running");
            return;
        }
        let _stopped = self.inner.consume_stopped.clone().drop_guard();

        let stop = self.inner.stop_consuming.token();
        let backoff = Backoff::new(
            self.inner.config.reconnect_base_ms,
            self.inner.config.reconnect_max_ms,
        );
        let mut failures: u32 = 0;

        loop {
            if stop.is_cancelled() {
                tracing::debug!("Broker stopped consuming events");
                return;
            }

            if !conn.is_connected() {
                tracing::info!("Broker consumer connection offline, waiting for reconnect");
                tokio::select! {
                    _ = stop.cancelled() => continue,
                    _ = conn.wait_for_connection() => {}
                }
                tracing::info!("Broker consumer connection back online, consuming events");
            }

            let end = match self.open_stream(conn).await {
                Ok((session, deliveries)) => {
                    failures = 0;
                    let end = self.drain(deliveries, &runtime.registry, &stop).await;
                    session.close().await;
                    end
                }
                Err(e) => StreamEnd::Failed(e),
            };

            match end {
                StreamEnd::Cancelled => continue,
                StreamEnd::Closed => {
                    tracing::debug!("Broker delivery stream ended");
                    failures = failures.saturating_add(1);
                }
                StreamEnd::Failed(e) => {
                    failures = failures.saturating_add(1);
                    if Backoff::should_warn(failures) {
                        tracing::warn!(attempt = failures, error = %e, "Broker consumer error");
                    } else {
                        tracing::debug!(attempt = failures, error = %e, "Broker consumer error");
                    }
                }
            }

            let delay = backoff.delay(failures);
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn open_stream(&self, conn: &Connection) -> Result<(Box<dyn Session>, DeliveryStream)> {
        let config = &self.inner.config;
        let session = conn.session().await?;
        let opened = async {
            session.set_prefetch(config.prefetch_count).await?;
            session
                .consume(&config.subscriber_queue, &config.consumer_name)
                .await
        }
        .await;
        match opened {
            Ok(deliveries) => Ok((session, deliveries)),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn drain(&self, mut deliveries: DeliveryStream, registry: &Registry, stop: &CancellationToken) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => return StreamEnd::Cancelled,
                next = deliveries.next() => next,
            };
            match next {
                None => return StreamEnd::Closed,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(delivery)) => self.dispatch(delivery, registry).await,
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery, registry: &Registry) {
        let queue = &self.inner.config.subscriber_queue;
        let Some(handler) = registry.lookup(&delivery.routing_key) else {
            tracing::trace!(routing_key = %delivery.routing_key, "No handler for routing key, dropping");
            metrics::record_delivery(&delivery.routing_key, "unhandled");
            if let Err(e) = delivery.acker.ack().await {
                tracing::debug!(error = %e, "Failed to ack unhandled delivery");
            }
            return;
        };

        let event = Event::from_delivery(queue, &delivery);
        match handler(event).await {
            Ok(()) => {
                metrics::record_delivery(&delivery.routing_key, "ok");
                if let Err(e) = delivery.acker.ack().await {
                    tracing::warn!(routing_key = %delivery.routing_key, error = %e, "Failed to ack delivery");
                }
            }
            Err(_) => {
                metrics::record_delivery(&delivery.routing_key, "error");
                if let Err(e) = delivery.acker.reject().await {
                    tracing::warn!(routing_key = %delivery.routing_key, error = %e, "Failed to reject delivery");
                }
            }
        }
    }

    /// Publish `message` to `exchange` with `routing_key`.
    ///
    /// The correlation header is taken from the message context. Failures are
    /// returned, never retried.
    pub async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        let runtime = self.inner.runtime.get().ok_or(BrokerError::NotInitialized)?;

        let mut headers = Metadata::new();
        if let Some(id) = message.context.request_id() {
            headers.insert(REQUEST_ID_HEADER, id);
        }
        let envelope = Envelope {
            headers,
            content_type: CONTENT_TYPE.to_string(),
            payload: message.body.clone(),
        };

        let wrap = |e: BrokerError| BrokerError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            source: Box::new(e),
        };
        let result = match Self::producer_session(runtime).await {
            Ok(session) => {
                let published = session.publish(exchange, routing_key, envelope).await;
                if published.is_err() {
                    Self::discard_producer_session(runtime, &session).await;
                }
                published
            }
            Err(e) => Err(e),
        }
        .map_err(wrap);

        metrics::record_publish(exchange, result.is_ok());
        result
    }

    /// The cached producer session, reopened when missing or no longer usable.
    async fn producer_session(runtime: &Runtime) -> Result<Arc<dyn Session>> {
        let mut slot = runtime.publisher.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_open() {
                return Ok(Arc::clone(session));
            }
        }
        if let Some(stale) = slot.take() {
            stale.close().await;
        }
        let session: Arc<dyn Session> = Arc::from(runtime.producer.session().await?);
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn discard_producer_session(runtime: &Runtime, failed: &Arc<dyn Session>) {
        let discarded = {
            let mut slot = runtime.publisher.lock().await;
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, failed) => slot.take(),
                _ => None,
            }
        };
        if let Some(session) = discarded {
            session.close().await;
        }
    }

    /// Hold a unit for a publish-only engine; released by `disconnect`.
    pub fn hold_unit(&self, unit: UnitGuard) {
        if let Ok(mut slot) = self.inner.publisher_unit.lock() {
            *slot = Some(unit);
        }
    }

    /// Stop the delivery loop and close both connections.
    ///
    /// Idempotent. When the delivery loop was never started only the
    /// connections are closed.
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.stop_consuming.trigger();
        if self.inner.consume_started.load(Ordering::SeqCst) {
            let drain = Duration::from_millis(self.inner.config.drain_timeout_ms);
            if tokio::time::timeout(drain, self.inner.consume_stopped.cancelled())
                .await
                .is_err()
            {
                tracing::warn!(timeout = ?drain, "Broker delivery loop did not stop in time");
            }
        }

        if let Some(runtime) = self.inner.runtime.get() {
            let publisher = runtime.publisher.lock().await.take();
            if let Some(session) = publisher {
                session.close().await;
            }
            if let Some(conn) = &runtime.consumer {
                conn.shutdown().await;
                tracing::debug!("Broker consumer connection closed");
            }
            runtime.producer.shutdown().await;
            tracing::debug!("Broker producer connection closed");
        }

        let held = self
            .inner
            .publisher_unit
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        drop(held);

        tracing::info!("Broker session terminated");
        Ok(())
    }

    fn with_setup<T>(&self, f: impl FnOnce(&mut Setup) -> Result<T>) -> Result<T> {
        let mut guard = self
            .inner
            .setup
            .lock()
            .map_err(|_| BrokerError::AlreadyInitialized)?;
        match guard.as_mut() {
            Some(setup) => f(setup),
            None => Err(BrokerError::AlreadyInitialized),
        }
    }

    fn take_setup(&self) -> Option<Setup> {
        self.inner.setup.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("address", &self.inner.config.address)
            .field("has_consumer", &self.has_consumer())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::transport::ExchangeKind;
    use crate::lifecycle::UnitTracker;

    fn config() -> BrokerConfig {
        BrokerConfig {
            address: "memory://test".into(),
            subscriber_queue: "svc-events".into(),
            reconnect_base_ms: 5,
            reconnect_max_ms: 20,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_before_initialize_fails() {
        let memory = MemoryBroker::new();
        let broker = Broker::new(config(), memory.dialer());
        let err = broker
            .publish("orders", "order.created", &Message::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotInitialized));
    }

    #[tokio::test]
    async fn subscribe_after_initialize_fails() {
        let memory = MemoryBroker::new();
        let broker = Broker::new(config(), memory.dialer());
        broker.initialize().await.unwrap();

        let err = broker
            .subscribe("orders", "order.created", |_| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyInitialized));
        assert!(matches!(
            broker.initialize().await,
            Err(BrokerError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn publish_only_engine_opens_one_connection() {
        let memory = MemoryBroker::new();
        let broker = Broker::new(config(), memory.dialer());
        assert!(!broker.has_consumer());

        broker.initialize().await.unwrap();
        assert_eq!(memory.dial_count(), 1);
        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_engine_declares_topology() {
        let memory = MemoryBroker::new();
        let broker = Broker::new(config(), memory.dialer());
        broker
            .subscribe("orders", "order.created", |_| async { Ok(()) })
            .unwrap();
        assert!(broker.has_consumer());

        broker.initialize().await.unwrap();
        assert_eq!(memory.dial_count(), 2);
        assert!(memory.has_exchange("orders"));
        assert!(memory.has_queue("svc-events"));
        assert!(memory.has_binding("svc-events", "orders", "order.created"));
        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn failed_declaration_names_the_side() {
        let memory = MemoryBroker::new();
        let broker = Broker::new(config(), memory.dialer());
        // Binding to a queue nobody declared fails on the producer side.
        broker
            .declare_for_producer(Declaration::binding("missing", "orders", "k"))
            .unwrap();

        let err = broker.initialize().await.unwrap_err();
        assert!(matches!(err, BrokerError::Declare { side: Side::Producer, .. }));
        assert!(err.to_string().contains("producer"));
    }

    #[tokio::test]
    async fn disconnect_without_consume_is_a_noop() {
        let memory = MemoryBroker::new();
        let broker = Broker::new(config(), memory.dialer());
        broker
            .subscribe("orders", "order.created", |_| async { Ok(()) })
            .unwrap();
        broker.initialize().await.unwrap();

        broker.disconnect().await.unwrap();
        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn held_publisher_unit_released_by_disconnect() {
        let memory = MemoryBroker::new();
        let broker = Broker::new(config(), memory.dialer());
        broker.initialize().await.unwrap();

        let tracker = UnitTracker::new();
        broker.hold_unit(tracker.register("broker"));
        assert_eq!(tracker.outstanding(), 1);

        broker.disconnect().await.unwrap();
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn consume_releases_unit_on_disconnect() {
        let memory = MemoryBroker::new();
        let broker = Broker::new(config(), memory.dialer());
        broker
            .subscribe("orders", "order.created", |_| async { Ok(()) })
            .unwrap();
        broker.initialize().await.unwrap();

        let tracker = UnitTracker::new();
        let unit = tracker.register("broker-consumer");
        let task = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.consume(unit).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(memory.prefetch(), Some(broker.config().prefetch_count));

        broker.disconnect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("delivery loop should exit")
            .unwrap();
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(memory.open_sessions(), 0);
    }

    async fn publishing_broker(memory: &MemoryBroker) -> Broker {
        let broker = Broker::new(config(), memory.dialer());
        broker
            .declare_for_producer(Declaration::exchange("orders", ExchangeKind::Topic))
            .unwrap();
        broker.initialize().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn publishes_share_one_session() {
        let memory = MemoryBroker::new();
        let broker = publishing_broker(&memory).await;
        assert_eq!(memory.open_sessions(), 0);

        for _ in 0..5 {
            broker
                .publish("orders", "order.created", &Message::new("x"))
                .await
                .unwrap();
        }
        assert_eq!(memory.published().len(), 5);
        assert_eq!(memory.open_sessions(), 1);

        broker.disconnect().await.unwrap();
        assert_eq!(memory.open_sessions(), 0);
    }

    #[tokio::test]
    async fn failed_publish_replaces_the_session() {
        let memory = MemoryBroker::new();
        let broker = publishing_broker(&memory).await;

        assert!(broker.publish("missing", "k", &Message::new("x")).await.is_err());
        assert_eq!(memory.open_sessions(), 0);

        broker
            .publish("orders", "order.created", &Message::new("x"))
            .await
            .unwrap();
        assert_eq!(memory.open_sessions(), 1);
        broker.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn publish_after_reconnect_uses_the_new_link() {
        let memory = MemoryBroker::new();
        let broker = publishing_broker(&memory).await;
        broker
            .publish("orders", "order.created", &Message::new("before"))
            .await
            .unwrap();

        memory.sever_links();
        let producer = &broker.inner.runtime.get().unwrap().producer;
        tokio::time::timeout(Duration::from_secs(1), async {
            while memory.dial_count() < 2 || !producer.is_connected() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("producer should reconnect");

        broker
            .publish("orders", "order.created", &Message::new("after"))
            .await
            .unwrap();
        assert_eq!(memory.published().len(), 2);
        assert_eq!(memory.open_sessions(), 1);

        broker.disconnect().await.unwrap();
        assert_eq!(memory.open_sessions(), 0);
        assert_eq!(memory.open_links(), 0);
    }
}
