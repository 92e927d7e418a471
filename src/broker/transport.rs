//! Transport seam between the engine and a concrete broker client.
//!
//! ```text
//! Dialer ──dial──▶ Link ──open_session──▶ Session
//!                   │                       ├─ declare / bind / prefetch
//!                   └─ closed()             ├─ consume ──▶ DeliveryStream
//!                                           ├─ publish(Envelope)
//!                                           └─ close()
//! ```
//!
//! The engine only sees these traits; AMQP and the in-memory broker
//! implement them.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::broker::error::Result;
use crate::metadata::Metadata;

/// Exchange type for declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
}

/// Opens physical links to a broker.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Link>>;
}

/// One physical link to the broker.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Point query: is the link still usable.
    fn is_open(&self) -> bool;

    /// Open a channel/session on this link.
    async fn open_session(&self) -> Result<Box<dyn Session>>;

    /// Resolves once the link has gone down, for whatever reason.
    async fn closed(&self);

    /// Close the link. Closing twice is a no-op.
    async fn close(&self);
}

/// A channel/session on a link.
#[async_trait]
pub trait Session: Send + Sync {
    /// Point query: can the session still be used.
    fn is_open(&self) -> bool;

    /// Release the session. Closing twice is a no-op.
    async fn close(&self);

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    async fn declare_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries in flight on this session.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Start consuming from `queue`. The stream ends or yields an error when
    /// the session or link fails.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<()>;
}

/// Acknowledgement handle of a single delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Reject without requeueing.
    async fn reject(&self) -> Result<()>;
}

/// Stream of deliveries from a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A message received from the broker.
pub struct Delivery {
    pub routing_key: String,
    pub headers: Metadata,
    pub payload: Bytes,
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("headers", &self.headers)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A transport-native outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub headers: Metadata,
    pub content_type: String,
    pub payload: Bytes,
}
