//! Message types exchanged with handlers and publishers.

use bytes::Bytes;

use crate::broker::transport::Delivery;
use crate::metadata::Metadata;

/// A delivered message as seen by a handler.
#[derive(Debug, Clone)]
pub struct Event {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// Transport headers as received.
    pub headers: Metadata,
    /// Request context. Populated by the metadata middleware.
    pub context: Metadata,
}

impl Event {
    pub fn new(queue: impl Into<String>, routing_key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            headers: Metadata::new(),
            context: Metadata::new(),
        }
    }

    /// Build an event from a delivery, leaving the acknowledgement handle behind.
    pub(crate) fn from_delivery(queue: &str, delivery: &Delivery) -> Self {
        Self {
            queue: queue.to_string(),
            routing_key: delivery.routing_key.clone(),
            payload: delivery.payload.clone(),
            headers: delivery.headers.clone(),
            context: Metadata::new(),
        }
    }

    pub fn with_headers(mut self, headers: Metadata) -> Self {
        self.headers = headers;
        self
    }
}

/// An outgoing message.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub body: Bytes,
    /// Context the correlation header is taken from.
    pub context: Metadata,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            context: Metadata::new(),
        }
    }

    pub fn with_context(mut self, context: Metadata) -> Self {
        self.context = context;
        self
    }
}
