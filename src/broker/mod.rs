//! Message broker subsystem.
//!
//! # Data Flow
//! ```text
//! Subscribe(exchange, key, handler)
//!     → declaration.rs (exchange, queue, binding queued)
//!     → registry.rs (handler wrapped with middleware.rs chain)
//!
//! Initialize
//!     → connection.rs (producer link, consumer link if subscribed)
//!     → declarations applied per side
//!     → registry frozen
//!
//! Consume
//!     → transport delivery stream
//!     → registry lookup by routing key → handler → ack / reject
//! ```
//!
//! # Design Decisions
//! - The engine depends only on the `transport` traits; `amqp` and `memory`
//!   are interchangeable adapters selected by address scheme
//! - Registration happens strictly before consumption; the registry is
//!   immutable afterwards

pub mod connection;
pub mod declaration;
pub mod engine;
pub mod error;
pub mod event;
pub mod memory;
pub mod middleware;
pub mod registry;
pub mod transport;

#[cfg(feature = "amqp")]
pub mod amqp;

use std::sync::Arc;

pub use connection::{Connection, ConnectionState};
pub use declaration::Declaration;
pub use engine::Broker;
pub use error::{BrokerError, Side};
pub use event::{Event, Message};
pub use memory::MemoryBroker;
pub use middleware::{Handler, HandlerError, HandlerResult};
pub use registry::DuplicatePolicy;
pub use transport::{Dialer, ExchangeKind};

/// Pick a transport for `address` by its scheme.
///
/// `memory://` gets a fresh in-process broker; `amqp://` and `amqps://` use
/// the AMQP adapter when the `amqp` feature is enabled.
pub fn dialer_for(address: &str) -> error::Result<Arc<dyn Dialer>> {
    let parsed =
        url::Url::parse(address).map_err(|_| BrokerError::UnsupportedAddress(address.to_string()))?;
    match parsed.scheme() {
        "memory" => Ok(MemoryBroker::new().dialer()),
        #[cfg(feature = "amqp")]
        "amqp" | "amqps" => Ok(Arc::new(amqp::AmqpDialer)),
        _ => Err(BrokerError::UnsupportedAddress(address.to_string())),
    }
}
