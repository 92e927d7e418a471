//! Broker error types.

use std::fmt;

/// Which connection a declaration was applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Consumer,
    Producer,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Consumer => write!(f, "consumer"),
            Side::Producer => write!(f, "producer"),
        }
    }
}

/// Error type for broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to broker at '{address}': {source}")]
    Connect {
        address: String,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("broker connection is not established")]
    NotConnected,

    #[error("broker link closed")]
    LinkClosed,

    #[error("failed to declare for {side}: {source}")]
    Declare {
        side: Side,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("unable to publish to exchange '{exchange}' with routing key '{routing_key}': {source}")]
    Publish {
        exchange: String,
        routing_key: String,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("broker is not initialized")]
    NotInitialized,

    #[error("broker is already initialized, subscriptions are frozen")]
    AlreadyInitialized,

    #[error("routing key '{0}' already has a handler")]
    DuplicateSubscription(String),

    #[error("unsupported broker address '{0}'")]
    UnsupportedAddress(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[cfg(feature = "amqp")]
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

/// Result alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
