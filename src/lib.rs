//! Multi-transport service runtime library.

pub mod broker;
pub mod config;
pub mod lifecycle;
pub mod metadata;
pub mod observability;
pub mod resilience;
pub mod server;

pub use broker::Broker;
pub use config::schema::ServiceConfig;
pub use lifecycle::{Orchestrator, Shutdown, SignalSource};
pub use metadata::Metadata;
