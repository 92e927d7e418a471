//! Network listeners.
//!
//! # Data Flow
//! ```text
//! Orchestrator
//!     → listener.rs (ServeContext: token, unit, health, reporter)
//!     → http.rs / grpc.rs (bind → ready → serve → graceful stop)
//!     → connections.rs (one task per connection; drain, then kill)
//!     → health.rs (serving / not serving)
//! ```
//!
//! # Design Decisions
//! - Every transport implements the same [`Listener`] contract
//! - Shutdown of each listener is bounded by its own grace period

pub mod connections;
pub mod debug;
pub mod grpc;
pub mod health;
pub mod http;
pub mod listener;

pub use connections::Connections;
pub use grpc::GrpcListener;
pub use health::HealthSink;
pub use http::HttpListener;
pub use listener::{
    stop_within, Listener, ListenerError, ListenerReport, Reporter, ServeContext, StopOutcome,
};
