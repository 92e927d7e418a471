//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters)
//!
//! Consumers:
//!     → stdout
//!     → debug listener /metrics (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through HTTP and broker handlers as structured fields
//! - Metrics are cheap: recording without an installed recorder is a no-op

pub mod logging;
pub mod metrics;
