//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Transient failure (dial, channel open, stream open):
//!     → backoff.rs (exponential delay with jitter, capped)
//!     → retry loop sleeps, then tries again
//! ```
//!
//! # Design Decisions
//! - Every retry loop sleeps; no loop may spin on a degraded link
//! - Jittered backoff prevents thundering herd on broker restarts
//! - Loud logging is rate limited by attempt count

pub mod backoff;

pub use backoff::{calculate_backoff, Backoff};
