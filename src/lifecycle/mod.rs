//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (orchestrator.rs):
//!     Debug listener appended → Broker initialize → Consumer spawned
//!     → Listeners spawned (tracker.rs counts each unit)
//!
//! Shutdown (orchestrator.rs, shutdown.rs):
//!     Signal received (signals.rs) → Broker disconnect → Cancel shared token
//!     → Listeners stop within their grace periods → Units drained → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: broker first, listeners last (traffic only when ready)
//! - Ordered shutdown: broker, then listeners, then wait
//! - Listener shutdown has a timeout: forced stop after its grace period

pub mod orchestrator;
pub mod shutdown;
pub mod signals;
pub mod tracker;

pub use orchestrator::{Orchestrator, OrchestratorError};
pub use shutdown::Shutdown;
pub use signals::{SignalSource, SignalTrigger};
pub use tracker::{UnitGuard, UnitTracker};
