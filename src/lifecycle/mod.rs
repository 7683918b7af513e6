//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → keepalive supervisors exit
//!               → reconnect engines abort their backoff
//!               → read loops stop
//!     then SessionManager closes every cached/registered session
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop background loops, send going-away, close
//! - The stop signal is level-triggered so late subscribers still see it

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
