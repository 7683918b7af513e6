//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound-originated session lost (not a normal close):
//!     → reconnect.rs (bounded retry loop)
//!     → backoff.rs (min(attempts * 2s, max_delay) before each attempt)
//!     → success: fresh session + fresh keepalive, read loop resumes
//!     → exhaustion: failure reported upward, no further recovery
//! ```
//!
//! # Design Decisions
//! - Deterministic backoff, no jitter
//! - Every sleep is cancellable by shutdown

pub mod backoff;
pub mod reconnect;

pub use reconnect::{retry_connect, ReconnectError, RetryState};
