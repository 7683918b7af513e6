//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound upgrade on an admission-controlled route:
//!     → admission.rs (per-service ceiling check)
//!     → rejected: policy-violation close with the reason, never registered
//!     → admitted: permit travels with the session, released on close
//! ```
//!
//! Transport security (trust stores, mTLS) lives in `net::tls`.
//!
//! # Design Decisions
//! - Fail closed: a full service rejects immediately, no queueing

pub mod admission;

pub use admission::{AdmissionController, AdmissionPermit, AdmissionRejected};
