//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound request
//!     → target.rs (placeholders, query, headers → URL + fingerprint)
//!     → tls.rs (trust-store spec → TrustConfig)
//!     → dial.rs (plain / insecure / verified dialer → handshake → Session)
//!
//! Inbound listener
//!     → tls.rs (server identity, optional client-certificate trust)
//! ```
//!
//! # Design Decisions
//! - Trust loading is a pure function; callers cache the result
//! - Handshake failures keep the HTTP status and body for diagnostics

pub mod dial;
pub mod target;
pub mod tls;
