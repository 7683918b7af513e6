//! Resilient WebSocket session manager.
//!
//! Opens outbound sessions and reuses them per fingerprint, accepts inbound
//! sessions behind per-service admission ceilings, keeps every session alive
//! with heartbeat probes, reconnects subscriptions with bounded backoff, and
//! drains everything cleanly on shutdown.

pub mod client;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod manager;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod security;
pub mod session;

pub use client::{ClientEvent, ClientSettings, OutboundClient, OutboundRequest, ReconnectingClient};
pub use config::ManagerConfig;
pub use http::{RunningServer, WebSocketServer};
pub use lifecycle::Shutdown;
pub use manager::SessionManager;
pub use session::{Session, SessionError};
