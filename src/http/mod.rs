//! Inbound accept boundary.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection (axum-server)
//!     → server.rs (router, trace layer, listener TLS)
//!     → websocket.rs (extract context, upgrade, register)
//!         → Data route:       read loop → DataHandler
//!         → Connection route: ConnectionHandler owns the session
//!         → Proxy route:      proxy.rs (admission → backend bridge)
//!     → RunningServer::stop drains the registry
//! ```

pub mod proxy;
pub mod server;
pub mod websocket;

pub use server::{RunningServer, ServerError, WebSocketServer};
pub use websocket::{
    ConnectionHandler, DataHandler, InboundConnection, InboundMessage, UpgradeContext, X_REQUEST_ID,
};
