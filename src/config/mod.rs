//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ManagerConfig (validated, immutable)
//!     → SessionManager / WebSocketServer / ReconnectingClient
//!
//! On change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → admission ceilings swapped in place
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only admission ceilings hot-reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdmissionConfig, DialConfig, KeepaliveConfig, ListenerConfig, ManagerConfig,
    ObservabilityConfig, ReconnectConfig, RouteConfig, RouteMode, SubscriptionConfig, TlsConfig,
};
pub use watcher::ConfigWatcher;
