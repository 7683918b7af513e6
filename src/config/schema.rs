//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the session
//! manager. All types derive Serde traits for deserialization from config
//! files, and every section has defaults so a minimal file is valid.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::session::MessageFormat;

/// Environment variable that forces server-initiated keepalive on.
pub const SERVER_PING_ENV: &str = "WS_SERVER_PING";

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ManagerConfig {
    /// Keepalive probe cadence.
    pub keepalive: KeepaliveConfig,

    /// Outbound dial settings.
    pub dial: DialConfig,

    /// Reconnect engine defaults.
    pub reconnect: ReconnectConfig,

    /// Admission ceilings for inbound services.
    pub admission: AdmissionConfig,

    /// Inbound listener. Absent means no listener is started.
    pub server: Option<ListenerConfig>,

    /// Reconnecting client subscription. Absent means none.
    pub client: Option<SubscriptionConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Keepalive probe cadence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Seconds between probes.
    pub interval_secs: u64,

    /// Deadline for writing one probe, in milliseconds.
    pub probe_timeout_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            probe_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DialConfig {
    /// Upper bound on the opening handshake.
    pub handshake_timeout_secs: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 45,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum attempts per episode; 0 or less disables reconnection.
    pub attempts: i32,

    /// Cap on the delay between attempts, in seconds.
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: 15,
            max_delay_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Ceiling for services without an explicit entry.
    pub default_ceiling: usize,

    /// Per-service ceilings.
    pub services: HashMap<String, usize>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_ceiling: 5,
            services: HashMap::new(),
        }
    }
}

/// Inbound listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Send keepalive probes from the server side.
    pub server_ping: bool,

    /// Upgrade routes.
    pub routes: Vec<RouteConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            server_ping: false,
            routes: Vec::new(),
        }
    }
}

impl ListenerConfig {
    /// Server ping from config or the `WS_SERVER_PING` environment toggle.
    pub fn server_ping_enabled(&self) -> bool {
        self.server_ping || env_flag(SERVER_PING_ENV)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Certificate chain: path to a PEM file or inline PEM.
    pub cert: String,

    /// Private key: path to a PEM file or inline PEM.
    pub key: String,

    /// Require client certificates.
    pub client_auth: bool,

    /// Trust store for client certificates (any form the loader accepts).
    pub trust_store: Option<String>,
}

/// How an upgrade route hands sessions to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Per-message callbacks.
    #[default]
    Data,
    /// The host receives the live session.
    Connection,
    /// Admission-controlled bridge to a backend.
    Proxy,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Path with optional `{name}` segments.
    pub path: String,

    pub mode: RouteMode,

    /// Logical service for admission; defaults to the path.
    pub service: Option<String>,

    /// Backend for proxy routes.
    pub backend_url: Option<String>,

    /// Skip backend certificate verification (proxy routes).
    pub allow_insecure: bool,

    /// Trust store for the backend (proxy routes).
    pub ca_cert: Option<String>,

    /// Payload classification for data routes.
    pub format: MessageFormat,
}

impl RouteConfig {
    pub fn service_name(&self) -> &str {
        self.service.as_deref().unwrap_or(&self.path)
    }
}

/// A reconnecting subscription to a remote server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub allow_insecure: bool,
    pub ca_cert: String,
    pub format: MessageFormat,
    /// Overrides `reconnect.attempts` for this subscription.
    pub auto_reconnect_attempts: Option<i32>,
    /// Overrides `reconnect.max_delay_secs` for this subscription.
    pub auto_reconnect_max_delay_secs: Option<u64>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            query: HashMap::new(),
            allow_insecure: false,
            ca_cert: String::new(),
            format: MessageFormat::Auto,
            auto_reconnect_attempts: None,
            auto_reconnect_max_delay_secs: None,
        }
    }
}

impl SubscriptionConfig {
    /// Reconnect policy for this subscription, falling back to `defaults`
    /// for anything it leaves unset.
    pub fn reconnect_policy(&self, defaults: &ReconnectConfig) -> ReconnectConfig {
        ReconnectConfig {
            attempts: self.auto_reconnect_attempts.unwrap_or(defaults.attempts),
            max_delay_secs: self
                .auto_reconnect_max_delay_secs
                .unwrap_or(defaults.max_delay_secs),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
