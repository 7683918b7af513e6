//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, ceilings >= 1)
//! - Validate URLs, route paths and TLS combinations
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ManagerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{ListenerConfig, ManagerConfig, RouteMode};

/// A single semantic problem, named by its config path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ManagerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.keepalive.interval_secs == 0 {
        errors.push(ValidationError::new("keepalive.interval_secs", "must be greater than 0"));
    }
    if config.keepalive.probe_timeout_ms == 0 {
        errors.push(ValidationError::new("keepalive.probe_timeout_ms", "must be greater than 0"));
    } else if config.keepalive.probe_timeout_ms >= config.keepalive.interval_secs.saturating_mul(1000) {
        errors.push(ValidationError::new(
            "keepalive.probe_timeout_ms",
            "must be shorter than the probe interval",
        ));
    }
    if config.dial.handshake_timeout_secs == 0 {
        errors.push(ValidationError::new("dial.handshake_timeout_secs", "must be greater than 0"));
    }

    if config.reconnect.attempts > 0 && config.reconnect.max_delay_secs == 0 {
        errors.push(ValidationError::new("reconnect.max_delay_secs", "must be greater than 0"));
    }

    if config.admission.default_ceiling == 0 {
        errors.push(ValidationError::new("admission.default_ceiling", "must be at least 1"));
    }
    for (service, ceiling) in &config.admission.services {
        if *ceiling == 0 {
            errors.push(ValidationError::new(
                format!("admission.services.{service}"),
                "must be at least 1",
            ));
        }
    }

    if let Some(server) = &config.server {
        validate_listener(server, &mut errors);
    }

    if let Some(client) = &config.client {
        check_ws_url("client.url", &client.url, &mut errors);
        let policy = client.reconnect_policy(&config.reconnect);
        if policy.attempts > 0 && policy.max_delay_secs == 0 {
            errors.push(ValidationError::new(
                "client.auto_reconnect_max_delay_secs",
                "must be greater than 0",
            ));
        }
    }

    if !config.observability.metrics_address.is_empty()
        && config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "must be a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(server: &ListenerConfig, errors: &mut Vec<ValidationError>) {
    if server.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("server.bind_address", "must be a socket address"));
    }

    if let Some(tls) = &server.tls {
        if tls.cert.trim().is_empty() != tls.key.trim().is_empty() {
            errors.push(ValidationError::new(
                "server.tls",
                "cert and key must be set together",
            ));
        } else if tls.cert.trim().is_empty() {
            errors.push(ValidationError::new("server.tls", "cert and key are required"));
        }
        let has_trust = tls.trust_store.as_deref().is_some_and(|t| !t.trim().is_empty());
        if tls.client_auth && !has_trust {
            errors.push(ValidationError::new(
                "server.tls.trust_store",
                "client_auth requires a trust store",
            ));
        }
    }

    let mut seen = std::collections::HashSet::new();
    for (i, route) in server.routes.iter().enumerate() {
        let field = format!("server.routes[{i}]");
        if !route.path.starts_with('/') {
            errors.push(ValidationError::new(format!("{field}.path"), "must start with '/'"));
        }
        if !seen.insert(route.path.as_str()) {
            errors.push(ValidationError::new(format!("{field}.path"), "duplicate route"));
        }
        match (route.mode, &route.backend_url) {
            (RouteMode::Proxy, Some(url)) => check_ws_url(&format!("{field}.backend_url"), url, errors),
            (RouteMode::Proxy, None) => errors.push(ValidationError::new(
                format!("{field}.backend_url"),
                "proxy routes need a backend",
            )),
            _ => {}
        }
    }
}

fn check_ws_url(field: &str, raw: &str, errors: &mut Vec<ValidationError>) {
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
        Ok(url) => errors.push(ValidationError::new(
            field,
            format!("scheme [{}] is not ws or wss", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new(field, e.to_string())),
    }
}
