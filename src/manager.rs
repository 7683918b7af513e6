//! Top-level owner of the shared session state.
//!
//! # Responsibilities
//! - Own the connection cache, admission controller and session registry
//! - Hand out outbound clients, servers and reconnecting clients wired to them
//! - Apply hot-reloaded admission ceilings
//! - Shut down in order: stop signal first, then going-away closes
//!
//! # Design Decisions
//! - Raising the stop signal before closing anything means no keepalive or
//!   reconnect loop can race the close frames and dial again

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::{ClientEvent, ClientSettings, OutboundClient, ReconnectingClient};
use crate::config::ManagerConfig;
use crate::http::WebSocketServer;
use crate::lifecycle::Shutdown;
use crate::security::AdmissionController;
use crate::session::{ConnectionCache, KeepaliveSettings, SessionError, SessionRegistry};

pub struct SessionManager {
    config: ManagerConfig,
    shutdown: Shutdown,
    cache: ConnectionCache,
    admission: Arc<AdmissionController>,
    registry: SessionRegistry,
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Self {
        let shutdown = Shutdown::new();
        let cache = ConnectionCache::new(KeepaliveSettings::from(&config.keepalive), shutdown.clone());
        let admission = Arc::new(AdmissionController::from_config(&config.admission));
        Self {
            config,
            shutdown,
            cache,
            admission,
            registry: SessionRegistry::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Outbound client sharing this manager's cache.
    pub fn outbound_client(&self) -> OutboundClient {
        OutboundClient::new(self.cache.clone()).with_handshake_timeout(Duration::from_secs(
            self.config.dial.handshake_timeout_secs,
        ))
    }

    /// Server builder for the configured listener (or `bind_address` when
    /// no `[server]` section is present), wired to the shared registry,
    /// admission controller and stop signal.
    pub fn server(&self, bind_address: &str) -> WebSocketServer {
        let server = match &self.config.server {
            Some(listener) => WebSocketServer::from_config(listener, &self.config),
            None => WebSocketServer::new(bind_address)
                .with_keepalive(KeepaliveSettings::from(&self.config.keepalive)),
        };
        server
            .with_registry(self.registry.clone())
            .with_admission(Arc::clone(&self.admission))
            .with_shutdown(self.shutdown.clone())
    }

    /// Start a reconnecting client bound to the manager's stop signal.
    pub async fn start_client(
        &self,
        settings: ClientSettings,
    ) -> Result<(ReconnectingClient, mpsc::Receiver<ClientEvent>), SessionError> {
        ReconnectingClient::start(settings, self.shutdown.subscribe()).await
    }

    /// Apply the live-reloadable parts of `config`.
    pub fn apply_config(&self, config: &ManagerConfig) {
        self.admission.update_ceilings(config.admission.services.clone());
        if config.keepalive != self.config.keepalive || config.dial != self.config.dial {
            tracing::warn!("Keepalive and dial changes take effect after a restart");
        }
    }

    /// Stop every loop, then close all cached and registered sessions.
    pub async fn shutdown(&self) {
        tracing::info!("Session manager shutting down");
        self.shutdown.trigger();
        let cached = self.cache.drain().await;
        let registered = self.registry.drain_all().await;
        tracing::info!(cached, registered, "Session manager stopped");
    }
}
