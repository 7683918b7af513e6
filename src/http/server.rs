//! WebSocket server setup.
//!
//! # Responsibilities
//! - Build the Axum router from data, connection and proxy routes
//! - Load the listener identity and optional client-certificate trust
//! - Bind plain or TLS through axum-server and report the bound address
//! - Drain registered sessions, then shut the listener down gracefully
//!
//! # Design Decisions
//! - Each route gets its own state; there is no catch-all dispatcher
//! - Routes are validated before the router is built, axum would panic
//!   on a duplicate or malformed path

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use super::proxy::ProxyTarget;
use super::websocket::{self, ConnectionHandler, DataHandler, InboundConnection, InboundMessage, RouteKind, RouteState};
use crate::client::TlsOptions;
use crate::config::{ListenerConfig, ManagerConfig, RouteMode, TlsConfig};
use crate::lifecycle::Shutdown;
use crate::net::dial::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::net::tls::{load_trust, server_config, CertificateError, ServerIdentity};
use crate::security::AdmissionController;
use crate::session::{KeepaliveSettings, ListenerId, MessageFormat, SessionRegistry};

/// How long in-flight HTTP requests get once shutdown starts.
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address [{0}]")]
    InvalidAddress(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid route [{path}]: {reason}")]
    InvalidRoute { path: String, reason: String },

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("server task failed: {0}")]
    Serve(String),
}

enum PendingRoute {
    Data {
        path: String,
        format: MessageFormat,
        handler: DataHandler,
    },
    Connection {
        path: String,
        handler: ConnectionHandler,
    },
    Proxy {
        path: String,
        service: String,
        backend_url: String,
        tls: TlsOptions,
    },
}

impl PendingRoute {
    fn path(&self) -> &str {
        match self {
            PendingRoute::Data { path, .. }
            | PendingRoute::Connection { path, .. }
            | PendingRoute::Proxy { path, .. } => path,
        }
    }
}

/// Builder for the inbound WebSocket listener.
pub struct WebSocketServer {
    bind_address: String,
    tls: Option<TlsConfig>,
    server_ping: bool,
    keepalive: KeepaliveSettings,
    handshake_timeout: Duration,
    registry: SessionRegistry,
    admission: Arc<AdmissionController>,
    shutdown: Shutdown,
    routes: Vec<PendingRoute>,
}

impl WebSocketServer {
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            tls: None,
            server_ping: false,
            keepalive: KeepaliveSettings::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            registry: SessionRegistry::new(),
            admission: Arc::new(AdmissionController::default()),
            shutdown: Shutdown::new(),
            routes: Vec::new(),
        }
    }

    /// Listener settings plus every proxy route from `listener`.
    ///
    /// Data and connection routes need host callbacks and are added by the
    /// caller with [`data_route`](Self::data_route) and
    /// [`connection_route`](Self::connection_route).
    pub fn from_config(listener: &ListenerConfig, config: &ManagerConfig) -> Self {
        let mut server = Self::new(listener.bind_address.clone())
            .with_server_ping(listener.server_ping_enabled())
            .with_keepalive(KeepaliveSettings::from(&config.keepalive))
            .with_handshake_timeout(Duration::from_secs(config.dial.handshake_timeout_secs));
        server.tls = listener.tls.clone();

        for route in listener.routes.iter().filter(|r| r.mode == RouteMode::Proxy) {
            if let Some(backend_url) = &route.backend_url {
                server = server.proxy_route(
                    route.path.clone(),
                    route.service_name(),
                    backend_url.clone(),
                    TlsOptions {
                        allow_insecure: route.allow_insecure,
                        ca_cert: route.ca_cert.clone().unwrap_or_default(),
                    },
                );
            }
        }
        server
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_server_ping(mut self, enabled: bool) -> Self {
        self.server_ping = enabled;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveSettings) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Per-message route; `handler` runs once per classified data frame.
    pub fn data_route<F, Fut>(mut self, path: impl Into<String>, format: MessageFormat, handler: F) -> Self
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: DataHandler = Arc::new(move |message| handler(message).boxed());
        self.routes.push(PendingRoute::Data {
            path: path.into(),
            format,
            handler,
        });
        self
    }

    /// Connection route; `handler` owns the session until it returns.
    pub fn connection_route<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(InboundConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: ConnectionHandler = Arc::new(move |connection| handler(connection).boxed());
        self.routes.push(PendingRoute::Connection {
            path: path.into(),
            handler,
        });
        self
    }

    /// Admission-controlled bridge to `backend_url`.
    pub fn proxy_route(
        mut self,
        path: impl Into<String>,
        service: impl Into<String>,
        backend_url: impl Into<String>,
        tls: TlsOptions,
    ) -> Self {
        self.routes.push(PendingRoute::Proxy {
            path: path.into(),
            service: service.into(),
            backend_url: backend_url.into(),
            tls,
        });
        self
    }

    fn build_router(&mut self, listener: ListenerId) -> Result<Router, ServerError> {
        let server_ping = self.server_ping.then_some(self.keepalive);
        let mut seen = HashSet::new();
        let mut router = Router::new();

        for route in self.routes.drain(..) {
            let path = route.path().to_owned();
            if !path.starts_with('/') {
                return Err(ServerError::InvalidRoute {
                    path,
                    reason: "must start with '/'".into(),
                });
            }
            if !seen.insert(path.clone()) {
                return Err(ServerError::InvalidRoute {
                    path,
                    reason: "registered twice".into(),
                });
            }

            let kind = match route {
                PendingRoute::Data { handler, format, .. } => RouteKind::Data { handler, format },
                PendingRoute::Connection { handler, .. } => RouteKind::Connection(handler),
                PendingRoute::Proxy {
                    service,
                    backend_url,
                    tls,
                    ..
                } => RouteKind::Proxy(Arc::new(ProxyTarget::new(
                    service,
                    backend_url,
                    &tls,
                    self.handshake_timeout,
                    Arc::clone(&self.admission),
                )?)),
            };
            let state = RouteState {
                listener,
                registry: self.registry.clone(),
                shutdown: self.shutdown.clone(),
                server_ping,
                kind,
            };
            router = router.route(&path, get(websocket::accept).with_state(state));
            tracing::debug!(listener = %listener, path = %path, "Route registered");
        }

        Ok(router.layer(TraceLayer::new_for_http()))
    }

    /// Bind and start serving in the background.
    pub async fn start(mut self) -> Result<RunningServer, ServerError> {
        let address: SocketAddr = self
            .bind_address
            .parse()
            .map_err(|_| ServerError::InvalidAddress(self.bind_address.clone()))?;
        let listener = ListenerId::new();
        let tls = self.tls.as_ref().map(rustls_config).transpose()?;
        let app = self
            .build_router(listener)?
            .into_make_service_with_connect_info::<SocketAddr>();

        let handle = Handle::new();
        let serve_handle = handle.clone();
        let task = match tls {
            Some(config) => tokio::spawn(async move {
                axum_server::bind_rustls(address, config)
                    .handle(serve_handle)
                    .serve(app)
                    .await
            }),
            None => tokio::spawn(async move {
                axum_server::bind(address)
                    .handle(serve_handle)
                    .serve(app)
                    .await
            }),
        };

        let Some(local_addr) = handle.listening().await else {
            let source = match task.await {
                Ok(Err(e)) => e,
                _ => std::io::Error::other("listener exited before binding"),
            };
            return Err(ServerError::Bind { address, source });
        };

        tracing::info!(
            address = %local_addr,
            listener = %listener,
            tls = self.tls.is_some(),
            server_ping = self.server_ping,
            "WebSocket server listening"
        );

        Ok(RunningServer {
            local_addr,
            listener,
            registry: self.registry,
            handle,
            task,
        })
    }
}

fn rustls_config(tls: &TlsConfig) -> Result<RustlsConfig, ServerError> {
    let identity = ServerIdentity::load(&tls.cert, &tls.key)?;
    let client_trust = if tls.client_auth {
        Some(load_trust(tls.trust_store.as_deref().unwrap_or_default())?)
    } else {
        None
    };
    Ok(RustlsConfig::from_config(server_config(identity, client_trust.as_ref())?))
}

/// A bound listener.
pub struct RunningServer {
    local_addr: SocketAddr,
    listener: ListenerId,
    registry: SessionRegistry,
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }

    /// Sessions currently registered under this listener.
    pub fn session_count(&self) -> usize {
        self.registry.count(self.listener)
    }

    /// Close every session with going-away, then stop accepting.
    pub async fn stop(self) -> Result<(), ServerError> {
        let drained = self.registry.drain(self.listener).await;
        self.handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));

        let result = match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ServerError::Serve(e.to_string())),
            Err(e) => Err(ServerError::Serve(e.to_string())),
        };
        tracing::info!(address = %self.local_addr, drained, "WebSocket server stopped");
        result
    }
}
