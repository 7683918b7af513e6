//! Inbound WebSocket accept path.
//!
//! # Responsibilities
//! - Extract path params, query pairs, headers and the peer address
//! - Complete the upgrade and wrap the socket in a [`Session`]
//! - Register every accepted session under its listener
//! - Run the data read loop or hand the session to a connection handler
//! - Attach the server-initiated keepalive when enabled
//!
//! # Data Flow
//! ```text
//! GET /route (Upgrade: websocket)
//!     → accept() extractors → UpgradeContext
//!     → proxy route?  → proxy::accept (admission first)
//!     → on_upgrade → Session::new(Inbound) → registry.register
//!     → Data:       read loop → classify → DataHandler per message
//!     → Connection: ConnectionHandler owns the frame stream
//!     → Registration dropped, session closed normally
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;

use super::proxy::{self, ProxyTarget};
use crate::lifecycle::Shutdown;
use crate::net::target::HeaderSet;
use crate::session::transport::split_axum;
use crate::session::{
    Frame, FrameStream, KeepaliveSettings, KeepaliveSupervisor, ListenerId, MessageFormat, Origin,
    Payload, Registration, Session, SessionRegistry, TransportError, CLOSE_NORMAL,
};

/// Header carrying the per-upgrade correlation id.
pub const X_REQUEST_ID: &str = "x-request-id";

/// What the peer sent with its upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeContext {
    pub request_id: String,
    pub remote: SocketAddr,
    pub path_params: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub headers: HeaderSet,
}

impl UpgradeContext {
    fn new(
        remote: SocketAddr,
        path_params: HashMap<String, String>,
        query: Vec<(String, String)>,
        raw_headers: &HeaderMap,
    ) -> Self {
        let mut headers = HeaderSet::new();
        for (name, value) in raw_headers {
            if let Ok(value) = value.to_str() {
                headers.append(name.as_str(), value);
            }
        }
        let request_id = headers
            .get(X_REQUEST_ID)
            .and_then(|values| values.first().cloned())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            request_id,
            remote,
            path_params,
            query,
            headers,
        }
    }

    /// Values of a query parameter, in request order.
    pub fn query_values(&self, name: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }
}

/// One classified data frame on a data route.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub session: Arc<Session>,
    pub context: Arc<UpgradeContext>,
    pub payload: Payload,
}

/// A session handed to a connection route. The handler owns the read half;
/// the session is unregistered and closed when the handler returns.
pub struct InboundConnection {
    pub session: Arc<Session>,
    pub stream: FrameStream,
    pub context: UpgradeContext,
}

pub type DataHandler = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(InboundConnection) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum RouteKind {
    Data {
        handler: DataHandler,
        format: MessageFormat,
    },
    Connection(ConnectionHandler),
    Proxy(Arc<ProxyTarget>),
}

/// Per-route state injected into [`accept`].
#[derive(Clone)]
pub(crate) struct RouteState {
    pub listener: ListenerId,
    pub registry: SessionRegistry,
    pub shutdown: Shutdown,
    /// Set when the server sends its own keepalive probes.
    pub server_ping: Option<KeepaliveSettings>,
    pub kind: RouteKind,
}

impl RouteState {
    /// Wrap an upgraded socket and register it.
    pub(crate) fn open(
        &self,
        context: &UpgradeContext,
        socket: WebSocket,
    ) -> (Arc<Session>, FrameStream, Registration) {
        let (sink, stream) = split_axum(socket);
        let session = Session::new(Origin::Inbound, context.remote.to_string(), sink);
        let registration = self.attach(Arc::clone(&session), &context.request_id);

        tracing::info!(
            session_id = %session.id(),
            listener = %self.listener,
            request_id = %context.request_id,
            remote = %context.remote,
            "Session accepted"
        );
        (session, stream, registration)
    }

    /// Register `session` and start the server keepalive when enabled.
    ///
    /// A fatal probe unregisters the session even while a connection
    /// handler still holds it.
    fn attach(&self, session: Arc<Session>, tag: &str) -> Registration {
        let registration = self.registry.register(self.listener, Arc::clone(&session), tag);

        if let Some(settings) = self.server_ping {
            let registry = self.registry.clone();
            let listener = self.listener;
            let id = session.id();
            KeepaliveSupervisor::spawn(session, settings, self.shutdown.subscribe(), move || {
                registry.unregister(listener, id);
            });
        }
        registration
    }
}

/// Unregister then close with a normal closure.
pub(crate) async fn finish(session: &Session, registration: Registration) {
    registration.release();
    if let Err(e) = session.close(CLOSE_NORMAL, "").await {
        tracing::debug!(session_id = %session.id(), error = %e, "Close after read loop failed");
    }
}

pub(crate) async fn accept(
    State(route): State<RouteState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(path_params): Path<HashMap<String, String>>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let context = UpgradeContext::new(remote, path_params, query, &headers);
    tracing::debug!(request_id = %context.request_id, remote = %remote, "Upgrade requested");

    match route.kind.clone() {
        RouteKind::Proxy(target) => proxy::accept(route, target, context, ws),
        RouteKind::Data { handler, format } => {
            ws.on_upgrade(move |socket| serve_data(route, context, socket, handler, format))
        }
        RouteKind::Connection(handler) => {
            ws.on_upgrade(move |socket| serve_connection(route, context, socket, handler))
        }
    }
}

async fn serve_data(
    route: RouteState,
    context: UpgradeContext,
    socket: WebSocket,
    handler: DataHandler,
    format: MessageFormat,
) {
    let (session, mut stream, registration) = route.open(&context, socket);
    let context = Arc::new(context);
    let mut shutdown = route.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = session.stopped() => break,
            _ = shutdown.recv() => break,
            next = stream.next() => match next {
                Some(Ok(Frame::Close(reason))) => {
                    tracing::debug!(session_id = %session.id(), ?reason, "Peer closed session");
                    break;
                }
                Some(Ok(frame)) => match format.classify_frame(&frame) {
                    Some(payload) => {
                        handler(InboundMessage {
                            session: Arc::clone(&session),
                            context: Arc::clone(&context),
                            payload,
                        })
                        .await;
                    }
                    None if frame.is_data() => {
                        tracing::warn!(session_id = %session.id(), "Dropping frame that is not valid JSON");
                    }
                    None => {}
                },
                Some(Err(TransportError::Transient(e))) => {
                    tracing::debug!(session_id = %session.id(), error = %e, "Transient read error");
                }
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session.id(), error = %e, "Read failed");
                    break;
                }
                None => break,
            },
        }
    }

    finish(&session, registration).await;
}

async fn serve_connection(
    route: RouteState,
    context: UpgradeContext,
    socket: WebSocket,
    handler: ConnectionHandler,
) {
    let (session, stream, registration) = route.open(&context, socket);
    handler(InboundConnection {
        session: Arc::clone(&session),
        stream,
        context,
    })
    .await;
    finish(&session, registration).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{session_with, MockSink};
    use crate::session::Liveness;
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn connection_route(server_ping: Option<KeepaliveSettings>) -> RouteState {
        let handler: ConnectionHandler =
            Arc::new(|_connection: InboundConnection| -> BoxFuture<'static, ()> { Box::pin(async {}) });
        RouteState {
            listener: ListenerId::new(),
            registry: SessionRegistry::new(),
            shutdown: Shutdown::new(),
            server_ping,
            kind: RouteKind::Connection(handler),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_server_ping_unregisters_held_session() {
        let route = connection_route(Some(KeepaliveSettings::default()));
        let (sink, probe) = MockSink::failing_pings(TransportError::Fatal("reset".into()));
        let session = session_with(sink);

        // The registration stays alive, as it would inside a handler that
        // never reads its stream.
        let registration = route.attach(Arc::clone(&session), "req-1");
        assert_eq!(route.registry.count(route.listener), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(probe.pings.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(session.liveness(), Liveness::Dead);
        assert_eq!(route.registry.count(route.listener), 0);
        assert!(!registration.release());
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_server_ping_keeps_session_registered() {
        let route = connection_route(Some(KeepaliveSettings::default()));
        let (sink, probe) = MockSink::healthy();
        let session = session_with(sink);

        let registration = route.attach(Arc::clone(&session), "req-2");
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(probe.pings.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(route.registry.count(route.listener), 1);
        assert!(registration.release());
        route.shutdown.trigger();
    }

    #[test]
    fn context_reuses_incoming_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Request-Id", HeaderValue::from_static("req-42"));
        headers.insert("Date", HeaderValue::from_static("Tue, 15 Nov 1994 08:12:31 GMT"));

        let context = UpgradeContext::new(
            "127.0.0.1:9000".parse().unwrap(),
            HashMap::new(),
            vec![("topic".into(), "x".into()), ("topic".into(), "y".into())],
            &headers,
        );
        assert_eq!(context.request_id, "req-42");
        assert_eq!(
            context.headers.get("date"),
            Some(&["Tue, 15 Nov 1994 08:12:31 GMT".to_string()][..])
        );
        assert_eq!(context.query_values("topic"), vec!["x", "y"]);
    }

    #[test]
    fn context_generates_request_id_when_absent() {
        let context = UpgradeContext::new(
            "127.0.0.1:9000".parse().unwrap(),
            HashMap::new(),
            Vec::new(),
            &HeaderMap::new(),
        );
        assert!(uuid::Uuid::parse_str(&context.request_id).is_ok());
    }
}
