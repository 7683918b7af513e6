//! Admission-controlled proxy bridge.
//!
//! # Responsibilities
//! - Admit or reject an upgrade before any session is registered
//! - Reject with a policy-violation close naming the service and ceiling
//! - Dial the backend through the dial policy and forward frames both ways
//! - Release the admission permit when the bridge ends
//!
//! # Data Flow
//! ```text
//! Client ←── frames ──→ bridge ←── frames ──→ Backend
//!            (registered, permit held for the bridge's lifetime)
//! ```
//!
//! # Design Decisions
//! - Control frames are answered by each transport, only data crosses
//! - A close from either side is propagated to the other with its code

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::StreamExt;
use url::Url;

use super::websocket::{finish, RouteState, UpgradeContext, X_REQUEST_ID};
use crate::client::TlsOptions;
use crate::net::dial::{build_dialer, dial};
use crate::net::target::{resolve_target, HeaderSet, ParamValue, Parameter, TargetError};
use crate::net::tls::{load_trust, CertificateError, TrustConfig};
use crate::security::admission::{AdmissionController, AdmissionPermit, AdmissionRejected};
use crate::session::transport::split_axum;
use crate::session::{
    CloseReason, Frame, FrameStream, Origin, Session, TransportError, CLOSE_GOING_AWAY,
    CLOSE_POLICY_VIOLATION,
};

/// Internal error close code, sent when the backend cannot be reached.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Where an admitted proxy session is bridged to.
pub(crate) struct ProxyTarget {
    pub service: String,
    /// Backend URL; `{name}` segments bind the inbound path params.
    pub backend: String,
    pub allow_insecure: bool,
    pub trust: Option<TrustConfig>,
    pub handshake_timeout: Duration,
    pub admission: Arc<AdmissionController>,
}

impl ProxyTarget {
    /// Load the backend trust store up front so a bad one fails at startup.
    pub(crate) fn new(
        service: String,
        backend: String,
        tls: &TlsOptions,
        handshake_timeout: Duration,
        admission: Arc<AdmissionController>,
    ) -> Result<Self, CertificateError> {
        let trust = if !tls.allow_insecure && backend.starts_with("wss://") {
            Some(load_trust(&tls.ca_cert)?)
        } else {
            None
        };
        Ok(Self {
            service,
            backend,
            allow_insecure: tls.allow_insecure,
            trust,
            handshake_timeout,
            admission,
        })
    }

    fn backend_url(&self, context: &UpgradeContext) -> Result<Url, TargetError> {
        let path: Vec<Parameter> = context
            .path_params
            .iter()
            .map(|(name, value)| Parameter::single(name.clone(), value.as_str()))
            .collect();

        let mut grouped: BTreeMap<&str, Vec<ParamValue>> = BTreeMap::new();
        for (name, value) in &context.query {
            grouped
                .entry(name.as_str())
                .or_default()
                .push(ParamValue::from(value.as_str()));
        }
        let query: Vec<Parameter> = grouped
            .into_iter()
            .map(|(name, values)| Parameter::repeating(name, values))
            .collect();

        resolve_target(&self.backend, &path, &query)
    }
}

pub(crate) fn accept(
    route: RouteState,
    target: Arc<ProxyTarget>,
    context: UpgradeContext,
    ws: WebSocketUpgrade,
) -> Response {
    match target.admission.try_admit(&target.service) {
        Ok(permit) => ws.on_upgrade(move |socket| serve(route, target, context, socket, permit)),
        Err(rejected) => ws.on_upgrade(move |socket| reject(socket, context, rejected)),
    }
}

/// Complete the handshake, send the policy-violation close, never register.
async fn reject(socket: WebSocket, context: UpgradeContext, rejected: AdmissionRejected) {
    let (sink, stream) = split_axum(socket);
    let session = Session::new(Origin::Inbound, context.remote.to_string(), sink);
    let reason = rejected.to_string();
    tracing::info!(
        request_id = %context.request_id,
        remote = %context.remote,
        service = %rejected.service,
        "Rejecting session over admission ceiling"
    );
    if let Err(e) = session.close(CLOSE_POLICY_VIOLATION, &reason).await {
        tracing::debug!(session_id = %session.id(), error = %e, "Rejection close failed");
    }
    drop(stream);
}

async fn serve(
    route: RouteState,
    target: Arc<ProxyTarget>,
    context: UpgradeContext,
    socket: WebSocket,
    permit: AdmissionPermit,
) {
    let (client, client_stream, registration) = route.open(&context, socket);

    match connect_backend(&target, &context).await {
        Ok((backend, backend_stream)) => {
            let mut shutdown = route.shutdown.subscribe();
            let closed_by = tokio::select! {
                reason = forward(client_stream, &backend) => reason,
                reason = forward(backend_stream, &client) => reason,
                _ = client.stopped() => None,
                _ = backend.stopped() => None,
                _ = shutdown.recv() => None,
            };

            let (code, reason) = match closed_by {
                Some(r) => (r.code, r.reason),
                None => (CLOSE_GOING_AWAY, "peer disconnected".to_string()),
            };
            tracing::debug!(
                client = %client.id(),
                backend = %backend.id(),
                code,
                "Bridge finished"
            );
            let (_, _) = tokio::join!(client.close(code, &reason), backend.close(code, &reason));
            registration.release();
        }
        Err(e) => {
            tracing::warn!(
                session_id = %client.id(),
                service = %target.service,
                error = %e,
                "Backend unavailable"
            );
            let _ = client.close(CLOSE_INTERNAL_ERROR, "backend unavailable").await;
            finish(&client, registration).await;
        }
    }

    permit.release();
}

async fn connect_backend(
    target: &ProxyTarget,
    context: &UpgradeContext,
) -> Result<(Arc<Session>, FrameStream), Box<dyn std::error::Error + Send + Sync>> {
    let url = target.backend_url(context)?;
    let dialer = build_dialer(&url, target.allow_insecure, target.trust.as_ref())?;
    let mut headers = HeaderSet::new();
    headers.insert(X_REQUEST_ID, &context.request_id);
    Ok(dial(&dialer, &url, &headers, target.handshake_timeout).await?)
}

/// Copy data frames until `from` closes or `to` stops accepting writes.
///
/// Returns the close frame `from` sent, if any.
async fn forward(mut from: FrameStream, to: &Session) -> Option<CloseReason> {
    while let Some(next) = from.next().await {
        match next {
            Ok(Frame::Close(reason)) => return reason,
            Ok(frame) if frame.is_data() => {
                if let Err(e) = to.send(frame).await {
                    tracing::debug!(session_id = %to.id(), error = %e, "Forward write failed");
                    return None;
                }
            }
            Ok(_) => {}
            Err(TransportError::Transient(_)) => continue,
            Err(_) => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn target(backend: &str) -> ProxyTarget {
        ProxyTarget::new(
            "quotes".into(),
            backend.into(),
            &TlsOptions::default(),
            Duration::from_secs(1),
            Arc::new(AdmissionController::default()),
        )
        .unwrap()
    }

    fn context(path: &[(&str, &str)], query: &[(&str, &str)]) -> UpgradeContext {
        UpgradeContext {
            request_id: "r".into(),
            remote: "127.0.0.1:1".parse().unwrap(),
            path_params: path.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>(),
            query: query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            headers: HeaderSet::new(),
        }
    }

    #[test]
    fn backend_url_binds_path_and_query() {
        let url = target("ws://backend:9000/feeds/{feed}")
            .backend_url(&context(&[("feed", "btc")], &[("depth", "5"), ("side", "bid"), ("side", "ask")]))
            .unwrap();
        assert_eq!(url.as_str(), "ws://backend:9000/feeds/btc?depth=5&side=bid&side=ask");
    }

    #[test]
    fn backend_url_requires_every_placeholder() {
        let err = target("ws://backend/feeds/{feed}")
            .backend_url(&context(&[], &[]))
            .unwrap_err();
        assert!(matches!(err, TargetError::MissingPathParameter(_)));
    }

    #[test]
    fn plain_backend_loads_no_trust() {
        assert!(target("ws://backend/x").trust.is_none());
    }
}
