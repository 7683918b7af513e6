//! Write-through-cache outbound client.
//!
//! Each `send` reuses the cached session for its fingerprint, dialing only
//! on a miss. A failed write evicts and closes the session and returns the
//! error; the next `send` for the same fingerprint dials again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use super::TlsOptions;
use crate::net::dial::{dial, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::net::target::{resolve_target, HeaderSet, Parameter, SessionFingerprint};
use crate::session::{
    ConnectionCache, Frame, FrameStream, Session, SessionError, TransportError, CLOSE_GOING_AWAY,
    CLOSE_NORMAL,
};

/// One outbound invocation.
#[derive(Debug, Clone, Default)]
pub struct OutboundRequest {
    /// Logical handler identity; part of the cache key.
    pub handler: String,
    /// Target URL with `{name}` placeholders.
    pub url_template: String,
    pub path_params: Vec<Parameter>,
    pub query_params: Vec<Parameter>,
    pub headers: Vec<Parameter>,
    pub tls: TlsOptions,
    pub payload: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutboundClient {
    cache: ConnectionCache,
    handshake_timeout: Duration,
}

impl OutboundClient {
    pub fn new(cache: ConnectionCache) -> Self {
        Self {
            cache,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    /// Write the request's payload through the cached session for its target.
    ///
    /// Returns the session the payload went out on.
    pub async fn send(&self, request: &OutboundRequest) -> Result<Arc<Session>, SessionError> {
        let payload = request
            .payload
            .as_deref()
            .ok_or(SessionError::MissingPayload)?;
        let url = resolve_target(
            &request.url_template,
            &request.path_params,
            &request.query_params,
        )?;
        let headers = HeaderSet::from_parameters(&request.headers);
        let fingerprint = SessionFingerprint::new(&request.handler, &url, &headers);

        let session = self
            .cache
            .get_or_create(&fingerprint, || async {
                let dialer = request.tls.dialer_for(&url)?;
                let (session, stream) = dial(&dialer, &url, &headers, self.handshake_timeout).await?;
                self.spawn_drain(fingerprint.clone(), Arc::clone(&session), stream);
                Ok::<_, SessionError>(session)
            })
            .await?;

        self.write(&fingerprint, &session, payload).await?;
        Ok(session)
    }

    /// Write on a cached session, evicting and closing it on failure.
    pub(crate) async fn write(
        &self,
        fingerprint: &SessionFingerprint,
        session: &Arc<Session>,
        payload: &str,
    ) -> Result<(), SessionError> {
        match session.send_text(payload).await {
            Ok(()) => {
                tracing::debug!(session_id = %session.id(), bytes = payload.len(), "Payload written");
                Ok(())
            }
            Err(source) => {
                tracing::warn!(
                    session_id = %session.id(),
                    fingerprint = %fingerprint,
                    error = %source,
                    "Write failed, evicting session"
                );
                self.cache.evict_session(fingerprint, session.id());
                let _ = session.close(CLOSE_GOING_AWAY, "write failed").await;
                Err(SessionError::WriteFailed {
                    session: session.id(),
                    source,
                })
            }
        }
    }

    /// Consume inbound frames so control frames get answered; a remote close
    /// or read error marks the session dead and evicts it.
    fn spawn_drain(&self, fingerprint: SessionFingerprint, session: Arc<Session>, mut stream: FrameStream) {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = session.stopped() => break "stopped".to_string(),
                    next = stream.next() => match next {
                        Some(Ok(Frame::Close(reason))) => {
                            break format!("remote close {:?}", reason.map(|r| r.code));
                        }
                        Some(Ok(frame)) => {
                            tracing::trace!(session_id = %session.id(), ?frame, "Frame ignored on outbound session");
                        }
                        Some(Err(TransportError::Transient(e))) => {
                            tracing::debug!(session_id = %session.id(), error = %e, "Transient read error");
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    },
                }
            };

            tracing::debug!(session_id = %session.id(), reason = %reason, "Outbound read loop finished");
            session.mark_dead();
            cache.evict_session(&fingerprint, session.id());
            let _ = session.close(CLOSE_NORMAL, "").await;
        });
    }
}
