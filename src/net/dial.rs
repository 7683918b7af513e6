//! Dial policy: choose transport security for a target and open sessions.
//!
//! # Responsibilities
//! - `wss` + insecure   → TLS without peer verification
//! - `wss` + verified   → TLS against the custom trust pool or web PKI roots
//! - `ws`               → plain TCP
//! - Capture status and body of a rejected handshake in [`DialError::Failed`]
//!
//! # Design Decisions
//! - Handshakes are bounded by a timeout so a hung peer cannot block callers
//! - ALPN is pinned to http/1.1; WebSocket upgrades never negotiate h2

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use url::Url;

use crate::net::target::HeaderSet;
use crate::net::tls::{crypto_provider, TrustConfig};
use crate::observability::metrics;
use crate::session::transport::split_tungstenite;
use crate::session::{FrameStream, Origin, Session};

/// Default bound on the opening handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial to [{url}] failed{}: {source}", describe_response(.status, .body))]
    Failed {
        url: String,
        status: Option<u16>,
        body: Option<String>,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("handshake with [{url}] timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("invalid header [{0}]")]
    InvalidHeader(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),
}

fn describe_response(status: &Option<u16>, body: &Option<String>) -> String {
    match (status, body) {
        (Some(status), Some(body)) if !body.is_empty() => format!(" with status {status} ({body})"),
        (Some(status), _) => format!(" with status {status}"),
        _ => String::new(),
    }
}

impl DialError {
    fn from_handshake(url: &Url, err: tungstenite::Error) -> Self {
        let (status, body) = match &err {
            tungstenite::Error::Http(response) => (
                Some(response.status().as_u16()),
                response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned()),
            ),
            _ => (None, None),
        };
        DialError::Failed {
            url: url.to_string(),
            status,
            body,
            source: Box::new(err),
        }
    }

    /// HTTP status of a rejected handshake, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            DialError::Failed { status, .. } => *status,
            _ => None,
        }
    }
}

/// Transport security chosen for a target.
#[derive(Debug, Clone)]
pub enum Dialer {
    Plain,
    Insecure(Arc<ClientConfig>),
    Verified(Arc<ClientConfig>),
}

impl Dialer {
    fn connector(&self) -> Connector {
        match self {
            Dialer::Plain => Connector::Plain,
            Dialer::Insecure(config) | Dialer::Verified(config) => {
                Connector::Rustls(Arc::clone(config))
            }
        }
    }
}

/// Pick the dialer for `url`.
pub fn build_dialer(
    url: &Url,
    allow_insecure: bool,
    trust: Option<&TrustConfig>,
) -> Result<Dialer, DialError> {
    if url.scheme() != "wss" {
        return Ok(Dialer::Plain);
    }

    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    if allow_insecure || trust.is_some_and(|t| t.skip_verify) {
        tracing::warn!(url = %url, "Peer verification disabled for this target");
        let mut config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        return Ok(Dialer::Insecure(Arc::new(config)));
    }

    let roots = trust.map_or_else(
        || TrustConfig::system_default().root_store(),
        TrustConfig::root_store,
    );
    let mut config = builder.with_root_certificates(roots).with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Dialer::Verified(Arc::new(config)))
}

/// Open an outbound session.
///
/// Returns the session and its read half; the caller owns the read loop.
pub async fn dial(
    dialer: &Dialer,
    url: &Url,
    headers: &HeaderSet,
    handshake_timeout: Duration,
) -> Result<(Arc<Session>, FrameStream), DialError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| DialError::from_handshake(url, e))?;
    for (name, values) in headers.iter() {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| DialError::InvalidHeader(name.to_owned()))?;
        for value in values {
            let value = HeaderValue::from_str(value)
                .map_err(|_| DialError::InvalidHeader(name.to_owned()))?;
            request.headers_mut().append(header.clone(), value);
        }
    }

    let connect = connect_async_tls_with_config(request, None, false, Some(dialer.connector()));
    let (ws, response) = match tokio::time::timeout(handshake_timeout, connect).await {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            metrics::record_dial(false);
            let err = DialError::from_handshake(url, e);
            tracing::warn!(url = %url, error = %err, "Dial failed");
            return Err(err);
        }
        Err(_) => {
            metrics::record_dial(false);
            tracing::warn!(url = %url, timeout = ?handshake_timeout, "Handshake timed out");
            return Err(DialError::Timeout {
                url: url.to_string(),
                after: handshake_timeout,
            });
        }
    };

    let (sink, stream) = split_tungstenite(ws);
    let session = Session::new(Origin::Outbound, url.as_str(), sink);
    metrics::record_dial(true);
    tracing::info!(
        session_id = %session.id(),
        url = %url,
        status = response.status().as_u16(),
        "Session established"
    );
    Ok((session, stream))
}

/// Accepts any server certificate; signatures are still checked.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_targets_get_plain_dialer() {
        let url = Url::parse("ws://localhost:9000/feed").unwrap();
        assert!(matches!(build_dialer(&url, true, None).unwrap(), Dialer::Plain));
    }

    #[test]
    fn insecure_wins_over_trust() {
        let url = Url::parse("wss://localhost:9000/feed").unwrap();
        let trust = TrustConfig::system_default();
        assert!(matches!(
            build_dialer(&url, true, Some(&trust)).unwrap(),
            Dialer::Insecure(_)
        ));
        assert!(matches!(
            build_dialer(&url, false, Some(&TrustConfig::insecure())).unwrap(),
            Dialer::Insecure(_)
        ));
    }

    #[test]
    fn secure_targets_verify_by_default() {
        let url = Url::parse("wss://localhost:9000/feed").unwrap();
        assert!(matches!(build_dialer(&url, false, None).unwrap(), Dialer::Verified(_)));
    }

    #[test]
    fn failure_message_includes_status_and_body() {
        let err = DialError::Failed {
            url: "ws://h/".into(),
            status: Some(401),
            body: Some("denied".into()),
            source: Box::new(tungstenite::Error::ConnectionClosed),
        };
        let message = err.to_string();
        assert!(message.contains("401"));
        assert!(message.contains("denied"));
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn refused_connection_is_dial_failed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}/")).unwrap();
        let Err(err) = dial(&Dialer::Plain, &url, &HeaderSet::new(), Duration::from_secs(5)).await
        else {
            panic!("dial to a closed port succeeded");
        };
        assert!(matches!(err, DialError::Failed { status: None, .. }));
    }
}
