//! Certificate loading and wss dialing with on-disk trust stores.

mod common;

use std::fs;
use std::time::Duration;

use common::FIXTURES;
use futures_util::StreamExt;
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use ws_session_manager::client::{OutboundClient, OutboundRequest, TlsOptions};
use ws_session_manager::config::TlsConfig;
use ws_session_manager::http::InboundConnection;
use ws_session_manager::lifecycle::Shutdown;
use ws_session_manager::net::tls::{load_trust, CertificateError};
use ws_session_manager::session::{ConnectionCache, Frame, KeepaliveSettings};
use ws_session_manager::{RunningServer, SessionError, WebSocketServer};

fn fixture(name: &str) -> String {
    format!("{FIXTURES}/{name}")
}

/// A directory with the CA and a file that is not a certificate.
fn trust_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::copy(fixture("ca.pem"), dir.path().join("ca.pem")).unwrap();
    fs::copy(fixture("not_a_cert.txt"), dir.path().join("notes.txt")).unwrap();
    dir
}

#[test]
fn directory_trust_accepts_certificates_signed_by_its_ca() {
    let dir = trust_dir();
    let trust = load_trust(dir.path().to_str().unwrap()).unwrap();

    let roots = trust.root_store();
    assert_eq!(roots.len(), 1);

    let leaf_pem = fs::read(fixture("server.pem")).unwrap();
    let leaf: CertificateDer<'static> = rustls_pemfile::certs(&mut leaf_pem.as_slice())
        .next()
        .unwrap()
        .unwrap();
    let verifier = WebPkiServerVerifier::builder(roots).build().unwrap();
    verifier
        .verify_server_cert(
            &leaf,
            &[],
            &ServerName::try_from("localhost").unwrap(),
            &[],
            UnixTime::now(),
        )
        .unwrap();
}

#[test]
fn empty_directory_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_trust(dir.path().to_str().unwrap()).unwrap_err();
    assert!(matches!(err, CertificateError::TrustStoreEmpty(_)), "{err}");
}

#[test]
fn directory_of_non_certificates_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    fs::copy(fixture("not_a_cert.txt"), dir.path().join("a.txt")).unwrap();
    let err = load_trust(dir.path().to_str().unwrap()).unwrap_err();
    assert!(matches!(err, CertificateError::TrustStoreEmpty(_)), "{err}");
}

#[test]
fn file_path_is_not_a_directory() {
    let err = load_trust(&fixture("not_a_cert.txt")).unwrap_err();
    assert!(matches!(err, CertificateError::TrustStoreNotADirectory(_)), "{err}");
}

#[test]
fn missing_path_is_not_found() {
    let err = load_trust("/definitely/not/here").unwrap_err();
    assert!(matches!(err, CertificateError::TrustStoreNotFound(_)), "{err}");
}

async fn echo(connection: InboundConnection) {
    let mut stream = connection.stream;
    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            Frame::Close(_) => break,
            frame if frame.is_data() => {
                let _ = connection.session.send(frame).await;
            }
            _ => {}
        }
    }
}

async fn tls_server() -> RunningServer {
    WebSocketServer::new("127.0.0.1:0")
        .with_tls(TlsConfig {
            cert: fixture("server.pem"),
            key: fixture("server.key"),
            client_auth: false,
            trust_store: None,
        })
        .connection_route("/echo", echo)
        .start()
        .await
        .unwrap()
}

fn request(server: &RunningServer, tls: TlsOptions) -> OutboundRequest {
    OutboundRequest {
        handler: "secure".into(),
        url_template: format!("wss://127.0.0.1:{}/echo", server.local_addr().port()),
        tls,
        payload: Some("hello".into()),
        ..Default::default()
    }
}

fn client() -> OutboundClient {
    OutboundClient::new(ConnectionCache::new(KeepaliveSettings::default(), Shutdown::new()))
        .with_handshake_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn wss_dial_succeeds_with_directory_trust() {
    let server = tls_server().await;
    let dir = trust_dir();
    let tls = TlsOptions {
        allow_insecure: false,
        ca_cert: dir.path().to_str().unwrap().to_owned(),
    };

    let session = client().send(&request(&server, tls)).await.unwrap();
    assert!(session.is_live());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn wss_dial_succeeds_with_inline_ca() {
    let server = tls_server().await;
    let tls = TlsOptions {
        allow_insecure: false,
        ca_cert: fs::read_to_string(fixture("ca.pem")).unwrap(),
    };
    client().send(&request(&server, tls)).await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn wss_dial_fails_without_trust() {
    let server = tls_server().await;
    let err = client()
        .send(&request(&server, TlsOptions::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Dial(_)), "{err}");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn wss_dial_succeeds_when_insecure() {
    let server = tls_server().await;
    let tls = TlsOptions {
        allow_insecure: true,
        ca_cert: String::new(),
    };
    client().send(&request(&server, tls)).await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn bad_trust_spec_fails_before_dialing() {
    let server = tls_server().await;
    let tls = TlsOptions {
        allow_insecure: false,
        ca_cert: "/definitely/not/here".into(),
    };
    let err = client().send(&request(&server, tls)).await.unwrap_err();
    assert!(matches!(err, SessionError::Certificate(CertificateError::TrustStoreNotFound(_))), "{err}");
    server.stop().await.unwrap();
}
