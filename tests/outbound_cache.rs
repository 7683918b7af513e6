//! Outbound write-through-cache behaviour against a live backend.

mod common;

use std::time::Duration;

use common::{eventually, MockBackend};
use ws_session_manager::client::{OutboundClient, OutboundRequest};
use ws_session_manager::lifecycle::Shutdown;
use ws_session_manager::net::target::Parameter;
use ws_session_manager::session::{ConnectionCache, KeepaliveSettings, Liveness};

fn client() -> OutboundClient {
    OutboundClient::new(ConnectionCache::new(KeepaliveSettings::default(), Shutdown::new()))
        .with_handshake_timeout(Duration::from_secs(5))
}

fn request(backend: &MockBackend, payload: &str) -> OutboundRequest {
    OutboundRequest {
        handler: "ticker".into(),
        url_template: backend.url("/rooms/{room}"),
        path_params: vec![Parameter::single("room", "lobby")],
        headers: vec![Parameter::single("X-Tenant", "acme")],
        payload: Some(payload.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn identical_requests_share_one_session() {
    let backend = MockBackend::start().await;
    let client = client();

    let first = client.send(&request(&backend, "one")).await.unwrap();
    let second = client.send(&request(&backend, "two")).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(backend.accepted(), 1);
    assert!(eventually(Duration::from_secs(2), || backend.received().len() == 2).await);
    assert_eq!(backend.received(), vec!["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn different_headers_get_different_sessions() {
    let backend = MockBackend::start().await;
    let client = client();

    let first = client.send(&request(&backend, "one")).await.unwrap();
    let mut other = request(&backend, "two");
    other.headers = vec![Parameter::single("X-Tenant", "globex")];
    let second = client.send(&other).await.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(backend.accepted(), 2);
    assert_eq!(client.cache().len(), 2);
}

#[tokio::test]
async fn remote_close_evicts_and_next_send_redials() {
    let backend = MockBackend::start().await;
    let client = client();

    let first = client.send(&request(&backend, "one")).await.unwrap();
    backend.close_all(1001);

    assert!(eventually(Duration::from_secs(2), || client.cache().is_empty()).await);
    assert_eq!(first.liveness(), Liveness::Dead);

    let second = client.send(&request(&backend, "two")).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(backend.accepted(), 2);
}

#[tokio::test]
async fn unreachable_target_surfaces_dial_failure() {
    let target = OutboundRequest {
        handler: "ticker".into(),
        url_template: "ws://127.0.0.1:1/rooms/{room}".into(),
        path_params: vec![Parameter::single("room", "lobby")],
        payload: Some("one".into()),
        ..Default::default()
    };

    let client = client();
    let err = client.send(&target).await.unwrap_err();
    assert!(matches!(err, ws_session_manager::SessionError::Dial(_)), "{err}");
    assert!(client.cache().is_empty());
}
