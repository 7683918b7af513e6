//! WebSocket session manager daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────── SessionManager ────────────────────────┐
//!                 │                                                                 │
//!  inbound peer ──┼─▶ http::server ─▶ websocket (Data / Connection)                 │
//!                 │                 └▶ proxy ─▶ AdmissionController ─▶ backend dial ─┼──▶ backend
//!                 │                         │                                       │
//!                 │                   SessionRegistry (drain on stop)               │
//!                 │                                                                 │
//!  host call ─────┼─▶ OutboundClient ─▶ ConnectionCache ─▶ dial policy ─────────────┼──▶ remote
//!                 │                         │                                       │
//!                 │                  KeepaliveSupervisor (one per session)          │
//!                 │                                                                 │
//!  subscription ◀─┼── ReconnectingClient ◀─ Reconnect engine (bounded backoff) ─────┼─── remote
//!                 └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use ws_session_manager::client::{ClientEvent, ClientSettings};
use ws_session_manager::config::{load_config, ConfigWatcher, ManagerConfig, RouteMode};
use ws_session_manager::lifecycle::signals::wait_for_signal;
use ws_session_manager::observability::{logging, metrics};
use ws_session_manager::session::Frame;
use ws_session_manager::SessionManager;

#[derive(Debug, Parser)]
#[command(name = "ws-session-manager", version, about = "Resilient WebSocket session manager")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address when the configuration has no [server] section.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ManagerConfig::default(),
    };

    logging::init_tracing(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ws-session-manager starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let manager = Arc::new(SessionManager::new(config.clone()));

    let mut server = manager.server(&args.bind);
    for route in config.server.iter().flat_map(|s| s.routes.iter()) {
        server = match route.mode {
            RouteMode::Data => server.data_route(route.path.clone(), route.format, |message| async move {
                tracing::info!(
                    session_id = %message.session.id(),
                    request_id = %message.context.request_id,
                    payload = %message.payload.to_text(),
                    "Message received"
                );
            }),
            RouteMode::Connection => server.connection_route(route.path.clone(), echo),
            RouteMode::Proxy => server,
        };
    }
    let running = server.start().await?;

    let client = match &config.client {
        Some(subscription) => {
            let settings = ClientSettings::from_config(subscription, &config);
            let (client, mut events) = manager.start_client(settings).await?;
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        ClientEvent::Message(message) => tracing::info!(
                            session_id = %message.session_id,
                            payload = %message.payload.to_text(),
                            "Subscription message"
                        ),
                        ClientEvent::Failed(e) => tracing::error!(error = %e, "Subscription failed"),
                    }
                }
            });
            Some(client)
        }
        None => None,
    };

    // The watcher stops when dropped.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                while let Some(reloaded) = updates.recv().await {
                    manager.apply_config(&reloaded);
                    tracing::info!("Admission ceilings reloaded");
                }
            });
            Some(watcher)
        }
        None => None,
    };

    wait_for_signal().await;

    if let Some(client) = client {
        client.stop().await;
    }
    manager.shutdown().await;
    running.stop().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Connection-mode handler that writes every data frame back.
async fn echo(connection: ws_session_manager::http::InboundConnection) {
    use futures_util::StreamExt;

    let mut stream = connection.stream;
    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            Frame::Close(_) => break,
            frame if frame.is_data() => {
                if connection.session.send(frame).await.is_err() {
                    break;
                }
            }
            _ => {}
        }
    }
}
