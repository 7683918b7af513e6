//! Per-session keepalive loop.
//!
//! # State Transitions
//! ```text
//! Active → Active:   probe ok, closing (benign), or transient failure
//! Active → Stopped:  session stop signal, manager shutdown, fatal failure
//! ```
//!
//! # Design Decisions
//! - One supervisor per session, claimed through the session itself
//! - A fatal failure marks the session dead, runs the eviction callback,
//!   then closes the session; the callback runs before the close frame so
//!   no caller can pick the session up in between
//! - The first probe fires one full interval after start

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{Session, TransportError, CLOSE_GOING_AWAY};
use crate::config::KeepaliveConfig;
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;

/// Probe cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&KeepaliveConfig> for KeepaliveSettings {
    fn from(config: &KeepaliveConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }
}

/// Spawns keepalive loops.
pub struct KeepaliveSupervisor;

impl KeepaliveSupervisor {
    /// Start the loop for `session`.
    ///
    /// Returns `None` if the session already has a supervisor.
    pub fn spawn<F>(
        session: Arc<Session>,
        settings: KeepaliveSettings,
        shutdown: ShutdownSignal,
        on_fatal: F,
    ) -> Option<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        if !session.claim_keepalive() {
            tracing::warn!(session_id = %session.id(), "Keepalive already running");
            return None;
        }
        Some(tokio::spawn(run(session, settings, shutdown, on_fatal)))
    }
}

async fn run<F>(
    session: Arc<Session>,
    settings: KeepaliveSettings,
    mut shutdown: ShutdownSignal,
    on_fatal: F,
) where
    F: FnOnce() + Send + 'static,
{
    let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        session_id = %session.id(),
        interval = ?settings.interval,
        "Keepalive started"
    );

    loop {
        tokio::select! {
            _ = session.stopped() => {
                tracing::debug!(session_id = %session.id(), "Keepalive stopped by session");
                return;
            }
            _ = shutdown.recv() => {
                tracing::debug!(session_id = %session.id(), "Keepalive stopped by shutdown");
                return;
            }
            _ = ticker.tick() => {}
        }

        match session.probe(settings.probe_timeout).await {
            Ok(()) => {
                tracing::trace!(session_id = %session.id(), "Probe sent");
            }
            Err(TransportError::Closing) => {
                tracing::debug!(session_id = %session.id(), "Probe skipped, session closing");
            }
            Err(TransportError::Transient(reason)) => {
                metrics::record_probe_failure("transient");
                tracing::warn!(session_id = %session.id(), reason = %reason, "Transient probe failure");
            }
            Err(TransportError::Fatal(reason)) => {
                metrics::record_probe_failure("fatal");
                tracing::error!(
                    session_id = %session.id(),
                    remote = %session.remote(),
                    reason = %reason,
                    "Probe failed, evicting session"
                );
                session.mark_dead();
                on_fatal();
                let _ = session.close(CLOSE_GOING_AWAY, "keepalive failed").await;
                return;
            }
        }
    }
}
