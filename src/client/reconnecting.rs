//! Reconnecting client subscription.
//!
//! # Responsibilities
//! - Hold one live session to a remote server and emit what it receives
//! - Attach a fresh keepalive supervisor to every session
//! - On abnormal loss, run the reconnect engine and resume reading
//! - Expose the live session for reuse by downstream senders
//!
//! # State Transitions
//! ```text
//! Reading → Stopped:       stop(), manager shutdown, or the event receiver
//!                          was dropped; the session is closed with going-away
//! Reading → Finished:      peer sent a normal (1000) close
//! Reading → Reconnecting:  any other close, read error, or keepalive failure
//! Reconnecting → Reading:  new session established
//! Reconnecting → Failed:   retries exhausted or disabled (ClientEvent::Failed)
//! ```

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use super::TlsOptions;
use crate::config::{ManagerConfig, ReconnectConfig, SubscriptionConfig};
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::net::dial::{dial, DialError, Dialer, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::net::target::{resolve_target, HeaderSet, ParamValue, Parameter};
use crate::resilience::{retry_connect, ReconnectError, RetryState};
use crate::session::{
    Frame, FrameStream, KeepaliveSettings, KeepaliveSupervisor, MessageFormat, ReceivedMessage,
    Session, SessionError, CLOSE_GOING_AWAY, CLOSE_NORMAL,
};

const EVENT_BUFFER: usize = 256;

/// Subscription parameters.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub url: String,
    pub headers: HeaderSet,
    pub query: Vec<Parameter>,
    pub tls: TlsOptions,
    pub auto_reconnect_attempts: i32,
    pub auto_reconnect_max_delay: Duration,
    pub format: MessageFormat,
    pub keepalive: KeepaliveSettings,
    pub handshake_timeout: Duration,
}

impl ClientSettings {
    pub fn new(url: impl Into<String>) -> Self {
        let retry = RetryState::from(&ReconnectConfig::default());
        Self {
            url: url.into(),
            headers: HeaderSet::new(),
            query: Vec::new(),
            tls: TlsOptions::default(),
            auto_reconnect_attempts: retry.max_attempts,
            auto_reconnect_max_delay: retry.max_delay,
            format: MessageFormat::Auto,
            keepalive: KeepaliveSettings::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn from_config(subscription: &SubscriptionConfig, config: &ManagerConfig) -> Self {
        let mut query: Vec<Parameter> = subscription
            .query
            .iter()
            .map(|(name, value)| Parameter::repeating(name.clone(), vec![ParamValue::from(value.as_str())]))
            .collect();
        query.sort_by(|a, b| a.name.cmp(&b.name));
        let retry = RetryState::from(&subscription.reconnect_policy(&config.reconnect));

        Self {
            url: subscription.url.clone(),
            headers: subscription
                .headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            query,
            tls: TlsOptions {
                allow_insecure: subscription.allow_insecure,
                ca_cert: subscription.ca_cert.clone(),
            },
            auto_reconnect_attempts: retry.max_attempts,
            auto_reconnect_max_delay: retry.max_delay,
            format: subscription.format,
            keepalive: KeepaliveSettings::from(&config.keepalive),
            handshake_timeout: Duration::from_secs(config.dial.handshake_timeout_secs),
        }
    }

    fn retry_state(&self) -> RetryState {
        RetryState::new(self.auto_reconnect_attempts, self.auto_reconnect_max_delay)
    }
}

/// Emitted by the read loop.
#[derive(Debug)]
pub enum ClientEvent {
    Message(ReceivedMessage),
    /// Reconnection gave up; no further events follow.
    Failed(ReconnectError),
}

struct ClientContext {
    url: Url,
    dialer: Dialer,
    settings: ClientSettings,
    current: ArcSwapOption<Session>,
    stop: Shutdown,
}

impl ClientContext {
    async fn connect(&self) -> Result<(Arc<Session>, FrameStream), DialError> {
        dial(&self.dialer, &self.url, &self.settings.headers, self.settings.handshake_timeout).await
    }

    /// Make `session` current and give it its own keepalive.
    fn install(&self, session: Arc<Session>) {
        KeepaliveSupervisor::spawn(
            Arc::clone(&session),
            self.settings.keepalive,
            self.stop.subscribe(),
            || {},
        );
        self.current.store(Some(session));
    }

    async fn reconnect(&self) -> Result<(Arc<Session>, FrameStream), ReconnectError> {
        let mut state = self.settings.retry_state();
        retry_connect(|| self.connect(), &mut state, self.stop.subscribe()).await
    }
}

enum ReadOutcome {
    Stopped,
    NormalClose,
    Lost(String),
}

/// A subscription that survives network loss.
pub struct ReconnectingClient {
    ctx: Arc<ClientContext>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingClient {
    /// Connect and start reading.
    ///
    /// A failed first dial goes through the reconnect engine before giving up.
    /// Triggering `shutdown` stops the client and closes its session. Dropping
    /// the coordinator behind `shutdown` without triggering it does not; the
    /// client then runs until [`stop`](Self::stop).
    pub async fn start(
        settings: ClientSettings,
        shutdown: ShutdownSignal,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), SessionError> {
        let url = resolve_target(&settings.url, &[], &settings.query)?;
        let dialer = settings.tls.dialer_for(&url)?;

        let stop = Shutdown::new();
        link_shutdown(shutdown, stop.clone());

        let ctx = Arc::new(ClientContext {
            url,
            dialer,
            settings,
            current: ArcSwapOption::empty(),
            stop,
        });

        let (session, stream) = match ctx.connect().await {
            Ok(established) => established,
            Err(e) => {
                tracing::warn!(url = %ctx.url, error = %e, "Initial connect failed, retrying");
                ctx.reconnect().await?
            }
        };
        ctx.install(session);

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(run(Arc::clone(&ctx), stream, events_tx));
        Ok((
            Self {
                ctx,
                task: Mutex::new(Some(task)),
            },
            events_rx,
        ))
    }

    /// The live session, if connected.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.ctx.current.load_full()
    }

    /// Stop reading and reconnecting, then close the session with going-away.
    pub async fn stop(&self) {
        self.ctx.stop.trigger();
        if let Some(session) = self.ctx.current.swap(None) {
            let _ = session.close(CLOSE_GOING_AWAY, "client stopping").await;
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        tracing::info!(url = %self.ctx.url, "Client stopped");
    }
}

/// Forward the manager's shutdown into the client's own stop signal.
fn link_shutdown(mut manager: ShutdownSignal, client: Shutdown) {
    let mut own = client.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            _ = manager.recv() => {
                // recv also resolves when the coordinator is dropped untriggered.
                if manager.is_triggered() {
                    client.trigger();
                }
            }
            _ = own.recv() => {}
        }
    });
}

async fn run(ctx: Arc<ClientContext>, mut stream: FrameStream, events: mpsc::Sender<ClientEvent>) {
    loop {
        let Some(session) = ctx.current.load_full() else {
            return;
        };

        match read_until_lost(&ctx, &session, &mut stream, &events).await {
            ReadOutcome::Stopped => {
                if let Some(session) = ctx.current.swap(None) {
                    let _ = session.close(CLOSE_GOING_AWAY, "client stopping").await;
                }
                return;
            }
            ReadOutcome::NormalClose => {
                tracing::info!(session_id = %session.id(), "Server closed the session normally");
                ctx.current.store(None);
                let _ = session.close(CLOSE_NORMAL, "").await;
                return;
            }
            ReadOutcome::Lost(reason) => {
                tracing::warn!(session_id = %session.id(), reason = %reason, "Session lost, reconnecting");
                ctx.current.store(None);
                let _ = session.close(CLOSE_GOING_AWAY, "reconnecting").await;

                match ctx.reconnect().await {
                    Ok((fresh, fresh_stream)) => {
                        ctx.install(fresh);
                        stream = fresh_stream;
                    }
                    Err(ReconnectError::Cancelled) => return,
                    Err(e) => {
                        tracing::error!(url = %ctx.url, error = %e, "Giving up on subscription");
                        let _ = events.send(ClientEvent::Failed(e)).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn read_until_lost(
    ctx: &ClientContext,
    session: &Arc<Session>,
    stream: &mut FrameStream,
    events: &mpsc::Sender<ClientEvent>,
) -> ReadOutcome {
    let mut stop = ctx.stop.subscribe();
    loop {
        tokio::select! {
            _ = stop.recv() => return ReadOutcome::Stopped,
            _ = session.stopped() => {
                // Raised by the keepalive supervisor after a fatal probe.
                if ctx.stop.is_triggered() {
                    return ReadOutcome::Stopped;
                }
                return ReadOutcome::Lost("keepalive failed".into());
            }
            next = stream.next() => match next {
                Some(Ok(Frame::Close(reason))) => {
                    return match reason {
                        Some(r) if r.code == CLOSE_NORMAL => ReadOutcome::NormalClose,
                        other => ReadOutcome::Lost(format!("closed by peer: {other:?}")),
                    };
                }
                Some(Ok(frame)) => {
                    if !frame.is_data() {
                        continue;
                    }
                    match ctx.settings.format.classify_frame(&frame) {
                        Some(payload) => {
                            let message = ReceivedMessage { session_id: session.id(), payload };
                            if events.send(ClientEvent::Message(message)).await.is_err() {
                                tracing::debug!("Event receiver dropped, stopping read loop");
                                return ReadOutcome::Stopped;
                            }
                        }
                        None => {
                            tracing::warn!(session_id = %session.id(), "Dropping frame that is not valid JSON");
                        }
                    }
                }
                Some(Err(e)) => return ReadOutcome::Lost(e.to_string()),
                None => return ReadOutcome::Lost("stream ended".into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn settings_follow_subscription_and_keepalive_config() {
        let config = parse_config(
            r#"
            [keepalive]
            interval_secs = 2
            probe_timeout_ms = 500

            [client]
            url = "ws://feed.local/stream"
            auto_reconnect_attempts = 3
            auto_reconnect_max_delay_secs = 4
            format = "json"

            [client.headers]
            Authorization = "Bearer t"

            [client.query]
            topic = "a,b"
            "#,
        )
        .unwrap();
        let subscription = config.client.as_ref().unwrap();
        let settings = ClientSettings::from_config(subscription, &config);

        assert_eq!(settings.url, "ws://feed.local/stream");
        assert_eq!(settings.auto_reconnect_attempts, 3);
        assert_eq!(settings.auto_reconnect_max_delay, Duration::from_secs(4));
        assert_eq!(settings.format, MessageFormat::Json);
        assert_eq!(settings.keepalive.interval, Duration::from_secs(2));
        assert_eq!(settings.headers.get("authorization"), Some(&["Bearer t".to_string()][..]));

        let url = resolve_target(&settings.url, &[], &settings.query).unwrap();
        assert_eq!(url.as_str(), "ws://feed.local/stream?topic=a&topic=b");
    }

    #[test]
    fn settings_default_to_reconnect_section() {
        let config = parse_config(
            r#"
            [reconnect]
            attempts = 3
            max_delay_secs = 10

            [client]
            url = "ws://feed.local/stream"
            "#,
        )
        .unwrap();
        let settings = ClientSettings::from_config(config.client.as_ref().unwrap(), &config);

        assert_eq!(settings.auto_reconnect_attempts, 3);
        assert_eq!(settings.auto_reconnect_max_delay, Duration::from_secs(10));
        assert_eq!(settings.retry_state(), RetryState::new(3, Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn disabled_reconnect_fails_start_when_unreachable() {
        let mut settings = ClientSettings::new("ws://127.0.0.1:1/feed");
        settings.auto_reconnect_attempts = 0;
        let shutdown = Shutdown::new();

        let err = ReconnectingClient::start(settings, shutdown.subscribe())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SessionError::Reconnect(ReconnectError::NoRetryConfigured)
        ));
    }
}
