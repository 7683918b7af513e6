//! Session abstraction shared by outbound and inbound connections.
//!
//! # Responsibilities
//! - Wrap the write half of a WebSocket transport behind [`FrameSink`]
//! - Serialize probes, payload writes and close frames per session
//! - Track liveness (Live → Probing → Live, anything → Dead)
//! - Own a per-session stop signal for the keepalive loop
//!
//! # Data Flow
//! ```text
//! dial / accept → transport::split_* → (Box<dyn FrameSink>, FrameStream)
//!                                          │                 │
//!                                   Session::new         read loop
//!                                          │
//!                    cache / registry / reconnecting client own Arc<Session>
//! ```
//!
//! # Design Decisions
//! - The write half sits behind a `tokio::sync::Mutex` so a ping can never
//!   interleave with a payload write on the wire
//! - The read half is handed back separately; exactly one task consumes it
//! - `close` is idempotent and bounded by a timeout

pub mod cache;
pub mod keepalive;
pub mod payload;
pub mod registry;
pub mod transport;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::{watch, Mutex};

use crate::net::dial::DialError;
use crate::net::target::TargetError;
use crate::net::tls::CertificateError;
use crate::resilience::ReconnectError;

pub use cache::ConnectionCache;
pub use keepalive::{KeepaliveSettings, KeepaliveSupervisor};
pub use payload::{MessageFormat, Payload, ReceivedMessage};
pub use registry::{ListenerId, Registration, SessionRegistry};

/// Payload carried by every keepalive probe.
pub const HEARTBEAT_PAYLOAD: &[u8] = b"---HeartBeat---";

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (shutdown, drain).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Policy violation (admission rejection).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Upper bound on sending the close frame and shutting the transport.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Global atomic counter for session IDs.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Generate a new unique session ID.
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

/// Which side originated the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Dialed by this process.
    Outbound,
    /// Accepted by this process, or a subscription that must be kept up.
    Inbound,
}

/// Liveness state, stored as an atomic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Liveness {
    Live = 0,
    Probing = 1,
    Dead = 2,
}

impl From<u8> for Liveness {
    fn from(v: u8) -> Self {
        match v {
            0 => Liveness::Live,
            1 => Liveness::Probing,
            _ => Liveness::Dead,
        }
    }
}

/// Close code and human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Transport-neutral WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

impl Frame {
    /// Whether this is a data frame (text or binary).
    pub fn is_data(&self) -> bool {
        matches!(self, Frame::Text(_) | Frame::Binary(_))
    }
}

/// Classified transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is already closing or closed. Benign for probes.
    #[error("connection already closing")]
    Closing,
    /// Temporary condition (timeout, interrupted I/O). Worth retrying.
    #[error("transient transport error: {0}")]
    Transient(String),
    /// Anything else. The session is unusable.
    #[error("transport error: {0}")]
    Fatal(String),
}

/// Errors surfaced to callers that send through a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no payload to send")]
    MissingPayload,

    #[error("write on session {session} failed: {source}")]
    WriteFailed {
        session: SessionId,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame and flush it.
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Flush and shut the write half down.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a transport.
pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

/// An open duplex message channel to a peer.
pub struct Session {
    id: SessionId,
    origin: Origin,
    remote: String,
    state: AtomicU8,
    closed: AtomicBool,
    keepalive_claimed: AtomicBool,
    sink: Mutex<Box<dyn FrameSink>>,
    stop: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("remote", &self.remote)
            .field("liveness", &self.liveness())
            .finish()
    }
}

impl Session {
    /// Wrap a write half into a new live session.
    pub fn new(origin: Origin, remote: impl Into<String>, sink: Box<dyn FrameSink>) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            id: SessionId::new(),
            origin,
            remote: remote.into(),
            state: AtomicU8::new(Liveness::Live as u8),
            closed: AtomicBool::new(false),
            keepalive_claimed: AtomicBool::new(false),
            sink: Mutex::new(sink),
            stop,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::from(self.state.load(Ordering::Acquire))
    }

    /// Live or currently being probed.
    pub fn is_live(&self) -> bool {
        self.liveness() != Liveness::Dead
    }

    /// Mark the session dead. Returns `true` if this call made the transition.
    pub fn mark_dead(&self) -> bool {
        let previous = self.state.swap(Liveness::Dead as u8, Ordering::AcqRel);
        Liveness::from(previous) != Liveness::Dead
    }

    /// Receiver for this session's own stop signal.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Raise the stop signal without closing the transport.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolve once the stop signal is raised.
    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Claim the single keepalive slot. Only the first caller gets `true`.
    pub(crate) fn claim_keepalive(&self) -> bool {
        !self.keepalive_claimed.swap(true, Ordering::AcqRel)
    }

    /// Send a frame through the session's write lock.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::Closing);
        }
        let mut sink = self.sink.lock().await;
        sink.send_frame(frame).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::Text(text.into())).await
    }

    /// Send one liveness probe, bounded by `timeout`.
    ///
    /// A probe that cannot be written in time counts as transient.
    pub async fn probe(&self, timeout: Duration) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::Closing);
        }
        let _ = self.state.compare_exchange(
            Liveness::Live as u8,
            Liveness::Probing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send_frame(Frame::Ping(HEARTBEAT_PAYLOAD.to_vec())).await
        };
        let result = match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Transient(format!(
                "probe not written within {}ms",
                timeout.as_millis()
            ))),
        };

        let _ = self.state.compare_exchange(
            Liveness::Probing as u8,
            Liveness::Live as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        result
    }

    /// Stop background work, send a close frame and shut the transport.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop();
        self.mark_dead();

        let frame = Frame::Close(Some(CloseReason::new(code, reason)));
        let shutdown = async {
            let mut sink = self.sink.lock().await;
            let sent = sink.send_frame(frame).await;
            let closed = sink.close().await;
            sent.and(closed)
        };

        let result = match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Err(TransportError::Closing)) => Ok(()),
            Ok(result) => result,
            Err(_) => Err(TransportError::Transient("close not completed in time".into())),
        };
        tracing::debug!(session_id = %self.id, remote = %self.remote, code, "Session closed");
        result
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-memory sink for unit tests.

    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default)]
    pub struct SinkProbe {
        pub pings: Arc<AtomicUsize>,
        pub frames: Arc<std::sync::Mutex<Vec<Frame>>>,
        pub closed: Arc<AtomicBool>,
    }

    pub struct MockSink {
        probe: SinkProbe,
        fail_pings_with: Option<TransportError>,
        fail_data_with: Option<TransportError>,
    }

    impl MockSink {
        pub fn healthy() -> (Self, SinkProbe) {
            let probe = SinkProbe::default();
            (
                Self {
                    probe: probe.clone(),
                    fail_pings_with: None,
                    fail_data_with: None,
                },
                probe,
            )
        }

        pub fn failing_pings(err: TransportError) -> (Self, SinkProbe) {
            let (mut sink, probe) = Self::healthy();
            sink.fail_pings_with = Some(err);
            (sink, probe)
        }

        pub fn failing_writes(err: TransportError) -> (Self, SinkProbe) {
            let (mut sink, probe) = Self::healthy();
            sink.fail_data_with = Some(err);
            (sink, probe)
        }
    }

    #[async_trait]
    impl FrameSink for MockSink {
        async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
            match &frame {
                Frame::Ping(_) => {
                    self.probe.pings.fetch_add(1, Ordering::SeqCst);
                    if let Some(err) = &self.fail_pings_with {
                        return Err(err.clone());
                    }
                }
                Frame::Text(_) | Frame::Binary(_) => {
                    if let Some(err) = &self.fail_data_with {
                        return Err(err.clone());
                    }
                }
                _ => {}
            }
            self.probe.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.probe.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    pub fn session_with(sink: MockSink) -> Arc<Session> {
        Session::new(Origin::Outbound, "mock://peer", Box::new(sink))
    }
}
