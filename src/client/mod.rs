//! Client-side session handling.
//!
//! # Data Flow
//! ```text
//! OutboundClient::send(request)
//!     → target resolution → fingerprint
//!     → ConnectionCache::get_or_create (dial on miss, keepalive attached)
//!     → write payload; on failure evict + close
//!
//! ReconnectingClient::start(settings)
//!     → dial (reconnect engine on failure)
//!     → read loop → ClientEvent::Message
//!     → abnormal loss → reconnect engine → fresh session + keepalive
//! ```

pub mod outbound;
pub mod reconnecting;

pub use outbound::{OutboundClient, OutboundRequest};
pub use reconnecting::{ClientEvent, ClientSettings, ReconnectingClient};

use crate::net::dial::{build_dialer, Dialer};
use crate::net::tls::load_trust;
use crate::session::SessionError;
use url::Url;

/// TLS options for an outbound target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Skip peer verification.
    pub allow_insecure: bool,
    /// Trust-store specification; empty means system defaults.
    pub ca_cert: String,
}

impl TlsOptions {
    /// Load trust (unless insecure) and pick the dialer for `url`.
    pub(crate) fn dialer_for(&self, url: &Url) -> Result<Dialer, SessionError> {
        let trust = if self.allow_insecure || url.scheme() != "wss" {
            None
        } else {
            Some(load_trust(&self.ca_cert)?)
        };
        Ok(build_dialer(url, self.allow_insecure, trust.as_ref())?)
    }
}
