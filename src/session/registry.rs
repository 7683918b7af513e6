//! Registry of inbound sessions, scoped per listener.
//!
//! Entries are added on accept and removed exactly once: either by the
//! [`Registration`] guard when the session's handler finishes, or by
//! [`SessionRegistry::drain`] when the listener shuts down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::{Session, SessionId, CLOSE_GOING_AWAY};
use crate::observability::metrics;

static LISTENER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn new() -> Self {
        Self(LISTENER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    session: Arc<Session>,
    tag: String,
}

type Listeners = DashMap<ListenerId, DashMap<SessionId, Entry>>;

/// Shared handle; clones see the same registry.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    listeners: Arc<Listeners>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an accepted session. Dropping the guard unregisters it.
    pub fn register(
        &self,
        listener: ListenerId,
        session: Arc<Session>,
        tag: impl Into<String>,
    ) -> Registration {
        let id = session.id();
        let tag = tag.into();
        tracing::debug!(listener = %listener, session_id = %id, tag = %tag, "Session registered");
        self.listeners
            .entry(listener)
            .or_default()
            .insert(id, Entry { session, tag });
        metrics::record_inbound_sessions(1.0);

        Registration {
            registry: self.clone(),
            listener,
            session: id,
            released: false,
        }
    }

    /// Remove a session. Returns `false` if it was not registered.
    pub fn unregister(&self, listener: ListenerId, session: SessionId) -> bool {
        let removed = self
            .listeners
            .get(&listener)
            .and_then(|sessions| sessions.remove(&session))
            .is_some();
        if removed {
            metrics::record_inbound_sessions(-1.0);
            tracing::debug!(listener = %listener, session_id = %session, "Session unregistered");
        }
        removed
    }

    pub fn count(&self, listener: ListenerId) -> usize {
        self.listeners.get(&listener).map_or(0, |sessions| sessions.len())
    }

    /// Registered sessions and their tags.
    pub fn sessions(&self, listener: ListenerId) -> Vec<(Arc<Session>, String)> {
        self.listeners.get(&listener).map_or_else(Vec::new, |sessions| {
            sessions
                .iter()
                .map(|e| (Arc::clone(&e.value().session), e.value().tag.clone()))
                .collect()
        })
    }

    /// Close every session of `listener` with going-away and forget them.
    pub async fn drain(&self, listener: ListenerId) -> usize {
        let Some((_, sessions)) = self.listeners.remove(&listener) else {
            return 0;
        };
        let entries: Vec<Entry> = sessions.into_iter().map(|(_, entry)| entry).collect();
        let drained = entries.len();
        metrics::record_inbound_sessions(-(drained as f64));

        for entry in entries {
            if let Err(e) = entry.session.close(CLOSE_GOING_AWAY, "server shutting down").await {
                tracing::debug!(session_id = %entry.session.id(), tag = %entry.tag, error = %e, "Close during drain failed");
            }
        }
        tracing::info!(listener = %listener, drained, "Listener drained");
        drained
    }

    /// Drain every listener.
    pub async fn drain_all(&self) -> usize {
        let listeners: Vec<ListenerId> = self.listeners.iter().map(|e| *e.key()).collect();
        let mut drained = 0;
        for listener in listeners {
            drained += self.drain(listener).await;
        }
        drained
    }
}

/// Guard that unregisters its session exactly once.
#[derive(Debug)]
pub struct Registration {
    registry: SessionRegistry,
    listener: ListenerId,
    session: SessionId,
    released: bool,
}

impl Registration {
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Unregister now instead of on drop.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.registry.unregister(self.listener, self.session)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released {
            self.registry.unregister(self.listener, self.session);
        }
    }
}
