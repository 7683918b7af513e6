//! Connection cache for outbound sessions.
//!
//! # Responsibilities
//! - Map a [`SessionFingerprint`] to at most one live [`Session`]
//! - Serialize creation per fingerprint so concurrent callers share one dial
//! - Attach a keepalive supervisor to every session before it is stored
//! - Evict on keepalive failure, remote close, or write failure
//!
//! # Design Decisions
//! - DashMap for lock-free reads on the hot path
//! - Per-key async mutex for creation; readers that find a live entry never
//!   touch it
//! - Eviction callbacks hold a `Weak` so a dropped cache does not linger
//! - Keepalive eviction only removes the entry if it still holds the same
//!   session, so a replacement dialed in the meantime is never dropped

use std::future::Future;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::keepalive::{KeepaliveSettings, KeepaliveSupervisor};
use super::{Session, SessionId, CLOSE_GOING_AWAY};
use crate::lifecycle::Shutdown;
use crate::net::target::SessionFingerprint;
use crate::observability::metrics;

struct CacheInner {
    entries: DashMap<SessionFingerprint, Arc<Session>>,
    creation_locks: DashMap<SessionFingerprint, Arc<Mutex<()>>>,
    keepalive: KeepaliveSettings,
    shutdown: Shutdown,
}

/// Shared handle to the cache; clones see the same entries.
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

impl ConnectionCache {
    pub fn new(keepalive: KeepaliveSettings, shutdown: Shutdown) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                creation_locks: DashMap::new(),
                keepalive,
                shutdown,
            }),
        }
    }

    /// The live session for `fingerprint`, if any. Dead entries are evicted.
    pub fn get(&self, fingerprint: &SessionFingerprint) -> Option<Arc<Session>> {
        let session = self
            .inner
            .entries
            .get(fingerprint)
            .map(|entry| Arc::clone(entry.value()))?;
        if session.is_live() {
            Some(session)
        } else {
            self.evict_session(fingerprint, session.id());
            None
        }
    }

    /// Return the live session for `fingerprint`, creating it if needed.
    ///
    /// `create` runs at most once per miss, with the per-key lock held. The
    /// lock is dropped from the map once no caller is waiting on it.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        fingerprint: &SessionFingerprint,
        create: F,
    ) -> Result<Arc<Session>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Session>, E>>,
    {
        if let Some(session) = self.get(fingerprint) {
            return Ok(session);
        }

        let lock = self
            .inner
            .creation_locks
            .entry(fingerprint.clone())
            .or_default()
            .value()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(fingerprint, create).await
        };
        drop(lock);
        self.inner
            .creation_locks
            .remove_if(fingerprint, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn create_locked<F, Fut, E>(
        &self,
        fingerprint: &SessionFingerprint,
        create: F,
    ) -> Result<Arc<Session>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Session>, E>>,
    {
        // Another caller may have finished creating while we waited.
        if let Some(session) = self.get(fingerprint) {
            return Ok(session);
        }

        let session = create().await?;
        self.attach_keepalive(fingerprint, &session);
        self.inner
            .entries
            .insert(fingerprint.clone(), Arc::clone(&session));

        tracing::debug!(
            session_id = %session.id(),
            fingerprint = %fingerprint,
            "Session cached"
        );
        Ok(session)
    }

    fn attach_keepalive(&self, fingerprint: &SessionFingerprint, session: &Arc<Session>) {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let key = fingerprint.clone();
        let id = session.id();
        KeepaliveSupervisor::spawn(
            Arc::clone(session),
            self.inner.keepalive,
            self.inner.shutdown.subscribe(),
            move || {
                if let Some(inner) = weak.upgrade() {
                    ConnectionCache { inner }.evict_session(&key, id);
                }
            },
        );
    }

    /// Remove the entry for `fingerprint`. Idempotent; does not close it.
    pub fn evict(&self, fingerprint: &SessionFingerprint) -> Option<Arc<Session>> {
        let removed = self.inner.entries.remove(fingerprint).map(|(_, s)| s);
        if let Some(session) = &removed {
            metrics::record_eviction("explicit");
            tracing::info!(session_id = %session.id(), fingerprint = %fingerprint, "Session evicted");
        }
        removed
    }

    /// Remove the entry only if it still holds session `id`.
    pub fn evict_session(&self, fingerprint: &SessionFingerprint, id: SessionId) -> bool {
        let removed = self
            .inner
            .entries
            .remove_if(fingerprint, |_, session| session.id() == id)
            .is_some();
        if removed {
            metrics::record_eviction("failure");
            tracing::info!(session_id = %id, fingerprint = %fingerprint, "Session evicted");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Empty the cache, closing every session with a going-away frame.
    pub async fn drain(&self) -> usize {
        let keys: Vec<SessionFingerprint> =
            self.inner.entries.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for key in keys {
            if let Some((_, session)) = self.inner.entries.remove(&key) {
                let _ = session.close(CLOSE_GOING_AWAY, "shutting down").await;
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::target::HeaderSet;
    use crate::session::testing::{session_with, MockSink};
    use crate::session::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    fn fingerprint(handler: &str) -> SessionFingerprint {
        let url = Url::parse("ws://backend.local/feed").unwrap();
        SessionFingerprint::new(handler, &url, &HeaderSet::new())
    }

    fn cache() -> ConnectionCache {
        ConnectionCache::new(KeepaliveSettings::default(), Shutdown::new())
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_dial() {
        let cache = cache();
        let dials = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint("h");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let dials = dials.clone();
            let fp = fp.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_create(&fp, move || async move {
                        dials.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, TransportError>(session_with(MockSink::healthy().0))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap());
        }
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(cache.len(), 1);
        assert!(cache.inner.creation_locks.is_empty());
    }

    #[tokio::test]
    async fn evicted_fingerprint_is_redialed() {
        let cache = cache();
        let fp = fingerprint("h");
        let counter = AtomicUsize::new(0);
        let dials = &counter;
        let create = move || async move {
            dials.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TransportError>(session_with(MockSink::healthy().0))
        };

        let first = cache.get_or_create(&fp, create).await.unwrap();
        assert!(cache.evict(&fp).is_some());
        assert!(cache.evict(&fp).is_none());

        let second = cache.get_or_create(&fp, create).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dead_entries_are_never_returned() {
        let cache = cache();
        let fp = fingerprint("h");
        let first = cache
            .get_or_create(&fp, || async {
                Ok::<_, TransportError>(session_with(MockSink::healthy().0))
            })
            .await
            .unwrap();
        first.mark_dead();

        assert!(cache.get(&fp).is_none());
        let second = cache
            .get_or_create(&fp, || async {
                Ok::<_, TransportError>(session_with(MockSink::healthy().0))
            })
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn failed_creation_leaves_no_entry() {
        let cache = cache();
        let fp = fingerprint("h");
        let result = cache
            .get_or_create(&fp, || async { Err::<Arc<Session>, _>(TransportError::Fatal("refused".into())) })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert!(cache.inner.creation_locks.is_empty());
    }

    #[tokio::test]
    async fn creation_locks_do_not_outlive_their_dials() {
        let cache = cache();
        for handler in ["a", "b", "c"] {
            cache
                .get_or_create(&fingerprint(handler), || async {
                    Ok::<_, TransportError>(session_with(MockSink::healthy().0))
                })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.inner.creation_locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_probe_evicts_within_one_interval() {
        let cache = cache();
        let fp = fingerprint("h");
        let (sink, probe) = MockSink::failing_pings(TransportError::Fatal("broken pipe".into()));
        let session = session_with(sink);
        let stored = session.clone();
        cache
            .get_or_create(&fp, || async move { Ok::<_, TransportError>(stored) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(cache.get(&fp).is_none());
        assert_eq!(probe.pings.load(Ordering::SeqCst), 1);
        assert!(!session.is_live());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(probe.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_eviction_spares_the_replacement() {
        let cache = cache();
        let fp = fingerprint("h");
        let old = cache
            .get_or_create(&fp, || async {
                Ok::<_, TransportError>(session_with(MockSink::healthy().0))
            })
            .await
            .unwrap();
        cache.evict(&fp);
        let replacement = cache
            .get_or_create(&fp, || async {
                Ok::<_, TransportError>(session_with(MockSink::healthy().0))
            })
            .await
            .unwrap();

        assert!(!cache.evict_session(&fp, old.id()));
        assert!(Arc::ptr_eq(&cache.get(&fp).unwrap(), &replacement));
    }

    #[tokio::test]
    async fn drain_closes_everything() {
        let cache = cache();
        let (sink, probe) = MockSink::healthy();
        let session = session_with(sink);
        cache
            .get_or_create(&fingerprint("a"), || async move { Ok::<_, TransportError>(session) })
            .await
            .unwrap();

        assert_eq!(cache.drain().await, 1);
        assert!(cache.is_empty());
        assert!(probe.closed.load(Ordering::SeqCst));
    }
}
