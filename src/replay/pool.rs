//! Client connection pool
//!
//! Creates and caches replay sessions by `SessionKey`. Only the pool
//! creates or destroys target channels; every other component reaches a
//! channel through a cached session. Session creation fails fast once the
//! pool is shutting down, and `shutdown_now` drains every cached session so
//! no sequencer slot or limiter permit is left stalled.

use crate::error::{ReplayError, Result};
use crate::replay::session::{ConnectionReplaySession, SessionKey};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target address (`host:port`).
    pub target_addr: String,
    pub connect_timeout: Duration,
}

pub struct ClientConnectionPool {
    config: PoolConfig,
    sessions: DashMap<SessionKey, Arc<ConnectionReplaySession>>,
    shutting_down: AtomicBool,
    sessions_created: AtomicU64,
    sessions_cancelled: AtomicU64,
}

impl ClientConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            sessions_created: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
        }
    }

    /// Fetch the session for `key`, creating it on first scheduled work.
    pub fn session_for(&self, key: &SessionKey) -> Result<Arc<ConnectionReplaySession>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ReplayError::ShuttingDown);
        }
        let session = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| {
                self.sessions_created.fetch_add(1, Ordering::Relaxed);
                debug!(session = %key, "Created replay session");
                Arc::new(ConnectionReplaySession::new(
                    key.clone(),
                    self.config.target_addr.clone(),
                    self.config.connect_timeout,
                ))
            })
            .clone();
        Ok(session)
    }

    /// Tear down the channel and evict the cache entry.
    pub async fn close_connection(&self, key: &SessionKey) {
        if let Some((_, session)) = self.sessions.remove(key) {
            session.close_channel().await;
            debug!(session = %key, "Evicted replay session");
        }
    }

    /// Additionally mark the session cancelled: new work is refused and
    /// every pending sequencer slot completes exceptionally right away,
    /// rather than leaving slots (and the tracking entries they hold)
    /// stalled forever.
    pub async fn cancel_connection(&self, key: &SessionKey) {
        if let Some((_, session)) = self.sessions.remove(key) {
            self.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
            session.cancel();
            session.close_channel().await;
            debug!(session = %key, "Cancelled replay session");
        }
    }

    /// Tear down the whole pool. Subsequent `session_for` calls fail fast.
    pub async fn shutdown_now(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let keys: Vec<SessionKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!(sessions = keys.len(), "Shutting down connection pool");
        for key in keys {
            if let Some((_, session)) = self.sessions.remove(&key) {
                session.cancel();
                session.close_channel().await;
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    pub fn sessions_cancelled(&self) -> u64 {
        self.sessions_cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ConnectionKey;

    fn pool() -> ClientConnectionPool {
        ClientConnectionPool::new(PoolConfig {
            target_addr: "127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(100),
        })
    }

    fn key(conn: &str) -> SessionKey {
        SessionKey::initial(ConnectionKey::new("n", conn))
    }

    #[tokio::test]
    async fn test_sessions_are_cached_by_key() {
        let pool = pool();
        let a1 = pool.session_for(&key("a")).unwrap();
        let a2 = pool.session_for(&key("a")).unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(pool.sessions_created(), 1);

        let _b = pool.session_for(&key("b")).unwrap();
        assert_eq!(pool.sessions_created(), 2);
        assert_eq!(pool.live_sessions(), 2);
    }

    #[tokio::test]
    async fn test_incarnations_get_distinct_sessions() {
        let pool = pool();
        let first = pool.session_for(&key("a")).unwrap();
        let second = pool.session_for(&key("a").next_incarnation()).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_close_evicts_entry() {
        let pool = pool();
        let _ = pool.session_for(&key("a")).unwrap();
        pool.close_connection(&key("a")).await;
        assert_eq!(pool.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_cancel_drains_parked_work_without_a_channel() {
        let pool = pool();
        let session = pool.session_for(&key("a")).unwrap();

        // Park work behind an index that never arrives; no target channel
        // was ever opened.
        let mut handles = Vec::new();
        for index in 1..=3u64 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                session.sequencer().run_in_order(index, async { Ok(()) }).await
            }));
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while session.sequencer().parked_len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        pool.cancel_connection(&key("a")).await;
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(ReplayError::SessionCancelled)
            ));
        }
        assert_eq!(session.sequencer().parked_len(), 0);
        assert_eq!(pool.sessions_cancelled(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_creation_fast() {
        let pool = pool();
        pool.shutdown_now().await;
        assert!(matches!(
            pool.session_for(&key("a")),
            Err(ReplayError::ShuttingDown)
        ));
    }
}
