//! Session registry and lifecycle management.
//!
//! # Design Decisions
//!
//! - **One `RwLock` over the registry**: `get`, `session_info` and `active_count`
//!   share the lock; `add`, `remove`, the sweep and `close_all` take it exclusively
//! - **Detach under lock, close outside**: an entry leaves the map while the
//!   write lock is held and its handle is closed after the lock is released,
//!   so every handle is closed exactly once and readers never see a closed one
//! - **`Weak` sweep task**: the periodic sweeper does not keep the pool alive
//! - **`std::sync::Mutex` for the sweep handle**: set synchronously in `start`
//! - **Shutdown is final**: once `shutdown` has begun, `add` rejects new
//!   sessions, checked under the write lock so none slip past `close_all`
//!
//! Handles are returned as cheap clones of the sqlx pool. A sweep racing an
//! in-flight statement closes the pool underneath it; the statement then
//! fails with an execution error instead of queries being serialised behind
//! the registry lock.

use crate::config::{Config, PoolLimits};
use crate::db::pool::DbPool;
use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, SessionInfo};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Session pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Driver-level limits applied to every session handle
    pub limits: PoolLimits,
    pub sweep_interval: Duration,
    /// Upper bound for closing one handle
    pub close_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limits: PoolLimits::default(),
            sweep_interval: Duration::from_secs(crate::config::DEFAULT_SWEEP_INTERVAL_SECS),
            close_timeout: Duration::from_secs(crate::config::DEFAULT_CLOSE_TIMEOUT_SECS),
        }
    }
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            limits: config.pool_limits(),
            sweep_interval: config.sweep_interval_duration(),
            close_timeout: config.close_timeout_duration(),
        }
    }
}

/// A registered session.
struct SessionEntry {
    pool: DbPool,
    owner_id: String,
    kind: BackendKind,
    created_at: DateTime<Utc>,
    last_used: Mutex<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl SessionEntry {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn touch(&self, now: DateTime<Utc>) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    fn info(&self, session_id: &str) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_string(),
            owner_id: self.owner_id.clone(),
            kind: self.kind,
            created_at: self.created_at,
            last_used: *self.last_used.lock().unwrap_or_else(PoisonError::into_inner),
            expires_at: self.expires_at,
        }
    }
}

/// Thread-safe registry of live sessions.
pub struct SessionPool {
    config: PoolConfig,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl SessionPool {
    /// Create the registry and spawn the expiry sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            sweep_handle: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let weak_pool = Arc::downgrade(&pool);
        let sweep_interval = pool.config.sweep_interval;
        let handle = tokio::spawn(async move {
            Self::sweep_task(weak_pool, sweep_interval).await;
        });

        *pool
            .sweep_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            sweep_interval_secs = sweep_interval.as_secs(),
            max_open = pool.config.limits.max_open,
            "Session pool started"
        );
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Driver-level limits every session handle is opened with.
    pub fn limits(&self) -> &PoolLimits {
        &self.config.limits
    }

    /// Register a session.
    ///
    /// An expiry earlier than now is clamped to now. A duplicate id, a
    /// handle of the wrong kind, or a pool that has been shut down is
    /// rejected and the handle is closed.
    pub async fn add(
        &self,
        session_id: impl Into<String>,
        owner_id: impl Into<String>,
        kind: BackendKind,
        handle: DbPool,
        expires_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let session_id = session_id.into();

        if handle.kind() != kind {
            let err = DbError::internal(format!(
                "Session {} declared as {} but the handle is {}",
                session_id,
                kind,
                handle.kind()
            ));
            self.close_handle(&session_id, &handle).await;
            return Err(err);
        }

        let now = Utc::now();
        let entry = SessionEntry {
            pool: handle,
            owner_id: owner_id.into(),
            kind,
            created_at: now,
            last_used: Mutex::new(now),
            expires_at: expires_at.max(now),
        };

        let rejected = {
            let mut sessions = self.sessions.write().await;
            if self.is_shut_down() {
                Some((entry, DbError::internal("Session pool is shut down")))
            } else if sessions.contains_key(&session_id) {
                let err =
                    DbError::internal(format!("Session {} is already registered", session_id));
                Some((entry, err))
            } else {
                debug!(
                    session_id = %session_id,
                    owner_id = %entry.owner_id,
                    db_type = %kind,
                    expires_at = %entry.expires_at,
                    "Session registered"
                );
                sessions.insert(session_id.clone(), entry);
                None
            }
        };

        match rejected {
            Some((entry, err)) => {
                self.close_handle(&session_id, &entry.pool).await;
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Look up a live session's handle and refresh its last-used time.
    pub async fn get(&self, session_id: &str) -> DbResult<DbPool> {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touch(now);
                Ok(entry.pool.clone())
            }
            _ => Err(DbError::session_not_found(session_id)),
        }
    }

    /// Session metadata, without refreshing last-used.
    pub async fn session_info(&self, session_id: &str) -> DbResult<SessionInfo> {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(entry) if !entry.is_expired_at(now) => Ok(entry.info(session_id)),
            _ => Err(DbError::session_not_found(session_id)),
        }
    }

    /// Unregister a session and close its handle.
    ///
    /// The entry is gone even when closing fails; the close error is still
    /// returned.
    pub async fn remove(&self, session_id: &str) -> DbResult<()> {
        let entry = self.sessions.write().await.remove(session_id);
        let Some(entry) = entry else {
            return Err(DbError::session_not_found(session_id));
        };

        debug!(session_id = %session_id, db_type = %entry.kind, "Session removed");
        entry
            .pool
            .close_within(session_id, self.config.close_timeout)
            .await
    }

    /// Number of registered sessions.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Live sessions owned by `owner_id`, oldest first.
    pub async fn sessions_for_owner(&self, owner_id: &str) -> Vec<SessionInfo> {
        let now = Utc::now();
        let mut infos: Vec<SessionInfo> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, entry)| entry.owner_id == owner_id && !entry.is_expired_at(now))
                .map(|(id, entry)| entry.info(id))
                .collect()
        };
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Remove and close every expired session. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<(String, SessionEntry)> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| entry.is_expired_at(now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (session_id, entry) in &expired {
            info!(
                session_id = %session_id,
                owner_id = %entry.owner_id,
                db_type = %entry.kind,
                "Session expired"
            );
            self.close_handle(session_id, &entry.pool).await;
        }
        expired.len()
    }

    /// Close every session and clear the registry.
    pub async fn close_all(&self) {
        let drained: Vec<(String, SessionEntry)> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().collect()
        };

        if !drained.is_empty() {
            info!(count = drained.len(), "Closing all sessions");
        }
        for (session_id, entry) in &drained {
            self.close_handle(session_id, &entry.pool).await;
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the sweeper and close every session. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);

        let handle = self
            .sweep_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Session sweeper terminated abnormally");
                }
            }
            info!("Session sweeper stopped");
        }

        self.close_all().await;
    }

    /// Close a detached handle, logging rather than propagating failures.
    async fn close_handle(&self, session_id: &str, handle: &DbPool) {
        if let Err(e) = handle
            .close_within(session_id, self.config.close_timeout)
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to close session handle");
        }
    }

    /// Periodically sweep expired sessions.
    ///
    /// Holds only a `Weak` reference and exits once the pool is dropped.
    async fn sweep_task(weak_pool: Weak<Self>, sweep_interval: Duration) {
        let mut interval = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let Some(pool) = weak_pool.upgrade() else {
                debug!("Session pool dropped, sweeper exiting");
                return;
            };

            let removed = pool.sweep_expired().await;
            if removed > 0 {
                info!(removed = removed, "Expired sessions swept");
            }
            drop(pool);
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweep_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_handle() -> DbPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        DbPool::SQLite(pool)
    }

    fn in_one_hour() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::hours(1)
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let pool = SessionPool::start(PoolConfig::default());
        let handle = memory_handle().await;
        pool.add("s1", "alice", BackendKind::Sqlite, handle.clone(), in_one_hour())
            .await
            .unwrap();

        assert_eq!(pool.active_count().await, 1);
        assert!(pool.get("s1").await.is_ok());

        pool.remove("s1").await.unwrap();
        assert!(handle.is_closed());
        assert_eq!(pool.active_count().await, 0);
        assert!(matches!(
            pool.remove("s1").await,
            Err(DbError::SessionNotFound { .. })
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_refreshes_last_used_but_info_does_not() {
        let pool = SessionPool::start(PoolConfig::default());
        pool.add("s1", "alice", BackendKind::Sqlite, memory_handle().await, in_one_hour())
            .await
            .unwrap();

        let before = pool.session_info("s1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let peeked = pool.session_info("s1").await.unwrap();
        assert_eq!(before.last_used, peeked.last_used);

        pool.get("s1").await.unwrap();
        let after = pool.session_info("s1").await.unwrap();
        assert!(after.last_used > before.last_used);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_session_is_not_found_then_swept() {
        let pool = SessionPool::start(PoolConfig::default());
        let handle = memory_handle().await;
        pool.add(
            "old",
            "alice",
            BackendKind::Sqlite,
            handle.clone(),
            Utc::now() - ChronoDuration::seconds(1),
        )
        .await
        .unwrap();

        assert!(matches!(
            pool.get("old").await,
            Err(DbError::SessionNotFound { .. })
        ));
        assert_eq!(pool.sweep_expired().await, 1);
        assert_eq!(pool.active_count().await, 0);
        assert!(handle.is_closed());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let pool = SessionPool::start(PoolConfig::default());
        pool.add("s1", "alice", BackendKind::Sqlite, memory_handle().await, in_one_hour())
            .await
            .unwrap();

        let second = memory_handle().await;
        let err = pool
            .add("s1", "bob", BackendKind::Sqlite, second.clone(), in_one_hour())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Internal { .. }));
        assert!(second.is_closed());
        assert_eq!(pool.session_info("s1").await.unwrap().owner_id, "alice");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_rejected() {
        let pool = SessionPool::start(PoolConfig::default());
        let err = pool
            .add("s1", "alice", BackendKind::Mysql, memory_handle().await, in_one_hour())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Internal { .. }));
        assert_eq!(pool.active_count().await, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sessions_for_owner() {
        let pool = SessionPool::start(PoolConfig::default());
        for (id, owner) in [("a", "alice"), ("b", "bob"), ("c", "alice")] {
            pool.add(id, owner, BackendKind::Sqlite, memory_handle().await, in_one_hour())
                .await
                .unwrap();
        }

        let ids: Vec<_> = pool
            .sessions_for_owner("alice")
            .await
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"c".to_string()));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pool = SessionPool::start(PoolConfig::default());
        let handle = memory_handle().await;
        pool.add("s1", "alice", BackendKind::Sqlite, handle.clone(), in_one_hour())
            .await
            .unwrap();

        pool.shutdown().await;
        pool.shutdown().await;
        assert_eq!(pool.active_count().await, 0);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_rejected() {
        let pool = SessionPool::start(PoolConfig::default());
        pool.shutdown().await;
        assert!(pool.is_shut_down());

        let late = memory_handle().await;
        let err = pool
            .add("late", "alice", BackendKind::Sqlite, late.clone(), in_one_hour())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Internal { .. }));
        assert!(late.is_closed());
        assert_eq!(pool.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired() {
        let pool = SessionPool::start(PoolConfig {
            sweep_interval: Duration::from_millis(50),
            ..PoolConfig::default()
        });
        pool.add(
            "old",
            "alice",
            BackendKind::Sqlite,
            memory_handle().await,
            Utc::now() - ChronoDuration::seconds(1),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.active_count().await, 0);
        pool.shutdown().await;
    }
}
