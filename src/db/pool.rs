//! Native session handles.
//!
//! A session owns exactly one [`DbPool`]: a database-specific sqlx pool
//! (`MySqlPool`, `PgPool`, `SqlitePool`) sized by the configured
//! [`PoolLimits`](crate::config::PoolLimits). Concurrent statements on the
//! same session are parallelised by the pool itself.

use crate::error::{DbError, DbResult};
use crate::models::BackendKind;
use crate::{db_dispatch_all, impl_db_dispatch};
use sqlx::{Connection, MySqlPool, PgPool, SqlitePool};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Get the backend kind for this pool.
    pub fn kind(&self) -> BackendKind {
        impl_db_dispatch!(self, {
            MySql(_p) => BackendKind::Mysql,
            Postgres(_p) => BackendKind::Postgres,
            SQLite(_p) => BackendKind::Sqlite,
        })
    }

    pub fn is_closed(&self) -> bool {
        db_dispatch_all!(self, |p| p.is_closed())
    }

    /// Acquire a connection and ping it, bounded by `limit`.
    pub async fn ping(&self, limit: Duration) -> DbResult<()> {
        let probe = async {
            db_dispatch_all!(self, |p| {
                let mut conn = p.acquire().await?;
                conn.ping().await?;
            });
            Ok::<(), sqlx::Error>(())
        };

        match timeout(limit, probe).await {
            Ok(result) => result.map_err(DbError::from),
            Err(_) => Err(DbError::timeout("liveness probe", limit.as_secs())),
        }
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        db_dispatch_all!(self, |p| p.close().await)
    }

    /// Close the pool, giving up after `limit`.
    ///
    /// A pool that does not finish closing in time is reported as a
    /// [`DbError::Close`]; sqlx has already stopped handing out connections
    /// by then, so the remaining ones are dropped as they are released.
    pub async fn close_within(&self, session_id: &str, limit: Duration) -> DbResult<()> {
        match timeout(limit, self.close()).await {
            Ok(()) => {
                debug!(session_id = %session_id, "Session handle closed");
                Ok(())
            }
            Err(_) => Err(DbError::close(
                session_id,
                format!("close did not complete within {}s", limit.as_secs()),
            )),
        }
    }
}
