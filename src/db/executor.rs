//! Query execution engine.
//!
//! This module provides query execution functionality with support for:
//! - Positional parameters
//! - Row caps (enforced via streaming - at most `cap + 1` rows are read)
//! - Statement timeouts, including transaction begin/commit/rollback
//! - Transactional single statements and batches
//!
//! # Timeouts
//!
//! Every statement carries two deadlines. The client-side one drops the
//! future and reports [`DbError::Timeout`]. The backend-side one trails it by
//! [`BACKEND_DEADLINE_SLACK`] and makes the database abort the statement:
//! a progress handler on SQLite and `statement_timeout` on PostgreSQL. MySQL
//! has no per-statement deadline for every statement kind, so a timed-out
//! MySQL connection that does not drain within [`RECOVERY_GRACE`] is detached
//! from the pool and dropped. The same happens on any backend that fails to
//! recover, so the session always gets a usable connection back.
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules
//! (`mysql`, `postgres`, `sqlite`). They are generated from one template so
//! that the only per-backend differences are the parameter binder and the
//! last-insert identity capability.

use crate::db::params;
use crate::db::pool::DbPool;
use crate::db::types::RowToValues;
use crate::error::{DbError, DbResult};
use crate::impl_db_dispatch;
use crate::models::{BatchRequest, BatchResult, QueryRequest, QueryResult};
use futures_util::StreamExt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Whether a statement produces a result set.
///
/// Only the leading token is inspected: anything starting with `SELECT`
/// (case-insensitive) is row-returning, everything else is a mutation.
pub fn is_row_returning(sql: &str) -> bool {
    let trimmed = sql.trim_start();
    trimmed
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"))
}

fn truncation_warning(cap: usize) -> String {
    format!("Query returned more than {cap} rows, only showing first {cap}")
}

/// Backend-side deadlines trail the client timeout by this much, so the
/// caller sees a timeout rather than a backend cancellation error.
const BACKEND_DEADLINE_SLACK: Duration = Duration::from_millis(250);

/// How long a timed-out connection may take to become idle again.
const RECOVERY_GRACE: Duration = Duration::from_secs(2);

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Run `fut` under `limit`, mapping expiry to [`DbError::Timeout`].
async fn bounded<T, E, F>(limit: Duration, operation: &str, fut: F) -> DbResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<DbError>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(DbError::timeout(operation, limit.as_secs())),
    }
}

/// Query executor that handles statement execution against a session handle.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    default_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Effective deadline for a request; `0` falls back to the default.
    pub fn timeout_for(&self, request: &QueryRequest) -> Duration {
        if request.timeout_secs > 0 {
            Duration::from_secs(request.timeout_secs)
        } else {
            self.default_timeout
        }
    }

    /// Execute a single statement.
    ///
    /// With `request.transaction` set, the statement runs in its own
    /// transaction which is committed on success and rolled back on error.
    pub async fn execute(&self, pool: &DbPool, request: &QueryRequest) -> DbResult<QueryResult> {
        let limit = self.timeout_for(request);

        debug!(
            sql = %request.sql,
            params = request.params.len(),
            transaction = request.transaction,
            max_rows = request.max_rows,
            timeout_secs = limit.as_secs(),
            "Executing query"
        );

        impl_db_dispatch!(pool, {
            MySql(p) => mysql::execute(p, request, limit).await,
            Postgres(p) => postgres::execute(p, request, limit).await,
            SQLite(p) => sqlite::execute(p, request, limit).await,
        })
    }

    /// Execute a batch, stopping at the first failing statement.
    ///
    /// Statement failures are reported inside the [`BatchResult`]; this
    /// never returns an error of its own.
    pub async fn execute_batch(&self, pool: &DbPool, batch: &BatchRequest) -> BatchResult {
        debug!(
            statements = batch.queries.len(),
            transaction = batch.transaction,
            "Executing batch"
        );

        let result = impl_db_dispatch!(pool, {
            MySql(p) => mysql::execute_batch(p, batch, self).await,
            Postgres(p) => postgres::execute_batch(p, batch, self).await,
            SQLite(p) => sqlite::execute_batch(p, batch, self).await,
        });

        if let (Some(index), Some(error)) = (result.failed_index, result.error.as_deref()) {
            warn!(failed_index = index, error = %error, "Batch aborted");
        }
        result
    }
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::models::DEFAULT_QUERY_TIMEOUT_SECS))
    }
}

fn failed_batch(
    mut result: BatchResult,
    index: Option<usize>,
    err: &DbError,
    start: Instant,
) -> BatchResult {
    result.error = Some(err.display_message());
    result.failed_index = index;
    result.execution_time_ms = elapsed_ms(start);
    result
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

macro_rules! backend_executor {
    ($module:ident, $db:ty, $bind:path, $deadline:ident, $last_insert_id:expr) => {
        mod $module {
            use super::*;
            use sqlx::pool::PoolConnection;
            use sqlx::{Column, Connection, Database, Executor, Pool, Statement};

            type Db = $db;
            type Conn = <Db as Database>::Connection;

            fn last_insert_id(result: &<Db as Database>::QueryResult) -> DbResult<i64> {
                let read: fn(&<Db as Database>::QueryResult) -> DbResult<i64> = $last_insert_id;
                read(result)
            }

            fn timed_out<T>(outcome: &DbResult<T>) -> bool {
                matches!(outcome, Err(DbError::Timeout { .. }))
            }

            /// Run one statement on a checked-out connection or an open transaction.
            async fn run(conn: &mut Conn, request: &QueryRequest) -> DbResult<QueryResult> {
                let start = Instant::now();
                let mut result = if is_row_returning(&request.sql) {
                    fetch(conn, request).await?
                } else {
                    mutate(conn, request).await?
                };
                result.execution_time_ms = elapsed_ms(start);
                Ok(result)
            }

            /// [`run`] under both the client and the backend deadline.
            ///
            /// On timeout the backend deadline stays armed; [`settle`] clears it.
            async fn run_bounded(
                conn: &mut Conn,
                request: &QueryRequest,
                limit: Duration,
            ) -> DbResult<QueryResult> {
                $deadline::arm(conn, limit + BACKEND_DEADLINE_SLACK).await?;
                let outcome = bounded(limit, "query execution", run(conn, request)).await;
                if !timed_out(&outcome) {
                    if let Err(e) = $deadline::disarm(conn).await {
                        debug!(error = %e, "Failed to clear statement deadline");
                    }
                }
                outcome
            }

            async fn fetch(conn: &mut Conn, request: &QueryRequest) -> DbResult<QueryResult> {
                let cap = request.row_cap();
                let mut result = QueryResult::default();
                {
                    // Without parameters, send raw SQL so that statements which
                    // cannot be prepared still run
                    let mut stream = if request.params.is_empty() {
                        (&mut *conn).fetch(request.sql.as_str())
                    } else {
                        (&mut *conn).fetch($bind(&request.sql, &request.params))
                    };

                    while let Some(row) = stream.next().await {
                        let row = row?;
                        if result.columns.is_empty() {
                            result.columns = row.column_names();
                        }
                        if let Some(cap) = cap.filter(|cap| result.rows.len() >= *cap) {
                            warn!(cap = cap, "Query result truncated");
                            result.warnings.push(truncation_warning(cap));
                            break;
                        }
                        result.rows.push(row.to_values());
                    }
                }

                if result.columns.is_empty() {
                    result.columns = describe_columns(conn, &request.sql).await;
                }
                result.rows_affected = result.rows.len() as u64;
                Ok(result)
            }

            /// Column names of a statement that produced no rows.
            async fn describe_columns(conn: &mut Conn, sql: &str) -> Vec<String> {
                match conn.prepare(sql).await {
                    Ok(statement) => statement
                        .columns()
                        .iter()
                        .map(|column| column.name().to_string())
                        .collect(),
                    Err(e) => {
                        debug!(error = %e, "Could not describe result columns");
                        Vec::new()
                    }
                }
            }

            async fn mutate(conn: &mut Conn, request: &QueryRequest) -> DbResult<QueryResult> {
                let done = if request.params.is_empty() {
                    conn.execute(request.sql.as_str()).await?
                } else {
                    conn.execute($bind(&request.sql, &request.params)).await?
                };

                let last_insert_id = match last_insert_id(&done) {
                    Ok(id) if id != 0 => Some(id),
                    Ok(_) => None,
                    Err(DbError::Unsupported { .. }) => None,
                    Err(e) => return Err(e),
                };

                Ok(QueryResult {
                    rows_affected: done.rows_affected(),
                    last_insert_id,
                    ..Default::default()
                })
            }

            async fn rollback(tx: sqlx::Transaction<'_, Db>, limit: Duration) {
                if let Err(e) = bounded(limit, "rollback", tx.rollback()).await {
                    warn!(error = %e, "Rollback failed");
                }
            }

            /// Hand a connection back to the pool.
            ///
            /// After a timeout the connection is given [`RECOVERY_GRACE`] to
            /// finish the aborted statement and drop its deadline. One that
            /// does not recover is detached so the pool opens a fresh one.
            async fn settle(mut conn: PoolConnection<Db>, expired: bool) {
                if !expired {
                    return;
                }
                let recovered =
                    bounded(RECOVERY_GRACE, "connection recovery", $deadline::recover(&mut conn))
                        .await;
                match recovered {
                    Ok(()) => debug!("Connection recovered after timeout"),
                    Err(e) => {
                        warn!(error = %e, "Discarding connection after timeout");
                        drop(conn.detach());
                    }
                }
            }

            async fn execute_in_transaction(
                conn: &mut Conn,
                request: &QueryRequest,
                limit: Duration,
            ) -> DbResult<QueryResult> {
                let mut tx = bounded(limit, "begin transaction", conn.begin()).await?;
                match run_bounded(&mut tx, request, limit).await {
                    Ok(result) => {
                        bounded(limit, "commit", tx.commit()).await?;
                        Ok(result)
                    }
                    Err(e) => {
                        rollback(tx, limit).await;
                        Err(e)
                    }
                }
            }

            pub async fn execute(
                pool: &Pool<Db>,
                request: &QueryRequest,
                limit: Duration,
            ) -> DbResult<QueryResult> {
                let mut conn = bounded(limit, "acquire connection", pool.acquire()).await?;
                let outcome = if request.transaction {
                    execute_in_transaction(&mut conn, request, limit).await
                } else {
                    run_bounded(&mut conn, request, limit).await
                };
                settle(conn, timed_out(&outcome)).await;
                outcome
            }

            async fn batch_in_transaction(
                conn: &mut Conn,
                batch: &BatchRequest,
                executor: &QueryExecutor,
                out: &mut BatchResult,
            ) -> Result<(), (Option<usize>, DbError)> {
                let limit = executor.default_timeout();
                let mut tx = bounded(limit, "begin transaction", conn.begin())
                    .await
                    .map_err(|e| (None, e))?;

                for (index, request) in batch.queries.iter().enumerate() {
                    let statement_limit = executor.timeout_for(request);
                    match run_bounded(&mut tx, request, statement_limit).await {
                        Ok(result) => out.results.push(result),
                        Err(e) => {
                            rollback(tx, limit).await;
                            return Err((Some(index), e));
                        }
                    }
                }

                bounded(limit, "commit", tx.commit())
                    .await
                    .map_err(|e| (None, e))
            }

            pub async fn execute_batch(
                pool: &Pool<Db>,
                batch: &BatchRequest,
                executor: &QueryExecutor,
            ) -> BatchResult {
                let start = Instant::now();
                let mut out = BatchResult::default();

                if !batch.transaction {
                    for (index, request) in batch.queries.iter().enumerate() {
                        match execute(pool, request, executor.timeout_for(request)).await {
                            Ok(result) => out.results.push(result),
                            Err(e) => return failed_batch(out, Some(index), &e, start),
                        }
                    }
                    out.execution_time_ms = elapsed_ms(start);
                    return out;
                }

                let limit = executor.default_timeout();
                let mut conn = match bounded(limit, "acquire connection", pool.acquire()).await {
                    Ok(conn) => conn,
                    Err(e) => return failed_batch(out, None, &e, start),
                };
                let outcome = batch_in_transaction(&mut conn, batch, executor, &mut out).await;
                let expired = matches!(outcome, Err((_, DbError::Timeout { .. })));
                settle(conn, expired).await;

                match outcome {
                    Ok(()) => {
                        out.execution_time_ms = elapsed_ms(start);
                        out
                    }
                    Err((index, e)) => failed_batch(out, index, &e, start),
                }
            }
        }
    };
}

// =============================================================================
// Backend-Side Deadlines
// =============================================================================

mod sqlite_deadline {
    use super::*;
    use sqlx::sqlite::SqliteConnection;

    /// Number of VM instructions between deadline checks.
    const PROGRESS_OPS: i32 = 1_000;

    /// Interrupt whatever runs on this connection once `limit` has passed.
    pub async fn arm(conn: &mut SqliteConnection, limit: Duration) -> DbResult<()> {
        let deadline = Instant::now() + limit;
        conn.lock_handle()
            .await?
            .set_progress_handler(PROGRESS_OPS, move || Instant::now() < deadline);
        Ok(())
    }

    pub async fn disarm(conn: &mut SqliteConnection) -> DbResult<()> {
        conn.lock_handle().await?.remove_progress_handler();
        Ok(())
    }

    /// Locking the handle waits for the worker to go idle, so the
    /// interrupted statement has ended once this returns.
    pub async fn recover(conn: &mut SqliteConnection) -> DbResult<()> {
        disarm(conn).await
    }
}

mod postgres_deadline {
    use super::*;
    use sqlx::Executor;
    use sqlx::postgres::PgConnection;

    pub async fn arm(conn: &mut PgConnection, limit: Duration) -> DbResult<()> {
        let sql = format!("SET statement_timeout = {}", limit.as_millis());
        conn.execute(sql.as_str()).await?;
        Ok(())
    }

    /// Restores the session default.
    pub async fn disarm(conn: &mut PgConnection) -> DbResult<()> {
        conn.execute("RESET statement_timeout").await?;
        Ok(())
    }

    /// The connection drains the cancelled statement before the reset runs.
    pub async fn recover(conn: &mut PgConnection) -> DbResult<()> {
        disarm(conn).await
    }
}

mod mysql_deadline {
    use super::*;
    use sqlx::Connection;
    use sqlx::mysql::MySqlConnection;

    // `max_execution_time` only covers read-only SELECTs and is absent on MariaDB
    pub async fn arm(_conn: &mut MySqlConnection, _limit: Duration) -> DbResult<()> {
        Ok(())
    }

    pub async fn disarm(_conn: &mut MySqlConnection) -> DbResult<()> {
        Ok(())
    }

    /// Waits for the abandoned statement to finish on the server.
    pub async fn recover(conn: &mut MySqlConnection) -> DbResult<()> {
        conn.ping().await?;
        Ok(())
    }
}

backend_executor!(mysql, sqlx::MySql, params::mysql_query, mysql_deadline, |done| {
    i64::try_from(done.last_insert_id())
        .map_err(|_| DbError::internal("last insert id exceeds i64 range"))
});

backend_executor!(postgres, sqlx::Postgres, params::postgres_query, postgres_deadline, |_| {
    Err(DbError::unsupported(
        "last insert id",
        crate::models::BackendKind::Postgres.display_name(),
    ))
});

backend_executor!(sqlite, sqlx::Sqlite, params::sqlite_query, sqlite_deadline, |done| Ok(
    done.last_insert_rowid()
));
