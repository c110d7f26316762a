//! Integration tests for session lifecycle.
//!
//! Tests verify that:
//! - Connect/disconnect leaves the active count unchanged
//! - Removing a session twice reports not-found
//! - Expired sessions are invisible immediately and swept later
//! - Concurrent lookups on one session do not block each other
//! - Lookups on distinct sessions proceed in parallel
//! - A timed-out statement leaves its session usable
//! - Unreachable backends are reported through the connect response
//! - A shut-down service accepts no new sessions

use db_session_proxy::config::BackendDefaults;
use db_session_proxy::db::{BackendConnector, PoolConfig, QueryExecutor, SessionPool};
use db_session_proxy::models::{BackendKind, ConnectionParams, QueryRequest};
use db_session_proxy::{DbError, ProxyService};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ENDLESS: &str = "SELECT count(*) FROM (WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT x FROM c)";

fn build_service(session_ttl: Duration) -> ProxyService {
    let sessions = SessionPool::start(PoolConfig::default());
    let connector = BackendConnector::new(
        BackendDefaults::default(),
        sessions.limits().clone(),
        Duration::from_secs(5),
    );
    ProxyService::new(sessions, connector, QueryExecutor::default(), session_ttl)
}

fn sqlite_params(dir: &TempDir, name: &str) -> ConnectionParams {
    let path = dir.path().join(name);
    ConnectionParams::sqlite(path.to_str().unwrap())
}

#[tokio::test]
async fn test_connect_disconnect_round_trip() {
    let dir = TempDir::new().unwrap();
    let service = build_service(Duration::from_secs(3600));
    let before = service.active_session_count().await;

    let response = service
        .connect("alice", &sqlite_params(&dir, "round_trip.db"))
        .await
        .unwrap();
    assert!(response.connected);
    assert_eq!(response.kind, BackendKind::Sqlite);
    assert!(uuid::Uuid::parse_str(&response.session_id).is_ok());
    assert_eq!(service.active_session_count().await, before + 1);

    service.disconnect(&response.session_id).await.unwrap();
    assert_eq!(service.active_session_count().await, before);

    service.shutdown().await;
}

#[tokio::test]
async fn test_second_disconnect_is_not_found() {
    let dir = TempDir::new().unwrap();
    let service = build_service(Duration::from_secs(3600));

    let response = service
        .connect("alice", &sqlite_params(&dir, "twice.db"))
        .await
        .unwrap();
    service.disconnect(&response.session_id).await.unwrap();

    let err = service.disconnect(&response.session_id).await.unwrap_err();
    assert!(matches!(err, DbError::SessionNotFound { .. }));

    service.shutdown().await;
}

#[tokio::test]
async fn test_expired_session_is_not_found() {
    let dir = TempDir::new().unwrap();
    let service = build_service(Duration::from_millis(50));

    let response = service
        .connect("alice", &sqlite_params(&dir, "expiring.db"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let err = service
        .execute_query(&response.session_id, &QueryRequest::new("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::SessionNotFound { .. }));

    assert_eq!(service.sessions().sweep_expired().await, 1);
    assert_eq!(service.active_session_count().await, 0);

    service.shutdown().await;
}

#[tokio::test]
async fn test_list_sessions_by_owner() {
    let dir = TempDir::new().unwrap();
    let service = build_service(Duration::from_secs(3600));

    let a = service
        .connect("alice", &sqlite_params(&dir, "a.db"))
        .await
        .unwrap();
    service
        .connect("bob", &sqlite_params(&dir, "b.db"))
        .await
        .unwrap();

    let sessions = service.list_sessions("alice").await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, a.session_id);
    assert_eq!(sessions[0].kind, BackendKind::Sqlite);
    assert!(sessions[0].expires_at > sessions[0].created_at);

    service.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_queries_on_one_session() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(build_service(Duration::from_secs(3600)));

    let response = service
        .connect("alice", &sqlite_params(&dir, "concurrent.db"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16i64 {
        let service = service.clone();
        let session_id = response.session_id.clone();
        handles.push(tokio::spawn(async move {
            service
                .execute_query(&session_id, &QueryRequest::new("SELECT ? AS n").with_param(i))
                .await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lookups_on_distinct_sessions_run_in_parallel() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(build_service(Duration::from_secs(3600)));

    let mut session_ids = Vec::new();
    for i in 0..8 {
        let response = service
            .connect("alice", &sqlite_params(&dir, &format!("parallel_{}.db", i)))
            .await
            .unwrap();
        session_ids.push(response.session_id);
    }

    let started = Instant::now();
    let mut handles = Vec::new();
    for session_id in session_ids.iter().cycle().take(64).cloned() {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..200 {
                service.sessions().get(&session_id).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "12800 lookups took {:?}",
        started.elapsed()
    );

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_statement_does_not_stall_other_sessions() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(build_service(Duration::from_secs(3600)));

    let slow = service
        .connect("alice", &sqlite_params(&dir, "slow.db"))
        .await
        .unwrap()
        .session_id;
    let mut others = Vec::new();
    for i in 0..4 {
        let response = service
            .connect("alice", &sqlite_params(&dir, &format!("other_{}.db", i)))
            .await
            .unwrap();
        others.push(response.session_id);
    }

    let runaway = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .execute_query(&slow, &QueryRequest::new(ENDLESS).with_timeout(2))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    for session_id in &others {
        let result = service
            .execute_query(session_id, &QueryRequest::new("SELECT 1"))
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    let err = runaway.await.unwrap().unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));

    service.shutdown().await;
}

#[tokio::test]
async fn test_session_survives_statement_timeout() {
    let dir = TempDir::new().unwrap();
    let service = build_service(Duration::from_secs(3600));
    let session_id = service
        .connect("alice", &sqlite_params(&dir, "timeout.db"))
        .await
        .unwrap()
        .session_id;

    let started = Instant::now();
    let err = service
        .execute_query(&session_id, &QueryRequest::new(ENDLESS).with_timeout(1))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(3));

    let started = Instant::now();
    let result = service
        .execute_query(&session_id, &QueryRequest::new("SELECT 1").with_timeout(3))
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));

    // Transactional statements recover the same way
    let err = service
        .execute_query(
            &session_id,
            &QueryRequest::new(ENDLESS)
                .with_timeout(1)
                .with_transaction(true),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    service
        .execute_query(&session_id, &QueryRequest::new("CREATE TABLE t (id INTEGER)"))
        .await
        .unwrap();

    assert_eq!(service.active_session_count().await, 1);
    service.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_backend_reports_failed_connect() {
    let service = build_service(Duration::from_secs(3600));
    let params = ConnectionParams::new(BackendKind::Postgres)
        .with_host("127.0.0.1")
        .with_port(1);

    let response = service.connect("alice", &params).await.unwrap();
    assert!(!response.connected);
    assert!(response.session_id.is_empty());
    assert!(response.error.is_some());
    assert_eq!(service.active_session_count().await, 0);

    service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let dir = TempDir::new().unwrap();
    let service = build_service(Duration::from_secs(3600));
    for name in ["one.db", "two.db"] {
        service
            .connect("alice", &sqlite_params(&dir, name))
            .await
            .unwrap();
    }
    assert_eq!(service.active_session_count().await, 2);

    service.shutdown().await;
    assert_eq!(service.active_session_count().await, 0);
    service.shutdown().await;

    let err = service
        .connect("alice", &sqlite_params(&dir, "late.db"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Internal { .. }));
    assert_eq!(service.active_session_count().await, 0);
}
