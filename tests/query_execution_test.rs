//! Integration tests for statement execution through sessions.
//!
//! Tests verify that:
//! - Row caps truncate and warn only when rows were dropped
//! - Mutations report affected rows and the inserted rowid
//! - Transactional statements roll back on failure
//! - Batches stop at the first failure and report its index
//! - Cells decode to the expected JSON-friendly values
//! - Empty result sets still report their columns

use db_session_proxy::config::BackendDefaults;
use db_session_proxy::db::{BackendConnector, PoolConfig, QueryExecutor, SessionPool};
use db_session_proxy::models::{BatchRequest, ColumnValue, ConnectionParams, QueryRequest};
use db_session_proxy::{DbError, ProxyService};
use std::time::Duration;
use tempfile::NamedTempFile;

async fn setup() -> (ProxyService, String) {
    let sessions = SessionPool::start(PoolConfig::default());
    let connector = BackendConnector::new(
        BackendDefaults::default(),
        sessions.limits().clone(),
        Duration::from_secs(5),
    );
    let service = ProxyService::new(
        sessions,
        connector,
        QueryExecutor::default(),
        Duration::from_secs(3600),
    );

    let path = NamedTempFile::new().unwrap().into_temp_path().keep().unwrap();
    let response = service
        .connect(
            "tester",
            &ConnectionParams::sqlite(path.to_str().unwrap()),
        )
        .await
        .unwrap();
    assert!(response.connected, "connect failed: {:?}", response.error);

    service
        .execute_query(
            &response.session_id,
            &QueryRequest::new(
                "CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, price REAL, payload BLOB)",
            ),
        )
        .await
        .unwrap();

    (service, response.session_id)
}

async fn insert(service: &ProxyService, session_id: &str, name: &str) {
    service
        .execute_query(
            session_id,
            &QueryRequest::new("INSERT INTO items (name) VALUES (?)").with_param(name),
        )
        .await
        .unwrap();
}

async fn count(service: &ProxyService, session_id: &str) -> i64 {
    let result = service
        .execute_query(session_id, &QueryRequest::new("SELECT COUNT(*) AS n FROM items"))
        .await
        .unwrap();
    result.value(0, "n").and_then(ColumnValue::as_i64).unwrap()
}

#[tokio::test]
async fn test_insert_reports_rowid() {
    let (service, session_id) = setup().await;

    let first = service
        .execute_query(
            &session_id,
            &QueryRequest::new("INSERT INTO items (name, price) VALUES (?, ?)")
                .with_param("widget")
                .with_param(9.5),
        )
        .await
        .unwrap();
    assert_eq!(first.rows_affected, 1);
    assert_eq!(first.last_insert_id, Some(1));
    assert!(first.columns.is_empty());

    let second = service
        .execute_query(
            &session_id,
            &QueryRequest::new("INSERT INTO items (name) VALUES ('gadget')"),
        )
        .await
        .unwrap();
    assert_eq!(second.last_insert_id, Some(2));

    service.shutdown().await;
}

#[tokio::test]
async fn test_row_cap_truncates_with_warning() {
    let (service, session_id) = setup().await;
    for name in ["a", "b", "c", "d", "e"] {
        insert(&service, &session_id, name).await;
    }

    let capped = service
        .execute_query(
            &session_id,
            &QueryRequest::new("SELECT name FROM items ORDER BY id").with_max_rows(2),
        )
        .await
        .unwrap();
    assert_eq!(capped.rows.len(), 2);
    assert_eq!(capped.rows_affected, 2);
    assert_eq!(capped.warnings.len(), 1);
    assert!(capped.warnings[0].contains("more than 2 rows"));

    let exact = service
        .execute_query(
            &session_id,
            &QueryRequest::new("SELECT name FROM items ORDER BY id").with_max_rows(5),
        )
        .await
        .unwrap();
    assert_eq!(exact.rows.len(), 5);
    assert!(exact.warnings.is_empty());

    let unlimited = service
        .execute_query(
            &session_id,
            &QueryRequest::new("SELECT name FROM items ORDER BY id").with_max_rows(-1),
        )
        .await
        .unwrap();
    assert_eq!(unlimited.rows.len(), 5);
    assert_eq!(
        unlimited.value(4, "name"),
        Some(&ColumnValue::Text("e".to_string()))
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_empty_result_reports_columns() {
    let (service, session_id) = setup().await;

    let result = service
        .execute_query(
            &session_id,
            &QueryRequest::new("SELECT id, name, price FROM items WHERE price > ?")
                .with_param(100.0),
        )
        .await
        .unwrap();
    assert_eq!(result.columns, vec!["id", "name", "price"]);
    assert!(result.rows.is_empty());

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["columns"], serde_json::json!(["id", "name", "price"]));
    assert_eq!(json["rows"], serde_json::json!([]));

    service.shutdown().await;
}

#[tokio::test]
async fn test_cell_decoding() {
    let (service, session_id) = setup().await;
    service
        .execute_query(
            &session_id,
            &QueryRequest::new(
                "INSERT INTO items (name, price, payload) VALUES ('bin', 1.25, X'FFFE0001'), ('txt', NULL, CAST('hello' AS BLOB))",
            ),
        )
        .await
        .unwrap();

    let result = service
        .execute_query(
            &session_id,
            &QueryRequest::new("SELECT id, name, price, payload FROM items ORDER BY id"),
        )
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["id", "name", "price", "payload"]);
    assert_eq!(result.value(0, "id"), Some(&ColumnValue::Integer(1)));
    assert_eq!(result.value(0, "price"), Some(&ColumnValue::Float(1.25)));
    assert_eq!(
        result.value(0, "payload"),
        Some(&ColumnValue::BinaryAsText("//4AAQ==".to_string()))
    );
    assert_eq!(result.value(1, "price"), Some(&ColumnValue::Null));
    assert_eq!(
        result.value(1, "payload"),
        Some(&ColumnValue::BinaryAsText("hello".to_string()))
    );

    let json = serde_json::to_value(&result).unwrap();
    assert!(json["rows"][1][2].is_null());
    assert_eq!(json["rows"][1][3], "hello");

    service.shutdown().await;
}

#[tokio::test]
async fn test_transactional_failure_rolls_back() {
    let (service, session_id) = setup().await;
    insert(&service, &session_id, "keep").await;

    let err = service
        .execute_query(
            &session_id,
            &QueryRequest::new("INSERT INTO items (name) VALUES (NULL)").with_transaction(true),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Execution { .. }));
    assert_eq!(count(&service, &session_id).await, 1);

    let committed = service
        .execute_query(
            &session_id,
            &QueryRequest::new("INSERT INTO items (name) VALUES ('tx')").with_transaction(true),
        )
        .await
        .unwrap();
    assert_eq!(committed.rows_affected, 1);
    assert_eq!(count(&service, &session_id).await, 2);

    service.shutdown().await;
}

#[tokio::test]
async fn test_transactional_batch_is_all_or_nothing() {
    let (service, session_id) = setup().await;

    let batch = BatchRequest::new(
        vec![
            QueryRequest::new("INSERT INTO items (name) VALUES ('one')"),
            QueryRequest::new("INSERT INTO items (name) VALUES ('two')"),
            QueryRequest::new("INSERT INTO missing_table VALUES (1)"),
            QueryRequest::new("INSERT INTO items (name) VALUES ('never')"),
        ],
        true,
    );
    let result = service.execute_batch(&session_id, &batch).await.unwrap();

    assert!(!result.is_success());
    assert_eq!(result.failed_index, Some(2));
    assert_eq!(result.results.len(), 2);
    assert_eq!(count(&service, &session_id).await, 0);

    service.shutdown().await;
}

#[tokio::test]
async fn test_plain_batch_keeps_earlier_statements() {
    let (service, session_id) = setup().await;

    let batch = BatchRequest::new(
        vec![
            QueryRequest::new("INSERT INTO items (name) VALUES ('one')"),
            QueryRequest::new("SELEC nonsense"),
            QueryRequest::new("INSERT INTO items (name) VALUES ('never')"),
        ],
        false,
    );
    let result = service.execute_batch(&session_id, &batch).await.unwrap();

    assert_eq!(result.failed_index, Some(1));
    assert!(result.error.is_some());
    assert_eq!(result.results.len(), 1);
    assert_eq!(count(&service, &session_id).await, 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_successful_batch_returns_every_result() {
    let (service, session_id) = setup().await;

    let batch = BatchRequest::new(
        vec![
            QueryRequest::new("INSERT INTO items (name) VALUES (?)").with_param("x"),
            QueryRequest::new("INSERT INTO items (name) VALUES (?)").with_param("y"),
            QueryRequest::new("SELECT name FROM items ORDER BY id"),
        ],
        true,
    );
    let result = service.execute_batch(&session_id, &batch).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.results.len(), 3);
    assert_eq!(result.results[2].rows.len(), 2);

    service.shutdown().await;
}

#[tokio::test]
async fn test_batch_on_unknown_session() {
    let (service, _session_id) = setup().await;

    let err = service
        .execute_batch("no-such-session", &BatchRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::SessionNotFound { .. }));

    service.shutdown().await;
}

#[tokio::test]
async fn test_query_after_disconnect_is_not_found() {
    let (service, session_id) = setup().await;
    service.disconnect(&session_id).await.unwrap();

    let err = service
        .execute_query(&session_id, &QueryRequest::new("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::SessionNotFound { .. }));

    service.shutdown().await;
}
