//! Schema introspection module.
//!
//! Produces the same [`TableInfo`]/[`ColumnInfo`] shape for SQLite,
//! PostgreSQL and MySQL, even though each backend keeps its catalog in a
//! completely different form.
//!
//! # Architecture
//!
//! SQL queries are organized in the `queries` submodule with constants for each
//! database type. Database-specific implementations are in their respective
//! submodules (postgres, mysql, sqlite), each providing the same interface.
//!
//! Tables come back ordered by name and columns in ordinal order. A failure
//! while reading any table's columns aborts the whole call.

use crate::db::pool::DbPool;
use crate::error::{DbError, DbResult};
use crate::impl_db_dispatch;
use crate::models::{BackendKind, ColumnInfo, TableInfo, TableKind};
use tracing::debug;

/// Schema inspector for database introspection.
pub struct SchemaInspector;

impl SchemaInspector {
    /// Describe every table (and view) in `schema`, or only `table` when given.
    ///
    /// `schema` defaults to `public` on PostgreSQL and to the connection's
    /// current database on MySQL; SQLite only has `main`. An unknown table
    /// yields an empty list.
    pub async fn describe_schema(
        pool: &DbPool,
        kind: BackendKind,
        schema: Option<&str>,
        table: Option<&str>,
    ) -> DbResult<Vec<TableInfo>> {
        if pool.kind() != kind {
            return Err(DbError::internal(format!(
                "Session handle is {} but {} introspection was requested",
                pool.kind(),
                kind
            )));
        }

        let schema = schema.filter(|s| !s.is_empty());
        let table = table.filter(|t| !t.is_empty());

        let tables = impl_db_dispatch!(pool, {
            MySql(p) => mysql::describe_schema(p, schema, table).await,
            Postgres(p) => postgres::describe_schema(p, schema, table).await,
            SQLite(p) => sqlite::describe_schema(p, table).await,
        })?;

        debug!(
            db_type = %kind,
            count = tables.len(),
            table = ?table,
            "Described schema"
        );
        Ok(tables)
    }
}

/// Map a catalog query failure to a schema error naming `object`.
fn catalog_error(object: &str) -> impl FnOnce(sqlx::Error) -> DbError + '_ {
    move |err| DbError::schema(DbError::from(err).to_string(), object)
}

// =============================================================================
// SQL Query Templates
// =============================================================================

mod queries {
    pub mod postgres {
        pub const DEFAULT_SCHEMA: &str = "public";

        pub const LIST_TABLES: &str = r#"
            SELECT name, kind FROM (
                SELECT tablename::text AS name, 'table'::text AS kind
                FROM pg_catalog.pg_tables
                WHERE schemaname = $1
                UNION ALL
                SELECT viewname::text AS name, 'view'::text AS kind
                FROM pg_catalog.pg_views
                WHERE schemaname = $1
            ) t
            WHERE $2::text IS NULL OR name = $2
            ORDER BY name
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            a.attname::text AS column_name,
            format_type(a.atttypid, a.atttypmod) AS column_type,
            NOT a.attnotnull AS is_nullable,
            pg_get_expr(d.adbin, d.adrelid) AS column_default,
            EXISTS (
                SELECT 1 FROM pg_catalog.pg_constraint con
                WHERE con.conrelid = c.oid
                AND con.contype = 'p'
                AND a.attnum = ANY(con.conkey)
            ) AS is_primary_key,
            col_description(c.oid, a.attnum) AS column_comment
        FROM pg_catalog.pg_attribute a
        JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
        LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
        WHERE n.nspname = $1 AND c.relname = $2
        AND a.attnum > 0 AND NOT a.attisdropped
        ORDER BY a.attnum
        "#;
    }

    pub mod mysql {
        pub const LIST_TABLES: &str = r#"
            SELECT
                CONVERT(TABLE_SCHEMA USING utf8mb4) AS TABLE_SCHEMA,
                CONVERT(TABLE_NAME USING utf8mb4) AS TABLE_NAME,
                CONVERT(TABLE_TYPE USING utf8mb4) AS TABLE_TYPE
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
            AND (? IS NULL OR TABLE_NAME = ?)
            ORDER BY TABLE_NAME
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8mb4) AS COLUMN_NAME,
            CONVERT(COLUMN_TYPE USING utf8mb4) AS COLUMN_TYPE,
            CONVERT(IS_NULLABLE USING utf8mb4) AS IS_NULLABLE,
            CONVERT(COLUMN_DEFAULT USING utf8mb4) AS COLUMN_DEFAULT,
            CONVERT(COLUMN_KEY USING utf8mb4) AS COLUMN_KEY,
            CONVERT(COLUMN_COMMENT USING utf8mb4) AS COLUMN_COMMENT
        FROM information_schema.COLUMNS
        WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
        ORDER BY ORDINAL_POSITION
        "#;
    }

    pub mod sqlite {
        pub const SCHEMA_NAME: &str = "main";

        pub const LIST_TABLES: &str = r#"
            SELECT name, type FROM sqlite_master
            WHERE type IN ('table', 'view')
            AND name NOT LIKE 'sqlite_%'
            AND (?1 IS NULL OR name = ?1)
            ORDER BY name
            "#;

        pub const DESCRIBE_COLUMNS: &str =
            r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#;
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod postgres {
    use super::*;
    use sqlx::{PgPool, Row};

    pub async fn describe_schema(
        pool: &PgPool,
        schema: Option<&str>,
        table: Option<&str>,
    ) -> DbResult<Vec<TableInfo>> {
        let schema_name = schema.unwrap_or(queries::postgres::DEFAULT_SCHEMA);

        let rows = sqlx::query(queries::postgres::LIST_TABLES)
            .bind(schema_name)
            .bind(table)
            .fetch_all(pool)
            .await
            .map_err(catalog_error(schema_name))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("name").map_err(catalog_error(schema_name))?;
            let kind: String = row.try_get("kind").map_err(catalog_error(schema_name))?;
            let columns = fetch_columns(pool, schema_name, &name).await?;
            tables.push(
                TableInfo::new(&name, schema_name, TableKind::parse(&kind)).with_columns(columns),
            );
        }
        Ok(tables)
    }

    async fn fetch_columns(
        pool: &PgPool,
        schema_name: &str,
        table_name: &str,
    ) -> DbResult<Vec<ColumnInfo>> {
        let rows = sqlx::query(queries::postgres::DESCRIBE_COLUMNS)
            .bind(schema_name)
            .bind(table_name)
            .fetch_all(pool)
            .await
            .map_err(catalog_error(table_name))?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("column_name")?;
                let column_type: String = row.try_get("column_type")?;
                let nullable: bool = row.try_get("is_nullable")?;
                let is_pk: bool = row.try_get("is_primary_key")?;
                let default_value: Option<String> = row.try_get("column_default")?;
                let comment: Option<String> = row.try_get("column_comment")?;

                Ok(ColumnInfo::new(name, column_type, nullable)
                    .with_primary_key(is_pk)
                    .with_default(default_value)
                    .with_comment(comment))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(catalog_error(table_name))
    }
}

mod mysql {
    use super::*;
    use sqlx::Row;
    use sqlx::mysql::{MySqlPool, MySqlRow};

    /// Safely get a string from a MySQL row.
    /// Catalog columns may come back as VARBINARY depending on the server charset.
    fn get_string(row: &MySqlRow, column: &str) -> Option<String> {
        row.try_get::<String, _>(column).ok().or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    fn get_optional_string(row: &MySqlRow, column: &str) -> Option<String> {
        row.try_get::<Option<String>, _>(column)
            .ok()
            .flatten()
            .or_else(|| {
                row.try_get::<Option<Vec<u8>>, _>(column)
                    .ok()
                    .flatten()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
    }

    fn required(row: &MySqlRow, column: &str, object: &str) -> DbResult<String> {
        get_string(row, column).ok_or_else(|| {
            DbError::schema(format!("catalog column {} is not readable", column), object)
        })
    }

    pub async fn describe_schema(
        pool: &MySqlPool,
        schema: Option<&str>,
        table: Option<&str>,
    ) -> DbResult<Vec<TableInfo>> {
        let object = schema.unwrap_or("current database");

        let rows = sqlx::query(queries::mysql::LIST_TABLES)
            .bind(schema)
            .bind(table)
            .bind(table)
            .fetch_all(pool)
            .await
            .map_err(catalog_error(object))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in &rows {
            let schema_name = required(row, "TABLE_SCHEMA", object)?;
            let name = required(row, "TABLE_NAME", object)?;
            let kind = required(row, "TABLE_TYPE", &name)?;
            let columns = fetch_columns(pool, &schema_name, &name).await?;
            tables.push(
                TableInfo::new(&name, &schema_name, TableKind::parse(&kind)).with_columns(columns),
            );
        }
        Ok(tables)
    }

    async fn fetch_columns(
        pool: &MySqlPool,
        schema_name: &str,
        table_name: &str,
    ) -> DbResult<Vec<ColumnInfo>> {
        let rows = sqlx::query(queries::mysql::DESCRIBE_COLUMNS)
            .bind(schema_name)
            .bind(table_name)
            .fetch_all(pool)
            .await
            .map_err(catalog_error(table_name))?;

        rows.iter()
            .map(|row| {
                let name = required(row, "COLUMN_NAME", table_name)?;
                let column_type = required(row, "COLUMN_TYPE", table_name)?;
                let nullable = get_string(row, "IS_NULLABLE").is_some_and(|v| v == "YES");
                let is_pk = get_string(row, "COLUMN_KEY").is_some_and(|v| v == "PRI");

                Ok(ColumnInfo::new(name, column_type, nullable)
                    .with_primary_key(is_pk)
                    .with_default(get_optional_string(row, "COLUMN_DEFAULT"))
                    .with_comment(get_optional_string(row, "COLUMN_COMMENT")))
            })
            .collect()
    }
}

mod sqlite {
    use super::*;
    use sqlx::{Row, SqlitePool};

    pub async fn describe_schema(
        pool: &SqlitePool,
        table: Option<&str>,
    ) -> DbResult<Vec<TableInfo>> {
        let schema_name = queries::sqlite::SCHEMA_NAME;

        let rows = sqlx::query(queries::sqlite::LIST_TABLES)
            .bind(table)
            .fetch_all(pool)
            .await
            .map_err(catalog_error(schema_name))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("name").map_err(catalog_error(schema_name))?;
            let kind: String = row.try_get("type").map_err(catalog_error(schema_name))?;
            let columns = fetch_columns(pool, &name).await?;
            tables.push(
                TableInfo::new(&name, schema_name, TableKind::parse(&kind)).with_columns(columns),
            );
        }
        Ok(tables)
    }

    async fn fetch_columns(pool: &SqlitePool, table_name: &str) -> DbResult<Vec<ColumnInfo>> {
        let rows = sqlx::query(queries::sqlite::DESCRIBE_COLUMNS)
            .bind(table_name)
            .fetch_all(pool)
            .await
            .map_err(catalog_error(table_name))?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("name")?;
                let data_type: String = row.try_get("type")?;
                let notnull: i64 = row.try_get("notnull")?;
                let default_value: Option<String> = row.try_get("dflt_value")?;
                let pk: i64 = row.try_get("pk")?;

                Ok(ColumnInfo::new(name, data_type, notnull == 0)
                    .with_primary_key(pk > 0)
                    .with_default(default_value))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(catalog_error(table_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sample_pool() -> DbPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for sql in [
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email VARCHAR(255) NOT NULL, nickname TEXT DEFAULT 'anon')",
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, user_id INTEGER)",
            "CREATE VIEW user_emails AS SELECT email FROM users",
        ] {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }
        DbPool::SQLite(pool)
    }

    #[tokio::test]
    async fn test_sqlite_describe_all_tables() {
        let pool = sample_pool().await;
        let tables = SchemaInspector::describe_schema(&pool, BackendKind::Sqlite, None, None)
            .await
            .unwrap();

        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["accounts", "user_emails", "users"]);
        assert!(tables.iter().all(|t| t.schema == "main"));
        assert_eq!(tables[1].kind, TableKind::View);
    }

    #[tokio::test]
    async fn test_sqlite_describe_single_table() {
        let pool = sample_pool().await;
        let tables =
            SchemaInspector::describe_schema(&pool, BackendKind::Sqlite, None, Some("users"))
                .await
                .unwrap();
        assert_eq!(tables.len(), 1);

        let users = &tables[0];
        assert_eq!(users.kind, TableKind::Table);
        let columns: Vec<_> = users.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(columns, vec!["id", "email", "nickname"]);

        let id = users.column("id").unwrap();
        assert!(id.primary_key);
        assert_eq!(id.data_type, "INTEGER");

        let email = users.column("email").unwrap();
        assert!(!email.nullable);
        assert!(!email.primary_key);
        assert_eq!(email.data_type, "VARCHAR(255)");

        let nickname = users.column("nickname").unwrap();
        assert!(nickname.nullable);
        assert_eq!(nickname.default_value.as_deref(), Some("'anon'"));
    }

    #[tokio::test]
    async fn test_unknown_table_is_empty() {
        let pool = sample_pool().await;
        let tables =
            SchemaInspector::describe_schema(&pool, BackendKind::Sqlite, None, Some("missing"))
                .await
                .unwrap();
        assert!(tables.is_empty());
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_rejected() {
        let pool = sample_pool().await;
        let err = SchemaInspector::describe_schema(&pool, BackendKind::Postgres, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_closed_handle_is_schema_error() {
        let pool = sample_pool().await;
        pool.close().await;
        let err = SchemaInspector::describe_schema(&pool, BackendKind::Sqlite, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Schema { .. }));
    }
}
