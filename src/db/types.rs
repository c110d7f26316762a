//! Row decoding into backend-agnostic [`ColumnValue`]s.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies the driver-reported column type
//! 2. Database-specific decoders extract the value for that category
//!
//! SQL NULL is detected on the raw value before any typed decode, so a
//! null is always [`ColumnValue::Null`] and never an empty string. Values
//! that cannot be decoded are logged and reported as null.

use crate::models::{BackendKind, ColumnValue};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Temporal,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, kind: BackendKind) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity stores plain numbers
        if kind == BackendKind::Sqlite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("timestamp")
        || lower.contains("datetime")
        || lower == "date"
        || lower == "time"
        || lower == "timetz"
    {
        return TypeCategory::Temporal;
    }

    if lower == "interval" || lower == "point" {
        return TypeCategory::Unknown;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") || lower.contains("serial") || lower == "year" {
        return TypeCategory::Integer;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" || lower == "enum" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

/// Convert a byte sequence to text: UTF-8 when valid, base64 otherwise.
pub fn binary_to_value(bytes: &[u8]) -> ColumnValue {
    match std::str::from_utf8(bytes) {
        Ok(s) => ColumnValue::BinaryAsText(s.to_string()),
        Err(_) => ColumnValue::BinaryAsText(STANDARD.encode(bytes)),
    }
}

fn float_value(v: f64) -> ColumnValue {
    ColumnValue::Float(v)
}

fn undecodable(kind: BackendKind, column: &str, type_name: &str) -> ColumnValue {
    tracing::warn!(
        db_type = %kind,
        column = %column,
        type_name = %type_name,
        "Failed to decode column value, returning null"
    );
    ColumnValue::Null
}

// =============================================================================
// Row Decoding Trait
// =============================================================================

/// Decode a driver row into column names and positional values.
pub trait RowToValues {
    fn column_names(&self) -> Vec<String>;
    fn to_values(&self) -> Vec<ColumnValue>;
}

macro_rules! impl_row_to_values {
    ($row:ty, $kind:expr, $decoder:path) => {
        impl RowToValues for $row {
            fn column_names(&self) -> Vec<String> {
                self.columns().iter().map(|c| c.name().to_string()).collect()
            }

            fn to_values(&self) -> Vec<ColumnValue> {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let is_null = self
                            .try_get_raw(idx)
                            .map(|raw| raw.is_null())
                            .unwrap_or(true);
                        if is_null {
                            return ColumnValue::Null;
                        }
                        let type_name = col.type_info().name();
                        let category = categorize_type(type_name, $kind);
                        $decoder(self, idx, type_name, category)
                            .unwrap_or_else(|| undecodable($kind, col.name(), type_name))
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_values!(MySqlRow, BackendKind::Mysql, mysql::decode_column);
impl_row_to_values!(PgRow, BackendKind::Postgres, postgres::decode_column);
impl_row_to_values!(SqliteRow, BackendKind::Sqlite, sqlite::decode_column);

// =============================================================================
// Database-Specific Decoders
// =============================================================================
//
// Each decoder is only called for non-null values and returns `None` when
// the value cannot be represented.

mod mysql {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Option<ColumnValue> {
        match category {
            TypeCategory::Decimal => row
                .try_get::<BigDecimal, _>(idx)
                .ok()
                .map(|v| ColumnValue::Text(v.to_string())),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(ColumnValue::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => row
                .try_get::<Vec<u8>, _>(idx)
                .ok()
                .map(|v| binary_to_value(&v)),
            TypeCategory::Json => row
                .try_get::<serde_json::Value, _>(idx)
                .ok()
                .map(|v| ColumnValue::Text(v.to_string())),
            TypeCategory::Temporal => decode_temporal(row, idx, type_name),
            _ => decode_text(row, idx),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Option<ColumnValue> {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Some(ColumnValue::Integer(v));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(ColumnValue::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(ColumnValue::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<i8, _>(idx) {
            return Some(ColumnValue::Integer(v.into()));
        }
        // Unsigned types; BIGINT UNSIGNED above i64::MAX is rendered as text
        if let Ok(v) = row.try_get::<u64, _>(idx) {
            return Some(
                i64::try_from(v)
                    .map(ColumnValue::Integer)
                    .unwrap_or_else(|_| ColumnValue::Text(v.to_string())),
            );
        }
        if let Ok(v) = row.try_get::<u32, _>(idx) {
            return Some(ColumnValue::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<u16, _>(idx) {
            return Some(ColumnValue::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<u8, _>(idx) {
            return Some(ColumnValue::Integer(v.into()));
        }
        None
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Option<ColumnValue> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(float_value(v));
        }
        row.try_get::<f32, _>(idx).ok().map(|v| float_value(v.into()))
    }

    fn decode_temporal(row: &MySqlRow, idx: usize, type_name: &str) -> Option<ColumnValue> {
        let text = match type_name.to_uppercase().as_str() {
            "TIMESTAMP" => row
                .try_get::<DateTime<Utc>, _>(idx)
                .ok()
                .map(|v| v.to_rfc3339()),
            "DATE" => row.try_get::<NaiveDate, _>(idx).ok().map(|v| v.to_string()),
            "TIME" => row.try_get::<NaiveTime, _>(idx).ok().map(|v| v.to_string()),
            _ => row
                .try_get::<NaiveDateTime, _>(idx)
                .ok()
                .map(|v| v.to_string()),
        };
        text.map(ColumnValue::Text)
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> Option<ColumnValue> {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Some(ColumnValue::Text(v));
        }
        // Binary-collated strings and other byte-like values
        row.try_get_unchecked::<Vec<u8>, _>(idx)
            .ok()
            .map(|v| binary_to_value(&v))
    }
}

mod postgres {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Option<ColumnValue> {
        match category {
            TypeCategory::Decimal => row
                .try_get::<BigDecimal, _>(idx)
                .ok()
                .map(|v| ColumnValue::Text(v.to_string())),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(ColumnValue::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => row
                .try_get::<Vec<u8>, _>(idx)
                .ok()
                .map(|v| binary_to_value(&v)),
            TypeCategory::Json => row
                .try_get::<serde_json::Value, _>(idx)
                .ok()
                .map(|v| ColumnValue::Text(v.to_string())),
            TypeCategory::Uuid => row
                .try_get::<uuid::Uuid, _>(idx)
                .ok()
                .map(|v| ColumnValue::Text(v.to_string())),
            TypeCategory::Temporal => decode_temporal(row, idx, type_name),
            _ => decode_text(row, idx),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<ColumnValue> {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Some(ColumnValue::Integer(v));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(ColumnValue::Integer(v.into()));
        }
        row.try_get::<i16, _>(idx)
            .ok()
            .map(|v| ColumnValue::Integer(v.into()))
    }

    fn decode_float(row: &PgRow, idx: usize) -> Option<ColumnValue> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(float_value(v));
        }
        row.try_get::<f32, _>(idx).ok().map(|v| float_value(v.into()))
    }

    fn decode_temporal(row: &PgRow, idx: usize, type_name: &str) -> Option<ColumnValue> {
        let text = match type_name.to_uppercase().as_str() {
            "TIMESTAMPTZ" => row
                .try_get::<DateTime<Utc>, _>(idx)
                .ok()
                .map(|v| v.to_rfc3339()),
            "TIMESTAMP" => row
                .try_get::<NaiveDateTime, _>(idx)
                .ok()
                .map(|v| v.to_string()),
            "DATE" => row.try_get::<NaiveDate, _>(idx).ok().map(|v| v.to_string()),
            "TIME" => row.try_get::<NaiveTime, _>(idx).ok().map(|v| v.to_string()),
            _ => None,
        };
        text.map(ColumnValue::Text)
    }

    fn decode_text(row: &PgRow, idx: usize) -> Option<ColumnValue> {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Some(ColumnValue::Text(v));
        }
        // User-defined enums are sent as their label
        row.try_get_unchecked::<String, _>(idx)
            .ok()
            .map(ColumnValue::Text)
    }
}

mod sqlite {
    use super::*;

    /// SQLite is dynamically typed: the declared type only matters for
    /// booleans, otherwise the value's storage class decides.
    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        _type_name: &str,
        category: TypeCategory,
    ) -> Option<ColumnValue> {
        if category == TypeCategory::Boolean {
            if let Ok(v) = row.try_get::<bool, _>(idx) {
                return Some(ColumnValue::Bool(v));
            }
        }

        let storage = row
            .try_get_raw(idx)
            .ok()
            .map(|raw| raw.type_info().name().to_string())
            .unwrap_or_default();

        match storage.as_str() {
            "INTEGER" => row
                .try_get_unchecked::<i64, _>(idx)
                .ok()
                .map(ColumnValue::Integer),
            "REAL" => row.try_get_unchecked::<f64, _>(idx).ok().map(float_value),
            "BLOB" => row
                .try_get_unchecked::<Vec<u8>, _>(idx)
                .ok()
                .map(|v| binary_to_value(&v)),
            _ => row
                .try_get_unchecked::<String, _>(idx)
                .ok()
                .map(ColumnValue::Text),
        }
    }
}
