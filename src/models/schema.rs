//! Schema-related data models.
//!
//! The same shape is produced for every backend.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Table,
    View,
}

impl TableKind {
    /// Parse table kind from a catalog-specific string.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "view" | "system view" => Self::View,
            // "table", "base table"
            _ => Self::Table,
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::View => write!(f, "view"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub schema: String,
    #[serde(rename = "type")]
    pub kind: TableKind,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, schema: impl Into<String>, kind: TableKind) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            kind,
            columns: Vec::new(),
        }
    }

    pub fn with_columns(mut self, columns: Vec<ColumnInfo>) -> Self {
        self.columns = columns;
        self
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    /// Type as reported by the backend (e.g., `int(11)`, `character varying(30)`)
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            primary_key: false,
            default_value: None,
            comment: None,
        }
    }

    pub fn with_primary_key(mut self, is_pk: bool) -> Self {
        self.primary_key = is_pk;
        self
    }

    /// Set the default value. Empty strings are treated as absent.
    pub fn with_default(mut self, default_value: Option<String>) -> Self {
        self.default_value = default_value.filter(|v| !v.is_empty());
        self
    }

    /// Set the comment. Empty strings are treated as absent.
    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment.filter(|c| !c.is_empty());
        self
    }
}
