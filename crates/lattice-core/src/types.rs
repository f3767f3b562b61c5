//! Domain types shared by the row store, the embedder and the driver.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Primary key of a source row. Supabase tables use either integer or
/// text/uuid keys, so both are accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowId {
    Int(i64),
    Text(String),
}

impl RowId {
    /// Projects a JSON id value. Non-integral numbers keep their textual form.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                Some(n.as_i64().map_or_else(|| Self::Text(n.to_string()), Self::Int))
            }
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RowId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for RowId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Expected JSON shape of a text-source column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    /// Array of strings, joined with `", "`.
    TextList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceField {
    pub column: String,
    #[serde(default)]
    pub kind: FieldKind,
}

impl SourceField {
    pub fn text(column: &str) -> Self {
        Self { column: column.to_string(), kind: FieldKind::Text }
    }

    pub fn text_list(column: &str) -> Self {
        Self { column: column.to_string(), kind: FieldKind::TextList }
    }

    fn project(&self, row: &Value) -> Option<String> {
        let value = row.get(&self.column)?;
        match (self.kind, value) {
            (FieldKind::Text, Value::String(s)) => Some(s.clone()),
            (FieldKind::TextList, Value::Array(items)) => {
                let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                if parts.is_empty() { None } else { Some(parts.join(", ")) }
            }
            (_, Value::Null) => None,
            (kind, other) => {
                tracing::debug!(
                    column = %self.column,
                    ?kind,
                    value = %other,
                    "field has unexpected type; skipping"
                );
                None
            }
        }
    }
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_embedding_column() -> String {
    "embedding".to_string()
}

/// One table to backfill: where the text comes from and where the vector goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillTarget {
    pub name: String,
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_embedding_column")]
    pub embedding_column: String,
    pub fields: Vec<SourceField>,
}

impl BackfillTarget {
    pub fn new(name: &str, table: &str, fields: Vec<SourceField>) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            id_column: default_id_column(),
            embedding_column: default_embedding_column(),
            fields,
        }
    }

    pub fn field_columns(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.column.clone()).collect()
    }

    /// Typed projection of a raw row. Returns `None` when the id column is
    /// missing or not a scalar.
    pub fn project_row(&self, row: &Value) -> Option<SourceRow> {
        let id = row.get(&self.id_column).and_then(RowId::from_json)?;
        let values = self.fields.iter().map(|field| field.project(row)).collect();
        Some(SourceRow { id, values })
    }
}

/// A fetched row reduced to its id and the configured text fields, in
/// configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub id: RowId,
    pub values: Vec<Option<String>>,
}

impl SourceRow {
    /// Joins the present field values into the prompt sent to the embedder.
    /// Empty when no field carries text.
    pub fn prompt_text(&self) -> String {
        self.values
            .iter()
            .flatten()
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One page of pending rows.
#[derive(Debug, Clone, Default)]
pub struct RowPage {
    pub rows: Vec<SourceRow>,
    /// Raw rows returned by the store, including ones dropped by projection.
    pub scanned: usize,
    /// Keyset cursor for the next fetch.
    pub last_id: Option<RowId>,
}
