//! Versioned schema registry. The source database appends one immutable
//! entry per DDL change into the `pgrelay.schema_log` table; downstream
//! sinks replay those entries strictly in version order per schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod diff;
pub mod memory;
pub mod postgres;
pub mod store;

pub use diff::{compute_schema_diff, ColumnDiff, Diff, TableDiff, ValueChange};
pub use store::{SchemaLogError, SchemaLogStore};

/// Schema owned by the relay on the source database.
pub const SCHEMA_NAME: &str = "pgrelay";
/// Table the schema log is stored in.
pub const TABLE_NAME: &str = "schema_log";

/// One version of one schema. Immutable once inserted; only `acked` flips
/// after downstream processors have applied the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Globally unique, lexicographically sortable.
    pub id: String,
    /// Monotonically increasing per schema.
    pub version: i64,
    pub schema_name: String,
    pub created_at: DateTime<Utc>,
    pub schema: SchemaView,
    pub acked: bool,
}

impl LogEntry {
    pub fn initial(&self) -> bool {
        self.version == 0
    }
}

/// Snapshot of all tables in a schema at one version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemaView {
    pub tables: Vec<Table>,
}

impl SchemaView {
    pub fn table_by_oid(&self, oid: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.oid == oid)
    }

    pub fn table_by_name(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    /// Relation oid on the source. Stable across renames, which is how
    /// renames are told apart from a drop-and-create.
    #[serde(default)]
    pub oid: String,
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub primary_key_columns: Vec<String>,
}

impl Table {
    pub fn column_by_id(&self, id: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Column {
    /// Immutable column identifier, stable across renames. Search sinks key
    /// their field mappings on it.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}
