use postgres_protocol::message::backend::{
    DeleteBody as DeleteBodyProto, InsertBody as InsertBodyProto, TupleData,
    UpdateBody as UpdateBodyProto,
};
use serde_json::json;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::position::CommitPosition;
use crate::schemalog::LogEntry;
use crate::table::{ColumnSchema, TableSchema};

use super::cell::{CellDecodeError, CellDecoder, CellValue};

#[derive(Debug, Error)]
pub enum ChangeEventConversionError {
    #[error("old tuple not present")]
    MissingOldTuple,

    #[error("tuple has {got} values but relation has {want} columns")]
    ColumnCountMismatch { want: usize, got: usize },

    #[error("unable to decode tuple data: {0}")]
    InvalidData(#[from] CellDecodeError),
}

impl Classify for ChangeEventConversionError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
    Truncate,
    Ddl,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "I",
            ChangeAction::Update => "U",
            ChangeAction::Delete => "D",
            ChangeAction::Truncate => "T",
            ChangeAction::Ddl => "DDL",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventColumn {
    /// Immutable identifier stamped by the injector; stable across renames.
    pub id: Option<String>,
    pub name: String,
    /// Declared source type, e.g. `int8` or `text`.
    pub type_name: String,
    pub value: CellValue,
    pub primary_key: bool,
}

impl EventColumn {
    pub fn size_bytes(&self) -> usize {
        self.name.len() + self.type_name.len() + self.value.size_bytes()
    }
}

/// One row-level change in canonical form, as emitted by the assembler and
/// consumed by processors and sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub schema: String,
    pub table: String,
    /// New values. Empty for deletes and truncates.
    pub columns: Vec<EventColumn>,
    /// Replica-identity (old) values for updates and deletes.
    pub identity: Vec<EventColumn>,
    /// Payload of a [`ChangeAction::Ddl`] event.
    pub schema_log: Option<Box<LogEntry>>,
    pub position: CommitPosition,
}

impl ChangeEvent {
    pub fn from_insert_proto(
        evt: &InsertBodyProto,
        table_schema: &TableSchema,
        decoder: &CellDecoder,
        position: CommitPosition,
    ) -> Result<ChangeEvent, ChangeEventConversionError> {
        Ok(ChangeEvent {
            action: ChangeAction::Insert,
            schema: table_schema.table_name.schema.clone(),
            table: table_schema.table_name.name.clone(),
            columns: decode_tuple(
                &table_schema.column_schemas,
                evt.tuple().tuple_data(),
                decoder,
            )?,
            identity: vec![],
            schema_log: None,
            position,
        })
    }

    pub fn from_update_proto(
        evt: &UpdateBodyProto,
        table_schema: &TableSchema,
        decoder: &CellDecoder,
        position: CommitPosition,
    ) -> Result<ChangeEvent, ChangeEventConversionError> {
        // The old tuple is only present when the replica identity changed
        // (or is FULL); otherwise the key columns of the new tuple identify
        // the row.
        let identity = match evt.old_tuple().or_else(|| evt.key_tuple()) {
            Some(old) => decode_tuple(&table_schema.column_schemas, old.tuple_data(), decoder)?
                .into_iter()
                .filter(|c| !c.value.is_null())
                .collect(),
            None => vec![],
        };

        Ok(ChangeEvent {
            action: ChangeAction::Update,
            schema: table_schema.table_name.schema.clone(),
            table: table_schema.table_name.name.clone(),
            columns: decode_tuple(
                &table_schema.column_schemas,
                evt.new_tuple().tuple_data(),
                decoder,
            )?,
            identity,
            schema_log: None,
            position,
        })
    }

    pub fn from_delete_proto(
        evt: &DeleteBodyProto,
        table_schema: &TableSchema,
        decoder: &CellDecoder,
        position: CommitPosition,
    ) -> Result<ChangeEvent, ChangeEventConversionError> {
        let old = evt
            .old_tuple()
            .or_else(|| evt.key_tuple())
            .ok_or(ChangeEventConversionError::MissingOldTuple)?;

        Ok(ChangeEvent {
            action: ChangeAction::Delete,
            schema: table_schema.table_name.schema.clone(),
            table: table_schema.table_name.name.clone(),
            columns: vec![],
            identity: decode_tuple(&table_schema.column_schemas, old.tuple_data(), decoder)?
                .into_iter()
                .filter(|c| !c.value.is_null())
                .collect(),
            schema_log: None,
            position,
        })
    }

    pub fn truncate(table_schema: &TableSchema, position: CommitPosition) -> ChangeEvent {
        ChangeEvent {
            action: ChangeAction::Truncate,
            schema: table_schema.table_name.schema.clone(),
            table: table_schema.table_name.name.clone(),
            columns: vec![],
            identity: vec![],
            schema_log: None,
            position,
        }
    }

    pub fn ddl(entry: LogEntry, position: CommitPosition) -> ChangeEvent {
        ChangeEvent {
            action: ChangeAction::Ddl,
            schema: entry.schema_name.clone(),
            table: crate::schemalog::TABLE_NAME.to_string(),
            columns: vec![],
            identity: vec![],
            schema_log: Some(Box::new(entry)),
            position,
        }
    }

    /// Events that must flush in their own singleton batch so schema changes
    /// never reorder against row changes.
    pub fn is_batch_boundary(&self) -> bool {
        matches!(self.action, ChangeAction::Truncate | ChangeAction::Ddl)
    }

    /// Columns identifying the affected row: the stamped primary-key columns
    /// of the new image, falling back to the replica identity.
    pub fn key_columns(&self) -> Vec<&EventColumn> {
        let pk: Vec<&EventColumn> = self.columns.iter().filter(|c| c.primary_key).collect();
        if !pk.is_empty() {
            return pk;
        }
        self.identity.iter().collect()
    }

    /// `schema/table/pk` key used by the kafka sink and the search retrier.
    pub fn key(&self) -> String {
        let pk_values: Vec<String> = self
            .key_columns()
            .iter()
            .map(|c| match &c.value {
                CellValue::String(s) => s.clone(),
                other => other.to_json().to_string(),
            })
            .collect();
        format!("{}/{}/{}", self.schema, self.table, pk_values.join("/"))
    }

    /// Rough in-memory weight, used by the batch queue byte accounting.
    pub fn size_bytes(&self) -> usize {
        let columns: usize = self.columns.iter().map(EventColumn::size_bytes).sum();
        let identity: usize = self.identity.iter().map(EventColumn::size_bytes).sum();
        self.schema.len() + self.table.len() + columns + identity + 16
    }

    /// Canonical JSON payload shared by the kafka and webhook sinks.
    pub fn to_json(&self) -> serde_json::Value {
        let columns: Vec<serde_json::Value> = self.columns.iter().map(column_json).collect();
        let identity: Vec<serde_json::Value> = self.identity.iter().map(column_json).collect();
        json!({
            "action": self.action.as_str(),
            "schema": self.schema,
            "table": self.table,
            "columns": columns,
            "identity": identity,
        })
    }
}

fn column_json(column: &EventColumn) -> serde_json::Value {
    json!({
        "id": column.id,
        "name": column.name,
        "type": column.type_name,
        "value": column.value.to_json(),
    })
}

fn decode_tuple(
    column_schemas: &[ColumnSchema],
    tuple_data: &[TupleData],
    decoder: &CellDecoder,
) -> Result<Vec<EventColumn>, ChangeEventConversionError> {
    if column_schemas.len() != tuple_data.len() {
        return Err(ChangeEventConversionError::ColumnCountMismatch {
            want: column_schemas.len(),
            got: tuple_data.len(),
        });
    }

    let mut columns = Vec::with_capacity(column_schemas.len());
    for (column_schema, data) in column_schemas.iter().zip(tuple_data) {
        columns.push(EventColumn {
            id: None,
            name: column_schema.name.clone(),
            type_name: column_schema.type_name.clone(),
            value: decoder.decode(column_schema.type_id as u32, data)?,
            primary_key: column_schema.primary_key,
        });
    }
    Ok(columns)
}
