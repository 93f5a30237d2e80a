use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::conversions::cell::CellValue;
use crate::conversions::change_event::{ChangeAction, ChangeEvent, EventColumn};
use crate::pg::{quote_qualified_identifier, Querier, QuerierError, Query};
use crate::pipeline::processors::{Processor, ProcessorError};
use crate::position::CommitPosition;
use crate::schemalog::{Column, SchemaLogError, SchemaLogStore, SchemaView, Table};
use crate::table::TableName;

const COLUMNS_QUERY: &str = "SELECT c.table_name, c.column_name, c.data_type, c.is_nullable, c.column_default, c.ordinal_position \
     FROM information_schema.columns c WHERE c.table_schema = $1 \
     ORDER BY c.table_name, c.ordinal_position";

const PRIMARY_KEYS_QUERY: &str = "SELECT tc.table_name, kcu.column_name \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu ON tc.constraint_name = kcu.constraint_name \
     WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("querier error: {0}")]
    Querier(#[from] QuerierError),

    #[error("schema log error: {0}")]
    SchemaLog(#[from] SchemaLogError),

    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),
}

/// Replays existing data through the pipeline: one schema-log entry per
/// schema (so sinks shape themselves first) followed by an insert event per
/// existing row. Snapshot events all carry the zero position; nothing is
/// acknowledged to the source until incremental streaming takes over.
pub struct SnapshotGenerator<P: Processor> {
    querier: Arc<dyn Querier>,
    schema_log: Arc<dyn SchemaLogStore>,
    processor: P,
}

impl<P: Processor> SnapshotGenerator<P> {
    pub fn new(
        querier: Arc<dyn Querier>,
        schema_log: Arc<dyn SchemaLogStore>,
        processor: P,
    ) -> Self {
        Self {
            querier,
            schema_log,
            processor,
        }
    }

    pub async fn snapshot(&self, tables: &[TableName]) -> Result<(), SnapshotError> {
        let schemas: HashSet<&str> = tables.iter().map(|t| t.schema.as_str()).collect();
        let mut ordered: Vec<&str> = schemas.into_iter().collect();
        ordered.sort_unstable();

        for schema in ordered {
            let view = self.capture_schema(schema, tables).await?;
            let entry = self.schema_log.insert(schema, view).await?;
            info!(schema, version = entry.version, "captured schema snapshot");
            self.processor
                .process_event(ChangeEvent::ddl(entry, CommitPosition::default()))
                .await?;
        }

        for table in tables {
            self.snapshot_table(table).await?;
        }
        Ok(())
    }

    async fn capture_schema(
        &self,
        schema: &str,
        tables: &[TableName],
    ) -> Result<SchemaView, SnapshotError> {
        let wanted: HashSet<&str> = tables
            .iter()
            .filter(|t| t.schema == schema)
            .map(|t| t.name.as_str())
            .collect();

        let rows = self
            .querier
            .query(&Query::with_params(
                COLUMNS_QUERY,
                vec![CellValue::String(schema.to_string())],
            ))
            .await?;

        let mut columns_by_table: BTreeMap<String, Vec<Column>> = BTreeMap::new();
        for row in &rows {
            let Some(CellValue::String(table)) = row.get("table_name") else {
                continue;
            };
            if !wanted.contains(table.as_str()) {
                continue;
            }
            let name = match row.get("column_name") {
                Some(CellValue::String(name)) => name.clone(),
                _ => continue,
            };
            let data_type = match row.get("data_type") {
                Some(CellValue::String(t)) => t.clone(),
                _ => continue,
            };
            let nullable = matches!(
                row.get("is_nullable"),
                Some(CellValue::String(s)) if s == "YES"
            );
            let default_value = match row.get("column_default") {
                Some(CellValue::String(d)) => Some(d.clone()),
                _ => None,
            };
            let ordinal = match row.get("ordinal_position") {
                Some(CellValue::Int(i)) => *i,
                _ => 0,
            };

            columns_by_table
                .entry(table.clone())
                .or_default()
                .push(Column {
                    // Stable across snapshots of the same table layout.
                    id: format!("{schema}.{table}.{ordinal}"),
                    name,
                    data_type,
                    nullable,
                    unique: false,
                    default_value,
                });
        }

        let pk_rows = self
            .querier
            .query(&Query::with_params(
                PRIMARY_KEYS_QUERY,
                vec![CellValue::String(schema.to_string())],
            ))
            .await?;
        let mut pks_by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in &pk_rows {
            if let (Some(CellValue::String(table)), Some(CellValue::String(column))) =
                (row.get("table_name"), row.get("column_name"))
            {
                pks_by_table
                    .entry(table.clone())
                    .or_default()
                    .push(column.clone());
            }
        }

        Ok(SchemaView {
            tables: columns_by_table
                .into_iter()
                .map(|(name, columns)| Table {
                    oid: format!("{schema}.{name}"),
                    primary_key_columns: pks_by_table.remove(&name).unwrap_or_default(),
                    name,
                    columns,
                })
                .collect(),
        })
    }

    async fn snapshot_table(&self, table: &TableName) -> Result<(), SnapshotError> {
        let rows = self
            .querier
            .query(&Query::new(format!(
                "SELECT * FROM {}",
                quote_qualified_identifier(&table.schema, &table.name)
            )))
            .await?;
        info!(table = %table, rows = rows.len(), "snapshotting table contents");

        for row in rows {
            let columns: Vec<EventColumn> = row
                .values
                .into_iter()
                .map(|(name, value)| EventColumn {
                    id: None,
                    name,
                    type_name: String::new(),
                    value,
                    primary_key: false,
                })
                .collect();

            self.processor
                .process_event(ChangeEvent {
                    action: ChangeAction::Insert,
                    schema: table.schema.clone(),
                    table: table.name.clone(),
                    columns,
                    identity: vec![],
                    schema_log: None,
                    position: CommitPosition::default(),
                })
                .await?;
        }
        Ok(())
    }
}
