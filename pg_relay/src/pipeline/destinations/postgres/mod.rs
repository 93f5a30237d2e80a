use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::conversions::change_event::{ChangeAction, ChangeEvent};
use crate::pg::{quote_identifier, quote_qualified_identifier, Querier, Query};
use crate::pipeline::batching::Batch;
use crate::schemalog::SchemaLogStore;

use super::{Sink, SinkError};

pub mod ddl;

pub use ddl::{schema_diff_to_queries, DdlAdapter, DdlError};

impl From<DdlError> for SinkError {
    fn from(err: DdlError) -> Self {
        match err {
            DdlError::SchemaLog(inner) => inner.into(),
        }
    }
}

/// Replays events into a downstream postgres database: upserts for inserts
/// and updates, deletes by replica identity, and adapter-produced DDL for
/// schema changes.
pub struct PostgresSink {
    querier: Arc<dyn Querier>,
    ddl_adapter: DdlAdapter,
}

impl PostgresSink {
    pub fn new(querier: Arc<dyn Querier>, schema_log: Arc<dyn SchemaLogStore>) -> Self {
        Self {
            querier,
            ddl_adapter: DdlAdapter::new(schema_log),
        }
    }

    fn upsert_query(event: &ChangeEvent) -> Query {
        let table = quote_qualified_identifier(&event.schema, &event.table);
        let columns: Vec<String> = event
            .columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .collect();
        let placeholders: Vec<String> =
            (1..=event.columns.len()).map(|i| format!("${i}")).collect();

        let pk_columns: Vec<String> = event
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| quote_identifier(&c.name))
            .collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );
        if !pk_columns.is_empty() {
            let assignments: Vec<String> = event
                .columns
                .iter()
                .filter(|c| !c.primary_key)
                .map(|c| {
                    let name = quote_identifier(&c.name);
                    format!("{name} = EXCLUDED.{name}")
                })
                .collect();
            if assignments.is_empty() {
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO NOTHING",
                    pk_columns.join(", ")
                ));
            } else {
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    pk_columns.join(", "),
                    assignments.join(", ")
                ));
            }
        }

        Query::with_params(sql, event.columns.iter().map(|c| c.value.clone()).collect())
    }

    fn delete_query(event: &ChangeEvent) -> Query {
        let table = quote_qualified_identifier(&event.schema, &event.table);
        let predicates: Vec<String> = event
            .identity
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ${}", quote_identifier(&c.name), i + 1))
            .collect();

        Query::with_params(
            format!("DELETE FROM {} WHERE {}", table, predicates.join(" AND ")),
            event.identity.iter().map(|c| c.value.clone()).collect(),
        )
    }

    fn truncate_query(event: &ChangeEvent) -> Query {
        Query::new(format!(
            "TRUNCATE {}",
            quote_qualified_identifier(&event.schema, &event.table)
        ))
    }
}

#[async_trait]
impl Sink for PostgresSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn write_batch(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut queries = vec![];
        for event in batch.events() {
            match event.action {
                ChangeAction::Insert | ChangeAction::Update => {
                    queries.push(Self::upsert_query(event));
                }
                ChangeAction::Delete => queries.push(Self::delete_query(event)),
                ChangeAction::Truncate => queries.push(Self::truncate_query(event)),
                ChangeAction::Ddl => {
                    let Some(entry) = event.schema_log.as_deref() else {
                        continue;
                    };
                    let ddl = self.ddl_adapter.log_entry_to_queries(entry).await?;
                    info!(
                        schema = %entry.schema_name,
                        version = entry.version,
                        queries = ddl.len(),
                        "applying schema change"
                    );
                    queries.extend(ddl);
                }
            }
        }
        if queries.is_empty() {
            return Ok(());
        }

        debug!(queries = queries.len(), hi = %batch.hi(), "writing batch to postgres");
        self.querier.execute_in_tx(&queries).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::conversions::cell::CellValue;
    use crate::conversions::change_event::EventColumn;
    use crate::pg::{QuerierError, Row};
    use crate::position::CommitPosition;
    use crate::schemalog::memory::MemorySchemaLogStore;

    #[derive(Default)]
    struct RecordingQuerier {
        transactions: Mutex<Vec<Vec<Query>>>,
    }

    #[async_trait]
    impl Querier for RecordingQuerier {
        async fn query(&self, _query: &Query) -> Result<Vec<Row>, QuerierError> {
            Ok(vec![])
        }

        async fn execute(&self, _query: &Query) -> Result<u64, QuerierError> {
            Ok(0)
        }

        async fn execute_in_tx(&self, queries: &[Query]) -> Result<(), QuerierError> {
            self.transactions.lock().unwrap().push(queries.to_vec());
            Ok(())
        }

        async fn close(&self) -> Result<(), QuerierError> {
            Ok(())
        }
    }

    fn column(name: &str, value: CellValue, primary_key: bool) -> EventColumn {
        EventColumn {
            id: None,
            name: name.to_string(),
            type_name: "text".to_string(),
            value,
            primary_key,
        }
    }

    fn sink() -> (Arc<RecordingQuerier>, PostgresSink) {
        let querier = Arc::new(RecordingQuerier::default());
        let sink = PostgresSink::new(querier.clone(), Arc::new(MemorySchemaLogStore::new()));
        (querier, sink)
    }

    #[tokio::test]
    async fn upserts_on_the_primary_key() {
        let (querier, sink) = sink();
        let event = ChangeEvent {
            action: ChangeAction::Insert,
            schema: "public".to_string(),
            table: "users".to_string(),
            columns: vec![
                column("id", CellValue::Int(1), true),
                column("name", CellValue::String("ada".to_string()), false),
            ],
            identity: vec![],
            schema_log: None,
            position: CommitPosition::new(1),
        };

        sink.write_batch(&Batch::from_events(vec![event]))
            .await
            .unwrap();

        let transactions = querier.transactions.lock().unwrap();
        let query = &transactions[0][0];
        assert_eq!(
            query.sql,
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\") VALUES ($1, $2) \
             ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""
        );
        assert_eq!(
            query.params,
            vec![CellValue::Int(1), CellValue::String("ada".to_string())]
        );
    }

    #[tokio::test]
    async fn hstore_and_array_columns_bind_as_params() {
        let (querier, sink) = sink();
        let event = ChangeEvent {
            action: ChangeAction::Insert,
            schema: "public".to_string(),
            table: "users".to_string(),
            columns: vec![
                column("id", CellValue::Int(1), true),
                column(
                    "attrs",
                    CellValue::Hstore(vec![("k".to_string(), Some("v".to_string()))]),
                    false,
                ),
                column(
                    "tags",
                    CellValue::Array(vec![
                        CellValue::String("a".to_string()),
                        CellValue::String("b".to_string()),
                    ]),
                    false,
                ),
            ],
            identity: vec![],
            schema_log: None,
            position: CommitPosition::new(1),
        };

        sink.write_batch(&Batch::from_events(vec![event]))
            .await
            .unwrap();

        let transactions = querier.transactions.lock().unwrap();
        let query = &transactions[0][0];
        assert_eq!(
            query.params,
            vec![
                CellValue::Int(1),
                CellValue::Hstore(vec![("k".to_string(), Some("v".to_string()))]),
                CellValue::Array(vec![
                    CellValue::String("a".to_string()),
                    CellValue::String("b".to_string()),
                ]),
            ]
        );
    }

    #[tokio::test]
    async fn deletes_by_identity_columns() {
        let (querier, sink) = sink();
        let event = ChangeEvent {
            action: ChangeAction::Delete,
            schema: "public".to_string(),
            table: "users".to_string(),
            columns: vec![],
            identity: vec![column("id", CellValue::Int(7), true)],
            schema_log: None,
            position: CommitPosition::new(2),
        };

        sink.write_batch(&Batch::from_events(vec![event]))
            .await
            .unwrap();

        let transactions = querier.transactions.lock().unwrap();
        assert_eq!(
            transactions[0][0].sql,
            "DELETE FROM \"public\".\"users\" WHERE \"id\" = $1"
        );
    }

    #[tokio::test]
    async fn a_batch_is_one_transaction() {
        let (querier, sink) = sink();
        let events = vec![
            ChangeEvent {
                action: ChangeAction::Insert,
                schema: "public".to_string(),
                table: "users".to_string(),
                columns: vec![column("id", CellValue::Int(1), true)],
                identity: vec![],
                schema_log: None,
                position: CommitPosition::new(1),
            },
            ChangeEvent {
                action: ChangeAction::Delete,
                schema: "public".to_string(),
                table: "users".to_string(),
                columns: vec![],
                identity: vec![column("id", CellValue::Int(2), true)],
                schema_log: None,
                position: CommitPosition::new(2),
            },
        ];

        sink.write_batch(&Batch::from_events(events)).await.unwrap();

        let transactions = querier.transactions.lock().unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].len(), 2);
    }

    #[tokio::test]
    async fn ddl_events_run_the_adapter_queries() {
        let store = Arc::new(MemorySchemaLogStore::new());
        let entry = store
            .insert(
                "public",
                crate::schemalog::SchemaView {
                    tables: vec![crate::schemalog::Table {
                        oid: "1".to_string(),
                        name: "t1".to_string(),
                        columns: vec![crate::schemalog::Column {
                            id: "c-1".to_string(),
                            name: "id".to_string(),
                            data_type: "uuid".to_string(),
                            ..Default::default()
                        }],
                        primary_key_columns: vec![],
                    }],
                },
            )
            .await
            .unwrap();

        let querier = Arc::new(RecordingQuerier::default());
        let sink = PostgresSink::new(querier.clone(), store);

        sink.write_batch(&Batch::from_events(vec![ChangeEvent::ddl(
            entry,
            CommitPosition::new(5),
        )]))
        .await
        .unwrap();

        let transactions = querier.transactions.lock().unwrap();
        assert!(transactions[0][0]
            .sql
            .starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"t1\""));
    }
}
