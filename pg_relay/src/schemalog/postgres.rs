use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::conversions::cell::CellValue;
use crate::pg::{Querier, QuerierError, Query, Row};

use super::{LogEntry, SchemaLogError, SchemaLogStore, SchemaView};

const INSERT_QUERY: &str = "INSERT INTO pgrelay.schema_log (id, version, schema_name, created_at, schema, acked) \
     SELECT $1, COALESCE(MAX(version) + 1, 0), $2, now(), $3, false \
     FROM pgrelay.schema_log WHERE schema_name = $2 \
     RETURNING id, version, schema_name, created_at, schema, acked";

const FETCH_QUERY: &str = "SELECT id, version, schema_name, created_at, schema, acked \
     FROM pgrelay.schema_log WHERE schema_name = $1 AND version = $2";

const FETCH_LAST_QUERY: &str = "SELECT id, version, schema_name, created_at, schema, acked \
     FROM pgrelay.schema_log WHERE schema_name = $1 \
     ORDER BY version DESC LIMIT 1";

const FETCH_LAST_ACKED_QUERY: &str = "SELECT id, version, schema_name, created_at, schema, acked \
     FROM pgrelay.schema_log WHERE schema_name = $1 AND acked \
     ORDER BY version DESC LIMIT 1";

const ACK_QUERY: &str = "UPDATE pgrelay.schema_log SET acked = true WHERE id = $1";

/// Schema log backed by the `pgrelay.schema_log` table on the source
/// database. The unique (schema_name, version) index makes concurrent
/// inserts for one schema conflict rather than fork the version sequence.
pub struct PgSchemaLogStore {
    querier: Arc<dyn Querier>,
}

impl PgSchemaLogStore {
    pub fn new(querier: Arc<dyn Querier>) -> Self {
        Self { querier }
    }
}

impl From<QuerierError> for SchemaLogError {
    fn from(err: QuerierError) -> Self {
        match err {
            QuerierError::Connection(msg) => SchemaLogError::Connection(msg),
            QuerierError::Query(msg) => SchemaLogError::Invalid(msg),
        }
    }
}

fn entry_from_row(row: &Row) -> Result<LogEntry, SchemaLogError> {
    let string = |name: &str| -> Result<String, SchemaLogError> {
        match row.get(name) {
            Some(CellValue::String(s)) => Ok(s.clone()),
            other => Err(SchemaLogError::Invalid(format!("bad {name}: {other:?}"))),
        }
    };
    let version = match row.get("version") {
        Some(CellValue::Int(v)) => *v,
        other => return Err(SchemaLogError::Invalid(format!("bad version: {other:?}"))),
    };
    let created_at: DateTime<Utc> = match row.get("created_at") {
        Some(CellValue::Timestamp(ts)) => *ts,
        other => {
            return Err(SchemaLogError::Invalid(format!(
                "bad created_at: {other:?}"
            )))
        }
    };
    let schema: SchemaView = match row.get("schema") {
        Some(CellValue::Json(value)) => serde_json::from_value(value.clone())
            .map_err(|e| SchemaLogError::Invalid(format!("bad schema snapshot: {e}")))?,
        other => return Err(SchemaLogError::Invalid(format!("bad schema: {other:?}"))),
    };
    let acked = match row.get("acked") {
        Some(CellValue::Bool(b)) => *b,
        other => return Err(SchemaLogError::Invalid(format!("bad acked: {other:?}"))),
    };

    Ok(LogEntry {
        id: string("id")?,
        version,
        schema_name: string("schema_name")?,
        created_at,
        schema,
        acked,
    })
}

#[async_trait]
impl SchemaLogStore for PgSchemaLogStore {
    async fn insert(
        &self,
        schema_name: &str,
        schema: SchemaView,
    ) -> Result<LogEntry, SchemaLogError> {
        let snapshot = serde_json::to_value(&schema)
            .map_err(|e| SchemaLogError::Invalid(format!("serialising schema snapshot: {e}")))?;
        let rows = self
            .querier
            .query(&Query::with_params(
                INSERT_QUERY,
                vec![
                    CellValue::String(Uuid::now_v7().to_string()),
                    CellValue::String(schema_name.to_string()),
                    CellValue::Json(snapshot),
                ],
            ))
            .await?;
        let row = rows.first().ok_or_else(|| {
            SchemaLogError::Invalid("schema log insert returned no row".to_string())
        })?;
        entry_from_row(row)
    }

    async fn fetch(&self, schema_name: &str, version: i64) -> Result<LogEntry, SchemaLogError> {
        let rows = self
            .querier
            .query(&Query::with_params(
                FETCH_QUERY,
                vec![
                    CellValue::String(schema_name.to_string()),
                    CellValue::Int(version),
                ],
            ))
            .await?;
        match rows.first() {
            Some(row) => entry_from_row(row),
            None => Err(SchemaLogError::NotFound {
                schema: schema_name.to_string(),
                version,
            }),
        }
    }

    async fn fetch_last(
        &self,
        schema_name: &str,
        acked_only: bool,
    ) -> Result<LogEntry, SchemaLogError> {
        let sql = if acked_only {
            FETCH_LAST_ACKED_QUERY
        } else {
            FETCH_LAST_QUERY
        };
        let rows = self
            .querier
            .query(&Query::with_params(
                sql,
                vec![CellValue::String(schema_name.to_string())],
            ))
            .await?;
        match rows.first() {
            Some(row) => entry_from_row(row),
            None => Err(SchemaLogError::NotFound {
                schema: schema_name.to_string(),
                version: -1,
            }),
        }
    }

    async fn ack(&self, id: &str) -> Result<(), SchemaLogError> {
        self.querier
            .execute(&Query::with_params(
                ACK_QUERY,
                vec![CellValue::String(id.to_string())],
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MockQuerier {
        queries: Mutex<Vec<Query>>,
        rows: Mutex<Vec<Vec<Row>>>,
    }

    impl MockQuerier {
        fn respond_with(&self, rows: Vec<Row>) {
            self.rows.lock().unwrap().push(rows);
        }
    }

    #[async_trait]
    impl Querier for MockQuerier {
        async fn query(&self, query: &Query) -> Result<Vec<Row>, QuerierError> {
            self.queries.lock().unwrap().push(query.clone());
            let mut rows = self.rows.lock().unwrap();
            if rows.is_empty() {
                Ok(vec![])
            } else {
                Ok(rows.remove(0))
            }
        }

        async fn execute(&self, query: &Query) -> Result<u64, QuerierError> {
            self.queries.lock().unwrap().push(query.clone());
            Ok(1)
        }

        async fn execute_in_tx(&self, _queries: &[Query]) -> Result<(), QuerierError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), QuerierError> {
            Ok(())
        }
    }

    fn entry_row(version: i64) -> Row {
        Row {
            values: vec![
                ("id".to_string(), CellValue::String("e1".to_string())),
                ("version".to_string(), CellValue::Int(version)),
                (
                    "schema_name".to_string(),
                    CellValue::String("public".to_string()),
                ),
                ("created_at".to_string(), CellValue::Timestamp(Utc::now())),
                (
                    "schema".to_string(),
                    CellValue::Json(serde_json::json!({"tables": []})),
                ),
                ("acked".to_string(), CellValue::Bool(false)),
            ],
        }
    }

    #[tokio::test]
    async fn fetch_parses_the_entry_row() {
        let querier = Arc::new(MockQuerier::default());
        querier.respond_with(vec![entry_row(2)]);

        let store = PgSchemaLogStore::new(querier.clone());
        let entry = store.fetch("public", 2).await.unwrap();

        assert_eq!(entry.version, 2);
        assert_eq!(entry.schema_name, "public");

        let queries = querier.queries.lock().unwrap();
        assert!(queries[0].sql.contains("version = $2"));
        assert_eq!(
            queries[0].params,
            vec![
                CellValue::String("public".to_string()),
                CellValue::Int(2),
            ]
        );
    }

    #[tokio::test]
    async fn fetch_miss_is_not_found() {
        let store = PgSchemaLogStore::new(Arc::new(MockQuerier::default()));
        assert!(matches!(
            store.fetch("public", 9).await,
            Err(SchemaLogError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn ack_updates_by_id() {
        let querier = Arc::new(MockQuerier::default());
        let store = PgSchemaLogStore::new(querier.clone());

        store.ack("e1").await.unwrap();

        let queries = querier.queries.lock().unwrap();
        assert!(queries[0].sql.starts_with("UPDATE pgrelay.schema_log"));
        assert_eq!(queries[0].params, vec![CellValue::String("e1".to_string())]);
    }
}
