use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::conversions::change_event::{ChangeAction, ChangeEvent};
use crate::pipeline::batching::Batch;
use crate::schemalog::LogEntry;

use super::{Sink, SinkError};

#[derive(Debug, Error)]
pub enum SearchClientError {
    #[error("transient search store failure: {0}")]
    Transient(String),

    #[error("permanent search store failure: {0}")]
    Permanent(String),
}

impl From<SearchClientError> for SinkError {
    fn from(err: SearchClientError) -> Self {
        match err {
            SearchClientError::Transient(msg) => SinkError::Transient(msg),
            SearchClientError::Permanent(msg) => SinkError::Permanent(msg),
        }
    }
}

/// Mapping of one column to a search-index field. The field is keyed by the
/// column's immutable id so renames never force a reindex.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    pub field_id: String,
    pub field_name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    Index { document: serde_json::Value },
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub index: String,
    /// `table/pk`, unique within the index.
    pub id: String,
    pub operation: BulkOperation,
}

/// Seam behind which the concrete search store client lives.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn create_index(&self, index: &str) -> Result<(), SearchClientError>;

    async fn put_mappings(
        &self,
        index: &str,
        mappings: Vec<FieldMapping>,
    ) -> Result<(), SearchClientError>;

    /// Applies bulk actions; returns the items that failed so the caller can
    /// retry them individually.
    async fn send_bulk_request(
        &self,
        items: Vec<BulkItem>,
    ) -> Result<Vec<BulkItem>, SearchClientError>;

    async fn delete_table_documents(
        &self,
        index: &str,
        table: &str,
    ) -> Result<(), SearchClientError>;

    /// Stores documents that exhausted their retry budget so they can be
    /// repaired out of band.
    async fn quarantine(&self, items: Vec<BulkItem>) -> Result<(), SearchClientError>;
}

/// Indexes events into a search store, one index per source schema.
/// Documents are keyed by `table/pk` and their fields by the column's
/// immutable id.
pub struct SearchSink {
    client: Arc<dyn SearchClient>,
    retry: BackoffConfig,
    known_indices: Mutex<HashMap<String, ()>>,
}

impl SearchSink {
    pub fn new(client: Arc<dyn SearchClient>, retry: BackoffConfig) -> Self {
        Self {
            client,
            retry,
            known_indices: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure_index(&self, index: &str) -> Result<(), SearchClientError> {
        let mut known = self.known_indices.lock().await;
        if !known.contains_key(index) {
            self.client.create_index(index).await?;
            known.insert(index.to_string(), ());
        }
        Ok(())
    }

    fn document(event: &ChangeEvent) -> serde_json::Value {
        let mut fields = serde_json::Map::new();
        for column in &event.columns {
            let key = column.id.clone().unwrap_or_else(|| column.name.clone());
            fields.insert(key, column.value.to_json());
        }
        fields.insert(
            "_table".to_string(),
            serde_json::Value::String(event.table.clone()),
        );
        serde_json::Value::Object(fields)
    }

    fn document_id(event: &ChangeEvent) -> String {
        let key = event.key();
        key.splitn(2, '/').nth(1).unwrap_or(&key).to_string()
    }

    async fn apply_schema_change(&self, entry: &LogEntry) -> Result<(), SearchClientError> {
        self.ensure_index(&entry.schema_name).await?;
        let mappings: Vec<FieldMapping> = entry
            .schema
            .tables
            .iter()
            .flat_map(|table| {
                table.columns.iter().map(|column| FieldMapping {
                    field_id: column.id.clone(),
                    field_name: column.name.clone(),
                    data_type: column.data_type.clone(),
                })
            })
            .collect();
        self.client
            .put_mappings(&entry.schema_name, mappings)
            .await
    }

    /// Retries failed items by document id with backoff; whatever survives
    /// the budget is quarantined rather than blocking the stream.
    async fn send_with_retries(&self, items: Vec<BulkItem>) -> Result<(), SearchClientError> {
        let mut failed = self.client.send_bulk_request(items).await?;
        let mut backoff = Backoff::new(self.retry.clone());

        while !failed.is_empty() {
            let Some(delay) = backoff.next_delay() else {
                error!(
                    documents = failed.len(),
                    "quarantining documents that exhausted the retry budget"
                );
                self.client.quarantine(failed).await?;
                return Ok(());
            };
            let ids: Vec<&str> = failed.iter().map(|item| item.id.as_str()).collect();
            warn!(attempt = backoff.attempts(), ?ids, "retrying failed bulk items");
            tokio::time::sleep(delay).await;
            failed = self.client.send_bulk_request(failed).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for SearchSink {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn write_batch(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut items = vec![];
        for event in batch.events() {
            match event.action {
                ChangeAction::Insert | ChangeAction::Update => {
                    self.ensure_index(&event.schema).await?;
                    items.push(BulkItem {
                        index: event.schema.clone(),
                        id: Self::document_id(event),
                        operation: BulkOperation::Index {
                            document: Self::document(event),
                        },
                    });
                }
                ChangeAction::Delete => {
                    items.push(BulkItem {
                        index: event.schema.clone(),
                        id: Self::document_id(event),
                        operation: BulkOperation::Delete,
                    });
                }
                ChangeAction::Truncate => {
                    self.client
                        .delete_table_documents(&event.schema, &event.table)
                        .await?;
                }
                ChangeAction::Ddl => {
                    if let Some(entry) = event.schema_log.as_deref() {
                        self.apply_schema_change(entry).await?;
                    }
                }
            }
        }

        if items.is_empty() {
            return Ok(());
        }
        debug!(items = items.len(), hi = %batch.hi(), "writing batch to search store");
        self.send_with_retries(items).await?;
        Ok(())
    }
}
