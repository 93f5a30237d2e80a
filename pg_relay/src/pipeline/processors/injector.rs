use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::conversions::change_event::{ChangeAction, ChangeEvent, EventColumn};
use crate::schemalog::{LogEntry, SchemaLogError, SchemaLogStore, Table};

use super::{Processor, ProcessorError};

/// Enriches events with schema-resolved column metadata: the immutable
/// column id (the stable key search sinks use across renames) and the
/// primary-key flag.
///
/// The latest schema-log entry per schema is cached; a lookup miss triggers
/// one refresh before it is treated as fatal.
pub struct Injector<P: Processor> {
    schema_log: Arc<dyn SchemaLogStore>,
    cache: Mutex<HashMap<String, LogEntry>>,
    next: P,
}

impl<P: Processor> Injector<P> {
    pub fn new(schema_log: Arc<dyn SchemaLogStore>, next: P) -> Self {
        Self {
            schema_log,
            cache: Mutex::new(HashMap::new()),
            next,
        }
    }

    async fn apply_schema_change(&self, entry: &LogEntry) -> Result<(), ProcessorError> {
        let mut cache = self.cache.lock().await;
        if let Some(current) = cache.get(&entry.schema_name) {
            // Versions apply strictly ascending per schema; anything older
            // than what we hold has already been applied.
            if entry.version <= current.version {
                warn!(
                    schema = %entry.schema_name,
                    version = entry.version,
                    current = current.version,
                    "skipping stale schema log entry"
                );
                return Ok(());
            }
        }
        cache.insert(entry.schema_name.clone(), entry.clone());
        drop(cache);

        self.schema_log.ack(&entry.id).await?;
        Ok(())
    }

    async fn refresh(&self, schema: &str) -> Result<Option<LogEntry>, ProcessorError> {
        match self.schema_log.fetch_last(schema, false).await {
            Ok(entry) => {
                debug!(schema, version = entry.version, "refreshed schema view");
                let mut cache = self.cache.lock().await;
                cache.insert(schema.to_string(), entry.clone());
                Ok(Some(entry))
            }
            Err(SchemaLogError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn cached(&self, schema: &str) -> Option<LogEntry> {
        self.cache.lock().await.get(schema).cloned()
    }

    async fn inject(&self, event: &mut ChangeEvent) -> Result<(), ProcessorError> {
        let entry = match self.cached(&event.schema).await {
            Some(entry) => entry,
            None => match self.refresh(&event.schema).await? {
                Some(entry) => entry,
                // No schema log for this schema at all; nothing to stamp.
                None => return Ok(()),
            },
        };

        match stamp_columns(event, &entry) {
            Ok(()) => Ok(()),
            Err(miss) => {
                // The event may be ahead of our cached view; refresh once.
                let Some(entry) = self.refresh(&event.schema).await? else {
                    return Err(miss);
                };
                stamp_columns(event, &entry)
            }
        }
    }
}

fn stamp_columns(event: &mut ChangeEvent, entry: &LogEntry) -> Result<(), ProcessorError> {
    let table =
        entry
            .schema
            .table_by_name(&event.table)
            .ok_or_else(|| ProcessorError::TableNotFound {
                schema: event.schema.clone(),
                table: event.table.clone(),
            })?;

    for column in event.columns.iter_mut().chain(event.identity.iter_mut()) {
        stamp_column(column, table, &event.schema)?;
    }
    Ok(())
}

fn stamp_column(
    column: &mut EventColumn,
    table: &Table,
    schema: &str,
) -> Result<(), ProcessorError> {
    let schema_column =
        table
            .column_by_name(&column.name)
            .ok_or_else(|| ProcessorError::ColumnNotFound {
                schema: schema.to_string(),
                table: table.name.clone(),
                column: column.name.clone(),
            })?;
    column.id = Some(schema_column.id.clone());
    column.primary_key = table.primary_key_columns.contains(&column.name);
    Ok(())
}

#[async_trait]
impl<P: Processor> Processor for Injector<P> {
    async fn process_event(&self, mut event: ChangeEvent) -> Result<(), ProcessorError> {
        match event.action {
            ChangeAction::Ddl => {
                if let Some(entry) = event.schema_log.as_deref() {
                    self.apply_schema_change(entry).await?;
                }
            }
            ChangeAction::Insert | ChangeAction::Update | ChangeAction::Delete => {
                self.inject(&mut event).await?;
            }
            ChangeAction::Truncate => {}
        }
        self.next.process_event(event).await
    }
}
