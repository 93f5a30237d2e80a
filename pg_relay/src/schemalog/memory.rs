use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{LogEntry, SchemaLogError, SchemaLogStore, SchemaView};

/// In-memory schema log. Backs tests and snapshot-only runs where no source
/// database owns the registry.
#[derive(Debug, Default)]
pub struct MemorySchemaLogStore {
    entries: Mutex<HashMap<String, Vec<LogEntry>>>,
}

impl MemorySchemaLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchemaLogStore for MemorySchemaLogStore {
    async fn insert(
        &self,
        schema_name: &str,
        schema: SchemaView,
    ) -> Result<LogEntry, SchemaLogError> {
        let mut entries = self.entries.lock().expect("schema log lock poisoned");
        let versions = entries.entry(schema_name.to_string()).or_default();
        let version = versions.last().map(|e| e.version + 1).unwrap_or(0);

        let entry = LogEntry {
            // Uuidv7 is time-ordered, so ids sort lexicographically.
            id: Uuid::now_v7().to_string(),
            version,
            schema_name: schema_name.to_string(),
            created_at: Utc::now(),
            schema,
            acked: false,
        };
        versions.push(entry.clone());
        Ok(entry)
    }

    async fn fetch(&self, schema_name: &str, version: i64) -> Result<LogEntry, SchemaLogError> {
        let entries = self.entries.lock().expect("schema log lock poisoned");
        entries
            .get(schema_name)
            .and_then(|versions| versions.iter().find(|e| e.version == version))
            .cloned()
            .ok_or_else(|| SchemaLogError::NotFound {
                schema: schema_name.to_string(),
                version,
            })
    }

    async fn fetch_last(
        &self,
        schema_name: &str,
        acked_only: bool,
    ) -> Result<LogEntry, SchemaLogError> {
        let entries = self.entries.lock().expect("schema log lock poisoned");
        entries
            .get(schema_name)
            .and_then(|versions| versions.iter().rev().find(|e| !acked_only || e.acked))
            .cloned()
            .ok_or_else(|| SchemaLogError::NotFound {
                schema: schema_name.to_string(),
                version: -1,
            })
    }

    async fn ack(&self, id: &str) -> Result<(), SchemaLogError> {
        let mut entries = self.entries.lock().expect("schema log lock poisoned");
        for versions in entries.values_mut() {
            if let Some(entry) = versions.iter_mut().find(|e| e.id == id) {
                entry.acked = true;
                return Ok(());
            }
        }
        Err(SchemaLogError::Invalid(format!(
            "cannot ack unknown schema log entry {id}"
        )))
    }
}
