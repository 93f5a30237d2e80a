use async_trait::async_trait;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

use super::{LogEntry, SchemaView};

#[derive(Debug, Error)]
pub enum SchemaLogError {
    #[error("no schema log entry found for schema {schema} version {version}")]
    NotFound { schema: String, version: i64 },

    #[error("schema log store connection error: {0}")]
    Connection(String),

    #[error("invalid schema log entry: {0}")]
    Invalid(String),
}

impl Classify for SchemaLogError {
    fn kind(&self) -> ErrorKind {
        match self {
            SchemaLogError::NotFound { .. } => ErrorKind::NotFound,
            SchemaLogError::Connection(_) => ErrorKind::Transient,
            SchemaLogError::Invalid(_) => ErrorKind::Validation,
        }
    }
}

/// Store for the versioned schema registry. Inserts are atomic per schema
/// and assign a monotonically increasing version; entries are immutable once
/// written, apart from the ack flag.
#[async_trait]
pub trait SchemaLogStore: Send + Sync {
    async fn insert(
        &self,
        schema_name: &str,
        schema: SchemaView,
    ) -> Result<LogEntry, SchemaLogError>;

    async fn fetch(&self, schema_name: &str, version: i64) -> Result<LogEntry, SchemaLogError>;

    /// Latest entry for a schema. With `acked_only` set, the latest entry
    /// downstream processors have already applied.
    async fn fetch_last(
        &self,
        schema_name: &str,
        acked_only: bool,
    ) -> Result<LogEntry, SchemaLogError>;

    async fn ack(&self, id: &str) -> Result<(), SchemaLogError>;
}
