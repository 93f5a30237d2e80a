use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::conversions::change_event::ChangeEvent;
use crate::error::{Classify, ErrorKind};
use crate::schemalog::SchemaLogError;
use crate::transformers::TransformerError;

pub mod injector;
pub mod transformer;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("table {table} not found in schema log for schema {schema}")]
    TableNotFound { schema: String, table: String },

    #[error("column {column} of {schema}.{table} not found in schema log")]
    ColumnNotFound {
        schema: String,
        table: String,
        column: String,
    },

    #[error("schema log error: {0}")]
    SchemaLog(#[from] SchemaLogError),

    #[error("transformer error: {0}")]
    Transform(#[from] TransformerError),

    #[error("event queue closed")]
    QueueClosed,
}

impl Classify for ProcessorError {
    fn kind(&self) -> ErrorKind {
        match self {
            // A schema miss that survives a refresh means the schema log and
            // the stream disagree; continuing would mis-key documents.
            ProcessorError::TableNotFound { .. } | ProcessorError::ColumnNotFound { .. } => {
                ErrorKind::Fatal
            }
            ProcessorError::SchemaLog(err) => err.kind(),
            ProcessorError::Transform(err) => err.kind(),
            ProcessorError::QueueClosed => ErrorKind::Fatal,
        }
    }
}

/// One stage of the event-processing chain. Processors wrap the next stage
/// and hand events downstream once their own work is done.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process_event(&self, event: ChangeEvent) -> Result<(), ProcessorError>;
}

#[async_trait]
impl<P: Processor + ?Sized> Processor for Arc<P> {
    async fn process_event(&self, event: ChangeEvent) -> Result<(), ProcessorError> {
        (**self).process_event(event).await
    }
}

#[async_trait]
impl<P: Processor + ?Sized> Processor for Box<P> {
    async fn process_event(&self, event: ChangeEvent) -> Result<(), ProcessorError> {
        (**self).process_event(event).await
    }
}
