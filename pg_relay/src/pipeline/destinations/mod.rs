use async_trait::async_trait;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::pg::QuerierError;
use crate::pipeline::batching::Batch;
use crate::schemalog::SchemaLogError;

pub mod kafka;
pub mod postgres;
pub mod search;
pub mod stdout;
pub mod webhook;

#[derive(Debug, Error)]
pub enum SinkError {
    /// The write may succeed if retried; the publisher applies the sink's
    /// backoff policy.
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// Retrying cannot help; the pipeline stops before acknowledging.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl Classify for SinkError {
    fn kind(&self) -> ErrorKind {
        match self {
            SinkError::Transient(_) => ErrorKind::Transient,
            SinkError::Permanent(_) => ErrorKind::Fatal,
        }
    }
}

impl From<QuerierError> for SinkError {
    fn from(err: QuerierError) -> Self {
        match err.kind() {
            ErrorKind::Transient => SinkError::Transient(err.to_string()),
            _ => SinkError::Permanent(err.to_string()),
        }
    }
}

impl From<SchemaLogError> for SinkError {
    fn from(err: SchemaLogError) -> Self {
        match err.kind() {
            ErrorKind::Transient => SinkError::Transient(err.to_string()),
            _ => SinkError::Permanent(err.to_string()),
        }
    }
}

/// A downstream destination. Batches arrive strictly in commit-position
/// order; a sink must have durably applied a batch before returning `Ok`.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write_batch(&self, batch: &Batch) -> Result<(), SinkError>;
}
