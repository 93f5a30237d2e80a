use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::conversions::change_event::ChangeAction;
use crate::pipeline::batching::Batch;

use super::{Sink, SinkError};

#[derive(Debug, Error)]
pub enum KafkaWriterError {
    #[error("transient kafka failure: {0}")]
    Transient(String),

    #[error("permanent kafka failure: {0}")]
    Permanent(String),
}

impl From<KafkaWriterError> for SinkError {
    fn from(err: KafkaWriterError) -> Self {
        match err {
            KafkaWriterError::Transient(msg) => SinkError::Transient(msg),
            KafkaWriterError::Permanent(msg) => SinkError::Permanent(msg),
        }
    }
}

/// One kafka record. The key routes all changes of one row to the same
/// partition, preserving per-row ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaMessage {
    pub key: String,
    pub value: Vec<u8>,
}

/// Seam behind which the concrete kafka producer lives.
#[async_trait]
pub trait KafkaWriter: Send + Sync {
    async fn write_messages(&self, messages: Vec<KafkaMessage>) -> Result<(), KafkaWriterError>;
}

/// Publishes one record per event, keyed `schema/table/pk`, with the
/// canonical JSON payload as the value. DDL events produce nothing for
/// kafka; consumers learn about schema changes from the schema log itself.
pub struct KafkaSink {
    writer: Arc<dyn KafkaWriter>,
}

impl KafkaSink {
    pub fn new(writer: Arc<dyn KafkaWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl Sink for KafkaSink {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn write_batch(&self, batch: &Batch) -> Result<(), SinkError> {
        let messages: Vec<KafkaMessage> = batch
            .events()
            .iter()
            .filter(|event| event.action != ChangeAction::Ddl)
            .map(|event| KafkaMessage {
                key: event.key(),
                value: event.to_json().to_string().into_bytes(),
            })
            .collect();

        if messages.is_empty() {
            return Ok(());
        }

        debug!(messages = messages.len(), hi = %batch.hi(), "writing batch to kafka");
        self.writer.write_messages(messages).await?;
        Ok(())
    }
}
