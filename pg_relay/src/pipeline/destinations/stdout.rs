use async_trait::async_trait;
use tracing::info;

use crate::pipeline::batching::Batch;

use super::{Sink, SinkError};

/// Prints every event as canonical JSON. Useful for demos and for wiring
/// tests without a real downstream.
pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn write_batch(&self, batch: &Batch) -> Result<(), SinkError> {
        for event in batch.events() {
            println!("{}", event.to_json());
        }
        info!(len = batch.len(), hi = %batch.hi(), "wrote batch to stdout");
        Ok(())
    }
}
