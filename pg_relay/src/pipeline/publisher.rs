use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::Classify;
use crate::position::CommitPosition;

use super::batching::{Batch, BatchHandler};
use super::destinations::{Sink, SinkError};
use super::stores::CheckpointHandle;

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("sink {sink} failed permanently: {source}")]
    SinkFailed {
        sink: &'static str,
        #[source]
        source: SinkError,
    },

    /// The sink exhausted its retry budget. The pipeline halts rather than
    /// queueing without bound behind an unhealthy sink.
    #[error("sink {sink} unhealthy after {attempts} attempts: {source}")]
    SinkUnhealthy {
        sink: &'static str,
        attempts: u32,
        #[source]
        source: SinkError,
    },
}

/// Fans a finished batch out to every enabled sink in parallel and reports
/// the acknowledged position to the checkpointer.
///
/// A flush returns only when every sink acknowledged, so batches reach each
/// sink strictly in commit-position order. The reported position is the
/// minimum across sinks' last acknowledged positions.
pub struct Publisher {
    sinks: Vec<Arc<dyn Sink>>,
    checkpoints: CheckpointHandle,
    retry: BackoffConfig,
    acked: Mutex<HashMap<&'static str, CommitPosition>>,
}

impl Publisher {
    pub fn new(
        sinks: Vec<Arc<dyn Sink>>,
        checkpoints: CheckpointHandle,
        retry: BackoffConfig,
    ) -> Self {
        Self {
            sinks,
            checkpoints,
            retry,
            acked: Mutex::new(HashMap::new()),
        }
    }

    async fn write_with_retry(&self, sink: &Arc<dyn Sink>, batch: &Batch) -> Result<(), PublisherError> {
        let mut backoff = Backoff::new(self.retry.clone());
        loop {
            match sink.write_batch(batch).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            sink = sink.name(),
                            attempt = backoff.attempts(),
                            "transient sink failure at {}, retrying in {delay:?}: {err}",
                            batch.hi(),
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(PublisherError::SinkUnhealthy {
                            sink: sink.name(),
                            attempts: backoff.attempts(),
                            source: err,
                        })
                    }
                },
                Err(err) => {
                    return Err(PublisherError::SinkFailed {
                        sink: sink.name(),
                        source: err,
                    })
                }
            }
        }
    }

    /// Minimum of every sink's most recently acknowledged position.
    async fn min_acked_position(&self) -> Option<CommitPosition> {
        let acked = self.acked.lock().await;
        if acked.len() < self.sinks.len() {
            return None;
        }
        acked.values().min().copied()
    }
}

#[async_trait]
impl BatchHandler for Publisher {
    async fn flush(&self, batch: Batch) -> Result<(), PublisherError> {
        if batch.is_empty() {
            return Ok(());
        }

        try_join_all(
            self.sinks
                .iter()
                .map(|sink| self.write_with_retry(sink, &batch)),
        )
        .await?;

        {
            let mut acked = self.acked.lock().await;
            for sink in &self.sinks {
                acked.insert(sink.name(), batch.hi());
            }
        }

        if let Some(position) = self.min_acked_position().await {
            info!(len = batch.len(), %position, "batch acknowledged by all sinks");
            self.checkpoints.report_position(position).await;
        }
        Ok(())
    }
}
