use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::QueuedEvent;
use super::{Batch, BatchConfig, EventQueueReceiver};
use crate::pipeline::publisher::PublisherError;

/// Receives finished batches. In production this is the publisher fanning
/// out to sinks.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn flush(&self, batch: Batch) -> Result<(), PublisherError>;
}

/// Single consumer of the event queue. Accumulates events into the current
/// batch and flushes it when any threshold holds: the batch reached
/// `batch_size` events, its oldest event reached `batch_time`, or a
/// DDL/truncate event arrived. Boundary events flush the preceding batch
/// first and then go out in their own singleton batch, so schema changes
/// never reorder against row changes.
pub struct Batcher<H: BatchHandler> {
    receiver: EventQueueReceiver,
    config: BatchConfig,
    handler: H,
    cancel: CancellationToken,
    shutdown_grace: Duration,
}

impl<H: BatchHandler> Batcher<H> {
    pub fn new(
        receiver: EventQueueReceiver,
        config: BatchConfig,
        handler: H,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            config,
            handler,
            cancel,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub async fn run(mut self) -> Result<(), PublisherError> {
        let mut current: Vec<QueuedEvent> = vec![];
        let mut oldest: Option<Instant> = None;

        loop {
            let deadline = oldest.map(|at| at + self.config.batch_time);

            tokio::select! {
                maybe_event = self.receiver.recv() => {
                    let Some(queued) = maybe_event else {
                        // Producers are gone; flush what we have and stop.
                        self.flush(&mut current, &mut oldest).await?;
                        return Ok(());
                    };

                    if queued.event.is_batch_boundary() {
                        self.flush(&mut current, &mut oldest).await?;
                        debug!(position = %queued.event.position, action = %queued.event.action,
                               "flushing boundary event in its own batch");
                        self.handler.flush(Batch::from_queued(vec![queued])).await?;
                        continue;
                    }

                    if oldest.is_none() {
                        oldest = Some(Instant::now());
                    }
                    current.push(queued);
                    if current.len() >= self.config.batch_size {
                        self.flush(&mut current, &mut oldest).await?;
                    }
                }
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    self.flush(&mut current, &mut oldest).await?;
                }
                _ = self.cancel.cancelled() => {
                    info!("batcher shutting down, flushing pending events");
                    let final_flush = self.flush(&mut current, &mut oldest);
                    match tokio::time::timeout(self.shutdown_grace, final_flush).await {
                        Ok(result) => result?,
                        // Positions were never acknowledged, so abandoning
                        // the batch is safe; it replays on restart.
                        Err(_) => warn!("final flush timed out, abandoning pending batch"),
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn flush(
        &self,
        current: &mut Vec<QueuedEvent>,
        oldest: &mut Option<Instant>,
    ) -> Result<(), PublisherError> {
        *oldest = None;
        if current.is_empty() {
            return Ok(());
        }
        let batch = Batch::from_queued(std::mem::take(current));
        debug!(len = batch.len(), lo = %batch.lo(), hi = %batch.hi(), "flushing batch");
        self.handler.flush(batch).await
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
