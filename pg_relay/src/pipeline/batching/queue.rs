use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::conversions::change_event::ChangeEvent;
use crate::pipeline::processors::{Processor, ProcessorError};

#[derive(Debug, Error)]
#[error("event queue closed")]
pub struct QueueClosedError;

#[derive(Debug)]
pub(crate) struct QueuedEvent {
    pub event: ChangeEvent,
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Producer half of the batch queue. Multiple upstream stages may hold
/// clones; a single batcher drains the receiver.
///
/// Sending acquires semaphore permits proportional to the event's size, so
/// the producer blocks once `max_queue_bytes` worth of events are in flight
/// and unflushed. The permits travel with the event into its batch and are
/// released when the batch is acknowledged.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<QueuedEvent>,
    bytes: Arc<Semaphore>,
    max_queue_bytes: usize,
}

pub struct EventQueueReceiver {
    rx: mpsc::UnboundedReceiver<QueuedEvent>,
}

pub fn event_queue(max_queue_bytes: usize) -> (EventQueue, EventQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventQueue {
            tx,
            bytes: Arc::new(Semaphore::new(max_queue_bytes)),
            max_queue_bytes,
        },
        EventQueueReceiver { rx },
    )
}

impl EventQueue {
    pub async fn send(&self, event: ChangeEvent) -> Result<(), QueueClosedError> {
        // An event larger than the whole budget still has to fit, or the
        // queue would deadlock.
        let weight = event.size_bytes().clamp(1, self.max_queue_bytes) as u32;
        let permit = self
            .bytes
            .clone()
            .acquire_many_owned(weight)
            .await
            .map_err(|_| QueueClosedError)?;

        self.tx
            .send(QueuedEvent {
                event,
                permit: Some(permit),
            })
            .map_err(|_| QueueClosedError)
    }

    /// Closes the queue; pending `send` calls fail and the receiver drains
    /// whatever was already queued.
    pub fn close(&self) {
        self.bytes.close();
    }
}

#[async_trait]
impl Processor for EventQueue {
    async fn process_event(&self, event: ChangeEvent) -> Result<(), ProcessorError> {
        self.send(event)
            .await
            .map_err(|_| ProcessorError::QueueClosed)
    }
}

impl EventQueueReceiver {
    pub(crate) async fn recv(&mut self) -> Option<QueuedEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::conversions::cell::CellValue;
    use crate::conversions::change_event::{ChangeAction, EventColumn};
    use crate::position::CommitPosition;

    fn event_of_size(bytes: usize) -> ChangeEvent {
        // size_bytes adds a fixed overhead of 16 plus name lengths; pad the
        // value to land close to the requested size.
        ChangeEvent {
            action: ChangeAction::Insert,
            schema: String::new(),
            table: String::new(),
            columns: vec![EventColumn {
                id: None,
                name: String::new(),
                type_name: String::new(),
                value: CellValue::String("x".repeat(bytes.saturating_sub(16))),
                primary_key: false,
            }],
            identity: vec![],
            schema_log: None,
            position: CommitPosition::new(1),
        }
    }

    #[tokio::test]
    async fn send_blocks_until_the_queue_drains() {
        let (queue, mut rx) = event_queue(1024);

        // Fills the byte budget.
        queue.send(event_of_size(1024)).await.unwrap();

        // The next send must block while the first event is unflushed.
        let mut blocked = Box::pin(queue.send(event_of_size(1024)));
        assert!((&mut blocked).now_or_never().is_none());

        // Draining the queue (and dropping the permit) unblocks it.
        let queued = rx.recv().await.unwrap();
        drop(queued);
        blocked.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_events_still_fit() {
        let (queue, mut rx) = event_queue(16);
        queue.send(event_of_size(1024)).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn close_fails_pending_sends() {
        let (queue, _rx) = event_queue(16);
        queue.send(event_of_size(16)).await.unwrap();

        let mut blocked = Box::pin(queue.send(event_of_size(16)));
        assert!((&mut blocked).now_or_never().is_none());

        queue.close();
        assert!(blocked.await.is_err());
    }
}
