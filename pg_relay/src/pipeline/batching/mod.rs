use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;

use crate::conversions::change_event::ChangeEvent;
use crate::position::CommitPosition;

pub mod batcher;
pub mod queue;

pub use batcher::{BatchHandler, Batcher};
pub use queue::{event_queue, EventQueue, EventQueueReceiver};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Max number of events accumulated before a flush is triggered.
    /// Defaults to 100.
    pub batch_size: usize,
    /// Max age of the oldest batched event before a flush is triggered.
    /// Defaults to 1s.
    pub batch_time: Duration,
    /// Max memory used for inflight, unflushed events. Producers block once
    /// it is reached. Defaults to 100MiB.
    pub max_queue_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_time: Duration::from_secs(1),
            max_queue_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Ordered run of events covering the commit-position range `[lo, hi]`.
///
/// A batch owns its events' queue-byte permits; dropping the batch after
/// every sink acked is what releases backpressure.
pub struct Batch {
    events: Vec<ChangeEvent>,
    // Held until the batch is dropped after acknowledgement; releasing them
    // is what unblocks producers.
    _permits: Vec<OwnedSemaphorePermit>,
    lo: CommitPosition,
    hi: CommitPosition,
    total_bytes: usize,
}

impl Batch {
    pub(crate) fn from_queued(items: Vec<queue::QueuedEvent>) -> Self {
        let mut events = Vec::with_capacity(items.len());
        let mut permits = Vec::with_capacity(items.len());
        let mut total_bytes = 0;
        for item in items {
            total_bytes += item.event.size_bytes();
            events.push(item.event);
            if let Some(permit) = item.permit {
                permits.push(permit);
            }
        }
        let lo = events.first().map(|e| e.position).unwrap_or_default();
        let hi = events.last().map(|e| e.position).unwrap_or_default();
        Batch {
            events,
            _permits: permits,
            lo,
            hi,
            total_bytes,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_events(events: Vec<ChangeEvent>) -> Self {
        Self::from_queued(
            events
                .into_iter()
                .map(|event| queue::QueuedEvent {
                    event,
                    permit: None,
                })
                .collect(),
        )
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn lo(&self) -> CommitPosition {
        self.lo
    }

    pub fn hi(&self) -> CommitPosition {
        self.hi
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("len", &self.events.len())
            .field("lo", &self.lo)
            .field("hi", &self.hi)
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}
