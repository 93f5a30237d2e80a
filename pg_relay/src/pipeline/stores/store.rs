use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::position::CommitPosition;

use super::{CheckpointError, CheckpointStore};

enum CheckpointMessage {
    /// A batch up to this position was acknowledged by every sink.
    ReportPosition { position: CommitPosition },
    GetPosition {
        respond_to: oneshot::Sender<CommitPosition>,
    },
    GetCommittedPosition {
        respond_to: oneshot::Sender<CommitPosition>,
    },
    Flush,
}

/// Checkpoint actor: tracks the high-water acknowledged position in memory
/// and flushes it to the durable store on an interval and on shutdown.
struct Checkpointer {
    receiver: mpsc::Receiver<CheckpointMessage>,
    position: Arc<AtomicU64>,
    store: Arc<dyn CheckpointStore>,
    flush_interval: Duration,
    cancel: CancellationToken,
}

impl Checkpointer {
    async fn run(&mut self) {
        let mut flush_tick = tokio::time::interval(self.flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(msg) = self.receiver.recv() => {
                    self.handle_message(msg).await;
                },
                _ = flush_tick.tick() => {
                    self.flush().await;
                },
                _ = self.cancel.cancelled() => {
                    self.receiver.close();
                    while let Some(msg) = self.receiver.recv().await {
                        self.handle_message(msg).await;
                    }
                    self.flush().await;
                    break;
                },
                else => break,
            }
        }
    }

    async fn handle_message(&mut self, msg: CheckpointMessage) {
        match msg {
            CheckpointMessage::ReportPosition { position } => {
                self.position
                    .fetch_max(position.as_u64(), Ordering::SeqCst);
            }
            CheckpointMessage::GetPosition { respond_to } => {
                let _ = respond_to.send(CommitPosition::new(
                    self.position.load(Ordering::SeqCst),
                ));
            }
            CheckpointMessage::GetCommittedPosition { respond_to } => {
                let position = self
                    .store
                    .read_position()
                    .await
                    .unwrap_or_else(|_| CommitPosition::default());
                let _ = respond_to.send(position);
            }
            CheckpointMessage::Flush => self.flush().await,
        }
    }

    async fn flush(&self) {
        let position = CommitPosition::new(self.position.load(Ordering::SeqCst));
        debug!(%position, "flushing checkpoint");
        if let Err(e) = self.store.write_position(position).await {
            warn!("failed flushing checkpoint: {e}");
        }
    }
}

#[derive(Clone)]
pub struct CheckpointHandle {
    sender: mpsc::Sender<CheckpointMessage>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl CheckpointHandle {
    pub async fn new(
        store: Arc<dyn CheckpointStore>,
        flush_interval: Duration,
    ) -> Result<Self, CheckpointError> {
        let (sender, receiver) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let initial = store.read_position().await?;

        let mut actor = Checkpointer {
            receiver,
            position: Arc::new(AtomicU64::new(initial.as_u64())),
            store,
            flush_interval,
            cancel: cancel.clone(),
        };

        let tasks = TaskTracker::new();
        tasks.spawn(async move { actor.run().await });
        tasks.close();

        Ok(Self {
            sender,
            cancel,
            tasks,
        })
    }

    pub async fn report_position(&self, position: CommitPosition) {
        let _ = self
            .sender
            .send(CheckpointMessage::ReportPosition { position })
            .await;
    }

    /// Latest position acknowledged by every sink, from memory.
    pub async fn get_position(&self) -> CommitPosition {
        let (send, recv) = oneshot::channel();
        let _ = self
            .sender
            .send(CheckpointMessage::GetPosition { respond_to: send })
            .await;
        recv.await.unwrap_or_default()
    }

    /// Latest position durably flushed to the checkpoint store.
    pub async fn get_committed_position(&self) -> CommitPosition {
        let (send, recv) = oneshot::channel();
        let _ = self
            .sender
            .send(CheckpointMessage::GetCommittedPosition { respond_to: send })
            .await;
        recv.await.unwrap_or_default()
    }

    pub async fn flush(&self) {
        let _ = self.sender.send(CheckpointMessage::Flush).await;
    }

    /// Drains pending reports, flushes a final checkpoint and stops the
    /// actor.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.wait().await;
    }
}
