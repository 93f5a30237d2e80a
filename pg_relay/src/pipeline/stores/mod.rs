use async_trait::async_trait;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::position::CommitPosition;

pub mod memory;
pub mod store;

pub use store::CheckpointHandle;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint store failure: {0}")]
    Store(String),
}

impl Classify for CheckpointError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// Durable store of the high-water commit position acknowledged by every
/// sink. For a postgres source the replication slot itself is the durable
/// half; this store covers sources without one.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn write_position(&self, position: CommitPosition) -> Result<(), CheckpointError>;

    async fn read_position(&self) -> Result<CommitPosition, CheckpointError>;
}
