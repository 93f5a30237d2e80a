use std::sync::Mutex;

use async_trait::async_trait;

use crate::position::CommitPosition;

use super::{CheckpointError, CheckpointStore};

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    position: Mutex<CommitPosition>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn write_position(&self, position: CommitPosition) -> Result<(), CheckpointError> {
        *self.position.lock().expect("checkpoint lock poisoned") = position;
        Ok(())
    }

    async fn read_position(&self) -> Result<CommitPosition, CheckpointError> {
        Ok(*self.position.lock().expect("checkpoint lock poisoned"))
    }
}
