use thiserror::Error;

use crate::conversions::change_event::ChangeEventConversionError;
use crate::error::{Classify, ErrorKind};

pub mod assembler;
pub mod batching;
pub mod data_pipeline;
pub mod destinations;
pub mod processors;
pub mod publisher;
pub mod sources;
pub mod stores;

use assembler::AssemblerError;
use processors::ProcessorError;
use publisher::PublisherError;
use sources::SourceError;
use stores::CheckpointError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("assembler error: {0}")]
    Assembler(#[from] AssemblerError),

    #[error("conversion error: {0}")]
    Conversion(#[from] ChangeEventConversionError),

    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("publisher error: {0}")]
    Publisher(#[from] PublisherError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("replication stream ended unexpectedly")]
    StreamEnded,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for PipelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Source(err) => err.kind(),
            PipelineError::Assembler(err) => err.kind(),
            PipelineError::Conversion(err) => err.kind(),
            PipelineError::Processor(err) => err.kind(),
            PipelineError::Publisher(_) => ErrorKind::Fatal,
            PipelineError::Checkpoint(err) => err.kind(),
            // A dropped stream is retried with backoff from the last
            // acknowledged position.
            PipelineError::StreamEnded => ErrorKind::Transient,
            PipelineError::Io(_) => ErrorKind::Fatal,
        }
    }
}
