use async_trait::async_trait;
use postgres::{
    client::ReplicationClientError,
    stream::{CdcStream, CdcStreamError, StatusUpdateError},
    PostgresSourceError,
};
use thiserror::Error;

use crate::conversions::cell::CellDecoder;
use crate::error::{Classify, ErrorKind};
use crate::position::CommitPosition;
use crate::table::{TableId, TableSchema};

pub mod postgres;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source error: {0}")]
    Postgres(#[from] PostgresSourceError),

    #[error("replication client error: {0}")]
    ReplicationClient(#[from] ReplicationClientError),

    #[error("cdc stream error: {0}")]
    CdcStream(#[from] CdcStreamError),

    #[error("status update error: {0}")]
    StatusUpdate(#[from] StatusUpdateError),
}

impl Classify for SourceError {
    fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Postgres(err) => err.kind(),
            SourceError::ReplicationClient(err) => err.kind(),
            SourceError::CdcStream(err) => err.kind(),
            SourceError::StatusUpdate(_) => ErrorKind::Transient,
        }
    }
}

#[async_trait]
pub trait Source {
    fn get_table_schema(&self, table_id: TableId) -> Result<&TableSchema, SourceError>;

    fn set_table_schema(&mut self, table_schema: TableSchema);

    /// Decoder for this source's tuple data, pre-loaded with any extension
    /// type oids discovered at connection time.
    fn cell_decoder(&self) -> &CellDecoder;

    async fn get_cdc_stream(&self, start: CommitPosition) -> Result<CdcStream, SourceError>;
}
