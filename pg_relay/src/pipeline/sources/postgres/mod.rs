use std::{
    collections::HashMap,
    time::{Duration, UNIX_EPOCH},
};

use async_trait::async_trait;
use client::ReplicationClient;
use stream::CdcStream;
use thiserror::Error;
use tracing::info;

use crate::conversions::cell::CellDecoder;
use crate::error::{Classify, ErrorKind};
use crate::pg::{parse_config, PgUrlError};
use crate::position::CommitPosition;
use crate::table::{TableId, TableName, TableSchema};

use super::{Source, SourceError};

pub mod client;
pub mod stream;

#[derive(Debug, Error)]
pub enum PostgresSourceError {
    #[error("schema missing for table id {0}")]
    MissingSchema(TableId),

    #[error("invalid connection url: {0}")]
    Url(#[from] PgUrlError),
}

impl Classify for PostgresSourceError {
    fn kind(&self) -> ErrorKind {
        match self {
            PostgresSourceError::MissingSchema(_) => ErrorKind::Fatal,
            PostgresSourceError::Url(_) => ErrorKind::Validation,
        }
    }
}

/// Replication listener for a source postgres database. Relation metadata
/// arrives on the stream itself (the server sends a Relation message before
/// a table's first row change), so the schema map fills in as the stream
/// progresses.
pub struct PostgresSource {
    replication_client: ReplicationClient,
    table_schemas: HashMap<TableId, TableSchema>,
    publication_tables: Vec<TableName>,
    cell_decoder: CellDecoder,
    slot_name: String,
    publication: String,
    confirmed_position: CommitPosition,
}

impl PostgresSource {
    pub async fn new(
        url: &str,
        publication: &str,
        slot_name: &str,
    ) -> Result<PostgresSource, SourceError> {
        let config = parse_config(url).map_err(PostgresSourceError::Url)?;
        let replication_client = ReplicationClient::connect(config).await?;

        let confirmed_position = replication_client.get_or_create_slot(slot_name).await?;
        let table_names = replication_client
            .get_publication_table_names(publication)
            .await?;
        info!(
            publication,
            slot_name,
            tables = table_names.len(),
            "connected to replication source"
        );

        let hstore_oid = replication_client.get_hstore_oid().await?;

        Ok(PostgresSource {
            replication_client,
            table_schemas: HashMap::new(),
            publication_tables: table_names,
            cell_decoder: CellDecoder::new(hstore_oid),
            slot_name: slot_name.to_string(),
            publication: publication.to_string(),
            confirmed_position,
        })
    }

    /// Position the server has already confirmed for the slot; streaming
    /// resumes from here after a restart.
    pub fn confirmed_position(&self) -> CommitPosition {
        self.confirmed_position
    }

    /// Tables included in the publication at connect time.
    pub fn publication_tables(&self) -> &[TableName] {
        &self.publication_tables
    }
}

#[async_trait]
impl Source for PostgresSource {
    fn get_table_schema(&self, table_id: TableId) -> Result<&TableSchema, SourceError> {
        let schema = self
            .table_schemas
            .get(&table_id)
            .ok_or(PostgresSourceError::MissingSchema(table_id))?;
        Ok(schema)
    }

    fn set_table_schema(&mut self, table_schema: TableSchema) {
        self.table_schemas
            .insert(table_schema.table_id, table_schema);
    }

    fn cell_decoder(&self) -> &CellDecoder {
        &self.cell_decoder
    }

    async fn get_cdc_stream(&self, start: CommitPosition) -> Result<CdcStream, SourceError> {
        info!("starting cdc stream at {start}");
        let stream = self
            .replication_client
            .get_logical_replication_stream(&self.publication, &self.slot_name, start)
            .await?;

        // Postgres timestamps count from 2000-01-01.
        const TIME_SEC_CONVERSION: u64 = 946_684_800;
        let postgres_epoch = UNIX_EPOCH + Duration::from_secs(TIME_SEC_CONVERSION);

        Ok(CdcStream::new(stream, postgres_epoch))
    }
}
