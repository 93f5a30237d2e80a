use std::str::FromStr;

use thiserror::Error;
use tokio_postgres::{
    config::ReplicationMode, replication::LogicalReplicationStream, types::PgLsn, Client, Config,
    NoTls, SimpleQueryMessage, SimpleQueryRow,
};
use tracing::{info, warn};

use crate::error::{Classify, ErrorKind};
use crate::pg::{quote_identifier, quote_literal};
use crate::position::CommitPosition;
use crate::table::TableName;

#[derive(Debug, Error)]
pub enum ReplicationClientError {
    #[error("tokio_postgres error: {0}")]
    TokioPostgres(#[from] tokio_postgres::Error),

    #[error("replication slot {0} has no confirmed flush lsn")]
    MissingSlotLsn(String),

    #[error("failed parsing lsn {0}")]
    LsnParse(String),

    #[error("publication {0} does not exist")]
    MissingPublication(String),
}

impl Classify for ReplicationClientError {
    fn kind(&self) -> ErrorKind {
        match self {
            // Connection-level failures are retried with backoff from the
            // last acknowledged position.
            ReplicationClientError::TokioPostgres(_) => ErrorKind::Transient,
            ReplicationClientError::LsnParse(_) => ErrorKind::Fatal,
            ReplicationClientError::MissingSlotLsn(_)
            | ReplicationClientError::MissingPublication(_) => ErrorKind::Validation,
        }
    }
}

/// Client on a logical replication connection. Replication connections only
/// speak the simple query protocol, so every catalog lookup goes through
/// `simple_query` with quoted identifiers and literals.
pub struct ReplicationClient {
    postgres_client: Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl ReplicationClient {
    /// Connects with `replication=database` and spawns the connection task.
    pub async fn connect(mut config: Config) -> Result<Self, ReplicationClientError> {
        config.replication_mode(ReplicationMode::Logical);
        if config.get_connect_timeout().is_none() {
            config.connect_timeout(std::time::Duration::from_secs(30));
        }
        let (postgres_client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("replication connection closed: {e}");
            }
        });

        Ok(Self {
            postgres_client,
            connection_task,
        })
    }

    /// Returns the slot's confirmed flush position, creating the slot if it
    /// does not exist yet.
    pub async fn get_or_create_slot(
        &self,
        slot_name: &str,
    ) -> Result<CommitPosition, ReplicationClientError> {
        if let Some(position) = self.slot_confirmed_position(slot_name).await? {
            info!("reusing replication slot {slot_name} at {position}");
            return Ok(position);
        }

        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput",
            quote_identifier(slot_name)
        );
        let rows = self.simple_query_rows(&query).await?;
        let row = rows
            .first()
            .ok_or_else(|| ReplicationClientError::MissingSlotLsn(slot_name.to_string()))?;
        let lsn = row
            .get("consistent_point")
            .ok_or_else(|| ReplicationClientError::MissingSlotLsn(slot_name.to_string()))?;

        info!("created replication slot {slot_name} at {lsn}");
        parse_position(lsn)
    }

    async fn slot_confirmed_position(
        &self,
        slot_name: &str,
    ) -> Result<Option<CommitPosition>, ReplicationClientError> {
        let query = format!(
            "SELECT confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = {}",
            quote_literal(slot_name)
        );
        let rows = self.simple_query_rows(&query).await?;
        match rows.first().and_then(|row| row.get("confirmed_flush_lsn")) {
            Some(lsn) => Ok(Some(parse_position(lsn)?)),
            None => Ok(None),
        }
    }

    pub async fn get_publication_table_names(
        &self,
        publication: &str,
    ) -> Result<Vec<TableName>, ReplicationClientError> {
        let query = format!(
            "SELECT schemaname, tablename FROM pg_publication_tables WHERE pubname = {}",
            quote_literal(publication)
        );
        let rows = self.simple_query_rows(&query).await?;
        if rows.is_empty() {
            return Err(ReplicationClientError::MissingPublication(
                publication.to_string(),
            ));
        }

        let mut table_names = Vec::with_capacity(rows.len());
        for row in &rows {
            if let (Some(schema), Some(name)) = (row.get("schemaname"), row.get("tablename")) {
                table_names.push(TableName {
                    schema: schema.to_string(),
                    name: name.to_string(),
                });
            }
        }
        Ok(table_names)
    }

    /// Oid of the hstore extension type, if installed. The oid differs per
    /// database so it cannot be hardcoded into the decoder.
    pub async fn get_hstore_oid(&self) -> Result<Option<u32>, ReplicationClientError> {
        let rows = self
            .simple_query_rows("SELECT oid FROM pg_type WHERE typname = 'hstore'")
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("oid"))
            .and_then(|oid| oid.parse().ok()))
    }

    pub async fn get_logical_replication_stream(
        &self,
        publication: &str,
        slot_name: &str,
        start: CommitPosition,
    ) -> Result<LogicalReplicationStream, ReplicationClientError> {
        let start_lsn: PgLsn = start.into();
        let options = format!(
            "(\"proto_version\" '1', \"publication_names\" {})",
            quote_literal(publication)
        );
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {start_lsn} {options}",
            quote_identifier(slot_name)
        );

        let copy_stream = self
            .postgres_client
            .copy_both_simple::<bytes::Bytes>(&query)
            .await?;

        Ok(LogicalReplicationStream::new(copy_stream))
    }

    async fn simple_query_rows(
        &self,
        query: &str,
    ) -> Result<Vec<SimpleQueryRow>, ReplicationClientError> {
        let messages = self.postgres_client.simple_query(query).await?;
        Ok(messages
            .into_iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .collect())
    }
}

fn parse_position(lsn: &str) -> Result<CommitPosition, ReplicationClientError> {
    PgLsn::from_str(lsn)
        .map(CommitPosition::from)
        .map_err(|_| ReplicationClientError::LsnParse(lsn.to_string()))
}

impl Drop for ReplicationClient {
    fn drop(&mut self) {
        // The connection task must not outlive the client it drives.
        self.connection_task.abort();
    }
}
