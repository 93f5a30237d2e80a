//! Privileged setup: creates the relay's schema and schema-log table on the
//! source database, plus the publication and replication slot the listener
//! expects.

use thiserror::Error;
use tracing::info;

use crate::conversions::cell::CellValue;
use crate::pg::{quote_identifier, PgQuerier, PgUrlError, Querier, QuerierError, Query};

const CREATE_SCHEMA: &str = "CREATE SCHEMA IF NOT EXISTS pgrelay";

const CREATE_SCHEMA_LOG_TABLE: &str = "CREATE TABLE IF NOT EXISTS pgrelay.schema_log (\n\
     id text PRIMARY KEY,\n\
     version bigint NOT NULL,\n\
     schema_name text NOT NULL,\n\
     created_at timestamptz NOT NULL DEFAULT now(),\n\
     schema jsonb NOT NULL,\n\
     acked boolean NOT NULL DEFAULT false,\n\
     UNIQUE (schema_name, version)\n\
     )";

const CREATE_SCHEMA_LOG_INDEX: &str = "CREATE INDEX IF NOT EXISTS schema_log_version_idx \
     ON pgrelay.schema_log (schema_name, version DESC)";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("connection error: {0}")]
    Url(#[from] PgUrlError),

    #[error("querier error: {0}")]
    Querier(#[from] QuerierError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub schema_log_ready: bool,
    pub publication_exists: bool,
    pub slot_exists: bool,
    pub confirmed_flush_lsn: Option<String>,
}

/// Creates the pgrelay schema, the schema-log table, the publication and
/// the replication slot. Every step is idempotent.
pub async fn init(url: &str, publication: &str, slot_name: &str) -> Result<(), BootstrapError> {
    let querier = PgQuerier::connect(url).await?;

    querier.execute(&Query::new(CREATE_SCHEMA)).await?;
    querier.execute(&Query::new(CREATE_SCHEMA_LOG_TABLE)).await?;
    querier.execute(&Query::new(CREATE_SCHEMA_LOG_INDEX)).await?;
    info!("schema log table ready");

    let publications = querier
        .query(&Query::with_params(
            "SELECT pubname FROM pg_publication WHERE pubname = $1",
            vec![CellValue::String(publication.to_string())],
        ))
        .await?;
    if publications.is_empty() {
        querier
            .execute(&Query::new(format!(
                "CREATE PUBLICATION {} FOR ALL TABLES",
                quote_identifier(publication)
            )))
            .await?;
        info!(publication, "created publication");
    }

    let slots = querier
        .query(&Query::with_params(
            "SELECT slot_name FROM pg_replication_slots WHERE slot_name = $1",
            vec![CellValue::String(slot_name.to_string())],
        ))
        .await?;
    if slots.is_empty() {
        querier
            .query(&Query::with_params(
                "SELECT pg_create_logical_replication_slot($1, 'pgoutput')",
                vec![CellValue::String(slot_name.to_string())],
            ))
            .await?;
        info!(slot_name, "created replication slot");
    }

    querier.close().await?;
    Ok(())
}

pub async fn status(
    url: &str,
    publication: &str,
    slot_name: &str,
) -> Result<SourceStatus, BootstrapError> {
    let querier = PgQuerier::connect(url).await?;

    let schema_log_ready = !querier
        .query(&Query::new(
            "SELECT tablename FROM pg_tables WHERE schemaname = 'pgrelay' AND tablename = 'schema_log'",
        ))
        .await?
        .is_empty();

    let publication_exists = !querier
        .query(&Query::with_params(
            "SELECT pubname FROM pg_publication WHERE pubname = $1",
            vec![CellValue::String(publication.to_string())],
        ))
        .await?
        .is_empty();

    let slots = querier
        .query(&Query::with_params(
            "SELECT slot_name, confirmed_flush_lsn::text AS confirmed_flush_lsn \
             FROM pg_replication_slots WHERE slot_name = $1",
            vec![CellValue::String(slot_name.to_string())],
        ))
        .await?;
    let slot_exists = !slots.is_empty();
    let confirmed_flush_lsn = slots.first().and_then(|row| match row.get("confirmed_flush_lsn") {
        Some(CellValue::String(lsn)) => Some(lsn.clone()),
        _ => None,
    });

    querier.close().await?;
    Ok(SourceStatus {
        schema_log_ready,
        publication_exists,
        slot_exists,
        confirmed_flush_lsn,
    })
}
