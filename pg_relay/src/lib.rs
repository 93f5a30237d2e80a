//! Change-data-capture relay for PostgreSQL.
//!
//! Tails a source database's WAL over logical replication, assembles row
//! changes into canonical events, optionally injects schema metadata and
//! applies per-column transformations, batches events and delivers them to
//! one or more sinks (postgres, kafka, search, webhooks). A versioned
//! schema log tracks DDL so sinks can reshape themselves without data loss.
//!
//! Delivery is at-least-once: the high-water commit position is only
//! acknowledged to the source once every enabled sink has acknowledged the
//! batch containing it.

pub mod backoff;
pub mod bootstrap;
pub mod config;
pub mod conversions;
pub mod error;
pub mod pg;
pub mod pipeline;
pub mod position;
pub mod schemalog;
pub mod snapshot;
pub mod stream;
pub mod table;
pub mod transformers;
