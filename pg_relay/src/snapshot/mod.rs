//! Bootstrap mode: captures the current schema and table contents of the
//! source and replays them through the regular pipeline before incremental
//! streaming takes over.

pub mod generator;
pub mod table_finder;

pub use generator::{SnapshotError, SnapshotGenerator};
pub use table_finder::TableFinder;
