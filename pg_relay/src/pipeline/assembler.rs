use thiserror::Error;

use crate::conversions::cell::CellValue;
use crate::conversions::change_event::{
    ChangeAction, ChangeEvent, ChangeEventConversionError, EventColumn,
};
use crate::error::{Classify, ErrorKind};
use crate::position::CommitPosition;
use crate::schemalog::{self, LogEntry, SchemaView};

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("row change outside of a transaction")]
    RowOutsideTransaction,

    #[error("commit message without begin message")]
    CommitWithoutBegin,

    #[error("incorrect commit position: {got} (expected {want})")]
    IncorrectCommitPosition {
        got: CommitPosition,
        want: CommitPosition,
    },

    #[error("commit position went backwards: {got} after {previous}")]
    PositionRegression {
        got: CommitPosition,
        previous: CommitPosition,
    },

    #[error("conversion error: {0}")]
    Conversion(#[from] ChangeEventConversionError),

    #[error("malformed schema log row: {0}")]
    SchemaLogRow(String),
}

// Transaction bookkeeping only breaks when the server misbehaves or the WAL
// is corrupt; there is nothing to retry.
impl Classify for AssemblerError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

/// Groups decoded records into transactions and emits canonical events.
///
/// Begin messages carry the transaction's commit position, so rows are
/// stamped and emitted eagerly instead of buffering until the commit. The
/// commit message then only validates the expected position.
#[derive(Debug, Default)]
pub struct Assembler {
    transaction_position: Option<CommitPosition>,
    last_emitted: CommitPosition,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, commit_position: CommitPosition) {
        self.transaction_position = Some(commit_position);
    }

    pub fn commit(&mut self, commit_position: CommitPosition) -> Result<(), AssemblerError> {
        let expected = self
            .transaction_position
            .take()
            .ok_or(AssemblerError::CommitWithoutBegin)?;
        if commit_position != expected {
            return Err(AssemblerError::IncorrectCommitPosition {
                got: commit_position,
                want: expected,
            });
        }
        Ok(())
    }

    /// Commit position for rows of the in-flight transaction.
    pub fn row_position(&self) -> Result<CommitPosition, AssemblerError> {
        self.transaction_position
            .ok_or(AssemblerError::RowOutsideTransaction)
    }

    /// Finalises an event: enforces stream-wide position monotonicity and
    /// rewrites inserts into the schema log table as DDL events.
    pub fn process(&mut self, event: ChangeEvent) -> Result<ChangeEvent, AssemblerError> {
        if event.position < self.last_emitted {
            return Err(AssemblerError::PositionRegression {
                got: event.position,
                previous: self.last_emitted,
            });
        }
        self.last_emitted = event.position;

        if event.action == ChangeAction::Insert && is_schema_log_event(&event) {
            let entry = log_entry_from_columns(&event.columns)?;
            return Ok(ChangeEvent::ddl(entry, event.position));
        }
        Ok(event)
    }
}

fn is_schema_log_event(event: &ChangeEvent) -> bool {
    event.schema == schemalog::SCHEMA_NAME && event.table == schemalog::TABLE_NAME
}

/// Parses a row of the schema log table into a [`LogEntry`].
fn log_entry_from_columns(columns: &[EventColumn]) -> Result<LogEntry, AssemblerError> {
    let get = |name: &str| -> Result<&CellValue, AssemblerError> {
        columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.value)
            .ok_or_else(|| AssemblerError::SchemaLogRow(format!("missing column {name}")))
    };

    let id = match get("id")? {
        CellValue::String(s) => s.clone(),
        other => return Err(AssemblerError::SchemaLogRow(format!("bad id: {other:?}"))),
    };
    let version = match get("version")? {
        CellValue::Int(v) => *v,
        other => {
            return Err(AssemblerError::SchemaLogRow(format!(
                "bad version: {other:?}"
            )))
        }
    };
    let schema_name = match get("schema_name")? {
        CellValue::String(s) => s.clone(),
        other => {
            return Err(AssemblerError::SchemaLogRow(format!(
                "bad schema_name: {other:?}"
            )))
        }
    };
    let created_at = match get("created_at")? {
        CellValue::Timestamp(ts) => *ts,
        other => {
            return Err(AssemblerError::SchemaLogRow(format!(
                "bad created_at: {other:?}"
            )))
        }
    };
    let schema: SchemaView = match get("schema")? {
        CellValue::Json(value) => serde_json::from_value(value.clone())
            .map_err(|e| AssemblerError::SchemaLogRow(format!("bad schema snapshot: {e}")))?,
        other => {
            return Err(AssemblerError::SchemaLogRow(format!(
                "bad schema snapshot: {other:?}"
            )))
        }
    };
    let acked = match get("acked")? {
        CellValue::Bool(b) => *b,
        other => return Err(AssemblerError::SchemaLogRow(format!("bad acked: {other:?}"))),
    };

    Ok(LogEntry {
        id,
        version,
        schema_name,
        created_at,
        schema,
        acked,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn row_event(position: CommitPosition) -> ChangeEvent {
        ChangeEvent {
            action: ChangeAction::Insert,
            schema: "public".to_string(),
            table: "users".to_string(),
            columns: vec![],
            identity: vec![],
            schema_log: None,
            position,
        }
    }

    fn column(name: &str, value: CellValue) -> EventColumn {
        EventColumn {
            id: None,
            name: name.to_string(),
            type_name: String::new(),
            value,
            primary_key: false,
        }
    }

    #[test]
    fn rows_are_stamped_with_the_transaction_commit_position() {
        let mut assembler = Assembler::new();
        assembler.begin(CommitPosition::new(100));

        assert_eq!(assembler.row_position().unwrap(), CommitPosition::new(100));
        assert!(assembler.commit(CommitPosition::new(100)).is_ok());
    }

    #[test]
    fn commit_without_begin_fails() {
        let mut assembler = Assembler::new();
        let err = assembler.commit(CommitPosition::new(1)).unwrap_err();
        assert!(matches!(err, AssemblerError::CommitWithoutBegin));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn mismatched_commit_position_fails() {
        let mut assembler = Assembler::new();
        assembler.begin(CommitPosition::new(100));
        assert!(matches!(
            assembler.commit(CommitPosition::new(101)),
            Err(AssemblerError::IncorrectCommitPosition { .. })
        ));
    }

    #[test]
    fn rows_outside_a_transaction_fail() {
        let assembler = Assembler::new();
        assert!(matches!(
            assembler.row_position(),
            Err(AssemblerError::RowOutsideTransaction)
        ));
    }

    #[test]
    fn emitted_positions_never_regress() {
        let mut assembler = Assembler::new();
        assembler.process(row_event(CommitPosition::new(10))).unwrap();
        assembler.process(row_event(CommitPosition::new(10))).unwrap();
        assembler.process(row_event(CommitPosition::new(11))).unwrap();

        assert!(matches!(
            assembler.process(row_event(CommitPosition::new(5))),
            Err(AssemblerError::PositionRegression { .. })
        ));
    }

    #[test]
    fn schema_log_inserts_become_ddl_events() {
        let mut assembler = Assembler::new();
        let event = ChangeEvent {
            action: ChangeAction::Insert,
            schema: schemalog::SCHEMA_NAME.to_string(),
            table: schemalog::TABLE_NAME.to_string(),
            columns: vec![
                column("id", CellValue::String("01HX".to_string())),
                column("version", CellValue::Int(3)),
                column("schema_name", CellValue::String("public".to_string())),
                column("created_at", CellValue::Timestamp(Utc::now())),
                column(
                    "schema",
                    CellValue::Json(json!({
                        "tables": [{"oid": "1", "name": "users", "columns": [],
                                    "primary_key_columns": []}]
                    })),
                ),
                column("acked", CellValue::Bool(false)),
            ],
            identity: vec![],
            schema_log: None,
            position: CommitPosition::new(50),
        };

        let ddl = assembler.process(event).unwrap();
        assert_eq!(ddl.action, ChangeAction::Ddl);
        let entry = ddl.schema_log.unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.schema_name, "public");
        assert_eq!(entry.schema.tables[0].name, "users");
    }

    #[test]
    fn malformed_schema_log_rows_fail() {
        let mut assembler = Assembler::new();
        let event = ChangeEvent {
            action: ChangeAction::Insert,
            schema: schemalog::SCHEMA_NAME.to_string(),
            table: schemalog::TABLE_NAME.to_string(),
            columns: vec![column("id", CellValue::String("01HX".to_string()))],
            identity: vec![],
            schema_log: None,
            position: CommitPosition::new(1),
        };

        assert!(matches!(
            assembler.process(event),
            Err(AssemblerError::SchemaLogRow(_))
        ));
    }
}
