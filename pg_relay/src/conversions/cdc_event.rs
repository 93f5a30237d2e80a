use postgres_protocol::message::backend::{
    BeginBody, CommitBody, DeleteBody, InsertBody, LogicalReplicationMessage, RelationBody,
    ReplicationMessage, TruncateBody, TypeBody, UpdateBody,
};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

#[derive(Debug, Error)]
pub enum CdcEventConversionError {
    #[error("message not supported")]
    MessageNotSupported,

    #[error("unknown replication message")]
    UnknownReplicationMessage,
}

// An undecodable replication message means the stream cannot safely
// continue: positions past it would acknowledge data we never saw.
impl Classify for CdcEventConversionError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

/// One message off the logical replication stream, before transaction
/// assembly. Keepalives never reach the event stream; they only drive
/// liveness.
#[derive(Debug)]
pub enum CdcEvent {
    Begin(BeginBody),
    Commit(CommitBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
    Relation(RelationBody),
    Type(TypeBody),
    KeepAliveRequested { reply: bool, wal_end: u64 },
}

impl TryFrom<ReplicationMessage<LogicalReplicationMessage>> for CdcEvent {
    type Error = CdcEventConversionError;

    fn try_from(
        value: ReplicationMessage<LogicalReplicationMessage>,
    ) -> Result<CdcEvent, CdcEventConversionError> {
        match value {
            ReplicationMessage::XLogData(xlog_data) => match xlog_data.into_data() {
                LogicalReplicationMessage::Begin(begin_body) => Ok(CdcEvent::Begin(begin_body)),
                LogicalReplicationMessage::Commit(commit_body) => Ok(CdcEvent::Commit(commit_body)),
                LogicalReplicationMessage::Relation(relation_body) => {
                    Ok(CdcEvent::Relation(relation_body))
                }
                LogicalReplicationMessage::Insert(insert_body) => Ok(CdcEvent::Insert(insert_body)),
                LogicalReplicationMessage::Update(update_body) => Ok(CdcEvent::Update(update_body)),
                LogicalReplicationMessage::Delete(delete_body) => Ok(CdcEvent::Delete(delete_body)),
                LogicalReplicationMessage::Truncate(truncate_body) => {
                    Ok(CdcEvent::Truncate(truncate_body))
                }
                LogicalReplicationMessage::Type(type_body) => Ok(CdcEvent::Type(type_body)),
                LogicalReplicationMessage::Origin(_) => {
                    Err(CdcEventConversionError::MessageNotSupported)
                }
                _ => Err(CdcEventConversionError::UnknownReplicationMessage),
            },
            ReplicationMessage::PrimaryKeepAlive(keep_alive) => Ok(CdcEvent::KeepAliveRequested {
                reply: keep_alive.reply() == 1,
                wal_end: keep_alive.wal_end(),
            }),
            _ => Err(CdcEventConversionError::UnknownReplicationMessage),
        }
    }
}
