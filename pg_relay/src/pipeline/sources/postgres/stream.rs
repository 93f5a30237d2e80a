use std::{
    pin::Pin,
    task::{Context, Poll},
    time::{SystemTime, SystemTimeError},
};

use futures::{ready, Stream};
use pin_project_lite::pin_project;
use thiserror::Error;
use tokio_postgres::replication::LogicalReplicationStream;

use crate::conversions::cdc_event::{CdcEvent, CdcEventConversionError};
use crate::error::{Classify, ErrorKind};
use crate::position::CommitPosition;

#[derive(Debug, Error)]
pub enum CdcStreamError {
    #[error("tokio_postgres error: {0}")]
    TokioPostgres(#[from] tokio_postgres::Error),

    #[error("cdc event conversion error: {0}")]
    CdcEventConversion(#[from] CdcEventConversionError),

    #[error("server position went backwards: {current} after {previous}")]
    PositionRegression {
        previous: CommitPosition,
        current: CommitPosition,
    },
}

impl Classify for CdcStreamError {
    fn kind(&self) -> ErrorKind {
        match self {
            // Stream I/O failures are retried from the last acknowledged
            // position; a corrupt record or a regressing server are not.
            CdcStreamError::TokioPostgres(_) => ErrorKind::Transient,
            CdcStreamError::CdcEventConversion(_) => ErrorKind::Fatal,
            CdcStreamError::PositionRegression { .. } => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum StatusUpdateError {
    #[error("system time error: {0}")]
    SystemTime(#[from] SystemTimeError),

    #[error("tokio_postgres error: {0}")]
    TokioPostgres(#[from] tokio_postgres::Error),
}

pin_project! {
    /// Lazy, unbounded, non-restartable stream of decoded replication
    /// messages. Dropping it terminates the stream.
    #[must_use = "streams do nothing unless polled"]
    pub struct CdcStream {
        #[pin]
        stream: LogicalReplicationStream,
        postgres_epoch: SystemTime,
        last_position: CommitPosition,
    }
}

impl CdcStream {
    pub fn new(stream: LogicalReplicationStream, postgres_epoch: SystemTime) -> CdcStream {
        CdcStream {
            stream,
            postgres_epoch,
            last_position: CommitPosition::default(),
        }
    }

    /// Replies to the server with the given position as written, flushed and
    /// applied. Must happen within the server's keepalive timeout or the
    /// connection is dropped.
    pub async fn send_status_update(
        self: Pin<&mut Self>,
        position: CommitPosition,
    ) -> Result<(), StatusUpdateError> {
        let this = self.project();
        let lsn = position.into();
        let ts = this.postgres_epoch.elapsed()?.as_micros() as i64;
        this.stream
            .standby_status_update(lsn, lsn, lsn, ts, 0)
            .await?;

        Ok(())
    }
}

impl Stream for CdcStream {
    type Item = Result<CdcEvent, CdcStreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match ready!(this.stream.poll_next(cx)) {
            Some(Ok(msg)) => {
                if let postgres_protocol::message::backend::ReplicationMessage::XLogData(body) =
                    &msg
                {
                    let current = CommitPosition::new(body.wal_start());
                    if current < *this.last_position {
                        return Poll::Ready(Some(Err(CdcStreamError::PositionRegression {
                            previous: *this.last_position,
                            current,
                        })));
                    }
                    *this.last_position = current;
                }
                match CdcEvent::try_from(msg) {
                    Ok(event) => Poll::Ready(Some(Ok(event))),
                    Err(e) => Poll::Ready(Some(Err(e.into()))),
                }
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e.into()))),
            None => Poll::Ready(None),
        }
    }
}
