use futures::StreamExt;
use tokio::pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::conversions::cdc_event::CdcEvent;
use crate::conversions::change_event::ChangeEvent;
use crate::position::CommitPosition;
use crate::table::TableSchema;

use super::assembler::Assembler;
use super::processors::Processor;
use super::sources::Source;
use super::stores::CheckpointHandle;
use super::PipelineError;

/// Drives the replication stream: decoded records are assembled into
/// canonical events and handed to the processor chain, whose terminal stage
/// feeds the batch queue. Acknowledgements flow the other way, from the
/// checkpointer back to the server via keepalive replies.
pub struct DataPipeline<Src: Source, P: Processor> {
    source: Src,
    processor: P,
    checkpoints: CheckpointHandle,
    cancel: CancellationToken,
}

impl<Src: Source, P: Processor> DataPipeline<Src, P> {
    pub fn new(
        source: Src,
        processor: P,
        checkpoints: CheckpointHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            processor,
            checkpoints,
            cancel,
        }
    }

    pub async fn run(mut self) -> Result<(), PipelineError> {
        let result = self.main_loop().await;
        if let Err(e) = &result {
            error!("main loop exited: {e}");
        }
        result
    }

    async fn main_loop(&mut self) -> Result<(), PipelineError> {
        let start = self.checkpoints.get_committed_position().await;
        let cdc_events = self.source.get_cdc_stream(start).await?;
        pin!(cdc_events);

        let mut assembler = Assembler::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("pipeline cancelled, stopping replication stream");
                    return Ok(());
                }
                maybe_event = cdc_events.next() => {
                    let Some(event) = maybe_event else {
                        return Err(PipelineError::StreamEnded);
                    };

                    match event.map_err(super::sources::SourceError::CdcStream)? {
                        CdcEvent::Begin(begin_body) => {
                            assembler.begin(CommitPosition::new(begin_body.final_lsn()));
                        }
                        CdcEvent::Commit(commit_body) => {
                            assembler.commit(CommitPosition::new(commit_body.commit_lsn()))?;
                        }
                        CdcEvent::Insert(insert_body) => {
                            let position = assembler.row_position()?;
                            let schema = self.source.get_table_schema(insert_body.rel_id())?;
                            let event = ChangeEvent::from_insert_proto(
                                &insert_body,
                                schema,
                                self.source.cell_decoder(),
                                position,
                            )?;
                            let event = assembler.process(event)?;
                            self.processor.process_event(event).await?;
                        }
                        CdcEvent::Update(update_body) => {
                            let position = assembler.row_position()?;
                            let schema = self.source.get_table_schema(update_body.rel_id())?;
                            let event = ChangeEvent::from_update_proto(
                                &update_body,
                                schema,
                                self.source.cell_decoder(),
                                position,
                            )?;
                            let event = assembler.process(event)?;
                            self.processor.process_event(event).await?;
                        }
                        CdcEvent::Delete(delete_body) => {
                            let position = assembler.row_position()?;
                            let schema = self.source.get_table_schema(delete_body.rel_id())?;
                            let event = ChangeEvent::from_delete_proto(
                                &delete_body,
                                schema,
                                self.source.cell_decoder(),
                                position,
                            )?;
                            let event = assembler.process(event)?;
                            self.processor.process_event(event).await?;
                        }
                        CdcEvent::Truncate(truncate_body) => {
                            // One event per truncated relation.
                            let position = assembler.row_position()?;
                            for rel_id in truncate_body.rel_ids() {
                                let schema = self.source.get_table_schema(*rel_id as u32)?;
                                let event =
                                    assembler.process(ChangeEvent::truncate(schema, position))?;
                                self.processor.process_event(event).await?;
                            }
                        }
                        CdcEvent::Relation(relation_body) => {
                            self.source
                                .set_table_schema(TableSchema::try_from(&relation_body)?);
                        }
                        CdcEvent::Type(_) => {}
                        CdcEvent::KeepAliveRequested { reply, wal_end } => {
                            if reply {
                                let position = self.checkpoints.get_position().await;
                                debug!(%position, wal_end, "replying to keepalive");
                                cdc_events
                                    .as_mut()
                                    .send_status_update(position)
                                    .await
                                    .map_err(super::sources::SourceError::StatusUpdate)?;
                            }
                        }
                    }
                }
            }
        }
    }
}
