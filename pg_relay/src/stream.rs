//! Wires configuration into a running pipeline: source, processor chain,
//! batcher, sinks and checkpointer.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::config::{ConfigError, StreamConfig};
use crate::error::{Classify, ErrorKind};
use crate::pg::{PgQuerier, PgUrlError};
use crate::pipeline::batching::{event_queue, Batcher, EventQueue};
use crate::pipeline::data_pipeline::DataPipeline;
use crate::pipeline::destinations::postgres::PostgresSink;
use crate::pipeline::destinations::stdout::StdoutSink;
use crate::pipeline::destinations::Sink;
use crate::pipeline::processors::injector::Injector;
use crate::pipeline::processors::transformer::{
    TransformerProcessor, TransformerRules, TransformerRulesError,
};
use crate::pipeline::processors::Processor;
use crate::pipeline::publisher::{Publisher, PublisherError};
use crate::pipeline::sources::postgres::PostgresSource;
use crate::pipeline::sources::SourceError;
use crate::pipeline::stores::memory::MemoryCheckpointStore;
use crate::pipeline::stores::{CheckpointError, CheckpointHandle};
use crate::pipeline::PipelineError;
use crate::schemalog::cache::CachedSchemaLogStore;
use crate::schemalog::postgres::PgSchemaLogStore;
use crate::schemalog::SchemaLogStore;
use crate::snapshot::{SnapshotError, SnapshotGenerator, TableFinder};
use crate::transformers::TransformerRegistry;

const SCHEMA_LOG_CACHE_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("connection error: {0}")]
    Url(#[from] PgUrlError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("publisher error: {0}")]
    Publisher(#[from] PublisherError),

    #[error("transformer rules error: {0}")]
    TransformerRules(#[from] TransformerRulesError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("task panicked: {0}")]
    Join(String),
}

impl Classify for StreamError {
    fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Config(_) | StreamError::Url(_) => ErrorKind::Validation,
            StreamError::Source(err) => err.kind(),
            StreamError::Checkpoint(err) => err.kind(),
            StreamError::Pipeline(err) => err.kind(),
            StreamError::Publisher(_) => ErrorKind::Fatal,
            StreamError::TransformerRules(_) => ErrorKind::Validation,
            StreamError::Snapshot(_) => ErrorKind::Fatal,
            StreamError::Join(_) => ErrorKind::Fatal,
        }
    }
}

struct Components {
    queue: EventQueue,
    chain: Box<dyn Processor>,
    checkpoints: CheckpointHandle,
    batcher_task: tokio::task::JoinHandle<Result<(), PublisherError>>,
    schema_log: Arc<dyn SchemaLogStore>,
    // Long-lived pipeline tasks; closed and awaited on shutdown.
    tasks: TaskTracker,
}

async fn build_components(
    config: &StreamConfig,
    cancel: &CancellationToken,
) -> Result<Components, StreamError> {
    config.validate()?;
    let listener = config
        .listener
        .postgres
        .as_ref()
        .ok_or(ConfigError::MissingListener)?;

    let source_querier = Arc::new(PgQuerier::connect(&listener.url).await?);
    let schema_log: Arc<dyn SchemaLogStore> = Arc::new(CachedSchemaLogStore::new(
        PgSchemaLogStore::new(source_querier),
        SCHEMA_LOG_CACHE_SIZE,
    ));

    let mut sinks: Vec<Arc<dyn Sink>> = vec![];
    if let Some(postgres) = &config.processor.postgres {
        let target_querier = Arc::new(PgQuerier::connect(&postgres.url).await?);
        sinks.push(Arc::new(PostgresSink::new(
            target_querier,
            schema_log.clone(),
        )));
    }
    if config.processor.stdout {
        sinks.push(Arc::new(StdoutSink));
    }
    info!(sinks = sinks.len(), "configured sinks");

    let checkpoints = CheckpointHandle::new(
        Arc::new(MemoryCheckpointStore::new()),
        config.checkpoint_interval(),
    )
    .await?;

    let batch_config = config.batch.to_batch_config();
    let (queue, receiver) = event_queue(batch_config.max_queue_bytes);
    let publisher = Publisher::new(
        sinks,
        checkpoints.clone(),
        config.retry.to_backoff_config(),
    );
    let tasks = TaskTracker::new();
    let batcher = Batcher::new(receiver, batch_config, publisher, cancel.child_token());
    let batcher_task = tasks.spawn(batcher.run());

    let mut chain: Box<dyn Processor> = Box::new(queue.clone());
    if let Some(transformer) = &config.processor.transformer {
        let rules = TransformerRules::from_file(&transformer.rules_file)?;
        chain = Box::new(TransformerProcessor::new(
            &rules,
            &TransformerRegistry::with_defaults(),
            chain,
        )?);
    }
    if config.processor.injector {
        chain = Box::new(Injector::new(schema_log.clone(), chain));
    }

    Ok(Components {
        queue,
        chain,
        checkpoints,
        batcher_task,
        schema_log,
        tasks,
    })
}

/// Runs the CDC pipeline until cancelled or until a stage fails. Transient
/// listener failures are retried with backoff from the last acknowledged
/// position; sink failures surface through the batcher and halt the run.
pub async fn run(config: StreamConfig, cancel: CancellationToken) -> Result<(), StreamError> {
    let listener = config
        .listener
        .postgres
        .clone()
        .ok_or(ConfigError::MissingListener)?;
    let components = build_components(&config, &cancel).await?;
    let Components {
        queue,
        chain,
        checkpoints,
        batcher_task,
        schema_log: _,
        tasks,
    } = components;
    let chain: Arc<dyn Processor> = Arc::from(chain);

    let retry = config.retry.to_backoff_config();
    let supervisor_cancel = cancel.clone();
    let supervisor_checkpoints = checkpoints.clone();
    let mut pipeline_task = tasks.spawn(async move {
        let mut backoff = Backoff::new(retry);
        loop {
            let attempt: Result<(), StreamError> = async {
                let source = PostgresSource::new(
                    &listener.url,
                    &listener.publication,
                    &listener.slot_name,
                )
                .await?;
                let pipeline = DataPipeline::new(
                    source,
                    chain.clone(),
                    supervisor_checkpoints.clone(),
                    supervisor_cancel.clone(),
                );
                pipeline.run().await?;
                Ok(())
            }
            .await;

            match attempt {
                Ok(()) => return Ok(()),
                // Teardown noise during shutdown is a clean exit.
                Err(_) if supervisor_cancel.is_cancelled() => return Ok(()),
                Err(err) if err.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!("replication attempt failed, retrying in {delay:?}: {err}");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    });
    let mut batcher_task = batcher_task;

    let result = tokio::select! {
        res = &mut pipeline_task => {
            cancel.cancel();
            queue.close();
            let batcher_result = flatten(batcher_task.await.map(|r| r.map_err(Into::into)));
            flatten(res).and(batcher_result)
        }
        res = &mut batcher_task => {
            cancel.cancel();
            queue.close();
            let pipeline_result = flatten(pipeline_task.await);
            flatten(res.map(|r| r.map_err(Into::into))).and(pipeline_result)
        }
    };

    tasks.close();
    tasks.wait().await;
    checkpoints.shutdown().await;
    info!("pipeline stopped");
    result
}

/// Bootstrap mode: captures the current schema and table contents of the
/// source and flushes them through the configured sinks.
pub async fn snapshot(config: StreamConfig, cancel: CancellationToken) -> Result<(), StreamError> {
    let listener = config
        .listener
        .postgres
        .clone()
        .ok_or(ConfigError::MissingListener)?;
    let components = build_components(&config, &cancel).await?;
    let Components {
        queue,
        chain,
        checkpoints,
        batcher_task,
        schema_log,
        tasks,
    } = components;

    let querier = Arc::new(PgQuerier::connect(&listener.url).await?);
    let tables = TableFinder::new(querier.clone())
        .find(&listener.snapshot_tables)
        .await
        .map_err(SnapshotError::Querier)?;
    info!(tables = tables.len(), "starting snapshot");

    let generator = SnapshotGenerator::new(querier, schema_log, chain);
    let result = tokio::select! {
        res = generator.snapshot(&tables) => res,
        // Nothing was acknowledged yet, so an interrupted snapshot is safe
        // to abandon and rerun.
        _ = cancel.cancelled() => {
            info!("snapshot cancelled");
            Ok(())
        }
    };

    // Drop every queue producer so the batcher drains what is left and
    // stops on its own.
    drop(generator);
    drop(queue);
    let batcher_result = flatten(batcher_task.await.map(|r| r.map_err(Into::into)));

    tasks.close();
    tasks.wait().await;
    checkpoints.shutdown().await;
    result.map_err(StreamError::Snapshot).and(batcher_result)
}

fn flatten(res: Result<Result<(), StreamError>, tokio::task::JoinError>) -> Result<(), StreamError> {
    match res {
        Ok(inner) => inner,
        Err(join_err) => Err(StreamError::Join(join_err.to_string())),
    }
}
