//! End-to-end tests of the in-process pipeline: processor chain, batch
//! queue, batcher, publisher and sinks, with the replication listener
//! replaced by direct event injection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pg_relay::backoff::BackoffConfig;
use pg_relay::conversions::cell::CellValue;
use pg_relay::conversions::change_event::{ChangeAction, ChangeEvent, EventColumn};
use pg_relay::pipeline::batching::{event_queue, Batch, BatchConfig, Batcher};
use pg_relay::pipeline::destinations::{Sink, SinkError};
use pg_relay::pipeline::processors::injector::Injector;
use pg_relay::pipeline::processors::transformer::{TableRules, TransformerProcessor, TransformerRules};
use pg_relay::pipeline::processors::Processor;
use pg_relay::pipeline::publisher::Publisher;
use pg_relay::pipeline::stores::memory::MemoryCheckpointStore;
use pg_relay::pipeline::stores::CheckpointHandle;
use pg_relay::position::CommitPosition;
use pg_relay::schemalog::memory::MemorySchemaLogStore;
use pg_relay::schemalog::{Column, SchemaLogStore, SchemaView, Table};
use pg_relay::transformers::{TransformerConfig, TransformerRegistry};

#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<Vec<ChangeEvent>>>,
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn write_batch(&self, batch: &Batch) -> Result<(), SinkError> {
        self.batches.lock().unwrap().push(batch.events().to_vec());
        Ok(())
    }
}

fn insert_event(position: u64, columns: Vec<EventColumn>) -> ChangeEvent {
    ChangeEvent {
        action: ChangeAction::Insert,
        schema: "public".to_string(),
        table: "users".to_string(),
        columns,
        identity: vec![],
        schema_log: None,
        position: CommitPosition::new(position),
    }
}

fn text_column(name: &str, value: &str) -> EventColumn {
    EventColumn {
        id: None,
        name: name.to_string(),
        type_name: "text".to_string(),
        value: CellValue::String(value.to_string()),
        primary_key: false,
    }
}

fn retry_config() -> BackoffConfig {
    BackoffConfig {
        initial_interval: Duration::from_millis(1),
        multiplier: 1.0,
        max_interval: Duration::from_millis(1),
        max_attempts: 1,
    }
}

#[tokio::test]
async fn events_flow_through_to_every_sink_in_order() {
    let (queue, receiver) = event_queue(1024 * 1024);
    let sink_a = Arc::new(RecordingSink::default());
    let sink_b = Arc::new(RecordingSink::default());

    let checkpoints = CheckpointHandle::new(
        Arc::new(MemoryCheckpointStore::new()),
        Duration::from_secs(3600),
    )
    .await
    .unwrap();
    let publisher = Publisher::new(
        vec![sink_a.clone(), sink_b.clone()],
        checkpoints.clone(),
        retry_config(),
    );
    let batcher = Batcher::new(
        receiver,
        BatchConfig {
            batch_size: 2,
            batch_time: Duration::from_secs(3600),
            max_queue_bytes: 1024 * 1024,
        },
        publisher,
        CancellationToken::new(),
    );
    let batcher_task = tokio::spawn(batcher.run());

    for position in 1..=6 {
        queue
            .send(insert_event(position, vec![text_column("id", "x")]))
            .await
            .unwrap();
    }
    drop(queue);
    batcher_task.await.unwrap().unwrap();

    for sink in [&sink_a, &sink_b] {
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 3);

        // Positions observed by the sink never regress.
        let positions: Vec<CommitPosition> = batches
            .iter()
            .flatten()
            .map(|event| event.position)
            .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }

    // The checkpointer advanced to the last acknowledged position.
    assert_eq!(checkpoints.get_position().await, CommitPosition::new(6));
    checkpoints.shutdown().await;
}

#[tokio::test]
async fn ddl_events_split_batches() {
    let (queue, receiver) = event_queue(1024 * 1024);
    let sink = Arc::new(RecordingSink::default());

    let checkpoints = CheckpointHandle::new(
        Arc::new(MemoryCheckpointStore::new()),
        Duration::from_secs(3600),
    )
    .await
    .unwrap();
    let publisher = Publisher::new(vec![sink.clone()], checkpoints.clone(), retry_config());
    let batcher = Batcher::new(
        receiver,
        BatchConfig {
            batch_size: 100,
            batch_time: Duration::from_secs(3600),
            max_queue_bytes: 1024 * 1024,
        },
        publisher,
        CancellationToken::new(),
    );
    let batcher_task = tokio::spawn(batcher.run());

    let store = MemorySchemaLogStore::new();
    let entry = store.insert("public", SchemaView::default()).await.unwrap();

    queue
        .send(insert_event(1, vec![text_column("id", "a")]))
        .await
        .unwrap();
    queue
        .send(insert_event(2, vec![text_column("id", "b")]))
        .await
        .unwrap();
    queue
        .send(ChangeEvent::ddl(entry, CommitPosition::new(3)))
        .await
        .unwrap();
    queue
        .send(insert_event(4, vec![text_column("id", "c")]))
        .await
        .unwrap();
    drop(queue);
    batcher_task.await.unwrap().unwrap();

    let batches = sink.batches.lock().unwrap();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].len(), 2);
    assert_eq!(batches[1].len(), 1);
    assert_eq!(batches[1][0].action, ChangeAction::Ddl);
    assert_eq!(batches[2].len(), 1);

    checkpoints.shutdown().await;
}

#[tokio::test]
async fn the_processor_chain_stamps_and_masks_before_batching() {
    // Schema log with an immutable id for each column.
    let schema_log = Arc::new(MemorySchemaLogStore::new());
    schema_log
        .insert(
            "public",
            SchemaView {
                tables: vec![Table {
                    oid: "1".to_string(),
                    name: "users".to_string(),
                    columns: vec![
                        Column {
                            id: "c-1".to_string(),
                            name: "id".to_string(),
                            data_type: "text".to_string(),
                            ..Default::default()
                        },
                        Column {
                            id: "c-2".to_string(),
                            name: "email".to_string(),
                            data_type: "text".to_string(),
                            ..Default::default()
                        },
                    ],
                    primary_key_columns: vec!["id".to_string()],
                }],
            },
        )
        .await
        .unwrap();

    let (queue, receiver) = event_queue(1024 * 1024);
    let sink = Arc::new(RecordingSink::default());
    let checkpoints = CheckpointHandle::new(
        Arc::new(MemoryCheckpointStore::new()),
        Duration::from_secs(3600),
    )
    .await
    .unwrap();
    let publisher = Publisher::new(vec![sink.clone()], checkpoints.clone(), retry_config());
    let batcher = Batcher::new(
        receiver,
        BatchConfig::default(),
        publisher,
        CancellationToken::new(),
    );
    let batcher_task = tokio::spawn(batcher.run());

    // email is scrambled, id left alone.
    let rules = TransformerRules {
        transformers: vec![TableRules {
            schema: "public".to_string(),
            table: "users".to_string(),
            column_rules: [(
                "email".to_string(),
                TransformerConfig {
                    name: "at_email".to_string(),
                    parameters: Default::default(),
                },
            )]
            .into_iter()
            .collect(),
        }],
    };
    let chain = Injector::new(
        schema_log.clone(),
        TransformerProcessor::new(&rules, &TransformerRegistry::with_defaults(), queue.clone())
            .unwrap(),
    );

    chain
        .process_event(insert_event(
            7,
            vec![
                text_column("id", "u-1"),
                text_column("email", "ada@example.com"),
            ],
        ))
        .await
        .unwrap();

    drop(chain);
    drop(queue);
    batcher_task.await.unwrap().unwrap();

    let batches = sink.batches.lock().unwrap();
    let event = &batches[0][0];

    // Injector ran first: immutable ids and the primary-key flag are set.
    assert_eq!(event.columns[0].id.as_deref(), Some("c-1"));
    assert!(event.columns[0].primary_key);
    assert_eq!(event.columns[1].id.as_deref(), Some("c-2"));

    // The transformer masked the email but kept it email-shaped.
    let CellValue::String(masked) = &event.columns[1].value else {
        panic!("expected string value");
    };
    assert_ne!(masked, "ada@example.com");
    assert!(masked.ends_with("@crypt.com"));

    checkpoints.shutdown().await;
}
