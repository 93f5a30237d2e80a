use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::pipeline::batching::Batch;

use super::{Sink, SinkError};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook delivery failed: {0}")]
    Delivery(String),

    #[error("subscription store failure: {0}")]
    Store(String),
}

/// A webhook endpoint with filtering rules. Empty filter dimensions act as
/// wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub url: String,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
}

impl Subscription {
    /// A subscription matches an event when each non-empty filter dimension
    /// agrees with it.
    pub fn is_for(&self, action: &str, schema: &str, table: &str) -> bool {
        if action.is_empty() && schema.is_empty() && table.is_empty() {
            return true;
        }

        if !action.is_empty()
            && !self.event_types.is_empty()
            && !self.event_types.iter().any(|t| t == action)
        {
            return false;
        }

        if !schema.is_empty() && !self.schema.is_empty() && self.schema != schema {
            return false;
        }

        if !table.is_empty() && !self.table.is_empty() && self.table != table {
            return false;
        }

        true
    }

    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.url, self.schema, self.table)
    }
}

/// Store of webhook subscriptions. Mutated only through explicit create and
/// delete calls; the notifier only reads.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create(&self, subscription: Subscription) -> Result<(), WebhookError>;

    async fn delete(&self, subscription: &Subscription) -> Result<(), WebhookError>;

    async fn get_subscriptions(
        &self,
        action: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<Subscription>, WebhookError>;
}

/// In-memory subscription store. Reads are frequent (one lookup per event),
/// writes rare, hence the read-write lock.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn create(&self, subscription: Subscription) -> Result<(), WebhookError> {
        self.subscriptions
            .write()
            .await
            .insert(subscription.key(), subscription);
        Ok(())
    }

    async fn delete(&self, subscription: &Subscription) -> Result<(), WebhookError> {
        self.subscriptions.write().await.remove(&subscription.key());
        Ok(())
    }

    async fn get_subscriptions(
        &self,
        action: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<Subscription>, WebhookError> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.is_for(action, schema, table))
            .cloned()
            .collect())
    }
}

/// Seam behind which the concrete HTTP client lives.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn send(&self, url: &str, payload: &serde_json::Value) -> Result<(), WebhookError>;
}

/// POSTs each event to every matching subscription. Deliveries fan out
/// independently: one failing URL neither blocks the others nor the stream,
/// and there are no retries across a flush.
pub struct WebhookSink {
    store: Arc<dyn SubscriptionStore>,
    client: Arc<dyn WebhookClient>,
}

impl WebhookSink {
    pub fn new(store: Arc<dyn SubscriptionStore>, client: Arc<dyn WebhookClient>) -> Self {
        Self { store, client }
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn write_batch(&self, batch: &Batch) -> Result<(), SinkError> {
        for event in batch.events() {
            let subscriptions = self
                .store
                .get_subscriptions(event.action.as_str(), &event.schema, &event.table)
                .await
                .map_err(|e| SinkError::Transient(e.to_string()))?;
            if subscriptions.is_empty() {
                continue;
            }

            let payload = event.to_json();
            debug!(
                urls = subscriptions.len(),
                position = %event.position,
                "notifying webhook subscribers"
            );
            let deliveries = subscriptions
                .iter()
                .map(|subscription| self.client.send(&subscription.url, &payload));
            for (subscription, result) in subscriptions.iter().zip(join_all(deliveries).await) {
                if let Err(e) = result {
                    warn!(url = %subscription.url, "webhook delivery failed: {e}");
                }
            }
        }
        Ok(())
    }
}
