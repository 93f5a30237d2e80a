use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{LogEntry, SchemaLogError, SchemaLogStore, SchemaView};

/// Read-through cache over a [`SchemaLogStore`], keyed by (schema, version).
///
/// Entries are immutable once written, so cached values never need
/// invalidation; eviction is oldest-first once the bound is reached. Only
/// `fetch` is cached: the latest entry of a schema changes over time.
pub struct CachedSchemaLogStore<S> {
    inner: S,
    cache: Mutex<VersionCache>,
}

#[derive(Debug, Default)]
struct VersionCache {
    entries: HashMap<(String, i64), LogEntry>,
    order: VecDeque<(String, i64)>,
    capacity: usize,
}

impl VersionCache {
    fn get(&self, key: &(String, i64)) -> Option<LogEntry> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: (String, i64), entry: LogEntry) {
        if self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, entry);
    }
}

impl<S: SchemaLogStore> CachedSchemaLogStore<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(VersionCache {
                capacity: capacity.max(1),
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl<S: SchemaLogStore> SchemaLogStore for CachedSchemaLogStore<S> {
    async fn insert(
        &self,
        schema_name: &str,
        schema: SchemaView,
    ) -> Result<LogEntry, SchemaLogError> {
        self.inner.insert(schema_name, schema).await
    }

    async fn fetch(&self, schema_name: &str, version: i64) -> Result<LogEntry, SchemaLogError> {
        let key = (schema_name.to_string(), version);
        if let Some(entry) = self.cache.lock().expect("cache lock poisoned").get(&key) {
            return Ok(entry);
        }

        let entry = self.inner.fetch(schema_name, version).await?;
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .put(key, entry.clone());
        Ok(entry)
    }

    async fn fetch_last(
        &self,
        schema_name: &str,
        acked_only: bool,
    ) -> Result<LogEntry, SchemaLogError> {
        self.inner.fetch_last(schema_name, acked_only).await
    }

    async fn ack(&self, id: &str) -> Result<(), SchemaLogError> {
        self.inner.ack(id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::schemalog::memory::MemorySchemaLogStore;

    struct CountingStore {
        inner: MemorySchemaLogStore,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl SchemaLogStore for CountingStore {
        async fn insert(
            &self,
            schema_name: &str,
            schema: SchemaView,
        ) -> Result<LogEntry, SchemaLogError> {
            self.inner.insert(schema_name, schema).await
        }

        async fn fetch(&self, schema_name: &str, version: i64) -> Result<LogEntry, SchemaLogError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(schema_name, version).await
        }

        async fn fetch_last(
            &self,
            schema_name: &str,
            acked_only: bool,
        ) -> Result<LogEntry, SchemaLogError> {
            self.inner.fetch_last(schema_name, acked_only).await
        }

        async fn ack(&self, id: &str) -> Result<(), SchemaLogError> {
            self.inner.ack(id).await
        }
    }

    #[tokio::test]
    async fn repeated_fetches_hit_the_cache() {
        let counting = CountingStore {
            inner: MemorySchemaLogStore::new(),
            fetches: AtomicUsize::new(0),
        };
        counting
            .insert("public", SchemaView::default())
            .await
            .unwrap();

        let cached = CachedSchemaLogStore::new(counting, 16);
        cached.fetch("public", 0).await.unwrap();
        cached.fetch("public", 0).await.unwrap();
        cached.fetch("public", 0).await.unwrap();

        assert_eq!(cached.inner.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn eviction_is_bounded() {
        let counting = CountingStore {
            inner: MemorySchemaLogStore::new(),
            fetches: AtomicUsize::new(0),
        };
        for _ in 0..3 {
            counting
                .insert("public", SchemaView::default())
                .await
                .unwrap();
        }

        let cached = CachedSchemaLogStore::new(counting, 2);
        cached.fetch("public", 0).await.unwrap();
        cached.fetch("public", 1).await.unwrap();
        cached.fetch("public", 2).await.unwrap();
        // Version 0 was evicted; fetching it again goes to the store.
        cached.fetch("public", 0).await.unwrap();

        assert_eq!(cached.inner.fetches.load(Ordering::SeqCst), 4);
    }
}
