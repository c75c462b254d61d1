/*!
In-memory storage backend.
*/

use async_trait::async_trait;
use std::sync::RwLock;
use tracing::debug;

use super::MetricStore;
use crate::aggregate::{self, MetricMap};
use crate::error::StoreError;
use crate::metric::Metric;

/// Metric map guarded by a single reader/writer lock
///
/// Writers take the lock exclusively. Readers share it and always receive
/// clones, so callers can neither observe a half-applied batch nor mutate
/// the stored state through a returned value.
///
/// # Example
/// ```rust
/// use telemetron_core::{Metric, MemoryStore, MetricStore};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let store = MemoryStore::new();
/// store.store_single(Metric::counter("requests", 5)).await?;
/// store.store_single(Metric::counter("requests", 3)).await?;
///
/// let stored = store.get("requests").await?.unwrap();
/// assert_eq!(stored.as_counter(), Some(8));
/// # Ok::<(), telemetron_core::StoreError>(())
/// # }).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    metrics: RwLock<MetricMap>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with an initial state, e.g. a restored snapshot
    pub fn with_metrics(metrics: MetricMap) -> Self {
        Self {
            metrics: RwLock::new(metrics),
        }
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn store_single(&self, metric: Metric) -> Result<Metric, StoreError> {
        let mut metrics = self.metrics.write().map_err(|_| StoreError::Poisoned)?;
        let stored = aggregate::upsert(&mut metrics, metric)?;
        debug!(metric_id = stored.id(), value = %stored.value(), "Stored metric");
        Ok(stored)
    }

    async fn store_batch(&self, batch: Vec<Metric>) -> Result<(), StoreError> {
        let batch = aggregate::deduplicate(batch)?;
        let mut metrics = self.metrics.write().map_err(|_| StoreError::Poisoned)?;

        // Apply to a working copy so a failing entry leaves the store untouched
        let mut working = metrics.clone();
        for metric in batch {
            aggregate::upsert(&mut working, metric)?;
        }
        *metrics = working;

        debug!(metrics = metrics.len(), "Stored batch");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Metric>, StoreError> {
        let metrics = self.metrics.read().map_err(|_| StoreError::Poisoned)?;
        Ok(metrics.get(id).cloned())
    }

    async fn all(&self) -> Result<MetricMap, StoreError> {
        let metrics = self.metrics.read().map_err(|_| StoreError::Poisoned)?;
        Ok(metrics.clone())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.metrics
            .read()
            .map(|_| ())
            .map_err(|_| StoreError::Poisoned)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
