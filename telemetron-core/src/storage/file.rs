/*!
File-backed storage adapter.
*/

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::MetricStore;
use crate::aggregate::{self, MetricMap};
use crate::error::StoreError;
use crate::metric::Metric;
use crate::snapshot::{read_metrics_file, write_metrics_file};

/// Write-through storage in a single JSON document
///
/// Every write decodes the whole document, applies the upsert and rewrites
/// the whole document. A missing file reads as an empty store. The lock
/// serializes callers within one process only; there is no file locking
/// across processes.
#[derive(Debug, Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.as_ref().to_path_buf(),
                lock: RwLock::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run a read-modify-write cycle under the exclusive lock on the blocking pool
    async fn modify<T, F>(&self, apply: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut MetricMap) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let _guard = inner.lock.write().map_err(|_| StoreError::Poisoned)?;
            let mut metrics = read_metrics_file(&inner.path)?;
            let result = apply(&mut metrics)?;
            write_metrics_file(&inner.path, &metrics)?;
            Ok(result)
        })
        .await?
    }

    /// Read the document under the shared lock on the blocking pool
    async fn read(&self) -> Result<MetricMap, StoreError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let _guard = inner.lock.read().map_err(|_| StoreError::Poisoned)?;
            read_metrics_file(&inner.path)
        })
        .await?
    }
}

#[async_trait]
impl MetricStore for FileStore {
    async fn store_single(&self, metric: Metric) -> Result<Metric, StoreError> {
        // reject before touching the disk
        metric.validate()?;

        let stored = self
            .modify(move |metrics| Ok(aggregate::upsert(metrics, metric)?))
            .await?;
        debug!(metric_id = stored.id(), path = %self.path().display(), "Stored metric");
        Ok(stored)
    }

    async fn store_batch(&self, batch: Vec<Metric>) -> Result<(), StoreError> {
        let batch = aggregate::deduplicate(batch)?;
        let count = batch.len();

        // the document is only rewritten once every upsert succeeded
        self.modify(move |metrics| {
            for metric in batch {
                aggregate::upsert(metrics, metric)?;
            }
            Ok(())
        })
        .await?;

        debug!(metrics = count, path = %self.path().display(), "Stored batch");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Metric>, StoreError> {
        let mut metrics = self.read().await?;
        Ok(metrics.remove(id))
    }

    async fn all(&self) -> Result<MetricMap, StoreError> {
        self.read().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.read().await.map(|_| ())
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path().join("metrics.json"))
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert!(store.all().await.unwrap().is_empty());
        assert_eq!(store.get("requests").await.unwrap(), None);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_counter_accumulates_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.store_single(Metric::counter("requests", 5)).await.unwrap();
        let stored = store.store_single(Metric::counter("requests", 3)).await.unwrap();
        assert_eq!(stored.as_counter(), Some(8));

        // a second handle on the same file sees the persisted state
        let reopened = store_in(&dir);
        assert_eq!(
            reopened.get("requests").await.unwrap(),
            Some(Metric::counter("requests", 8))
        );
    }

    #[tokio::test]
    async fn test_gauge_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.store_single(Metric::gauge("temp", 1.0)).await.unwrap();
        store.store_single(Metric::gauge("temp", 2.5)).await.unwrap();
        assert_eq!(store.get("temp").await.unwrap().unwrap().as_gauge(), Some(2.5));
    }

    #[tokio::test]
    async fn test_batch_deduplicates() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store
            .store_batch(vec![
                Metric::counter("x", 1),
                Metric::gauge("temp", 4.0),
                Metric::counter("x", 2),
            ])
            .await
            .unwrap();

        let all = store.all().await.unwrap();
        assert_eq!(all["x"].as_counter(), Some(3));
        assert_eq!(all["temp"].as_gauge(), Some(4.0));
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.store_single(Metric::gauge("temp", 1.0)).await.unwrap();
        let before = fs::read(store.path()).unwrap();

        let result = store
            .store_batch(vec![Metric::counter("fresh", 1), Metric::counter("temp", 1)])
            .await;

        assert!(result.unwrap_err().is_validation());
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_malformed_file_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), b"[{\"id\": ").unwrap();

        assert!(matches!(store.all().await, Err(StoreError::Decode { .. })));
        assert!(matches!(
            store.store_single(Metric::gauge("temp", 1.0)).await,
            Err(StoreError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_metric_does_not_touch_disk() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let err = store.store_single(Metric::counter("", 1)).await.unwrap_err();
        assert!(err.is_validation());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_non_finite_gauge_keeps_document_readable() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.store_single(Metric::gauge("temp", 1.0)).await.unwrap();

        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = store.store_single(Metric::gauge("x", value)).await.unwrap_err();
            assert!(err.is_validation());

            let err = store
                .store_batch(vec![Metric::counter("c", 1), Metric::gauge("x", value)])
                .await
                .unwrap_err();
            assert!(err.is_validation());
        }

        store.store_single(Metric::gauge("y", 2.0)).await.unwrap();
        let all = read_metrics_file(store.path()).unwrap();
        assert_eq!(all.keys().map(String::as_str).collect::<Vec<_>>(), ["temp", "y"]);
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut tasks = Vec::new();

        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.store_single(Metric::counter("hits", 1)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get("hits").await.unwrap().unwrap().as_counter(), Some(16));
    }
}
