/*!
Storage backends for collected metrics.

[`MetricStore`] is the port every backend implements; the collector only
ever talks to an [`StoreHandle`]. Three adapters exist:

- [`MemoryStore`]: a map behind a reader/writer lock, optionally snapshotted
  to disk by the [`SnapshotScheduler`](crate::snapshot::SnapshotScheduler)
- [`FileStore`]: read-modify-write of a JSON document on every store
- `PostgresStore` (feature `postgres`): a `metrics` table, one transaction
  per call

All of them apply the merge contract from [`crate::aggregate`].
*/

pub mod file;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::aggregate::MetricMap;
use crate::config::ServerConfig;
use crate::error::StoreError;
use crate::metric::Metric;
use crate::snapshot::{read_metrics_file, SnapshotScheduler};
use crate::{Result, TelemetronError};

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Storage abstraction shared by all backends
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Validate and upsert one metric, returning the value now stored
    async fn store_single(&self, metric: Metric) -> std::result::Result<Metric, StoreError>;

    /// Deduplicate and upsert a batch as one unit
    ///
    /// Either every metric in the batch is applied or none is.
    async fn store_batch(&self, metrics: Vec<Metric>) -> std::result::Result<(), StoreError>;

    /// Look up one metric by id
    async fn get(&self, id: &str) -> std::result::Result<Option<Metric>, StoreError>;

    /// An independent copy of the full store state
    async fn all(&self) -> std::result::Result<MetricMap, StoreError>;

    /// Liveness check
    async fn ping(&self) -> std::result::Result<(), StoreError>;

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Release backend resources once the collector stops serving
    async fn close(&self) {}
}

/// Shared, type-erased store handle
pub type StoreHandle = Arc<dyn MetricStore>;

/// Open the backend selected by `config`
///
/// A database DSN selects the relational backend. Otherwise a zero store
/// interval selects the write-through file backend, and anything else the
/// in-memory backend, restored from the snapshot file when requested and
/// paired with a snapshot scheduler.
pub async fn open_store(config: &ServerConfig) -> Result<(StoreHandle, Option<SnapshotScheduler>)> {
    if let Some(dsn) = config.database_dsn.as_deref().filter(|dsn| !dsn.is_empty()) {
        return open_database(dsn).await;
    }

    if config.store_interval.is_zero() {
        if config.file_storage_path.as_os_str().is_empty() {
            return Err(TelemetronError::config(
                "write-through storage requires a file storage path",
            ));
        }
        info!(path = %config.file_storage_path.display(), "Using file-backed storage");
        let store: StoreHandle = Arc::new(FileStore::new(&config.file_storage_path));
        return Ok((store, None));
    }

    let initial = if config.restore && !config.file_storage_path.as_os_str().is_empty() {
        let path = config.file_storage_path.clone();
        let restored = tokio::task::spawn_blocking(move || read_metrics_file(&path))
            .await
            .map_err(StoreError::from)??;
        info!(
            path = %config.file_storage_path.display(),
            metrics = restored.len(),
            "Restored metrics from snapshot"
        );
        restored
    } else {
        MetricMap::new()
    };

    let store: StoreHandle = Arc::new(MemoryStore::with_metrics(initial));
    let scheduler = SnapshotScheduler::new(
        store.clone(),
        config.file_storage_path.clone(),
        config.store_interval,
    );
    info!(snapshots = scheduler.is_some(), "Using in-memory storage");
    Ok((store, scheduler))
}

#[cfg(feature = "postgres")]
async fn open_database(dsn: &str) -> Result<(StoreHandle, Option<SnapshotScheduler>)> {
    let store = PostgresStore::connect(dsn).await?;
    info!("Using PostgreSQL storage");
    Ok((Arc::new(store), None))
}

#[cfg(not(feature = "postgres"))]
async fn open_database(_dsn: &str) -> Result<(StoreHandle, Option<SnapshotScheduler>)> {
    Err(TelemetronError::config(
        "a database DSN was given but this build has no PostgreSQL support (enable feature `postgres`)",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::write_metrics_file;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            file_storage_path: dir.path().join("metrics.json"),
            database_dsn: None,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_zero_interval_selects_file_backend() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            store_interval: Duration::ZERO,
            ..config_in(&dir)
        };

        let (store, scheduler) = open_store(&config).await.unwrap();
        assert_eq!(store.backend_name(), "file");
        assert!(scheduler.is_none());
    }

    #[tokio::test]
    async fn test_memory_backend_restores_snapshot() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let mut seeded = MetricMap::new();
        seeded.insert("requests".to_string(), Metric::counter("requests", 8));
        write_metrics_file(&config.file_storage_path, &seeded).unwrap();

        let (store, scheduler) = open_store(&config).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
        assert!(scheduler.is_some());
        assert_eq!(store.all().await.unwrap(), seeded);
    }

    #[tokio::test]
    async fn test_restore_without_snapshot_starts_empty() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&config_in(&dir)).await.unwrap();
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_disabled_ignores_snapshot() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            restore: false,
            ..config_in(&dir)
        };

        let mut seeded = MetricMap::new();
        seeded.insert("temp".to_string(), Metric::gauge("temp", 1.0));
        write_metrics_file(&config.file_storage_path, &seeded).unwrap();

        let (store, _) = open_store(&config).await.unwrap();
        assert!(store.all().await.unwrap().is_empty());
    }
}
