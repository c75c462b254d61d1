/*!
Snapshot persistence for the in-memory backend.

The snapshot file is a JSON array of metrics in the wire shape. It is
always rewritten whole: the new document goes to a temporary file in the
same directory which then replaces the old one, so a reader never sees a
truncated snapshot.
*/

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::aggregate::MetricMap;
use crate::error::StoreError;
use crate::metric::Metric;
use crate::observability;
use crate::storage::StoreHandle;

/// Read a metrics document from disk
///
/// A missing file is an empty store; anything that is not a valid document
/// is a decode error.
pub fn read_metrics_file(path: &Path) -> Result<MetricMap, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(MetricMap::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(MetricMap::new());
    }

    let metrics: Vec<Metric> = serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(metrics
        .into_iter()
        .map(|metric| (metric.id().to_string(), metric))
        .collect())
}

/// Replace the metrics document at `path` with `metrics`
///
/// Every metric is validated first; a document that could not be read back
/// is never written.
pub fn write_metrics_file(path: &Path, metrics: &MetricMap) -> Result<(), StoreError> {
    for metric in metrics.values() {
        metric.validate()?;
    }

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let document: Vec<&Metric> = metrics.values().collect();
    let encoded = serde_json::to_vec_pretty(&document).map_err(StoreError::Encode)?;

    let mut temp = NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;
    temp.write_all(&encoded)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| StoreError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;

    debug!(path = %path.display(), metrics = metrics.len(), "Wrote metrics file");
    Ok(())
}

/// Periodically writes the full store state to a snapshot file
///
/// Writes happen on every tick and once more when the shutdown signal
/// fires. A failed periodic write is logged and retried on the next tick;
/// a failed final write is returned to the caller.
pub struct SnapshotScheduler {
    store: StoreHandle,
    path: PathBuf,
    interval: Duration,
}

impl SnapshotScheduler {
    /// Returns `None` unless both the interval and the path are set
    pub fn new(store: StoreHandle, path: impl Into<PathBuf>, interval: Duration) -> Option<Self> {
        let path = path.into();
        if interval.is_zero() || path.as_os_str().is_empty() {
            debug!("Snapshot scheduler disabled");
            return None;
        }
        Some(Self {
            store,
            path,
            interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Write the current store state to the snapshot file once
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let metrics = self.store.all().await?;
        let count = metrics.len();
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_metrics_file(&path, &metrics)).await??;

        observability::record_snapshot_write();

        Ok(count)
    }

    /// Run until `shutdown` becomes true (or its sender is dropped), then flush once more
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        info!(
            path = %self.path.display(),
            interval_secs = self.interval.as_secs(),
            "Snapshot scheduler started"
        );

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.flush().await {
                        Ok(count) => debug!(metrics = count, "Snapshot written"),
                        Err(e) => warn!(path = %self.path.display(), error = %e, "Periodic snapshot failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        match self.flush().await {
            Ok(count) => {
                info!(path = %self.path.display(), metrics = count, "Final snapshot written");
                Ok(())
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Final snapshot failed");
                Err(e)
            }
        }
    }

    /// Run on a background task
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<Result<(), StoreError>> {
        tokio::spawn(self.run(shutdown))
    }
}
