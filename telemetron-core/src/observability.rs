/*!
Observability infrastructure for Telemetron.

- Structured logging through `tracing`, human-readable or JSON
- Optional Prometheus counters (feature `metrics`) for storage, delivery and
  snapshot activity

The recording functions are always available and do nothing until the
metrics registry has been initialised (or when the feature is off), so call
sites never need feature gates.
*/

#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, TelemetronError};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "telemetron=info";
const VERBOSE_FILTER: &str = "telemetron=debug,tower_http=debug";

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<TelemetronMetrics> = OnceLock::new();

/// Prometheus counters for Telemetron operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct TelemetronMetrics {
    pub metrics_stored_total: IntCounter,
    pub storage_retries_total: IntCounter,
    pub storage_errors_total: IntCounter,
    pub delivery_attempts_total: IntCounter,
    pub delivery_given_up_total: IntCounter,
    pub snapshot_writes_total: IntCounter,

    registry: Registry,
}

#[cfg(feature = "metrics")]
impl TelemetronMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help).map_err(|e| {
                TelemetronError::observability(format!("Failed to create {name} metric: {e}"))
            })?;
            registry.register(Box::new(counter.clone())).map_err(|e| {
                TelemetronError::observability(format!("Failed to register {name}: {e}"))
            })?;
            Ok(counter)
        };

        Ok(Self {
            metrics_stored_total: counter(
                "telemetron_metrics_stored_total",
                "Metrics accepted by the collector",
            )?,
            storage_retries_total: counter(
                "telemetron_storage_retries_total",
                "Storage operations retried after a transient failure",
            )?,
            storage_errors_total: counter(
                "telemetron_storage_errors_total",
                "Storage operations that failed for good",
            )?,
            delivery_attempts_total: counter(
                "telemetron_delivery_attempts_total",
                "Outbound batch delivery attempts",
            )?,
            delivery_given_up_total: counter(
                "telemetron_delivery_given_up_total",
                "Batches dropped after exhausting delivery retries",
            )?,
            snapshot_writes_total: counter(
                "telemetron_snapshot_writes_total",
                "Snapshot files written",
            )?,
            registry,
        })
    }

    /// Initialise the global instance once; later calls return the same one
    pub fn init() -> Result<&'static TelemetronMetrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }
        let metrics = Self::new()?;
        Ok(METRICS.get_or_init(|| metrics))
    }

    /// The global instance, if initialised
    pub fn global() -> Option<&'static TelemetronMetrics> {
        METRICS.get()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder.encode(&metric_families, &mut buffer).map_err(|e| {
            TelemetronError::observability(format!("Failed to encode metrics: {e}"))
        })?;

        String::from_utf8(buffer).map_err(|e| {
            TelemetronError::observability(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

#[cfg(feature = "metrics")]
fn with_metrics(f: impl FnOnce(&TelemetronMetrics)) {
    if let Some(metrics) = TelemetronMetrics::global() {
        f(metrics);
    }
}

/// Record metrics accepted by the collector
pub fn record_stored(_count: usize) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.metrics_stored_total.inc_by(_count as u64));
}

/// Record a storage retry
pub fn record_storage_retry() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.storage_retries_total.inc());
}

/// Record a storage operation that failed for good
pub fn record_storage_error() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.storage_errors_total.inc());
}

/// Record one outbound delivery attempt
pub fn record_delivery_attempt() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.delivery_attempts_total.inc());
}

/// Record a dropped batch
pub fn record_delivery_given_up() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.delivery_given_up_total.inc());
}

/// Record a snapshot write
pub fn record_snapshot_write() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.snapshot_writes_total.inc());
}

/// Initialize the global logging (and, with feature `metrics`, the registry)
///
/// `RUST_LOG` takes precedence; otherwise `verbose` picks between
/// [`DEFAULT_FILTER`] and debug output. `json` switches to one JSON object
/// per line.
pub fn init_observability(json: bool, verbose: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    TelemetronMetrics::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })
    });

    let registry = TracingRegistry::default().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(verbose))
            .try_init()
    };

    result.map_err(|e| {
        TelemetronError::observability(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Telemetron observability initialized");
    Ok(())
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = TelemetronMetrics::init().unwrap();
        let before = metrics.snapshot_writes_total.get();

        record_snapshot_write();
        record_stored(3);

        assert_eq!(metrics.snapshot_writes_total.get(), before + 1);
        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("telemetron_snapshot_writes_total"));
        assert!(text.contains("telemetron_metrics_stored_total"));
    }

    #[test]
    fn test_init_is_idempotent() {
        let first = TelemetronMetrics::init().unwrap() as *const TelemetronMetrics;
        let second = TelemetronMetrics::init().unwrap() as *const TelemetronMetrics;
        assert_eq!(first, second);
    }
}
