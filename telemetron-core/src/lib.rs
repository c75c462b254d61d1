/*!
# Telemetron Core Engine

Push-based metrics collection: an agent samples host and process gauges and
ships them in batches, a collector merges them into one of several storage
backends.

This crate provides:

- The metric model (gauges and counters) and its merge rules
- Storage backends behind one [`MetricStore`] port: in-memory with periodic
  snapshots, write-through JSON file, and PostgreSQL (feature `postgres`)
- The wire codec: gzip bodies, optionally signed with HMAC-SHA256
- The agent pipeline: sampler, bounded-concurrency sender, graceful drain
- The collector's HTTP router

## Architecture

The collector only talks to a [`StoreHandle`]; backends are adapters chosen
at startup by [`open_store`]. Every storage call made for a request and every
outbound delivery runs under a bounded linear retry from `telemetron-retry`.

## Usage

```rust
use telemetron_core::aggregate::{upsert, MetricMap};
use telemetron_core::Metric;

let mut store = MetricMap::new();
upsert(&mut store, Metric::counter("PollCount", 2)).unwrap();
let merged = upsert(&mut store, Metric::counter("PollCount", 3)).unwrap();
assert_eq!(merged.as_counter(), Some(5));

upsert(&mut store, Metric::gauge("RandomValue", 0.25)).unwrap();
let replaced = upsert(&mut store, Metric::gauge("RandomValue", 0.75)).unwrap();
assert_eq!(replaced.as_gauge(), Some(0.75));
```
*/

pub mod agent;
pub mod aggregate;
pub mod compression;
pub mod config;
pub mod error;
pub mod metric;
pub mod observability;
pub mod server;
pub mod signing;
pub mod snapshot;
pub mod storage;

pub use agent::{Agent, AgentHandle};
pub use aggregate::MetricMap;
pub use compression::{CompressionAdapter, GzipCompressor};
pub use config::{AgentConfig, ServerConfig};
pub use error::{MetricError, Result, StoreError, TelemetronError};
pub use metric::{Metric, MetricKind, MetricValue, RawMetric};
pub use server::{create_router, AppState};
pub use signing::{Signer, SIGNATURE_HEADER};
pub use snapshot::{read_metrics_file, write_metrics_file, SnapshotScheduler};
#[cfg(feature = "postgres")]
pub use storage::PostgresStore;
pub use storage::{open_store, FileStore, MemoryStore, MetricStore, StoreHandle};
