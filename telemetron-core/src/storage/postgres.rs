//! PostgreSQL storage adapter using sqlx.
//!
//! Every store call runs in its own transaction. Counter merges are a single
//! atomic `delta = metrics.delta + EXCLUDED.delta` upsert, so two concurrent
//! transactions adding to the same counter cannot lose an update.

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

use super::MetricStore;
use crate::aggregate::{self, MetricMap};
use crate::error::{MetricError, StoreError};
use crate::metric::{Metric, MetricKind, MetricValue, RawMetric};

/// Default maximum connections in the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default pool acquire timeout.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLSTATE for `numeric_value_out_of_range`
const NUMERIC_OUT_OF_RANGE: &str = "22003";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS metrics (
    id    TEXT PRIMARY KEY,
    mtype TEXT NOT NULL,
    delta BIGINT,
    value DOUBLE PRECISION
)
"#;

const UPSERT_GAUGE: &str = r#"
INSERT INTO metrics (id, mtype, delta, value)
VALUES ($1, 'gauge', NULL, $2)
ON CONFLICT (id) DO UPDATE
SET mtype = EXCLUDED.mtype, delta = NULL, value = EXCLUDED.value
"#;

const UPSERT_COUNTER: &str = r#"
INSERT INTO metrics (id, mtype, delta, value)
VALUES ($1, 'counter', $2, NULL)
ON CONFLICT (id) DO UPDATE
SET delta = metrics.delta + EXCLUDED.delta
WHERE metrics.mtype = 'counter'
RETURNING delta
"#;

const SELECT_ONE: &str = "SELECT id, mtype, delta, value FROM metrics WHERE id = $1";
const SELECT_ALL: &str = "SELECT id, mtype, delta, value FROM metrics ORDER BY id";

type MetricRow = (String, String, Option<i64>, Option<f64>);

fn decode_row((id, kind, delta, value): MetricRow) -> Result<Metric, StoreError> {
    let raw = RawMetric {
        id,
        kind,
        delta,
        value,
    };
    Ok(Metric::try_from(raw)?)
}

/// Relational backend over a `metrics` table
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// Connect to the database and make sure the metrics table exists
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
            .connect(dsn)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the metrics table if missing
    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        info!("PostgreSQL metrics table ready");
        Ok(Self { pool })
    }
}

/// Upsert one already-validated metric on `conn`
async fn upsert_on(conn: &mut PgConnection, metric: &Metric) -> Result<Metric, StoreError> {
    match metric.value() {
        MetricValue::Gauge(value) => {
            sqlx::query(UPSERT_GAUGE)
                .bind(metric.id())
                .bind(value)
                .execute(&mut *conn)
                .await?;
            Ok(metric.clone())
        }
        MetricValue::Counter(delta) => {
            let merged: Option<i64> = sqlx::query_scalar(UPSERT_COUNTER)
                .bind(metric.id())
                .bind(delta)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| overflow_or(e, metric.id()))?;

            match merged {
                Some(total) => Ok(Metric::counter(metric.id(), total)),
                // the conflict row exists but is not a counter
                None => Err(MetricError::KindMismatch {
                    id: metric.id().to_string(),
                    expected: MetricKind::Counter,
                    found: MetricKind::Gauge,
                }
                .into()),
            }
        }
    }
}

fn overflow_or(err: sqlx::Error, id: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(NUMERIC_OUT_OF_RANGE) {
            return MetricError::DeltaOverflow(id.to_string()).into();
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl MetricStore for PostgresStore {
    async fn store_single(&self, metric: Metric) -> Result<Metric, StoreError> {
        metric.validate()?;

        let mut tx = self.pool.begin().await?;
        let stored = upsert_on(&mut tx, &metric).await?;
        tx.commit().await?;

        debug!(metric_id = stored.id(), value = %stored.value(), "Stored metric");
        Ok(stored)
    }

    async fn store_batch(&self, batch: Vec<Metric>) -> Result<(), StoreError> {
        let batch = aggregate::deduplicate(batch)?;

        // dropping the transaction on an early return rolls it back
        let mut tx = self.pool.begin().await?;
        for metric in &batch {
            upsert_on(&mut tx, metric).await?;
        }
        tx.commit().await?;

        debug!(metrics = batch.len(), "Stored batch");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Metric>, StoreError> {
        let row: Option<MetricRow> = sqlx::query_as(SELECT_ONE)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(decode_row).transpose()
    }

    async fn all(&self) -> Result<MetricMap, StoreError> {
        let rows: Vec<MetricRow> = sqlx::query_as(SELECT_ALL).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| decode_row(row).map(|metric| (metric.id().to_string(), metric)))
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }
}
