/*!
Aggregation rules shared by every storage backend.

Gauges are last-value-wins; counters accumulate by addition. All backends
route their writes through [`upsert`] (or, for batches, [`deduplicate`]
followed by [`upsert`]) so the merge contract is identical everywhere.
*/

use std::collections::{BTreeMap, HashMap};

use crate::error::MetricError;
use crate::metric::{Metric, MetricKind, MetricValue};

/// Store state: metric id to the current metric
///
/// Ordered so that listings and snapshot files are deterministic.
pub type MetricMap = BTreeMap<String, Metric>;

/// Returns true if the metric may be stored
pub fn validate(metric: &Metric) -> bool {
    metric.is_valid()
}

/// Merge two counters with the same id into one whose delta is the sum
pub fn merge_counter(old: &Metric, new: &Metric) -> Result<Metric, MetricError> {
    if old.id() != new.id() {
        return Err(MetricError::IdMismatch {
            left: new.id().to_string(),
            right: old.id().to_string(),
        });
    }

    match (old.value(), new.value()) {
        (MetricValue::Counter(a), MetricValue::Counter(b)) => {
            let delta = a
                .checked_add(b)
                .ok_or_else(|| MetricError::DeltaOverflow(old.id().to_string()))?;
            Ok(Metric::counter(old.id(), delta))
        }
        _ => Err(MetricError::KindMismatch {
            id: old.id().to_string(),
            expected: MetricKind::Counter,
            found: if old.kind() == MetricKind::Counter {
                new.kind()
            } else {
                old.kind()
            },
        }),
    }
}

/// Apply one metric to a store map and return the stored result
///
/// A gauge overwrites whatever was there. A counter is inserted as-is when
/// absent, otherwise merged into the existing counter. A counter arriving for
/// an id currently holding a gauge is a kind mismatch.
pub fn upsert(store: &mut MetricMap, new: Metric) -> Result<Metric, MetricError> {
    new.validate()?;

    let stored = match new.kind() {
        MetricKind::Gauge => new,
        MetricKind::Counter => match store.get(new.id()) {
            Some(existing) => merge_counter(existing, &new)?,
            None => new,
        },
    };

    store.insert(stored.id().to_string(), stored.clone());
    Ok(stored)
}

/// Collapse entries sharing an id into one
///
/// Counters are summed, so their result does not depend on input order.
/// Gauges keep the last value in input order. Output keeps the position of
/// each id's first appearance. Invalid metrics, and an id that appears with
/// both kinds, are rejected up front.
pub fn deduplicate(batch: Vec<Metric>) -> Result<Vec<Metric>, MetricError> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(batch.len());
    let mut merged: Vec<Metric> = Vec::with_capacity(batch.len());

    for metric in batch {
        metric.validate()?;

        match positions.get(metric.id()) {
            Some(&index) => {
                let first = &merged[index];
                if first.kind() != metric.kind() {
                    return Err(MetricError::KindMismatch {
                        id: metric.id().to_string(),
                        expected: first.kind(),
                        found: metric.kind(),
                    });
                }
                let combined = match metric.kind() {
                    MetricKind::Gauge => metric,
                    MetricKind::Counter => merge_counter(first, &metric)?,
                };
                merged[index] = combined;
            }
            None => {
                positions.insert(metric.id().to_string(), merged.len());
                merged.push(metric);
            }
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_counter_sums_deltas() {
        let merged = merge_counter(&Metric::counter("requests", 5), &Metric::counter("requests", 3))
            .unwrap();
        assert_eq!(merged, Metric::counter("requests", 8));

        let merged = merge_counter(&Metric::counter("requests", 5), &Metric::counter("requests", -7))
            .unwrap();
        assert_eq!(merged.as_counter(), Some(-2));
    }

    #[test]
    fn test_merge_counter_errors() {
        let err = merge_counter(&Metric::counter("a", 1), &Metric::counter("b", 1)).unwrap_err();
        assert!(matches!(err, MetricError::IdMismatch { .. }));

        let err = merge_counter(&Metric::gauge("a", 1.0), &Metric::counter("a", 1)).unwrap_err();
        assert_eq!(
            err,
            MetricError::KindMismatch {
                id: "a".to_string(),
                expected: MetricKind::Counter,
                found: MetricKind::Gauge,
            }
        );

        let err = merge_counter(&Metric::counter("a", i64::MAX), &Metric::counter("a", 1))
            .unwrap_err();
        assert_eq!(err, MetricError::DeltaOverflow("a".to_string()));
    }

    #[test]
    fn test_upsert_counter_accumulates() {
        let mut store = MetricMap::new();
        upsert(&mut store, Metric::counter("requests", 5)).unwrap();
        let stored = upsert(&mut store, Metric::counter("requests", 3)).unwrap();

        assert_eq!(stored.as_counter(), Some(8));
        assert_eq!(store["requests"].as_counter(), Some(8));
    }

    #[test]
    fn test_upsert_gauge_overwrites() {
        let mut store = MetricMap::new();
        upsert(&mut store, Metric::gauge("temp", 1.0)).unwrap();
        upsert(&mut store, Metric::gauge("temp", 2.5)).unwrap();
        assert_eq!(store["temp"], Metric::gauge("temp", 2.5));

        // a gauge also replaces a counter under the same id
        upsert(&mut store, Metric::counter("mixed", 4)).unwrap();
        upsert(&mut store, Metric::gauge("mixed", 0.5)).unwrap();
        assert_eq!(store["mixed"].kind(), MetricKind::Gauge);
    }

    #[test]
    fn test_upsert_rejects_invalid() {
        let mut store = MetricMap::new();
        assert_eq!(
            upsert(&mut store, Metric::gauge("", 1.0)),
            Err(MetricError::EmptyId)
        );
        assert!(store.is_empty());

        upsert(&mut store, Metric::gauge("temp", 1.0)).unwrap();
        assert!(upsert(&mut store, Metric::counter("temp", 1)).is_err());
        assert_eq!(store["temp"], Metric::gauge("temp", 1.0));
    }

    #[test]
    fn test_deduplicate_counters_order_independent() {
        let forward = vec![
            Metric::counter("x", 1),
            Metric::counter("x", 2),
            Metric::counter("x", 4),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        assert_eq!(deduplicate(forward).unwrap(), vec![Metric::counter("x", 7)]);
        assert_eq!(deduplicate(backward).unwrap(), vec![Metric::counter("x", 7)]);
    }

    #[test]
    fn test_deduplicate_gauge_last_wins() {
        let batch = vec![
            Metric::gauge("temp", 1.0),
            Metric::counter("polls", 1),
            Metric::gauge("temp", 3.0),
            Metric::gauge("load", 0.5),
        ];

        assert_eq!(
            deduplicate(batch).unwrap(),
            vec![
                Metric::gauge("temp", 3.0),
                Metric::counter("polls", 1),
                Metric::gauge("load", 0.5),
            ]
        );
    }

    #[test]
    fn test_deduplicate_rejects_invalid() {
        let batch = vec![Metric::counter("x", 1), Metric::gauge("", 2.0)];
        assert_eq!(deduplicate(batch), Err(MetricError::EmptyId));
    }

    #[test]
    fn test_deduplicate_rejects_mixed_kinds() {
        let batch = vec![
            Metric::counter("x", 2),
            Metric::gauge("x", 1.0),
            Metric::counter("x", 3),
        ];
        assert_eq!(
            deduplicate(batch),
            Err(MetricError::KindMismatch {
                id: "x".to_string(),
                expected: MetricKind::Counter,
                found: MetricKind::Gauge,
            })
        );
    }

    #[test]
    fn test_deduplicate_rejects_non_finite_gauge() {
        let batch = vec![Metric::gauge("temp", 1.0), Metric::gauge("temp", f64::NAN)];
        assert_eq!(
            deduplicate(batch),
            Err(MetricError::NonFiniteValue("temp".to_string()))
        );

        let mut store = MetricMap::new();
        assert!(upsert(&mut store, Metric::gauge("temp", f64::INFINITY)).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_replayed_batches() {
        let gauges = vec![Metric::gauge("a", 1.0), Metric::gauge("b", 2.0)];
        let counters = vec![Metric::counter("c", 3), Metric::counter("d", 4)];

        let mut store = MetricMap::new();
        for _ in 0..2 {
            for metric in deduplicate(gauges.clone()).unwrap() {
                upsert(&mut store, metric).unwrap();
            }
            for metric in deduplicate(counters.clone()).unwrap() {
                upsert(&mut store, metric).unwrap();
            }
        }

        assert_eq!(store["a"].as_gauge(), Some(1.0));
        assert_eq!(store["b"].as_gauge(), Some(2.0));
        assert_eq!(store["c"].as_counter(), Some(6));
        assert_eq!(store["d"].as_counter(), Some(8));
    }
}
