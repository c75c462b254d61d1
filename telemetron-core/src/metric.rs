/*!
Metric value model.

A [`Metric`] is an id plus exactly one typed payload. The payload is a sum
type, so a gauge carrying a delta (or a counter carrying neither) cannot be
constructed; such shapes only exist on the wire as [`RawMetric`] and are
rejected when converted.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MetricError;

/// The two supported metric kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Last-value-wins floating point sample
    Gauge,
    /// Running sum of signed integer deltas
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(MetricError::UnknownKind(other.to_string())),
        }
    }
}

/// Typed metric payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// Parse a plain-text scalar of the given kind
    ///
    /// `NaN` and the infinities are rejected: JSON has no encoding for them.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, MetricError> {
        let invalid = || MetricError::InvalidScalar {
            kind,
            raw: raw.to_string(),
        };
        match kind {
            MetricKind::Gauge => raw
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(MetricValue::Gauge)
                .ok_or_else(invalid),
            MetricKind::Counter => raw
                .parse::<i64>()
                .map(MetricValue::Counter)
                .map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(value) => write!(f, "{value}"),
            MetricValue::Counter(delta) => write!(f, "{delta}"),
        }
    }
}

/// A single named measurement
///
/// Serializes to the wire shape `{"id", "type", "delta"?, "value"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMetric", into = "RawMetric")]
pub struct Metric {
    id: String,
    value: MetricValue,
}

impl Metric {
    pub fn new<S: Into<String>>(id: S, value: MetricValue) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }

    pub fn gauge<S: Into<String>>(id: S, value: f64) -> Self {
        Self::new(id, MetricValue::Gauge(value))
    }

    pub fn counter<S: Into<String>>(id: S, delta: i64) -> Self {
        Self::new(id, MetricValue::Counter(delta))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> MetricValue {
        self.value
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Gauge payload, if this is a gauge
    pub fn as_gauge(&self) -> Option<f64> {
        match self.value {
            MetricValue::Gauge(value) => Some(value),
            MetricValue::Counter(_) => None,
        }
    }

    /// Counter payload, if this is a counter
    pub fn as_counter(&self) -> Option<i64> {
        match self.value {
            MetricValue::Counter(delta) => Some(delta),
            MetricValue::Gauge(_) => None,
        }
    }

    /// A metric is valid iff its id is non-empty and a gauge holds a finite value.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> Result<(), MetricError> {
        if self.id.is_empty() {
            return Err(MetricError::EmptyId);
        }
        match self.value {
            MetricValue::Gauge(value) if !value.is_finite() => {
                Err(MetricError::NonFiniteValue(self.id.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// Untyped wire representation of a metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetric {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl TryFrom<RawMetric> for Metric {
    type Error = MetricError;

    fn try_from(raw: RawMetric) -> Result<Self, Self::Error> {
        let kind: MetricKind = raw.kind.parse()?;
        let value = match (kind, raw.delta, raw.value) {
            (MetricKind::Gauge, None, Some(value)) => MetricValue::Gauge(value),
            (MetricKind::Gauge, Some(_), _) => return Err(MetricError::UnexpectedDelta(raw.id)),
            (MetricKind::Gauge, None, None) => return Err(MetricError::MissingValue(raw.id)),
            (MetricKind::Counter, Some(delta), None) => MetricValue::Counter(delta),
            (MetricKind::Counter, _, Some(_)) => return Err(MetricError::UnexpectedValue(raw.id)),
            (MetricKind::Counter, None, None) => return Err(MetricError::MissingDelta(raw.id)),
        };
        let metric = Metric { id: raw.id, value };
        metric.validate()?;
        Ok(metric)
    }
}

impl From<Metric> for RawMetric {
    fn from(metric: Metric) -> Self {
        let (delta, value) = match metric.value {
            MetricValue::Gauge(value) => (None, Some(value)),
            MetricValue::Counter(delta) => (Some(delta), None),
        };
        RawMetric {
            kind: metric.kind().as_str().to_string(),
            id: metric.id,
            delta,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_id_is_invalid() {
        assert!(!Metric::gauge("", 1.0).is_valid());
        assert_eq!(Metric::gauge("", 1.0).validate(), Err(MetricError::EmptyId));
        assert!(Metric::gauge("temp", 1.0).is_valid());
    }

    #[test]
    fn test_non_finite_gauge_is_invalid() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert_eq!(
                Metric::gauge("temp", value).validate(),
                Err(MetricError::NonFiniteValue("temp".to_string()))
            );
        }
        assert!(Metric::gauge("temp", f64::MAX).is_valid());
        assert!(Metric::gauge("temp", f64::MIN_POSITIVE).is_valid());
    }

    #[test]
    fn test_parse_rejects_non_finite_gauge() {
        for raw in ["NaN", "nan", "inf", "-inf", "infinity"] {
            assert!(matches!(
                MetricValue::parse(MetricKind::Gauge, raw),
                Err(MetricError::InvalidScalar { .. })
            ));
        }
        assert_eq!(
            MetricValue::parse(MetricKind::Gauge, "-1.5e3"),
            Ok(MetricValue::Gauge(-1500.0))
        );
    }

    #[test]
    fn test_wire_shape() {
        let gauge = serde_json::to_value(Metric::gauge("temp", 2.5)).unwrap();
        assert_eq!(gauge, json!({"id": "temp", "type": "gauge", "value": 2.5}));

        let counter = serde_json::to_value(Metric::counter("requests", 8)).unwrap();
        assert_eq!(counter, json!({"id": "requests", "type": "counter", "delta": 8}));
    }

    #[test]
    fn test_decode_rejects_mismatched_payload() {
        let both = json!({"id": "x", "type": "gauge", "value": 1.0, "delta": 1});
        assert!(serde_json::from_value::<Metric>(both).is_err());

        let neither = json!({"id": "x", "type": "counter"});
        assert!(serde_json::from_value::<Metric>(neither).is_err());

        let unknown = json!({"id": "x", "type": "histogram", "value": 1.0});
        assert!(serde_json::from_value::<Metric>(unknown).is_err());
    }

    #[test]
    fn test_raw_metric_validation() {
        let raw = RawMetric {
            id: String::new(),
            kind: "gauge".to_string(),
            value: Some(1.0),
            delta: None,
        };
        assert_eq!(Metric::try_from(raw), Err(MetricError::EmptyId));

        let raw = RawMetric {
            id: "PollCount".to_string(),
            kind: "counter".to_string(),
            delta: Some(3),
            value: None,
        };
        assert_eq!(Metric::try_from(raw), Ok(Metric::counter("PollCount", 3)));

        let raw = RawMetric {
            id: "PollCount".to_string(),
            kind: "counter".to_string(),
            delta: None,
            value: Some(3.0),
        };
        assert_eq!(
            Metric::try_from(raw),
            Err(MetricError::UnexpectedValue("PollCount".to_string()))
        );
    }

    #[test]
    fn test_scalar_parse_and_display() {
        assert_eq!(
            MetricValue::parse(MetricKind::Gauge, "2.5"),
            Ok(MetricValue::Gauge(2.5))
        );
        assert_eq!(
            MetricValue::parse(MetricKind::Counter, "-4"),
            Ok(MetricValue::Counter(-4))
        );
        assert!(MetricValue::parse(MetricKind::Counter, "1.5").is_err());

        assert_eq!(MetricValue::Gauge(1.0).to_string(), "1");
        assert_eq!(MetricValue::Gauge(0.25).to_string(), "0.25");
        assert_eq!(MetricValue::Counter(42).to_string(), "42");
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("gauge".parse::<MetricKind>(), Ok(MetricKind::Gauge));
        assert_eq!("counter".parse::<MetricKind>(), Ok(MetricKind::Counter));
        assert_eq!(
            "Gauge".parse::<MetricKind>(),
            Err(MetricError::UnknownKind("Gauge".to_string()))
        );
    }
}
