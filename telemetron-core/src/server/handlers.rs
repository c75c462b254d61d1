/*!
Collector request handlers.

Every storage call goes through the state's retry policy. Validation
failures answer 400, unknown metrics 404, and a storage failure that
survives its retries 500.
*/

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use std::future::Future;
use telemetron_retry::{retry, RetryError, RetryableError};
use thiserror::Error;
use tracing::{debug, error, info};

use super::AppState;
use crate::aggregate::MetricMap;
use crate::error::{MetricError, StoreError};
use crate::metric::{Metric, MetricKind, MetricValue, RawMetric};
use crate::observability;

/// Failure of a single request
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Malformed request body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(#[from] MetricError),

    #[error("Metric not found")]
    NotFound,

    #[error("Storage unavailable: {0}")]
    Storage(#[source] RetryError<StoreError>),
}

impl From<RetryError<StoreError>> for ApiError {
    fn from(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Permanent {
                source: StoreError::Validation(e),
                ..
            } => ApiError::Invalid(e),
            other => ApiError::Storage(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Body(_) | ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run one storage call under the request retry policy, counting the outcome
async fn with_retry<T, F, Fut>(state: &AppState, operation: &'static str, f: F) -> ApiResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let result = retry(operation, &state.retry, |attempt| {
        if attempt > 1 {
            observability::record_storage_retry();
        }
        f()
    })
    .await;

    result.map_err(|err| {
        if !err.last_error().is_validation() {
            error!(
                operation,
                backend = state.store.backend_name(),
                attempts = err.attempts(),
                error = %err.last_error(),
                "Storage call failed"
            );
            observability::record_storage_error();
        }
        ApiError::from(err)
    })
}

/// `POST /update/`
pub async fn update_json(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Metric>> {
    let raw: RawMetric = serde_json::from_slice(&body)?;
    let metric = Metric::try_from(raw)?;
    debug!(metric_id = metric.id(), kind = %metric.kind(), "Storing metric");

    let stored = with_retry(&state, "store_single", || {
        state.store.store_single(metric.clone())
    })
    .await?;

    observability::record_stored(1);
    Ok(Json(stored))
}

/// `POST /updates/`
pub async fn update_batch(State(state): State<AppState>, body: Bytes) -> ApiResult<StatusCode> {
    let raws: Vec<RawMetric> = serde_json::from_slice(&body)?;
    let metrics = raws
        .into_iter()
        .map(Metric::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let count = metrics.len();

    with_retry(&state, "store_batch", || state.store.store_batch(metrics.clone())).await?;

    info!(metrics = count, "Stored metric batch");
    observability::record_stored(count);
    Ok(StatusCode::OK)
}

/// `POST /value/`
///
/// Only the id is required. A kind, when given, must match the stored one.
pub async fn value_json(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Metric>> {
    let raw: RawMetric = serde_json::from_slice(&body)?;
    let kind = if raw.kind.is_empty() {
        None
    } else {
        Some(raw.kind.parse::<MetricKind>()?)
    };

    let metric = lookup(&state, &raw.id, kind).await?;
    Ok(Json(metric))
}

/// `GET /value/{kind}/{name}`
pub async fn value_path(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> ApiResult<Response> {
    let kind: MetricKind = kind.parse()?;
    let metric = lookup(&state, &name, Some(kind)).await?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        metric.value().to_string(),
    )
        .into_response())
}

async fn lookup(state: &AppState, id: &str, kind: Option<MetricKind>) -> ApiResult<Metric> {
    if id.is_empty() {
        return Err(ApiError::NotFound);
    }

    let found = with_retry(state, "get", || state.store.get(id)).await?;
    match found {
        Some(metric) if kind.map_or(true, |kind| kind == metric.kind()) => Ok(metric),
        _ => Err(ApiError::NotFound),
    }
}

/// `POST /update/{kind}/{name}/{value}`
pub async fn update_path(
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let kind: MetricKind = kind.parse()?;
    let metric = Metric::new(name, MetricValue::parse(kind, &value)?);
    metric.validate()?;

    let stored = with_retry(&state, "store_single", || {
        state.store.store_single(metric.clone())
    })
    .await?;

    observability::record_stored(1);
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        stored.value().to_string(),
    )
        .into_response())
}

/// `GET /ping`
pub async fn ping(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => {
            error!(backend = state.store.backend_name(), error = %e, "Storage ping failed");
            let status = if e.is_transient() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, e.to_string()).into_response()
        }
    }
}

/// `GET /`
pub async fn list_metrics(State(state): State<AppState>) -> ApiResult<Html<String>> {
    let metrics = with_retry(&state, "all", || state.store.all()).await?;
    Ok(Html(render_table(&metrics)))
}

/// `GET /metrics`
#[cfg(feature = "metrics")]
pub async fn prometheus_metrics() -> Response {
    let Some(metrics) = crate::observability::TelemetronMetrics::global() else {
        return (StatusCode::NOT_FOUND, "Metrics registry not initialised").into_response();
    };
    match metrics.gather_metrics() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response(),
    }
}

/// HTML table of every metric, in id order
fn render_table(metrics: &MetricMap) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head><title>Metrics</title></head>\n<body>\n\
         <table>\n<tr><th>Name</th><th>Type</th><th>Value</th></tr>\n",
    );
    for metric in metrics.values() {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(metric.id()),
            metric.kind(),
            metric.value()
        ));
    }
    html.push_str("</table>\n</body>\n</html>\n");
    html
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_table_is_sorted_and_escaped() {
        let mut metrics = MetricMap::new();
        metrics.insert("b".to_string(), Metric::counter("b", 7));
        metrics.insert("<a>".to_string(), Metric::gauge("<a>", 1.5));

        let html = render_table(&metrics);
        let first = html.find("&lt;a&gt;").unwrap();
        let second = html.find("<td>b</td>").unwrap();
        assert!(first < second);
        assert!(html.contains("<td>gauge</td><td>1.5</td>"));
        assert!(html.contains("<td>counter</td><td>7</td>"));
        assert!(!html.contains("<a>"));
    }

    #[test]
    fn test_error_status_codes() {
        let not_found = ApiError::NotFound.into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let invalid = ApiError::Invalid(MetricError::EmptyId).into_response();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let storage = ApiError::from(RetryError::Exhausted {
            operation: "get",
            attempts: 4,
            source: StoreError::Poisoned,
        });
        assert_eq!(storage.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_validation_from_store_is_bad_request() {
        let err = ApiError::from(RetryError::Permanent {
            operation: "store_single",
            source: StoreError::Validation(MetricError::DeltaOverflow("c".to_string())),
        });
        assert!(matches!(err, ApiError::Invalid(MetricError::DeltaOverflow(_))));
    }
}
