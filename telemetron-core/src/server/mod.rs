/*!
The collector's HTTP surface.

[`create_router`] wires the handlers in [`handlers`] behind the middleware
stack, outermost first:

1. request tracing (`tower-http` `TraceLayer`)
2. panic recovery, answering 500
3. signature check and response signing ([`middleware::signature`]), which
   sees the request body exactly as it came off the wire
4. gzip request decompression
5. gzip response compression when the client accepts it
*/

pub mod handlers;
pub mod middleware;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use telemetron_retry::RetryPolicy;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::signing::Signer;
use crate::storage::StoreHandle;
use crate::Result;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    /// Policy applied to every storage call made on behalf of a request
    pub retry: RetryPolicy,
    pub signer: Option<Arc<Signer>>,
}

impl AppState {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            signer: None,
        }
    }

    /// Build the state for a store opened from `config`
    pub fn from_config(store: StoreHandle, config: &ServerConfig) -> Result<Self> {
        let signer = match config.secret() {
            Some(secret) => Signer::from_secret(secret)?.map(Arc::new),
            None => None,
        };
        Ok(Self {
            signer,
            ..Self::new(store)
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }
}

/// Build the collector router
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/", get(handlers::list_metrics))
        .route("/ping", get(handlers::ping))
        .route("/update/", post(handlers::update_json))
        .route("/updates/", post(handlers::update_batch))
        .route("/value/", post(handlers::value_json))
        .route("/update/{kind}/{name}/{value}", post(handlers::update_path))
        .route("/value/{kind}/{name}", get(handlers::value_path));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(handlers::prometheus_metrics));

    router
        .layer(CompressionLayer::new())
        .layer(RequestDecompressionLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::signature,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
