/*!
Batch delivery to the collector.

Each batch is encoded exactly once into an [`Envelope`] (JSON, gzip, optional
HMAC signature) and the same bytes are re-sent on every retry. Deliveries run
as independent tasks; the [`ConcurrencyGate`] bounds how many requests are on
the wire at once.
*/

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetron_retry::{retry, RetryPolicy, RetryableError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::gate::ConcurrencyGate;
use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::metric::Metric;
use crate::observability;
use crate::signing::{Signer, SIGNATURE_HEADER};

/// Default timeout for one delivery request
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from a single delivery attempt
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The batch could not be serialized or compressed
    #[error("Failed to encode batch: {0}")]
    Encode(String),

    /// Network or protocol failure
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The collector answered with a non-success status
    #[error("Collector responded with status {0}")]
    Status(u16),
}

impl RetryableError for DeliveryError {
    fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transport(_) | DeliveryError::Status(_))
    }
}

/// A fully built request body, ready to be sent any number of times
#[derive(Debug, Clone)]
pub struct Envelope {
    pub body: Bytes,
    pub content_encoding: String,
    pub signature: Option<String>,
    pub metrics: usize,
}

impl Envelope {
    /// JSON-encode and compress `batch`, signing the compressed bytes
    pub fn build(
        batch: &[Metric],
        compressor: &dyn CompressionAdapter,
        signer: Option<&Signer>,
    ) -> Result<Self, DeliveryError> {
        let json = serde_json::to_vec(batch).map_err(|e| DeliveryError::Encode(e.to_string()))?;
        let compressed = compressor
            .compress(&json)
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;

        Ok(Self {
            signature: signer.map(|signer| signer.sign(&compressed)),
            body: Bytes::from(compressed),
            content_encoding: compressor.algorithm_name().to_string(),
            metrics: batch.len(),
        })
    }
}

/// Sends one envelope to the collector
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, envelope: &Envelope) -> Result<(), DeliveryError>;
}

/// HTTP transport posting to the collector's batch endpoint
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// `address` is `host:port` or a full `http(s)://` base URL
    pub fn new(address: &str) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            url: updates_url(address),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn updates_url(address: &str) -> String {
    let base = address.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/updates/")
    } else {
        format!("http://{base}/updates/")
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::CONTENT_ENCODING, envelope.content_encoding.as_str())
            .body(envelope.body.clone());

        if let Some(signature) = &envelope.signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Counts one running delivery until dropped, even if the task panics
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Outcome of delivering one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: usize },
    GivenUp { attempts: usize },
}

/// Deliver one envelope under the retry policy
///
/// A gate permit is held for each attempt only, never across a pause.
/// Failures are logged; this never returns an error.
pub async fn deliver<T: Transport + ?Sized>(
    transport: &T,
    gate: &ConcurrencyGate,
    policy: &RetryPolicy,
    envelope: &Envelope,
) -> DeliveryOutcome {
    let result = retry("deliver_batch", policy, |attempt| async move {
        let _permit = gate.acquire().await;
        observability::record_delivery_attempt();
        debug!(attempt, bytes = envelope.body.len(), "Sending batch");
        transport.send(envelope).await.map(|_| attempt)
    })
    .await;

    match result {
        Ok(attempts) => {
            debug!(metrics = envelope.metrics, attempts, "Batch delivered");
            DeliveryOutcome::Delivered { attempts }
        }
        Err(err) => {
            observability::record_delivery_given_up();
            error!(
                metrics = envelope.metrics,
                attempts = err.attempts(),
                error = %err.last_error(),
                "Giving up on batch"
            );
            DeliveryOutcome::GivenUp {
                attempts: err.attempts(),
            }
        }
    }
}

/// Consumes sampled batches and delivers them concurrently
///
/// Batches are not sent as they arrive: they wait for the next report tick,
/// so the report interval sets the request rate independently of polling.
pub struct Sender {
    transport: Arc<dyn Transport>,
    gate: ConcurrencyGate,
    policy: RetryPolicy,
    compressor: GzipCompressor,
    signer: Option<Signer>,
    report_interval: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl Sender {
    pub fn new(
        transport: Arc<dyn Transport>,
        rate_limit: usize,
        report_interval: Duration,
        signer: Option<Signer>,
    ) -> Self {
        Self {
            transport,
            gate: ConcurrencyGate::new(rate_limit),
            policy: RetryPolicy::default(),
            compressor: GzipCompressor::fast(),
            signer,
            report_interval,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Shared count of deliveries currently running
    pub fn in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.in_flight)
    }

    fn dispatch(&self, tasks: &mut JoinSet<DeliveryOutcome>, batch: Vec<Metric>) {
        let envelope = match Envelope::build(&batch, &self.compressor, self.signer.as_ref()) {
            Ok(envelope) => envelope,
            Err(e) => {
                // encoding is deterministic, so retrying cannot help
                error!(metrics = batch.len(), error = %e, "Dropping batch that cannot be encoded");
                return;
            }
        };

        let transport = Arc::clone(&self.transport);
        let gate = self.gate.clone();
        let policy = self.policy;
        let in_flight = InFlight::enter(&self.in_flight);

        tasks.spawn(async move {
            let _in_flight = in_flight;
            deliver(transport.as_ref(), &gate, &policy, &envelope).await
        });
    }

    /// Receive batches until the channel closes or `stop` fires
    ///
    /// Batches received between report ticks are held and dispatched on the
    /// next tick, one request each. On shutdown every held batch is
    /// dispatched and all running deliveries are awaited before returning.
    pub async fn run(self, mut input: mpsc::Receiver<Vec<Metric>>, mut stop: watch::Receiver<bool>) {
        info!(
            rate_limit = self.gate.capacity(),
            report_interval_ms = self.report_interval.as_millis() as u64,
            "Sender started"
        );

        let mut tasks = JoinSet::new();
        let mut pending: Vec<Vec<Metric>> = Vec::new();
        let mut ticker = tokio::time::interval(self.report_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                received = input.recv() => match received {
                    Some(batch) => pending.push(batch),
                    None => break,
                },
                _ = ticker.tick() => {
                    for batch in pending.drain(..) {
                        self.dispatch(&mut tasks, batch);
                    }
                }
                // reap finished deliveries so the set does not grow unbounded
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Delivery task failed");
                    }
                }
            }
        }

        // take whatever the sampler had already queued
        input.close();
        while let Some(batch) = input.recv().await {
            pending.push(batch);
        }
        for batch in pending.drain(..) {
            self.dispatch(&mut tasks, batch);
        }

        info!(in_flight = self.in_flight.load(Ordering::SeqCst), "Sender draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Delivery task failed");
            }
        }
        info!("Sender stopped");
    }
}
