/*!
The sampling and delivery agent.

A [`Sampler`] task produces one batch per poll tick into a capacity-1
channel; a [`Sender`] task ships those batches to the collector. Both
observe one stop signal. Stopping waits for the sampler to close its
channel and for every in-flight delivery to finish.
*/

pub mod gate;
pub mod sampler;
pub mod sender;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use gate::{ConcurrencyGate, GatePermit};
pub use sampler::Sampler;
pub use sender::{deliver, DeliveryError, DeliveryOutcome, Envelope, HttpTransport, Sender, Transport};

use crate::config::AgentConfig;
use crate::signing::Signer;
use crate::Result;
use telemetron_retry::RetryPolicy;

/// Agent pipeline built from an [`AgentConfig`]
pub struct Agent {
    sampler: Sampler,
    sender: Sender,
}

impl Agent {
    /// Build an agent that posts to the configured collector over HTTP
    pub fn new(config: &AgentConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(&config.address)
            .map_err(|e| crate::TelemetronError::config(format!("cannot build HTTP client: {e}")))?;
        info!(url = transport.url(), "Agent reporting to collector");
        Self::with_transport(config, Arc::new(transport))
    }

    /// Build an agent with a custom transport
    pub fn with_transport(config: &AgentConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let signer = match config.secret() {
            Some(secret) => Signer::from_secret(secret)?,
            None => None,
        };

        Ok(Self {
            sampler: Sampler::new(config.poll_interval),
            sender: Sender::new(transport, config.rate_limit, config.report_interval, signer),
        })
    }

    /// Replace the delivery retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.sender = self.sender.with_policy(policy);
        self
    }

    /// Spawn the sampler and sender tasks
    pub fn start(self) -> AgentHandle {
        let (batches_tx, batches_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let in_flight = self.sender.in_flight();

        let sampler = tokio::spawn(self.sampler.run(batches_tx, stop_rx.clone()));
        let sender = tokio::spawn(self.sender.run(batches_rx, stop_rx));

        AgentHandle {
            stop: stop_tx,
            sampler,
            sender,
            in_flight,
        }
    }
}

/// Running agent
pub struct AgentHandle {
    stop: watch::Sender<bool>,
    sampler: JoinHandle<()>,
    sender: JoinHandle<()>,
    in_flight: Arc<AtomicUsize>,
}

impl AgentHandle {
    /// Deliveries currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Signal stop and wait for the sampler to exit and deliveries to drain
    ///
    /// There is no timeout on the drain; a delivery finishes after at most
    /// its retry budget.
    pub async fn stop(self) {
        info!("Stopping agent");
        // both receivers may already be gone if the tasks exited on their own
        let _ = self.stop.send(true);

        if let Err(e) = self.sampler.await {
            warn!(error = %e, "Sampler task failed");
        }
        if let Err(e) = self.sender.await {
            warn!(error = %e, "Sender task failed");
        }
        info!("Agent stopped");
    }
}
