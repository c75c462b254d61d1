/*!
Periodic metric sampling.

Each tick produces one batch: the poll counter, a random gauge, the
process gauges from [`PROCESS_GAUGES`] and the host memory gauges. Which
readings exist is decided here at compile time, one named accessor per
gauge.
*/

use std::time::Duration;

use sysinfo::{Pid, Process, System};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::metric::Metric;

pub const POLL_COUNT: &str = "PollCount";
pub const RANDOM_VALUE: &str = "RandomValue";
pub const TOTAL_MEMORY: &str = "TotalMemory";
pub const FREE_MEMORY: &str = "FreeMemory";
pub const USED_MEMORY: &str = "UsedMemory";

/// A named reading taken from the agent's own process
pub struct ProcessGauge {
    pub name: &'static str,
    pub read: fn(&Process) -> f64,
}

/// Process gauges reported on every tick
pub const PROCESS_GAUGES: &[ProcessGauge] = &[
    ProcessGauge {
        name: "ResidentMemory",
        read: |p: &Process| p.memory() as f64,
    },
    ProcessGauge {
        name: "VirtualMemory",
        read: |p: &Process| p.virtual_memory() as f64,
    },
    ProcessGauge {
        name: "CpuUsage",
        read: |p: &Process| f64::from(p.cpu_usage()),
    },
    ProcessGauge {
        name: "RunTime",
        read: |p: &Process| p.run_time() as f64,
    },
    ProcessGauge {
        name: "DiskReadBytes",
        read: |p: &Process| p.disk_usage().total_read_bytes as f64,
    },
    ProcessGauge {
        name: "DiskWrittenBytes",
        read: |p: &Process| p.disk_usage().total_written_bytes as f64,
    },
];

/// Produces one metric batch per poll tick
pub struct Sampler {
    system: System,
    pid: Option<Pid>,
    poll_count: i64,
    interval: Duration,
}

impl Sampler {
    pub fn new(interval: Duration) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "Cannot resolve own pid, process gauges disabled");
                None
            }
        };

        Self {
            system: System::new(),
            pid,
            poll_count: 0,
            interval,
        }
    }

    /// Number of completed samples so far
    pub fn poll_count(&self) -> i64 {
        self.poll_count
    }

    /// Take one sample
    ///
    /// The poll counter's delta is the number of samples taken during this
    /// run, including this one.
    pub fn sample(&mut self) -> Vec<Metric> {
        self.poll_count += 1;

        let mut batch = Vec::with_capacity(PROCESS_GAUGES.len() + 5);
        batch.push(Metric::counter(POLL_COUNT, self.poll_count));
        batch.push(Metric::gauge(RANDOM_VALUE, rand::random::<f64>()));

        if let Some(pid) = self.pid {
            if self.system.refresh_process(pid) {
                if let Some(process) = self.system.process(pid) {
                    // a reading the collector would reject must not sink the whole batch
                    batch.extend(
                        PROCESS_GAUGES
                            .iter()
                            .map(|gauge| Metric::gauge(gauge.name, (gauge.read)(process)))
                            .filter(Metric::is_valid),
                    );
                }
            }
        }

        self.system.refresh_memory();
        let total = self.system.total_memory() as f64;
        let used = self.system.used_memory() as f64;
        let used_percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };

        batch.push(Metric::gauge(TOTAL_MEMORY, total));
        batch.push(Metric::gauge(FREE_MEMORY, self.system.free_memory() as f64));
        batch.push(Metric::gauge(USED_MEMORY, used_percent));

        batch
    }

    /// Sample on every tick until `stop` fires, then close `output`
    ///
    /// A send waits while the capacity-1 channel is full; a stop during that
    /// wait drops the pending batch.
    pub async fn run(mut self, output: mpsc::Sender<Vec<Metric>>, mut stop: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Sampler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let batch = self.sample();
                    debug!(poll_count = self.poll_count, metrics = batch.len(), "Sampled metrics");

                    tokio::select! {
                        _ = stop.changed() => break,
                        sent = output.send(batch) => {
                            if sent.is_err() {
                                warn!("Sender is gone, stopping sampler");
                                break;
                            }
                        }
                    }
                }
            }
        }

        // dropping `output` closes the channel
        info!(polls = self.poll_count, "Sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;

    #[test]
    fn test_sample_contents() {
        let mut sampler = Sampler::new(Duration::from_secs(1));
        let batch = sampler.sample();

        assert_eq!(batch[0], Metric::counter(POLL_COUNT, 1));
        assert_eq!(batch[1].id(), RANDOM_VALUE);
        assert!(batch.iter().all(Metric::is_valid));

        for name in [TOTAL_MEMORY, FREE_MEMORY, USED_MEMORY] {
            let metric = batch.iter().find(|m| m.id() == name).unwrap();
            assert_eq!(metric.kind(), MetricKind::Gauge);
        }
        for gauge in PROCESS_GAUGES {
            assert!(batch.iter().any(|m| m.id() == gauge.name), "missing {}", gauge.name);
        }
    }

    #[test]
    fn test_poll_count_increases_per_tick() {
        let mut sampler = Sampler::new(Duration::from_secs(1));
        sampler.sample();
        sampler.sample();
        let batch = sampler.sample();

        assert_eq!(batch[0].as_counter(), Some(3));
        assert_eq!(sampler.poll_count(), 3);
    }

    #[test]
    fn test_random_value_is_fresh() {
        let mut sampler = Sampler::new(Duration::from_secs(1));
        let values: Vec<f64> = (0..5)
            .map(|_| sampler.sample()[1].as_gauge().unwrap())
            .collect();

        assert!(values.iter().all(|v| (0.0..1.0).contains(v)));
        assert!(values.windows(2).any(|w| w[0] != w[1]));
    }

    #[tokio::test]
    async fn test_stop_closes_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(Sampler::new(Duration::from_millis(10)).run(tx, stop_rx));

        let first = rx.recv().await.unwrap();
        assert_eq!(first[0].as_counter(), Some(1));

        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        // drain whatever was buffered, then the channel reports closed
        while rx.recv().await.is_some() {}
    }
}
