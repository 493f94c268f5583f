//! Claim reaper: returns jobs with expired leases to the queue.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::queue::JobQueue;
use super::store::{JobStoreError, ReapReport};

/// Reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Max leases reverted per store call
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            batch_size: 500,
        }
    }
}

impl ReaperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Periodically reverts expired leases.
///
/// Safe to run in several processes at once: each store call only touches
/// rows it can lock, and a job already reverted no longer matches.
#[derive(Debug, Clone)]
pub struct ClaimReaper {
    queue: JobQueue,
    config: ReaperConfig,
}

impl ClaimReaper {
    pub fn new(queue: JobQueue, config: ReaperConfig) -> Self {
        Self { queue, config }
    }

    /// One sweep: reap in batches until a batch comes back short.
    pub async fn run_once(&self) -> Result<ReapReport, JobStoreError> {
        let batch_size = self.config.batch_size.max(1);
        let mut total = ReapReport::default();
        loop {
            let batch = self.queue.reap_expired(batch_size).await?;
            let full = batch.total() >= batch_size;
            total.requeued.extend(batch.requeued);
            total.dead_lettered.extend(batch.dead_lettered);
            if !full {
                return Ok(total);
            }
        }
    }

    /// Sweep every `config.interval` until the handle is shut down.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            info!(interval_secs = self.config.interval.as_secs(), "claim reaper started");
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "reaper sweep failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("claim reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to a running reaper.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "claim reaper ended abnormally");
        }
    }
}
