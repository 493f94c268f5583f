//! Queue facade: the entry point producers, workers and the reaper share.
//!
//! [`JobQueue`] validates caller input, reads "now" from the injected clock
//! and delegates to a [`JobStore`]. Stores stay clock-free.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use kitqueue_core::{Clock, JobId, RunId, SharedClock, SystemClock};

use super::backoff::RetryDecision;
use super::monitor::{QueueDepth, QueueSnapshot, WorkerLeases};
use super::store::{EnqueueOutcome, FailOutcome, JobStore, JobStoreError, ReapReport};
use super::types::{ArtifactRef, Failure, Job, NewJob};
use crate::config::QueueConfig;

/// Cheap to clone; every clone shares the same store and clock.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: SharedClock,
    config: QueueConfig,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn validate_worker(worker_id: &str) -> Result<(), JobStoreError> {
    if worker_id.trim().is_empty() {
        return Err(JobStoreError::Validation("worker_id must not be blank".to_string()));
    }
    Ok(())
}

fn validate_lease(lease: Duration) -> Result<(), JobStoreError> {
    if lease.is_zero() {
        return Err(JobStoreError::Validation("lease duration must be positive".to_string()));
    }
    Ok(())
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, clock: SharedClock, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Queue over `store` with the wall clock and default limits.
    pub fn with_store(store: Arc<dyn JobStore>) -> Self {
        Self::new(store, SystemClock::shared(), QueueConfig::default())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Submit a job. Returns the existing job's id when an active job already
    /// holds the same dedupe key.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<EnqueueOutcome, JobStoreError> {
        let job = new_job.into_job(&self.config, self.now())?;
        let job_type = job.job_type.clone();
        let outcome = self.store.enqueue(job).await?;
        if outcome.created {
            debug!(job_id = %outcome.job_id, job_type = %job_type, "job enqueued");
        } else {
            debug!(job_id = %outcome.job_id, job_type = %job_type, "deduplicated enqueue");
        }
        Ok(outcome)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(job_id).await
    }

    /// Atomically lease the most urgent eligible job, if any.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        job_types: Option<&[String]>,
        lease: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        validate_worker(worker_id)?;
        validate_lease(lease)?;
        let job = self
            .store
            .claim_next(worker_id, job_types, lease, self.now())
            .await?;
        if let Some(job) = &job {
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                worker_id,
                attempt = job.attempt,
                "job claimed"
            );
        }
        Ok(job)
    }

    pub async fn start(
        &self,
        job_id: JobId,
        worker_id: &str,
        execution_id: Option<RunId>,
    ) -> Result<Job, JobStoreError> {
        validate_worker(worker_id)?;
        self.store
            .start(job_id, worker_id, execution_id, self.now())
            .await
    }

    /// Heartbeat: extend the caller's lease. Returns the new expiry.
    pub async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<DateTime<Utc>, JobStoreError> {
        validate_worker(worker_id)?;
        validate_lease(lease)?;
        self.store
            .extend_lease(job_id, worker_id, lease, self.now())
            .await
    }

    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
        metrics: JsonValue,
    ) -> Result<Job, JobStoreError> {
        validate_worker(worker_id)?;
        let job = self
            .store
            .complete(job_id, worker_id, result, metrics, self.now())
            .await?;
        debug!(job_id = %job_id, worker_id, "job completed");
        Ok(job)
    }

    /// Report a failed attempt; the job's retry policy decides what happens next.
    pub async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &Failure,
    ) -> Result<FailOutcome, JobStoreError> {
        validate_worker(worker_id)?;
        let outcome = self
            .store
            .fail(job_id, worker_id, failure, self.now())
            .await?;
        match outcome.decision {
            RetryDecision::Retry { delay } => debug!(
                job_id = %job_id,
                attempt = outcome.job.attempt,
                delay_secs = delay.as_secs(),
                error = %failure.error,
                "job failed, retry scheduled"
            ),
            RetryDecision::DeadLetter => warn!(
                job_id = %job_id,
                attempt = outcome.job.attempt,
                retryable = failure.retryable,
                error = %failure.error,
                "job dead-lettered"
            ),
        }
        Ok(outcome)
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let job = self.store.cancel(job_id, self.now()).await?;
        info!(job_id = %job_id, "job cancelled");
        Ok(job)
    }

    /// Move a dead-lettered job back to `pending` with a fresh attempt budget.
    pub async fn reinstate(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let job = self.store.reinstate(job_id, self.now()).await?;
        info!(job_id = %job_id, "job reinstated from dead letter");
        Ok(job)
    }

    /// Revert up to `limit` expired leases.
    pub async fn reap_expired(&self, limit: usize) -> Result<ReapReport, JobStoreError> {
        let report = self.store.reap_expired(self.now(), limit).await?;
        if !report.is_empty() {
            info!(
                requeued = report.requeued.len(),
                dead_lettered = report.dead_lettered.len(),
                "reclaimed expired leases"
            );
        }
        Ok(report)
    }

    pub async fn attach_artifact(&self, artifact: ArtifactRef) -> Result<(), JobStoreError> {
        self.store.attach_artifact(artifact).await
    }

    pub async fn queue_depth(&self) -> Result<Vec<QueueDepth>, JobStoreError> {
        self.store.queue_depth().await
    }

    pub async fn ready_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.store.ready_jobs(self.now(), limit).await
    }

    pub async fn active_leases(&self) -> Result<Vec<WorkerLeases>, JobStoreError> {
        self.store.active_leases(self.now()).await
    }

    pub async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.store.recent_failures(limit).await
    }

    /// All monitoring views at one instant; `limit` bounds the job lists.
    pub async fn snapshot(&self, limit: usize) -> Result<QueueSnapshot, JobStoreError> {
        let taken_at = self.now();
        Ok(QueueSnapshot {
            taken_at,
            depth: self.store.queue_depth().await?,
            ready: self.store.ready_jobs(taken_at, limit).await?,
            leases: self.store.active_leases(taken_at).await?,
            recent_failures: self.store.recent_failures(limit).await?,
        })
    }

    /// Delete terminal jobs last updated more than `retention` ago.
    pub async fn purge_terminal(&self, retention: Duration) -> Result<u64, JobStoreError> {
        let before = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| self.now().checked_sub_signed(retention))
            .ok_or_else(|| {
                JobStoreError::Validation(format!("retention {retention:?} is out of range"))
            })?;
        let removed = self.store.purge_terminal(before).await?;
        if removed > 0 {
            info!(removed, %before, "purged terminal jobs");
        }
        Ok(removed)
    }
}
