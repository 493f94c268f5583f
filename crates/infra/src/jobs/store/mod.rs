//! Job storage: the single source of truth for job state.
//!
//! Every mutating operation is a single-row transition guarded by the row's
//! current status (and by the lease owner where one applies), so a reaper and
//! a completing worker racing on the same job can never both win.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use kitqueue_core::{DomainError, JobId, RunId};

use super::backoff::RetryDecision;
use super::monitor::{QueueDepth, WorkerLeases};
use super::types::{ArtifactRef, Failure, Job};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The job's status does not allow the requested transition.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    /// The caller no longer holds the lease (reaped, cancelled or reclaimed).
    #[error("lease lost: {0}")]
    StaleLease(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::InvalidTransition(msg) => Self::InvalidTransition(msg),
            DomainError::Conflict(msg) => Self::Conflict(msg),
            DomainError::InvariantViolation(msg) => Self::Storage(msg),
            DomainError::NotFound => Self::Storage("record not found".to_string()),
        }
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub job_id: JobId,
    /// `false` when an active job with the same dedupe key was returned instead.
    pub created: bool,
}

/// Result of a reported failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FailOutcome {
    pub job: Job,
    pub decision: RetryDecision,
}

/// Result of one reaper sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    /// Jobs returned to `pending`.
    pub requeued: Vec<JobId>,
    /// Jobs whose expired claim was their final attempt.
    pub dead_lettered: Vec<JobId>,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.dead_lettered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Job store abstraction.
///
/// Stores never read the clock: every time-dependent call takes `now` so the
/// queue's injected clock is the only time source.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a validated pending job, or return the active job holding the
    /// same dedupe key.
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically claim the most urgent eligible job.
    ///
    /// Returns `None` when nothing is eligible. Concurrent callers each get a
    /// distinct job or nothing; contested rows are skipped, never waited on.
    async fn claim_next(
        &self,
        worker_id: &str,
        job_types: Option<&[String]>,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `claimed → running` for the lease owner.
    async fn start(
        &self,
        job_id: JobId,
        worker_id: &str,
        execution_id: Option<RunId>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Push the lease expiry forward; returns the new expiry.
    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobStoreError>;

    /// `claimed | running → completed` for the lease owner.
    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
        metrics: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Record a failed attempt and apply the job's retry policy.
    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError>;

    /// `pending | claimed → cancelled`.
    async fn cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// `dead_letter → pending` with a fresh attempt budget.
    async fn reinstate(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Revert up to `limit` expired leases.
    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<ReapReport, JobStoreError>;

    /// Record an artifact produced by a job.
    async fn attach_artifact(&self, artifact: ArtifactRef) -> Result<(), JobStoreError>;

    /// Counts grouped by job type and status.
    async fn queue_depth(&self) -> Result<Vec<QueueDepth>, JobStoreError>;

    /// Pending jobs eligible at `now`, in claim order.
    async fn ready_jobs(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<Job>, JobStoreError>;

    /// Active leases grouped by worker.
    async fn active_leases(&self, now: DateTime<Utc>) -> Result<Vec<WorkerLeases>, JobStoreError>;

    /// Dead-lettered and failed jobs, newest first.
    async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Delete terminal jobs last updated before `before`. Returns the number removed.
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError>;
}
