//! Core job types and lifecycle transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use kitqueue_core::{DomainError, DomainResult, JobId, RunId};

use super::backoff::{RetryDecision, RetryPolicy, deadline_after};
use crate::config::QueueConfig;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Leased by a worker, not started yet
    Claimed,
    /// Handler is executing under a lease
    Running,
    /// Completed successfully
    Completed,
    /// Terminal failure recorded outside the retry flow
    Failed,
    /// Cancelled before execution started
    Cancelled,
    /// Retries exhausted or failure was not retryable
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Claimed,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::DeadLetter
        )
    }

    /// Whether the status carries a lease.
    pub fn is_leased(&self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("invalid job status: {s}")))
    }
}

/// A job submission, before it is validated and stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: JsonValue,
    pub name: Option<String>,
    pub dedupe_key: Option<String>,
    /// Earliest eligible time; defaults to "now" at enqueue.
    pub schedule_at: Option<DateTime<Utc>>,
    pub priority: i32,
    /// Defaults to [`QueueConfig::default_max_attempts`].
    pub max_attempts: Option<u32>,
    /// Defaults to [`QueueConfig::default_retry_backoff_seconds`].
    pub retry_backoff_seconds: Option<u32>,
    pub tags: Vec<String>,
    pub metadata: JsonValue,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            name: None,
            dedupe_key: None,
            schedule_at: None,
            priority: 0,
            max_attempts: None,
            retry_backoff_seconds: None,
            tags: Vec::new(),
            metadata: JsonValue::Object(Default::default()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_at = Some(at);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff_seconds(mut self, seconds: u32) -> Self {
        self.retry_backoff_seconds = Some(seconds);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validate the submission against queue limits and build the pending job.
    pub fn into_job(self, config: &QueueConfig, now: DateTime<Utc>) -> DomainResult<Job> {
        let job_type = self.job_type.trim().to_string();
        if job_type.is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        if !config.priority_range().contains(&self.priority) {
            return Err(DomainError::validation(format!(
                "priority {} outside allowed range {}..={}",
                self.priority, config.priority_min, config.priority_max
            )));
        }
        let max_attempts = self.max_attempts.unwrap_or(config.default_max_attempts);
        if max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if !self.metadata.is_object() {
            return Err(DomainError::validation("metadata must be a JSON object"));
        }
        let dedupe_key = match self.dedupe_key {
            Some(key) if key.trim().is_empty() => {
                return Err(DomainError::validation("dedupe_key must not be blank"));
            }
            other => other,
        };

        Ok(Job {
            id: JobId::new(),
            job_type,
            name: self.name,
            dedupe_key,
            payload: self.payload,
            priority: self.priority,
            status: JobStatus::Pending,
            scheduled_at: self.schedule_at.unwrap_or(now),
            claimed_by: None,
            claim_expires_at: None,
            attempt: 0,
            max_attempts,
            retry_backoff_seconds: self
                .retry_backoff_seconds
                .unwrap_or(config.default_retry_backoff_seconds),
            next_retry_at: None,
            result: None,
            metrics: None,
            error_message: None,
            error_detail: None,
            execution_id: None,
            artifacts: Vec::new(),
            tags: self.tags,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }
}

/// Reference to an artifact produced while a job ran. Written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub job_id: JobId,
    /// Storage locator returned by the artifact store.
    pub locator: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the artifact bytes.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// A failed attempt as reported to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub error: String,
    pub retryable: bool,
    pub detail: JsonValue,
}

impl Failure {
    /// Transient failure (timeouts, 5xx, contention): retried with backoff.
    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retryable: true,
            detail: JsonValue::Null,
        }
    }

    /// Permanent failure (bad payload, unknown type): dead-lettered at once.
    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retryable: false,
            detail: JsonValue::Null,
        }
    }

    pub fn with_detail(mut self, detail: JsonValue) -> Self {
        self.detail = detail;
        self
    }
}

/// What the reaper did with one expired lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimAction {
    /// Back to `pending`, claimable by any worker.
    Requeued,
    /// The expired claim was the last allowed attempt.
    DeadLettered,
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Selects the handler.
    pub job_type: String,
    pub name: Option<String>,
    pub dedupe_key: Option<String>,
    /// Opaque document handed to the handler.
    pub payload: JsonValue,
    /// Higher runs first.
    pub priority: i32,
    pub status: JobStatus,
    /// Earliest time the job may be claimed.
    pub scheduled_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// Attempts consumed so far (incremented at claim time).
    pub attempt: u32,
    pub max_attempts: u32,
    pub retry_backoff_seconds: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub result: Option<JsonValue>,
    pub metrics: Option<JsonValue>,
    pub error_message: Option<String>,
    pub error_detail: Option<JsonValue>,
    /// Telemetry run of the latest execution.
    pub execution_id: Option<RunId>,
    pub artifacts: Vec<ArtifactRef>,
    pub tags: Vec<String>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(u64::from(self.retry_backoff_seconds)),
        )
    }

    /// Eligible for `claim_next` at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_at <= now
            && self.attempt < self.max_attempts
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leased() && self.claim_expires_at.is_some_and(|at| at < now)
    }

    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.status.is_leased() && self.claimed_by.as_deref() == Some(worker_id)
    }

    /// `pending → claimed`: take a lease and consume one attempt.
    pub fn mark_claimed(
        &mut self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.is_claimable(now) {
            return Err(DomainError::invalid_transition(format!(
                "job {} is not claimable (status {})",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Claimed;
        self.claimed_by = Some(worker_id.to_string());
        self.claim_expires_at = Some(deadline_after(now, lease));
        self.attempt += 1;
        self.updated_at = now;
        Ok(())
    }

    /// `claimed → running`.
    pub fn mark_running(
        &mut self,
        worker_id: &str,
        execution_id: Option<RunId>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_owner(worker_id)?;
        if self.status != JobStatus::Claimed {
            return Err(DomainError::invalid_transition(format!(
                "cannot start job {} from status {}",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Running;
        self.execution_id = execution_id;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Heartbeat: push the lease expiry forward.
    pub fn extend_lease(
        &mut self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> DomainResult<DateTime<Utc>> {
        self.ensure_owner(worker_id)?;
        let expires_at = deadline_after(now, lease);
        self.claim_expires_at = Some(expires_at);
        self.updated_at = now;
        Ok(expires_at)
    }

    /// `claimed | running → completed`.
    pub fn mark_completed(
        &mut self,
        worker_id: &str,
        result: JsonValue,
        metrics: JsonValue,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_owner(worker_id)?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.metrics = Some(metrics);
        self.completed_at = Some(now);
        self.next_retry_at = None;
        self.clear_lease();
        self.updated_at = now;
        Ok(())
    }

    /// `claimed | running → pending (retry) | dead_letter`.
    pub fn mark_failed(
        &mut self,
        worker_id: &str,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> DomainResult<RetryDecision> {
        self.ensure_owner(worker_id)?;
        let decision = self.retry_policy().decide(self.attempt, failure.retryable);
        self.error_message = Some(failure.error.clone());
        self.error_detail = Some(failure.detail.clone());
        self.clear_lease();
        self.updated_at = now;

        match decision {
            RetryDecision::Retry { delay } => {
                let at = deadline_after(now, delay);
                self.status = JobStatus::Pending;
                self.scheduled_at = at;
                self.next_retry_at = Some(at);
            }
            RetryDecision::DeadLetter => {
                self.status = JobStatus::DeadLetter;
                self.next_retry_at = None;
                self.completed_at = Some(now);
            }
        }
        Ok(decision)
    }

    /// `pending | claimed → cancelled`.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !matches!(self.status, JobStatus::Pending | JobStatus::Claimed) {
            return Err(DomainError::invalid_transition(format!(
                "cannot cancel job {} in status {}",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Cancelled;
        self.next_retry_at = None;
        self.clear_lease();
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Lease expired: `claimed | running → pending`, or dead-letter when the
    /// expired claim was the last attempt. `attempt` is left unchanged.
    pub fn mark_reclaimed(&mut self, now: DateTime<Utc>) -> DomainResult<ReclaimAction> {
        if !self.lease_expired(now) {
            return Err(DomainError::invalid_transition(format!(
                "job {} has no expired lease",
                self.id
            )));
        }
        self.clear_lease();
        self.updated_at = now;

        if self.attempt >= self.max_attempts {
            self.status = JobStatus::DeadLetter;
            self.error_message = Some(LEASE_EXPIRED.to_string());
            self.completed_at = Some(now);
            self.next_retry_at = None;
            Ok(ReclaimAction::DeadLettered)
        } else {
            self.status = JobStatus::Pending;
            self.scheduled_at = now;
            Ok(ReclaimAction::Requeued)
        }
    }

    /// `dead_letter → pending` with a fresh attempt budget. Errors are kept for audit.
    pub fn mark_reinstated(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::DeadLetter {
            return Err(DomainError::invalid_transition(format!(
                "only dead-lettered jobs can be reinstated (job {} is {})",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Pending;
        self.attempt = 0;
        self.scheduled_at = now;
        self.next_retry_at = None;
        self.completed_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn ensure_owner(&self, worker_id: &str) -> DomainResult<()> {
        if self.is_leased_by(worker_id) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "job {} is not leased by {worker_id} (status {}, owner {:?})",
                self.id, self.status, self.claimed_by
            )))
        }
    }

    fn clear_lease(&mut self) {
        self.claimed_by = None;
        self.claim_expires_at = None;
    }
}

/// Error message recorded when a lease runs out on the final attempt.
pub const LEASE_EXPIRED: &str = "lease expired";
