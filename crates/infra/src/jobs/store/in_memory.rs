//! In-memory job store for tests, dev and single-process deployments.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use kitqueue_core::{JobId, RunId};

use super::{EnqueueOutcome, FailOutcome, JobStore, JobStoreError, ReapReport};
use crate::jobs::monitor::{QueueDepth, WorkerLeases};
use crate::jobs::types::{ArtifactRef, Failure, Job, JobStatus, ReclaimAction};

/// In-memory job store.
///
/// One mutex guards the whole table, so selection and mutation in
/// `claim_next` happen as a single step and no two callers can observe the
/// same pending job.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    /// dedupe_key → id of the non-terminal job holding it.
    active_keys: HashMap<String, JobId>,
}

impl Tables {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, JobStoreError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))
    }

    /// Drop the dedupe reservation once a job reaches a terminal status.
    fn release_key_if_terminal(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        if !job.status.is_terminal() {
            return;
        }
        if let Some(key) = job.dedupe_key.clone() {
            if self.active_keys.get(&key) == Some(&job_id) {
                self.active_keys.remove(&key);
            }
        }
    }
}

/// Claim order: priority desc, then scheduled_at, created_at, id asc.
fn claim_order(job: &Job) -> (Reverse<i32>, DateTime<Utc>, DateTime<Utc>, JobId) {
    (
        Reverse(job.priority),
        job.scheduled_at,
        job.created_at,
        job.id,
    )
}

fn lease_lost(job: &Job, worker_id: &str) -> JobStoreError {
    JobStoreError::StaleLease(format!(
        "job {} is not leased by {worker_id} (status {}, owner {:?})",
        job.id, job.status, job.claimed_by
    ))
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs (any status).
    pub fn len(&self) -> usize {
        self.lock().map(|t| t.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, JobStoreError> {
        self.inner
            .lock()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    /// Apply an owner-guarded transition.
    fn with_owned_job<T>(
        &self,
        job_id: JobId,
        worker_id: &str,
        f: impl FnOnce(&mut Job) -> Result<T, JobStoreError>,
    ) -> Result<(Job, T), JobStoreError> {
        let mut tables = self.lock()?;
        let job = tables.job_mut(job_id)?;
        if !job.is_leased_by(worker_id) {
            return Err(lease_lost(job, worker_id));
        }
        let out = f(job)?;
        let snapshot = job.clone();
        tables.release_key_if_terminal(job_id);
        Ok((snapshot, out))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let mut tables = self.lock()?;

        if let Some(key) = &job.dedupe_key {
            if let Some(existing) = tables.active_keys.get(key) {
                return Ok(EnqueueOutcome {
                    job_id: *existing,
                    created: false,
                });
            }
        }
        if tables.jobs.contains_key(&job.id) {
            return Err(JobStoreError::Conflict(format!("job already exists: {}", job.id)));
        }

        let job_id = job.id;
        if let Some(key) = job.dedupe_key.clone() {
            tables.active_keys.insert(key, job_id);
        }
        tables.jobs.insert(job_id, job);
        Ok(EnqueueOutcome {
            job_id,
            created: true,
        })
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        job_types: Option<&[String]>,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut tables = self.lock()?;

        let candidate = tables
            .jobs
            .values()
            .filter(|j| {
                j.is_claimable(now)
                    && job_types.is_none_or(|types| types.iter().any(|t| t == &j.job_type))
            })
            .min_by_key(|j| claim_order(j))
            .map(|j| j.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let job = tables.job_mut(job_id)?;
        job.mark_claimed(worker_id, lease, now)?;
        Ok(Some(job.clone()))
    }

    async fn start(
        &self,
        job_id: JobId,
        worker_id: &str,
        execution_id: Option<RunId>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let (job, ()) = self.with_owned_job(job_id, worker_id, |job| {
            job.mark_running(worker_id, execution_id, now)
                .map_err(JobStoreError::from)
        })?;
        Ok(job)
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobStoreError> {
        let (_, expires_at) = self.with_owned_job(job_id, worker_id, |job| {
            job.extend_lease(worker_id, lease, now)
                .map_err(JobStoreError::from)
        })?;
        Ok(expires_at)
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
        metrics: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let (job, ()) = self.with_owned_job(job_id, worker_id, |job| {
            job.mark_completed(worker_id, result, metrics, now)
                .map_err(JobStoreError::from)
        })?;
        Ok(job)
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        let (job, decision) = self.with_owned_job(job_id, worker_id, |job| {
            job.mark_failed(worker_id, failure, now)
                .map_err(JobStoreError::from)
        })?;
        Ok(FailOutcome { job, decision })
    }

    async fn cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut tables = self.lock()?;
        let job = tables.job_mut(job_id)?;
        job.mark_cancelled(now)?;
        let snapshot = job.clone();
        tables.release_key_if_terminal(job_id);
        Ok(snapshot)
    }

    async fn reinstate(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut tables = self.lock()?;
        let job = tables
            .jobs
            .get(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        if let Some(key) = &job.dedupe_key {
            if let Some(holder) = tables.active_keys.get(key) {
                if *holder != job_id {
                    return Err(JobStoreError::Conflict(format!(
                        "dedupe key {key:?} is held by active job {holder}"
                    )));
                }
            }
        }

        let job = tables.job_mut(job_id)?;
        job.mark_reinstated(now)?;
        let snapshot = job.clone();
        if let Some(key) = snapshot.dedupe_key.clone() {
            tables.active_keys.insert(key, job_id);
        }
        Ok(snapshot)
    }

    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<ReapReport, JobStoreError> {
        let mut tables = self.lock()?;
        let mut expired: Vec<(DateTime<Utc>, JobId)> = tables
            .jobs
            .values()
            .filter(|j| j.lease_expired(now))
            .filter_map(|j| j.claim_expires_at.map(|at| (at, j.id)))
            .collect();
        expired.sort();
        expired.truncate(limit);

        let mut report = ReapReport::default();
        for (_, job_id) in expired {
            let job = tables.job_mut(job_id)?;
            match job.mark_reclaimed(now)? {
                ReclaimAction::Requeued => report.requeued.push(job_id),
                ReclaimAction::DeadLettered => report.dead_lettered.push(job_id),
            }
            tables.release_key_if_terminal(job_id);
        }
        Ok(report)
    }

    async fn attach_artifact(&self, artifact: ArtifactRef) -> Result<(), JobStoreError> {
        let mut tables = self.lock()?;
        let job = tables.job_mut(artifact.job_id)?;
        if job.artifacts.iter().any(|a| a.locator == artifact.locator) {
            return Err(JobStoreError::Conflict(format!(
                "artifact {} already recorded for job {}",
                artifact.locator, artifact.job_id
            )));
        }
        job.artifacts.push(artifact);
        Ok(())
    }

    async fn queue_depth(&self) -> Result<Vec<QueueDepth>, JobStoreError> {
        let tables = self.lock()?;
        let mut counts: BTreeMap<(String, JobStatus), u64> = BTreeMap::new();
        for job in tables.jobs.values() {
            *counts.entry((job.job_type.clone(), job.status)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((job_type, status), count)| QueueDepth {
                job_type,
                status,
                count,
            })
            .collect())
    }

    async fn ready_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.lock()?;
        let mut ready: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .cloned()
            .collect();
        ready.sort_by_key(claim_order);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn active_leases(&self, now: DateTime<Utc>) -> Result<Vec<WorkerLeases>, JobStoreError> {
        let tables = self.lock()?;
        let mut by_worker: BTreeMap<String, WorkerLeases> = BTreeMap::new();
        for job in tables.jobs.values().filter(|j| j.status.is_leased()) {
            let Some(worker_id) = job.claimed_by.clone() else {
                continue;
            };
            let entry = by_worker
                .entry(worker_id.clone())
                .or_insert_with(|| WorkerLeases {
                    worker_id,
                    claimed: 0,
                    running: 0,
                    next_expiry: None,
                    expired: 0,
                });
            match job.status {
                JobStatus::Claimed => entry.claimed += 1,
                _ => entry.running += 1,
            }
            if let Some(at) = job.claim_expires_at {
                entry.next_expiry = Some(entry.next_expiry.map_or(at, |cur| cur.min(at)));
                if at < now {
                    entry.expired += 1;
                }
            }
        }
        Ok(by_worker.into_values().collect())
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.lock()?;
        let mut failed: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::DeadLetter | JobStatus::Failed))
            .cloned()
            .collect();
        failed.sort_by_key(|j| Reverse((j.updated_at, j.id)));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut tables = self.lock()?;
        let initial = tables.jobs.len();
        tables
            .jobs
            .retain(|_, j| !(j.status.is_terminal() && j.updated_at < before));
        Ok((initial - tables.jobs.len()) as u64)
    }
}
