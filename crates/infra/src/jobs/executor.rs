//! Job executor: claims jobs, runs handlers and reports outcomes.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use kitqueue_core::{JobId, RunId};

use super::backoff::RetryDecision;
use super::collaborators::{ArtifactStore, DisabledArtifactStore, RunRecorder, TracingRunRecorder};
use super::context::ExecutionContext;
use super::handler::{HandlerRegistry, JobResult};
use super::queue::JobQueue;
use super::store::JobStoreError;
use super::types::{Failure, Job};

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Base worker id; slot `n` claims as `<worker_id>-<n>`.
    pub worker_id: String,
    /// Only claim these job types (`None` = any).
    pub job_types: Option<Vec<String>>,
    /// Lease taken per claim and per heartbeat.
    pub lease_duration: Duration,
    /// Idle sleep when nothing is claimable
    pub poll_interval: Duration,
    /// Concurrent executor slots
    pub concurrency: usize,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            job_types: None,
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            concurrency: 4,
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

impl JobExecutorConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_job_types<I, S>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_types = Some(job_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn slot_worker_id(&self, slot: usize) -> String {
        format!("{}-{slot}", self.worker_id)
    }
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ExecutionOutcome {
    Completed,
    /// Failed; back in `pending` until `at`.
    RetryScheduled { at: DateTime<Utc> },
    DeadLettered,
    /// The worker no longer held the lease when it tried to report.
    LeaseLost,
}

/// Summary of one claimed job's execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub job_id: JobId,
    pub job_type: String,
    pub attempt: u32,
    pub worker_id: String,
    pub run_id: Option<RunId>,
    pub outcome: ExecutionOutcome,
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Failed attempts that were scheduled for retry
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub leases_lost: u64,
    /// Executions whose outcome could not be written to the store
    pub outcome_errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: ExecutionOutcome) {
        self.jobs_processed += 1;
        match outcome {
            ExecutionOutcome::Completed => self.jobs_succeeded += 1,
            ExecutionOutcome::RetryScheduled { .. } => self.jobs_failed += 1,
            ExecutionOutcome::DeadLettered => self.jobs_dead_lettered += 1,
            ExecutionOutcome::LeaseLost => self.leases_lost += 1,
        }
    }

    fn record_error(&mut self) {
        self.jobs_processed += 1;
        self.outcome_errors += 1;
    }
}

type SharedStats = Arc<Mutex<ExecutorStats>>;

fn lock_stats(stats: &SharedStats) -> MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    slots: Vec<JoinHandle<()>>,
    stats: SharedStats,
    started: Instant,
}

impl JobExecutorHandle {
    /// Stop claiming new jobs and wait for in-flight executions to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for slot in self.slots {
            if let Err(e) = slot.await {
                error!(error = %e, "executor slot ended abnormally");
            }
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = lock_stats(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Background job executor.
///
/// Each slot polls the queue, runs the resolved handler in its own task and
/// reports the outcome. Handler panics become retryable failures; the slot
/// keeps polling.
pub struct JobExecutor {
    queue: JobQueue,
    registry: Arc<HandlerRegistry>,
    recorder: Arc<dyn RunRecorder>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("queue", &self.queue)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    /// Executor with log-only run recording and no artifact storage.
    ///
    /// `put_artifact` fails until a store is set with [`Self::with_artifact_store`].
    pub fn new(queue: JobQueue, registry: HandlerRegistry) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            recorder: Arc::new(TracingRunRecorder),
            artifacts: Arc::new(DisabledArtifactStore),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Spawn `config.concurrency` polling slots on the current tokio runtime.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = SharedStats::default();
        let executor = Arc::new(self);

        let slots = (0..config.concurrency.max(1))
            .map(|slot| {
                let worker_id = config.slot_worker_id(slot);
                tokio::spawn(slot_loop(
                    executor.clone(),
                    config.clone(),
                    worker_id,
                    shutdown_rx.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        info!(
            worker = %config.worker_id,
            concurrency = config.concurrency,
            job_types = ?config.job_types,
            "job executor started"
        );

        JobExecutorHandle {
            shutdown: shutdown_tx,
            slots,
            stats,
            started: Instant::now(),
        }
    }

    /// Claim and execute at most one job as `config.worker_id`.
    pub async fn run_once(
        &self,
        config: &JobExecutorConfig,
    ) -> Result<Option<ExecutionReport>, JobStoreError> {
        let Some(job) = self
            .queue
            .claim_next(
                &config.worker_id,
                config.job_types.as_deref(),
                config.lease_duration,
            )
            .await?
        else {
            return Ok(None);
        };
        self.execute(job, &config.worker_id, config.lease_duration)
            .await
            .map(Some)
    }

    /// Execute a job this worker has just claimed.
    ///
    /// Lost leases are reported as [`ExecutionOutcome::LeaseLost`]; only
    /// storage failures are returned as errors.
    pub async fn execute(
        &self,
        job: Job,
        worker_id: &str,
        lease: Duration,
    ) -> Result<ExecutionReport, JobStoreError> {
        let run_id = match self.recorder.start_run(&job).await {
            Ok(run_id) => Some(run_id),
            Err(e) => {
                warn!(worker = worker_id, job_id = %job.id, error = %e, "failed to open run");
                None
            }
        };
        let mut report = ExecutionReport {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.attempt,
            worker_id: worker_id.to_string(),
            run_id,
            outcome: ExecutionOutcome::LeaseLost,
        };

        let job = match self.queue.start(job.id, worker_id, run_id).await {
            Ok(job) => job,
            Err(e) => {
                if let Err(e) = self.lease_lost(&report, e) {
                    let reason = format!("job not started: {e}");
                    self.close_run(run_id, Err(reason.as_str())).await;
                    return Err(e);
                }
                self.close_run(run_id, Err("lease lost before start")).await;
                return Ok(report);
            }
        };

        let transition = match self.invoke(job, worker_id, run_id, lease).await {
            Ok((result, metrics)) => {
                match self
                    .queue
                    .complete(report.job_id, worker_id, result.clone(), metrics)
                    .await
                {
                    Ok(_) => {
                        self.close_run(run_id, Ok(&result)).await;
                        Ok(ExecutionOutcome::Completed)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(failure) => match self.queue.fail(report.job_id, worker_id, &failure).await {
                Ok(outcome) => {
                    self.close_run(run_id, Err(failure.error.as_str())).await;
                    Ok(match outcome.decision {
                        RetryDecision::Retry { .. } => ExecutionOutcome::RetryScheduled {
                            at: outcome.job.scheduled_at,
                        },
                        RetryDecision::DeadLetter => ExecutionOutcome::DeadLettered,
                    })
                }
                Err(e) => Err(e),
            },
        };

        match transition {
            Ok(outcome) => report.outcome = outcome,
            Err(e) => {
                if let Err(e) = self.lease_lost(&report, e) {
                    let reason = format!("outcome not recorded: {e}");
                    self.close_run(run_id, Err(reason.as_str())).await;
                    return Err(e);
                }
                self.close_run(run_id, Err("lease lost")).await;
            }
        }
        Ok(report)
    }

    /// Resolve and run the handler in its own task so a panic cannot take
    /// down the slot. Returns `(result, metrics)` or the failure to report.
    async fn invoke(
        &self,
        job: Job,
        worker_id: &str,
        run_id: Option<RunId>,
        lease: Duration,
    ) -> Result<(JsonValue, JsonValue), Failure> {
        let Some(handler) = self.registry.resolve(&job.job_type) else {
            warn!(worker = worker_id, job_id = %job.id, job_type = %job.job_type, "no handler for job type");
            return Err(Failure::permanent(format!(
                "no handler registered for job type {:?}",
                job.job_type
            ))
            .with_detail(json!({ "kind": "no_handler", "job_type": job.job_type })));
        };

        let ctx = ExecutionContext::new(
            self.queue.clone(),
            &job,
            worker_id,
            run_id,
            lease,
            self.recorder.clone(),
            self.artifacts.clone(),
        );
        let job_id = job.id;
        match tokio::spawn(async move { handler.handle(job, ctx).await }).await {
            Ok(JobResult::Success { result, metrics }) => Ok((result, metrics)),
            Ok(JobResult::Failure { error, retryable }) => Err(Failure {
                error,
                retryable,
                detail: json!({ "kind": "handler" }),
            }),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(worker = worker_id, job_id = %job_id, panic = %message, "handler panicked");
                Err(Failure::transient(format!("handler panicked: {message}"))
                    .with_detail(json!({ "kind": "panic", "message": message })))
            }
            Err(e) => Err(Failure::transient(format!("handler task cancelled: {e}"))
                .with_detail(json!({ "kind": "cancelled" }))),
        }
    }

    /// Classify a rejected transition. Anything but a storage failure means
    /// another actor (reaper, cancel) took the job away.
    fn lease_lost(&self, report: &ExecutionReport, err: JobStoreError) -> Result<(), JobStoreError> {
        match err {
            JobStoreError::StaleLease(_)
            | JobStoreError::InvalidTransition(_)
            | JobStoreError::NotFound(_) => {
                warn!(
                    worker = %report.worker_id,
                    job_id = %report.job_id,
                    job_type = %report.job_type,
                    attempt = report.attempt,
                    error = %err,
                    "lease lost, dropping result"
                );
                Ok(())
            }
            other => Err(other),
        }
    }

    async fn close_run(&self, run_id: Option<RunId>, result: Result<&JsonValue, &str>) {
        let Some(run_id) = run_id else {
            return;
        };
        let closed = match result {
            Ok(value) => self.recorder.complete_run(run_id, value).await,
            Err(error) => self.recorder.fail_run(run_id, error).await,
        };
        if let Err(e) = closed {
            warn!(run_id = %run_id, error = %e, "failed to close run");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
    }
}

async fn slot_loop(
    executor: Arc<JobExecutor>,
    config: JobExecutorConfig,
    worker_id: String,
    mut shutdown: watch::Receiver<bool>,
    stats: SharedStats,
) {
    debug!(worker = %worker_id, "executor slot started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = executor
            .queue
            .claim_next(&worker_id, config.job_types.as_deref(), config.lease_duration)
            .await;

        match claimed {
            Ok(Some(job)) => {
                lock_stats(&stats).current_running += 1;
                let result = executor.execute(job, &worker_id, config.lease_duration).await;
                {
                    let mut s = lock_stats(&stats);
                    s.current_running = s.current_running.saturating_sub(1);
                    match &result {
                        Ok(report) => s.record(report.outcome),
                        Err(_) => s.record_error(),
                    }
                }

                match result {
                    Ok(report) => debug!(
                        worker = %worker_id,
                        job_id = %report.job_id,
                        job_type = %report.job_type,
                        attempt = report.attempt,
                        outcome = ?report.outcome,
                        "job executed"
                    ),
                    Err(e) => {
                        error!(worker = %worker_id, error = %e, "failed to record job outcome");
                        if idle(&mut shutdown, config.poll_interval).await {
                            break;
                        }
                    }
                }
            }
            Ok(None) => {
                if idle(&mut shutdown, config.poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                error!(worker = %worker_id, error = %e, "failed to claim job");
                if idle(&mut shutdown, config.poll_interval).await {
                    break;
                }
            }
        }
    }

    debug!(worker = %worker_id, "executor slot stopped");
}

/// Sleep one poll interval. Returns `true` when shutdown was requested.
async fn idle(shutdown: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
