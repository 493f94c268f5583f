//! Per-execution context handed to handlers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::warn;

use kitqueue_core::{JobId, RunId};

use super::collaborators::{ArtifactStore, CollaboratorError, RunEvent, RunRecorder};
use super::queue::JobQueue;
use super::store::JobStoreError;
use super::types::{ArtifactRef, Job};

/// Artifact upload failure, returned to the handler.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Upload(#[from] CollaboratorError),
    #[error("artifact stored but not recorded: {0}")]
    Record(#[from] JobStoreError),
}

/// Handle to the queue and collaborators for one job execution.
///
/// Cheap to clone; handlers may move clones into spawned tasks.
#[derive(Clone)]
pub struct ExecutionContext {
    queue: JobQueue,
    job_id: JobId,
    job_type: String,
    worker_id: String,
    attempt: u32,
    run_id: Option<RunId>,
    lease: Duration,
    recorder: Arc<dyn RunRecorder>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("worker_id", &self.worker_id)
            .field("attempt", &self.attempt)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub(crate) fn new(
        queue: JobQueue,
        job: &Job,
        worker_id: impl Into<String>,
        run_id: Option<RunId>,
        lease: Duration,
        recorder: Arc<dyn RunRecorder>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            queue,
            job_id: job.id,
            job_type: job.job_type.clone(),
            worker_id: worker_id.into(),
            attempt: job.attempt,
            run_id,
            lease,
            recorder,
            artifacts,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Telemetry run of this execution, if the recorder opened one.
    pub fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    /// Record a telemetry event. Recorder failures are logged, not returned.
    pub async fn emit(&self, kind: impl Into<String>, data: JsonValue) {
        let Some(run_id) = self.run_id else {
            return;
        };
        let event = RunEvent {
            kind: kind.into(),
            data,
            at: self.queue.now(),
        };
        if let Err(e) = self.recorder.append_event(run_id, event).await {
            warn!(job_id = %self.job_id, run_id = %run_id, error = %e, "failed to record run event");
        }
    }

    /// Upload an artifact and record a reference to it on the job.
    pub async fn put_artifact(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<ArtifactRef, ArtifactError> {
        let checksum = hex::encode(Sha256::digest(&bytes));
        let size_bytes = bytes.len() as u64;
        let locator = self.artifacts.put(self.job_id, bytes, content_type).await?;

        let artifact = ArtifactRef {
            job_id: self.job_id,
            locator,
            content_type: content_type.to_string(),
            size_bytes,
            checksum,
            created_at: self.queue.now(),
        };
        self.queue.attach_artifact(artifact.clone()).await?;
        Ok(artifact)
    }

    /// Extend this worker's lease by the executor's lease duration.
    ///
    /// Fails with [`JobStoreError::StaleLease`] once the lease is gone.
    pub async fn heartbeat(&self) -> Result<DateTime<Utc>, JobStoreError> {
        self.queue
            .extend_lease(self.job_id, &self.worker_id, self.lease)
            .await
    }

    /// Whether the handler should stop at the next safe point.
    ///
    /// True once the job is no longer running under this worker's lease
    /// (cancelled, reaped or reclaimed by another worker) or the lease has run
    /// out. A failed status read is treated as "keep going".
    pub async fn should_stop(&self) -> bool {
        match self.queue.get(self.job_id).await {
            Ok(Some(job)) => !job.is_leased_by(&self.worker_id) || job.lease_expired(self.queue.now()),
            Ok(None) => true,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "lease check failed");
                false
            }
        }
    }
}
