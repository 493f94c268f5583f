//! External collaborators used during execution: the telemetry run recorder
//! and the artifact store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

use kitqueue_core::{JobId, RunId};

use super::types::Job;

/// Run recorder / artifact store failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("unknown run: {0}")]
    UnknownRun(RunId),
    #[error("run already finished: {0}")]
    RunFinished(RunId),
    #[error("artifact rejected: {0}")]
    Rejected(String),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// One telemetry event emitted by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: String,
    pub data: JsonValue,
    pub at: DateTime<Utc>,
}

/// Telemetry for job executions. One run per attempt.
#[async_trait]
pub trait RunRecorder: Send + Sync + 'static {
    async fn start_run(&self, job: &Job) -> Result<RunId, CollaboratorError>;

    async fn append_event(&self, run_id: RunId, event: RunEvent) -> Result<(), CollaboratorError>;

    async fn complete_run(&self, run_id: RunId, result: &JsonValue)
        -> Result<(), CollaboratorError>;

    async fn fail_run(&self, run_id: RunId, error: &str) -> Result<(), CollaboratorError>;
}

/// Blob storage for job outputs.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Store `bytes` and return a locator for them.
    async fn put(
        &self,
        job_id: JobId,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, CollaboratorError>;
}

/// Run recorder that writes lifecycle events as log records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunRecorder;

#[async_trait]
impl RunRecorder for TracingRunRecorder {
    async fn start_run(&self, job: &Job) -> Result<RunId, CollaboratorError> {
        let run_id = RunId::new();
        info!(
            run_id = %run_id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt,
            "run started"
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: RunId, event: RunEvent) -> Result<(), CollaboratorError> {
        info!(run_id = %run_id, kind = %event.kind, data = %event.data, "run event");
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: RunId,
        result: &JsonValue,
    ) -> Result<(), CollaboratorError> {
        info!(run_id = %run_id, result = %result, "run completed");
        Ok(())
    }

    async fn fail_run(&self, run_id: RunId, error: &str) -> Result<(), CollaboratorError> {
        info!(run_id = %run_id, error, "run failed");
        Ok(())
    }
}

/// How a recorded run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    Running,
    Completed { result: JsonValue },
    Failed { error: String },
}

/// A run as captured by [`InMemoryRunRecorder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedRun {
    pub run_id: RunId,
    pub job_id: JobId,
    pub job_type: String,
    pub attempt: u32,
    pub events: Vec<RunEvent>,
    pub state: RunState,
}

/// Run recorder that keeps every run in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRunRecorder {
    runs: Arc<Mutex<HashMap<RunId, RecordedRun>>>,
}

impl InMemoryRunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&self, run_id: RunId) -> Option<RecordedRun> {
        self.runs.lock().ok()?.get(&run_id).cloned()
    }

    /// All runs for one job, oldest attempt first.
    pub fn runs_for(&self, job_id: JobId) -> Vec<RecordedRun> {
        let Ok(runs) = self.runs.lock() else {
            return Vec::new();
        };
        let mut out: Vec<_> = runs.values().filter(|r| r.job_id == job_id).cloned().collect();
        out.sort_by_key(|r| r.attempt);
        out
    }

    fn with_open_run<T>(
        &self,
        run_id: RunId,
        f: impl FnOnce(&mut RecordedRun) -> T,
    ) -> Result<T, CollaboratorError> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("lock poisoned".to_string()))?;
        let run = runs
            .get_mut(&run_id)
            .ok_or(CollaboratorError::UnknownRun(run_id))?;
        if run.state != RunState::Running {
            return Err(CollaboratorError::RunFinished(run_id));
        }
        Ok(f(run))
    }
}

#[async_trait]
impl RunRecorder for InMemoryRunRecorder {
    async fn start_run(&self, job: &Job) -> Result<RunId, CollaboratorError> {
        let run_id = RunId::new();
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("lock poisoned".to_string()))?;
        runs.insert(
            run_id,
            RecordedRun {
                run_id,
                job_id: job.id,
                job_type: job.job_type.clone(),
                attempt: job.attempt,
                events: Vec::new(),
                state: RunState::Running,
            },
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: RunId, event: RunEvent) -> Result<(), CollaboratorError> {
        self.with_open_run(run_id, |run| run.events.push(event))
    }

    async fn complete_run(
        &self,
        run_id: RunId,
        result: &JsonValue,
    ) -> Result<(), CollaboratorError> {
        self.with_open_run(run_id, |run| {
            run.state = RunState::Completed {
                result: result.clone(),
            }
        })
    }

    async fn fail_run(&self, run_id: RunId, error: &str) -> Result<(), CollaboratorError> {
        self.with_open_run(run_id, |run| {
            run.state = RunState::Failed {
                error: error.to_string(),
            }
        })
    }
}

/// A blob held by [`InMemoryArtifactStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub job_id: JobId,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Artifact store backed by a map. Locators look like `mem://<job_id>/<uuid>`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryArtifactStore {
    blobs: Arc<Mutex<HashMap<String, StoredArtifact>>>,
    max_size: Option<usize>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject artifacts larger than `bytes`.
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = Some(bytes);
        self
    }

    pub fn get(&self, locator: &str) -> Option<StoredArtifact> {
        self.blobs.lock().ok()?.get(locator).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(
        &self,
        job_id: JobId,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, CollaboratorError> {
        if let Some(max) = self.max_size {
            if bytes.len() > max {
                return Err(CollaboratorError::Rejected(format!(
                    "artifact of {} bytes exceeds limit of {max}",
                    bytes.len()
                )));
            }
        }
        let locator = format!("mem://{job_id}/{}", Uuid::now_v7());
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("lock poisoned".to_string()))?;
        blobs.insert(
            locator.clone(),
            StoredArtifact {
                job_id,
                content_type: content_type.to_string(),
                bytes,
            },
        );
        Ok(locator)
    }
}

/// Artifact store for deployments without blob storage: rejects every upload.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledArtifactStore;

#[async_trait]
impl ArtifactStore for DisabledArtifactStore {
    async fn put(
        &self,
        job_id: JobId,
        _bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable(format!(
            "no artifact store configured (job {job_id})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::jobs::types::NewJob;

    fn job() -> Job {
        NewJob::new("demo", serde_json::json!({}))
            .into_job(&QueueConfig::default(), Utc::now())
            .unwrap()
    }

    #[tokio::test]
    async fn in_memory_recorder_tracks_run_lifecycle() {
        let recorder = InMemoryRunRecorder::new();
        let job = job();

        let run_id = recorder.start_run(&job).await.unwrap();
        recorder
            .append_event(
                run_id,
                RunEvent {
                    kind: "progress".to_string(),
                    data: serde_json::json!({"pct": 50}),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
        recorder
            .complete_run(run_id, &serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let run = recorder.run(run_id).unwrap();
        assert_eq!(run.events.len(), 1);
        assert_eq!(
            run.state,
            RunState::Completed {
                result: serde_json::json!({"ok": true})
            }
        );

        // A finished run accepts nothing more.
        let err = recorder.fail_run(run_id, "late").await.unwrap_err();
        assert_eq!(err, CollaboratorError::RunFinished(run_id));
        assert_eq!(recorder.runs_for(job.id).len(), 1);
    }

    #[tokio::test]
    async fn unknown_run_is_rejected() {
        let recorder = InMemoryRunRecorder::new();
        let run_id = RunId::new();
        assert_eq!(
            recorder.fail_run(run_id, "x").await.unwrap_err(),
            CollaboratorError::UnknownRun(run_id)
        );
    }

    #[tokio::test]
    async fn artifact_store_enforces_size_limit() {
        let store = InMemoryArtifactStore::new().with_max_size(4);
        let job_id = JobId::new();

        let locator = store.put(job_id, b"abcd".to_vec(), "text/plain").await.unwrap();
        assert!(locator.starts_with(&format!("mem://{job_id}/")));
        assert_eq!(store.get(&locator).unwrap().bytes, b"abcd");

        let err = store
            .put(job_id, b"abcde".to_vec(), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn disabled_artifact_store_rejects_uploads() {
        let err = DisabledArtifactStore
            .put(JobId::new(), b"abcd".to_vec(), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
    }
}
