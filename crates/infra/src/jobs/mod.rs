//! Durable job queue with leases, retry/backoff and dead-lettering.
//!
//! ## Components
//!
//! - [`JobQueue`]: enqueue, claim and report outcomes; reads "now" from an injected clock
//! - [`JobStore`]: persistence (in-memory or Postgres); every transition is a guarded single-row update
//! - [`JobExecutor`]: polling slots that run registered handlers
//! - [`ClaimReaper`]: reverts expired leases so another worker can pick the job up
//!
//! ## Lifecycle
//!
//! ```text
//! pending → claimed → running → completed
//!                             → pending (retry after backoff)
//!                             → dead_letter
//! claimed | running → pending      (lease expired)
//! pending | claimed → cancelled
//! dead_letter → pending            (reinstate)
//! ```

pub mod backoff;
pub mod collaborators;
pub mod context;
pub mod executor;
pub mod handler;
pub mod monitor;
pub mod queue;
pub mod reaper;
pub mod store;
pub mod types;

pub use backoff::{RetryDecision, RetryPolicy, backoff_delay};
pub use collaborators::{
    ArtifactStore, CollaboratorError, DisabledArtifactStore, InMemoryArtifactStore,
    InMemoryRunRecorder, RunEvent, RunRecorder, TracingRunRecorder,
};
pub use context::{ArtifactError, ExecutionContext};
pub use executor::{
    ExecutionOutcome, ExecutionReport, ExecutorStats, JobExecutor, JobExecutorConfig,
    JobExecutorHandle,
};
pub use handler::{HandlerRegistry, JobHandler, JobResult};
pub use monitor::{QueueDepth, QueueSnapshot, WorkerLeases};
pub use queue::JobQueue;
pub use reaper::{ClaimReaper, ReaperConfig, ReaperHandle};
pub use store::{
    EnqueueOutcome, FailOutcome, InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore,
    ReapReport,
};
pub use types::{ArtifactRef, Failure, Job, JobStatus, NewJob, ReclaimAction};
