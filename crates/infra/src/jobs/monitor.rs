//! Read-only status views over the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Job, JobStatus};

/// Number of jobs of one type in one status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub job_type: String,
    pub status: JobStatus,
    pub count: u64,
}

/// Leases currently held by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLeases {
    pub worker_id: String,
    pub claimed: u64,
    pub running: u64,
    /// Soonest lease expiry among this worker's jobs.
    pub next_expiry: Option<DateTime<Utc>>,
    /// Leases already past expiry, waiting for the reaper.
    pub expired: u64,
}

impl WorkerLeases {
    pub fn total(&self) -> u64 {
        self.claimed + self.running
    }
}

/// All monitoring views captured at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub taken_at: DateTime<Utc>,
    pub depth: Vec<QueueDepth>,
    pub ready: Vec<Job>,
    pub leases: Vec<WorkerLeases>,
    pub recent_failures: Vec<Job>,
}

impl QueueSnapshot {
    /// Total jobs in `status`, across all job types.
    pub fn count_in(&self, status: JobStatus) -> u64 {
        self.depth
            .iter()
            .filter(|d| d.status == status)
            .map(|d| d.count)
            .sum()
    }

    /// Total jobs of `job_type` in `status`.
    pub fn count_of(&self, job_type: &str, status: JobStatus) -> u64 {
        self.depth
            .iter()
            .find(|d| d.job_type == job_type && d.status == status)
            .map_or(0, |d| d.count)
    }
}
