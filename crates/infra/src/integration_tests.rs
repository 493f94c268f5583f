//! Integration tests for the full queue pipeline.
//!
//! Tests: enqueue → claim → execute → complete / retry / dead-letter, plus
//! lease expiry and reaping, over the in-memory store with a manual clock.
//!
//! Verifies:
//! - Concurrent claimers never receive the same job
//! - Dedupe keys collapse concurrent enqueues into one job
//! - Lifecycle invariants hold under arbitrary operation sequences

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;
    use serde_json::json;

    use kitqueue_core::{Clock, JobId, ManualClock};

    use crate::config::QueueConfig;
    use crate::jobs::{
        ClaimReaper, ExecutionOutcome, Failure, HandlerRegistry, InMemoryJobStore, JobExecutor,
        JobExecutorConfig, JobQueue, JobResult, JobStatus, JobStoreError, NewJob, ReaperConfig,
    };

    const LEASE: Duration = Duration::from_secs(60);

    fn setup() -> (JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = JobQueue::new(InMemoryJobStore::arc(), clock.clone(), QueueConfig::default());
        (queue, clock)
    }

    #[tokio::test]
    async fn demo_job_round_trip_completes() {
        let (queue, _) = setup();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("demo", |_job, _ctx| async { JobResult::success(json!({"ok": true})) });
        let executor = JobExecutor::new(queue.clone(), registry);

        let id = queue
            .enqueue(NewJob::new("demo", json!({"x": 1})))
            .await
            .unwrap()
            .job_id;

        let config = JobExecutorConfig::default().with_worker_id("worker-a");
        let report = executor.run_once(&config).await.unwrap().unwrap();
        assert_eq!(report.job_id, id);
        assert_eq!(report.outcome, ExecutionOutcome::Completed);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert_eq!(job.payload, json!({"x": 1}));
        assert!(job.claimed_by.is_none());
        assert!(job.claim_expires_at.is_none());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_dead_letter() {
        let (queue, clock) = setup();
        let id = queue
            .enqueue(
                NewJob::new("flaky", json!({}))
                    .with_max_attempts(3)
                    .with_backoff_seconds(10),
            )
            .await
            .unwrap()
            .job_id;

        // attempt 1 → retry after 10s, attempt 2 → retry after 20s
        for (attempt, delay) in [(1u32, 10i64), (2, 20)] {
            let job = queue.claim_next("w1", None, LEASE).await.unwrap().unwrap();
            assert_eq!(job.attempt, attempt);
            let failed_at = clock.now();
            let outcome = queue
                .fail(id, "w1", &Failure::transient(format!("timeout #{attempt}")))
                .await
                .unwrap();
            assert_eq!(outcome.job.status, JobStatus::Pending);
            assert_eq!(
                outcome.job.next_retry_at,
                Some(failed_at + chrono::Duration::seconds(delay))
            );

            assert!(queue.claim_next("w1", None, LEASE).await.unwrap().is_none());
            clock.advance(chrono::Duration::seconds(delay));
        }

        queue.claim_next("w1", None, LEASE).await.unwrap().unwrap();
        let outcome = queue
            .fail(id, "w1", &Failure::transient("timeout #3"))
            .await
            .unwrap();
        assert_eq!(outcome.job.status, JobStatus::DeadLetter);
        assert_eq!(outcome.job.attempt, 3);
        assert_eq!(outcome.job.error_message.as_deref(), Some("timeout #3"));

        // Dead letters stay put.
        clock.advance(chrono::Duration::days(1));
        assert!(queue.claim_next("w1", None, LEASE).await.unwrap().is_none());

        // Until reinstated.
        queue.reinstate(id).await.unwrap();
        let job = queue.claim_next("w2", None, LEASE).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_by_another_worker() {
        let (queue, clock) = setup();
        let id = queue
            .enqueue(NewJob::new("demo", json!({})))
            .await
            .unwrap()
            .job_id;

        queue.claim_next("worker-a", None, LEASE).await.unwrap().unwrap();
        queue.start(id, "worker-a", None).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));

        let report = ClaimReaper::new(queue.clone(), ReaperConfig::default())
            .run_once()
            .await
            .unwrap();
        assert_eq!(report.requeued, vec![id]);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let reclaimed = queue.claim_next("worker-b", None, LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("worker-b"));
        assert_eq!(reclaimed.attempt, 2);

        // The original worker's late completion is rejected.
        let err = queue
            .complete(id, "worker-a", json!({}), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::StaleLease(_)));
    }

    #[tokio::test]
    async fn empty_and_fully_claimed_queue_returns_none() {
        let (queue, _) = setup();
        assert!(queue.claim_next("w1", None, LEASE).await.unwrap().is_none());

        queue.enqueue(NewJob::new("demo", json!({}))).await.unwrap();
        assert!(queue.claim_next("w1", None, LEASE).await.unwrap().is_some());
        assert!(queue.claim_next("w2", None, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_job_is_never_claimed() {
        let (queue, clock) = setup();
        let id = queue
            .enqueue(NewJob::new("demo", json!({})))
            .await
            .unwrap()
            .job_id;
        let job = queue.cancel(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        clock.advance(chrono::Duration::hours(1));
        assert!(queue.claim_next("w1", None, LEASE).await.unwrap().is_none());
        assert!(matches!(
            queue.cancel(id).await,
            Err(JobStoreError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn running_job_cannot_be_cancelled() {
        let (queue, _) = setup();
        let id = queue
            .enqueue(NewJob::new("demo", json!({})))
            .await
            .unwrap()
            .job_id;
        queue.claim_next("w1", None, LEASE).await.unwrap();
        queue.start(id, "w1", None).await.unwrap();

        assert!(matches!(
            queue.cancel(id).await,
            Err(JobStoreError::InvalidTransition(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_are_unique() {
        let (queue, _) = setup();
        let mut expected = HashSet::new();
        for i in 0..50 {
            let id = queue
                .enqueue(NewJob::new("demo", json!({ "i": i })))
                .await
                .unwrap()
                .job_id;
            expected.insert(id);
        }

        let mut tasks = Vec::new();
        for w in 0..8 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                let worker = format!("w{w}");
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim_next(&worker, None, LEASE).await.unwrap() {
                    claimed.push(job.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut seen: Vec<JobId> = Vec::new();
        for task in tasks {
            seen.extend(task.await.unwrap());
        }
        let unique: HashSet<JobId> = seen.iter().copied().collect();
        assert_eq!(seen.len(), unique.len(), "a job was claimed twice");
        assert_eq!(unique, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_with_one_dedupe_key_yield_one_job() {
        let (queue, _) = setup();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                queue
                    .enqueue(NewJob::new("sync", json!({})).with_dedupe_key("account-9"))
                    .await
                    .unwrap()
            }));
        }

        let mut ids = HashSet::new();
        let mut created = 0;
        for task in tasks {
            let outcome = task.await.unwrap();
            ids.insert(outcome.job_id);
            created += usize::from(outcome.created);
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(created, 1);
        assert_eq!(queue.ready_jobs(100).await.unwrap().len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue { priority: i32, max_attempts: u32 },
        Claim { worker: usize },
        Start { pick: usize },
        Complete { pick: usize },
        Fail { pick: usize, retryable: bool },
        Cancel { pick: usize },
        Advance { secs: i64 },
        Reap,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            2 => (-5i32..=5, 1u32..=4)
                .prop_map(|(priority, max_attempts)| Op::Enqueue { priority, max_attempts }),
            3 => (0usize..3).prop_map(|worker| Op::Claim { worker }),
            1 => any::<usize>().prop_map(|pick| Op::Start { pick }),
            2 => any::<usize>().prop_map(|pick| Op::Complete { pick }),
            2 => (any::<usize>(), any::<bool>())
                .prop_map(|(pick, retryable)| Op::Fail { pick, retryable }),
            1 => any::<usize>().prop_map(|pick| Op::Cancel { pick }),
            2 => (1i64..=90).prop_map(|secs| Op::Advance { secs }),
            1 => Just(Op::Reap),
        ]
    }

    async fn run_ops(ops: Vec<Op>) {
        let (queue, clock) = setup();
        let lease = Duration::from_secs(30);
        let workers = ["w0", "w1", "w2"];
        let mut ids: Vec<JobId> = Vec::new();
        let mut last_attempt: HashMap<JobId, u32> = HashMap::new();
        let mut terminal: HashMap<JobId, JobStatus> = HashMap::new();

        for op in ops {
            let pick = |p: usize| (!ids.is_empty()).then(|| ids[p % ids.len()]);
            match op {
                Op::Enqueue { priority, max_attempts } => {
                    let new_job = NewJob::new("prop", json!({}))
                        .with_priority(priority)
                        .with_max_attempts(max_attempts)
                        .with_backoff_seconds(5);
                    ids.push(queue.enqueue(new_job).await.unwrap().job_id);
                }
                Op::Claim { worker } => {
                    if let Some(job) = queue.claim_next(workers[worker], None, lease).await.unwrap() {
                        assert!(!terminal.contains_key(&job.id));
                        assert_eq!(job.status, JobStatus::Claimed);
                    }
                }
                Op::Start { pick: p } => {
                    if let Some(id) = pick(p) {
                        let job = queue.get(id).await.unwrap().unwrap();
                        if let Some(owner) = job.claimed_by.clone() {
                            let _ = queue.start(id, &owner, None).await;
                        }
                    }
                }
                Op::Complete { pick: p } => {
                    if let Some(id) = pick(p) {
                        let job = queue.get(id).await.unwrap().unwrap();
                        if let Some(owner) = job.claimed_by.clone() {
                            queue.complete(id, &owner, json!({}), json!({})).await.unwrap();
                        }
                    }
                }
                Op::Fail { pick: p, retryable } => {
                    if let Some(id) = pick(p) {
                        let job = queue.get(id).await.unwrap().unwrap();
                        if let Some(owner) = job.claimed_by.clone() {
                            let failure = Failure {
                                error: "boom".to_string(),
                                retryable,
                                detail: json!(null),
                            };
                            queue.fail(id, &owner, &failure).await.unwrap();
                        }
                    }
                }
                Op::Cancel { pick: p } => {
                    if let Some(id) = pick(p) {
                        let _ = queue.cancel(id).await;
                    }
                }
                Op::Advance { secs } => clock.advance(chrono::Duration::seconds(secs)),
                Op::Reap => {
                    queue.reap_expired(100).await.unwrap();
                }
            }

            for id in &ids {
                let job = queue.get(*id).await.unwrap().unwrap();
                assert!(job.attempt <= job.max_attempts);
                let prev = last_attempt.insert(job.id, job.attempt).unwrap_or(0);
                assert!(job.attempt >= prev, "attempt went backwards");
                assert_eq!(
                    job.status.is_leased(),
                    job.claimed_by.is_some() && job.claim_expires_at.is_some()
                );
                if let Some(status) = terminal.get(id) {
                    assert_eq!(job.status, *status, "terminal job changed status");
                } else if job.status.is_terminal() {
                    terminal.insert(job.id, job.status);
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn lifecycle_invariants_hold(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(run_ops(ops));
        }
    }
}
