//! Postgres job store tests.
//!
//! Skipped unless `DATABASE_URL` points at a disposable database. Each test
//! uses its own job type so tests can share one schema.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use kitqueue_core::{Clock, JobId, ManualClock};
use kitqueue_infra::config::QueueConfig;
use kitqueue_infra::jobs::{
    ArtifactRef, Failure, JobQueue, JobStatus, JobStore, JobStoreError, NewJob, PostgresJobStore,
    RetryDecision,
};

const LEASE: Duration = Duration::from_secs(60);

async fn store() -> Option<PostgresJobStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let store = PostgresJobStore::connect(&url, 10).await.unwrap();
    store.ensure_schema().await.unwrap();
    Some(store)
}

fn unique_type(prefix: &str) -> String {
    format!("{prefix}.{}", uuid::Uuid::now_v7().simple())
}

async fn setup() -> Option<(JobQueue, Arc<ManualClock>, Vec<String>)> {
    let store = store().await?;
    let clock = Arc::new(ManualClock::starting_now());
    let queue = JobQueue::new(Arc::new(store), clock.clone(), QueueConfig::default());
    Some((queue, clock, vec![unique_type("pg")]))
}

#[tokio::test]
async fn ensure_schema_is_idempotent() {
    let Some(store) = store().await else {
        return;
    };
    store.ensure_schema().await.unwrap();
}

#[tokio::test]
async fn claim_complete_round_trip() {
    let Some((queue, _, types)) = setup().await else {
        return;
    };
    let id = queue
        .enqueue(NewJob::new(&types[0], json!({"x": 1})).with_tag("pg"))
        .await
        .unwrap()
        .job_id;

    let job = queue
        .claim_next("w1", Some(&types), LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Claimed);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.tags, vec!["pg".to_string()]);
    assert!(queue.claim_next("w2", Some(&types), LEASE).await.unwrap().is_none());

    queue.start(id, "w1", None).await.unwrap();
    let done = queue
        .complete(id, "w1", json!({"ok": true}), json!({}))
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result, Some(json!({"ok": true})));
    assert!(done.claimed_by.is_none());
}

#[tokio::test]
async fn claim_respects_priority() {
    let Some((queue, _, types)) = setup().await else {
        return;
    };
    let low = queue
        .enqueue(NewJob::new(&types[0], json!({})).with_priority(-1))
        .await
        .unwrap()
        .job_id;
    let high = queue
        .enqueue(NewJob::new(&types[0], json!({})).with_priority(10))
        .await
        .unwrap()
        .job_id;

    let first = queue.claim_next("w1", Some(&types), LEASE).await.unwrap().unwrap();
    let second = queue.claim_next("w1", Some(&types), LEASE).await.unwrap().unwrap();
    assert_eq!((first.id, second.id), (high, low));
}

#[tokio::test]
async fn retry_then_dead_letter_then_reinstate() {
    let Some((queue, clock, types)) = setup().await else {
        return;
    };
    let id = queue
        .enqueue(NewJob::new(&types[0], json!({})).with_max_attempts(2).with_backoff_seconds(5))
        .await
        .unwrap()
        .job_id;

    queue.claim_next("w1", Some(&types), LEASE).await.unwrap().unwrap();
    let outcome = queue.fail(id, "w1", &Failure::transient("503")).await.unwrap();
    assert_eq!(
        outcome.decision,
        RetryDecision::Retry {
            delay: Duration::from_secs(5)
        }
    );
    assert_eq!(outcome.job.status, JobStatus::Pending);

    assert!(queue.claim_next("w1", Some(&types), LEASE).await.unwrap().is_none());
    clock.advance(chrono::Duration::seconds(5));
    queue.claim_next("w1", Some(&types), LEASE).await.unwrap().unwrap();
    let outcome = queue.fail(id, "w1", &Failure::transient("503 again")).await.unwrap();
    assert_eq!(outcome.job.status, JobStatus::DeadLetter);
    assert_eq!(outcome.job.error_message.as_deref(), Some("503 again"));

    let job = queue.reinstate(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt, 0);
}

#[tokio::test]
async fn stale_worker_is_rejected_after_reap() {
    let Some((queue, clock, types)) = setup().await else {
        return;
    };
    let id = queue
        .enqueue(NewJob::new(&types[0], json!({})))
        .await
        .unwrap()
        .job_id;
    queue.claim_next("w1", Some(&types), LEASE).await.unwrap().unwrap();

    clock.advance(chrono::Duration::seconds(61));
    let report = queue.reap_expired(10_000).await.unwrap();
    assert!(report.requeued.contains(&id));

    let err = queue.complete(id, "w1", json!({}), json!({})).await.unwrap_err();
    assert!(matches!(err, JobStoreError::StaleLease(_)));

    let job = queue.claim_next("w2", Some(&types), LEASE).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempt, 2);
}

#[tokio::test]
async fn dedupe_key_collapses_active_jobs() {
    let Some((queue, _, types)) = setup().await else {
        return;
    };
    let key = unique_type("dedupe");
    let make = || NewJob::new(&types[0], json!({})).with_dedupe_key(&key);

    let first = queue.enqueue(make()).await.unwrap();
    let second = queue.enqueue(make()).await.unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.job_id, second.job_id);

    queue.cancel(first.job_id).await.unwrap();
    let third = queue.enqueue(make()).await.unwrap();
    assert!(third.created);
    assert_ne!(third.job_id, first.job_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_are_unique() {
    let Some((queue, _, types)) = setup().await else {
        return;
    };
    let mut expected = HashSet::new();
    for _ in 0..40 {
        expected.insert(
            queue
                .enqueue(NewJob::new(&types[0], json!({})))
                .await
                .unwrap()
                .job_id,
        );
    }

    let mut tasks = Vec::new();
    for w in 0..6 {
        let (queue, types) = (queue.clone(), types.clone());
        tasks.push(tokio::spawn(async move {
            let worker = format!("w{w}");
            let mut claimed = Vec::new();
            while let Some(job) = queue.claim_next(&worker, Some(&types), LEASE).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut seen: Vec<JobId> = Vec::new();
    for task in tasks {
        seen.extend(task.await.unwrap());
    }
    let unique: HashSet<JobId> = seen.iter().copied().collect();
    assert_eq!(seen.len(), unique.len());
    assert_eq!(unique, expected);
}

#[tokio::test]
async fn artifacts_are_loaded_with_the_job() {
    let Some((queue, clock, types)) = setup().await else {
        return;
    };
    let id = queue
        .enqueue(NewJob::new(&types[0], json!({})))
        .await
        .unwrap()
        .job_id;
    let artifact = ArtifactRef {
        job_id: id,
        locator: "mem://a".to_string(),
        content_type: "text/plain".to_string(),
        size_bytes: 5,
        checksum: "abc".to_string(),
        created_at: clock.now(),
    };
    queue.attach_artifact(artifact.clone()).await.unwrap();
    assert!(matches!(
        queue.attach_artifact(artifact.clone()).await,
        Err(JobStoreError::Conflict(_))
    ));

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.artifacts.len(), 1);
    assert_eq!(job.artifacts[0].locator, "mem://a");

    let missing = ArtifactRef {
        job_id: JobId::new(),
        ..artifact
    };
    assert!(matches!(
        queue.attach_artifact(missing).await,
        Err(JobStoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn monitoring_queries_run() {
    let Some((queue, _, types)) = setup().await else {
        return;
    };
    queue.enqueue(NewJob::new(&types[0], json!({}))).await.unwrap();
    queue.claim_next("mon-w1", Some(&types), LEASE).await.unwrap().unwrap();

    let depth = queue.queue_depth().await.unwrap();
    assert!(depth
        .iter()
        .any(|d| d.job_type == types[0] && d.status == JobStatus::Claimed && d.count == 1));

    let leases = queue.active_leases().await.unwrap();
    assert!(leases.iter().any(|l| l.worker_id == "mon-w1" && l.claimed == 1));

    queue.snapshot(5).await.unwrap();
    let store: &dyn JobStore = queue.store().as_ref();
    store.purge_terminal(Utc::now() - chrono::Duration::days(3650)).await.unwrap();
}
