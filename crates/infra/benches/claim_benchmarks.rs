use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use kitqueue_infra::jobs::{InMemoryJobStore, JobQueue, NewJob};
use serde_json::json;
use tokio::runtime::Runtime;

const LEASE: Duration = Duration::from_secs(60);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn queue_with(rt: &Runtime, jobs: usize) -> JobQueue {
    let queue = JobQueue::with_store(InMemoryJobStore::arc());
    rt.block_on(async {
        for i in 0..jobs {
            queue
                .enqueue(NewJob::new("bench", json!({ "i": i })).with_priority((i % 7) as i32))
                .await
                .unwrap();
        }
    });
    queue
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_throughput");

    for count in [100usize, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || JobQueue::with_store(InMemoryJobStore::arc()),
                |queue| {
                    rt.block_on(async {
                        for i in 0..count {
                            black_box(
                                queue
                                    .enqueue(NewJob::new("bench", json!({ "i": i })))
                                    .await
                                    .unwrap(),
                            );
                        }
                    })
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_claim_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_latency");

    // Claim cost grows with the pending backlog the selection scans.
    for backlog in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || queue_with(&rt, backlog),
                |queue| rt.block_on(async { black_box(queue.claim_next("bench", None, LEASE).await.unwrap()) }),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_drain_with_concurrent_workers(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("drain_concurrent");
    let jobs = 1_000usize;
    group.throughput(Throughput::Elements(jobs as u64));

    for workers in [1usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter_batched(
                || queue_with(&rt, jobs),
                |queue| {
                    rt.block_on(async {
                        let queue = Arc::new(queue);
                        let mut tasks = Vec::with_capacity(workers);
                        for w in 0..workers {
                            let queue = queue.clone();
                            tasks.push(tokio::spawn(async move {
                                let worker = format!("bench-{w}");
                                let mut n = 0usize;
                                while let Some(job) =
                                    queue.claim_next(&worker, None, LEASE).await.unwrap()
                                {
                                    queue
                                        .complete(job.id, &worker, json!({}), json!({}))
                                        .await
                                        .unwrap();
                                    n += 1;
                                }
                                n
                            }));
                        }
                        let mut total = 0;
                        for task in tasks {
                            total += task.await.unwrap();
                        }
                        assert_eq!(total, jobs);
                    })
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_throughput,
    bench_claim_latency,
    bench_drain_with_concurrent_workers
);
criterion_main!(benches);
