use std::sync::Arc;

use anyhow::Context;

use kitqueue_core::SystemClock;
use kitqueue_infra::config::{Settings, StoreKind};
use kitqueue_infra::jobs::{
    ClaimReaper, HandlerRegistry, InMemoryJobStore, JobExecutor, JobQueue, JobResult, JobStore,
    PostgresJobStore,
};

async fn build_store(settings: &Settings) -> anyhow::Result<Arc<dyn JobStore>> {
    match settings.store.kind {
        StoreKind::Memory => {
            tracing::warn!("using in-memory job store; jobs are lost on exit");
            Ok(InMemoryJobStore::arc())
        }
        StoreKind::Postgres => {
            let url = settings
                .store
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres store")?;
            let store = PostgresJobStore::connect(url, settings.store.max_connections)
                .await
                .context("failed to connect to postgres")?;
            store
                .ensure_schema()
                .await
                .context("failed to apply job schema")?;
            Ok(Arc::new(store))
        }
    }
}

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    // Echoes its payload back as the result.
    registry.register_fn("demo", |job, ctx| async move {
        ctx.emit("demo.echo", serde_json::json!({ "bytes": job.payload.to_string().len() }))
            .await;
        JobResult::success(job.payload)
    });
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kitqueue_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let store = build_store(&settings).await?;
    let queue = JobQueue::new(store, SystemClock::shared(), settings.queue.clone());

    let executor = JobExecutor::new(queue.clone(), registry()).spawn(settings.executor.clone());
    let reaper = ClaimReaper::new(queue, settings.reaper.clone()).spawn();

    tracing::info!(
        worker = %settings.executor.worker_id,
        store = ?settings.store.kind,
        "kitqueue worker running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    reaper.shutdown().await;
    let stats = executor.stats();
    executor.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        dead_lettered = stats.jobs_dead_lettered,
        outcome_errors = stats.outcome_errors,
        "kitqueue worker stopped"
    );
    Ok(())
}
