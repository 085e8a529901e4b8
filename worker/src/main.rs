// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::Parser;
use shutter_config::ServiceConfig;
use shutter_storage::{
    JobQueue, MongoVariantStore, ObjectStore, QueueConfig, RedisJobQueue, S3ObjectStore,
    VariantStore,
};
use shutter_worker::{monitor, pipeline::ResizePipeline, ResizeWorker};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Parser)]
#[clap(name = "shutter-worker", author, version)]
struct ShutterWorkerArgs {
    /// Overrides WORKER_CONCURRENCY for this process.
    #[clap(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = ShutterWorkerArgs::parse();
    if let Err(err) = run(args).await {
        error!(error = ?err, "worker terminated");
        std::process::exit(1);
    }
}

async fn run(args: ShutterWorkerArgs) -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("loading configuration")?;

    let store: Arc<dyn VariantStore> = Arc::new(
        MongoVariantStore::connect(&config.mongodb_uri, &config.db_name)
            .await
            .context("connecting metadata store")?,
    );
    let objects: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::connect(&config.object_store)
            .await
            .context("connecting object store")?,
    );
    let queue_config = QueueConfig::default();
    let queue: Arc<dyn JobQueue> = Arc::new(
        RedisJobQueue::connect(&config.queue_broker.url(), queue_config.clone())
            .await
            .context("connecting queue broker")?,
    );

    let concurrency = args.concurrency.unwrap_or(config.worker_concurrency);
    let pipeline = ResizePipeline::new(store.clone(), objects.clone());
    let worker = Arc::new(ResizeWorker::new(
        store.clone(),
        queue.clone(),
        pipeline,
        queue_config.clone(),
        concurrency,
    ));

    let stop = worker.stop_flag();
    let monitors = [
        monitor::spawn_broker_monitor(queue.clone(), stop.clone()),
        monitor::spawn_lag_probe(stop.clone()),
        monitor::spawn_stuck_record_monitor(store.clone(), stop),
    ];

    let run_handle = tokio::spawn(worker.clone().run());

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight jobs");
    worker.request_stop();

    // In-flight jobs finish or hit their step timeouts; the lock
    // duration bounds how long either can take.
    let drain_budget = queue_config.lock_duration + Duration::from_secs(30);
    if tokio::time::timeout(drain_budget, run_handle).await.is_err() {
        warn!("drain budget exceeded, exiting anyway");
    }
    for monitor in monitors {
        monitor.abort();
    }
    info!("worker shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
