// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::{
    pipeline::ResizePipeline,
    requeue::{run_requeue_policy, RequeueOutcome},
};
use futures::future::join_all;
use shutter_storage::{ActiveJob, FailDisposition, JobQueue, QueueConfig, StalledJob, VariantStore};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const DEQUEUE_WAIT: Duration = Duration::from_secs(1);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// The queue consumer. Runs N concurrent dequeue/pipeline slots plus
/// the housekeeping loops (delayed-job promotion and stall sweeps).
/// Multiple worker processes may run side by side; correctness rests
/// on the store's conditional updates and the queue's locks, not on
/// anything process-local.
pub struct ResizeWorker {
    store: Arc<dyn VariantStore>,
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<ResizePipeline>,
    queue_config: QueueConfig,
    concurrency: usize,
    stop: Arc<AtomicBool>,
}

impl ResizeWorker {
    pub fn new(
        store: Arc<dyn VariantStore>,
        queue: Arc<dyn JobQueue>,
        pipeline: ResizePipeline,
        queue_config: QueueConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            queue,
            pipeline: Arc::new(pipeline),
            queue_config,
            concurrency,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative shutdown: slots stop pulling new jobs and drain
    /// whatever they hold; `run` returns once every loop has exited.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run(self: Arc<Self>) {
        info!(concurrency = self.concurrency, "resize worker starting");
        let mut tasks = Vec::new();
        for slot in 0..self.concurrency {
            let worker = self.clone();
            tasks.push(tokio::spawn(async move { worker.slot_loop(slot).await }));
        }
        {
            let worker = self.clone();
            tasks.push(tokio::spawn(async move { worker.maintenance_loop().await }));
        }
        {
            let worker = self.clone();
            tasks.push(tokio::spawn(async move { worker.stall_loop().await }));
        }
        join_all(tasks).await;
        info!("resize worker stopped");
    }

    async fn slot_loop(&self, slot: usize) {
        debug!(slot, "worker slot online");
        while !self.stop.load(Ordering::Relaxed) {
            match self.queue.dequeue(DEQUEUE_WAIT).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => continue,
                Err(err) => {
                    warn!(slot, error = %err, "dequeue failed, backing off");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!(slot, "worker slot offline");
    }

    async fn process(&self, job: ActiveJob) {
        let heartbeat = self.spawn_heartbeat(job.clone());
        let result = self.pipeline.execute(&job, self.queue.as_ref()).await;
        heartbeat.abort();

        match result {
            Ok(()) => {
                if let Err(err) = self.queue.complete(&job).await {
                    warn!(job_id = job.id.as_str(), error = %err, "completion ack failed");
                }
            }
            Err(pipeline_err) => {
                let disposition = self
                    .queue
                    .fail(&job, &pipeline_err.to_string(), pipeline_err.is_retriable())
                    .await;
                match disposition {
                    Ok(FailDisposition::Retry { delay }) => {
                        info!(
                            job_id = job.id.as_str(),
                            attempt = job.attempts_made,
                            retry_in_ms = delay.as_millis() as u64,
                            "attempt rescheduled"
                        );
                    }
                    Ok(FailDisposition::Exhausted) => {
                        self.finalize_failure(&job.payload).await;
                    }
                    Err(err) => {
                        error!(job_id = job.id.as_str(), error = %err, "failure ack failed");
                    }
                }
            }
        }
    }

    /// Extends the visibility lock at half its duration for as long
    /// as the job is being processed.
    fn spawn_heartbeat(&self, job: ActiveJob) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = self.queue_config.lock_duration / 2;
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if let Err(err) = queue.extend_lock(&job).await {
                    warn!(job_id = job.id.as_str(), error = %err, "heartbeat failed");
                }
            }
        })
    }

    async fn maintenance_loop(&self) {
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(err) = self.queue.maintenance().await {
                warn!(error = %err, "queue maintenance failed");
            }
            sleep(MAINTENANCE_INTERVAL).await;
        }
    }

    async fn stall_loop(&self) {
        while !self.stop.load(Ordering::Relaxed) {
            sleep(self.queue_config.stalled_interval).await;
            match self.queue.reap_stalled().await {
                Ok(stalled) => {
                    for job in stalled {
                        self.handle_stalled(job).await;
                    }
                }
                Err(err) => warn!(error = %err, "stall sweep failed"),
            }
        }
    }

    pub(crate) async fn handle_stalled(&self, stalled: StalledJob) {
        if !stalled.exhausted {
            // Re-dispatched by the queue; nothing to do here.
            return;
        }
        warn!(
            job_id = stalled.id.as_str(),
            record_id = stalled.payload.record_id.as_str(),
            "job lost its lock past the stall budget"
        );
        if let Err(err) = self
            .store
            .mark_failed(&stalled.payload.record_id, "job stalled: lock expired")
            .await
        {
            warn!(
                record_id = stalled.payload.record_id.as_str(),
                error = %err,
                "could not annotate stalled record"
            );
        }
        self.finalize_failure(&stalled.payload).await;
    }

    async fn finalize_failure(&self, payload: &shutter_types::JobPayload) {
        match run_requeue_policy(self.store.as_ref(), self.queue.as_ref(), payload).await {
            Ok(RequeueOutcome::Requeued { token, cycle }) => {
                debug!(token = token.as_str(), cycle, "fresh cycle admitted");
            }
            Ok(RequeueOutcome::BudgetSpent)
            | Ok(RequeueOutcome::RecordGone)
            | Ok(RequeueOutcome::AlreadyReady) => {}
            Err(err) => {
                error!(
                    record_id = payload.record_id.as_str(),
                    error = %err,
                    "requeue policy failed"
                );
            }
        }
    }
}
