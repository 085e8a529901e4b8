// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::render::{render_variant, sniff_content_type};
use shutter_storage::{ActiveJob, JobQueue, ObjectStore, VariantStore, IMMUTABLE_CACHE_CONTROL};
use shutter_types::{Error, VariantStatus};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Wall-clock budget per pipeline step. Breaching a budget fails the
/// step; the queue decides whether the attempt is retried.
#[derive(Clone, Debug)]
pub struct StepTimeouts {
    pub connectivity: Duration,
    pub existence: Duration,
    pub mark_processing: Duration,
    pub download: Duration,
    pub render: Duration,
    pub upload: Duration,
    pub mark_ready: Duration,
    /// Best-effort failure annotation after a step breaks.
    pub fail_annotation: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            connectivity: Duration::from_secs(10),
            existence: Duration::from_secs(15),
            mark_processing: Duration::from_secs(15),
            download: Duration::from_secs(120),
            render: Duration::from_secs(60),
            upload: Duration::from_secs(120),
            mark_ready: Duration::from_secs(15),
            fail_annotation: Duration::from_secs(10),
        }
    }
}

/// Which collaborator a step spends its time in. The completion
/// summary breaks wall-clock down across these lanes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lane {
    Store,
    Objects,
    Render,
}

#[derive(Default)]
struct StepTimings {
    entries: Vec<(&'static str, Lane, Duration)>,
}

impl StepTimings {
    fn record(&mut self, name: &'static str, lane: Lane, elapsed: Duration) {
        self.entries.push((name, lane, elapsed));
    }

    fn lane_millis(&self, lane: Lane) -> u128 {
        self.entries
            .iter()
            .filter(|(_, l, _)| *l == lane)
            .map(|(_, _, d)| d.as_millis())
            .sum()
    }

    fn total_millis(&self) -> u128 {
        self.entries.iter().map(|(_, _, d)| d.as_millis()).sum()
    }
}

async fn step<T, F>(
    name: &'static str,
    budget: Duration,
    lane: Lane,
    timings: &mut StepTimings,
    operation: F,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    let started = Instant::now();
    let outcome = timeout(budget, operation).await;
    timings.record(name, lane, started.elapsed());
    match outcome {
        Err(_) => Err(Error::timeout(name, budget)),
        Ok(result) => result,
    }
}

/// One job, queued to ready. Every step is timed and budgeted; any
/// failure is annotated onto the record best-effort and then
/// re-raised so the queue applies its retry policy.
pub struct ResizePipeline {
    store: Arc<dyn VariantStore>,
    objects: Arc<dyn ObjectStore>,
    timeouts: StepTimeouts,
}

impl ResizePipeline {
    pub fn new(store: Arc<dyn VariantStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self::with_timeouts(store, objects, StepTimeouts::default())
    }

    pub fn with_timeouts(
        store: Arc<dyn VariantStore>,
        objects: Arc<dyn ObjectStore>,
        timeouts: StepTimeouts,
    ) -> Self {
        Self {
            store,
            objects,
            timeouts,
        }
    }

    pub async fn execute(&self, job: &ActiveJob, queue: &dyn JobQueue) -> Result<(), Error> {
        match self.run(job, queue).await {
            Ok(timings) => {
                let total = timings.total_millis().max(1);
                info!(
                    job_id = job.id.as_str(),
                    attempt = job.attempts_made,
                    total_ms = timings.total_millis() as u64,
                    store_pct = (timings.lane_millis(Lane::Store) * 100 / total) as u64,
                    objects_pct = (timings.lane_millis(Lane::Objects) * 100 / total) as u64,
                    render_pct = (timings.lane_millis(Lane::Render) * 100 / total) as u64,
                    "variant rendered"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    job_id = job.id.as_str(),
                    attempt = job.attempts_made,
                    error = %err,
                    "pipeline attempt failed"
                );
                self.annotate_failure(&job.payload.record_id, &err).await;
                Err(err)
            }
        }
    }

    async fn run(&self, job: &ActiveJob, queue: &dyn JobQueue) -> Result<StepTimings, Error> {
        let payload = &job.payload;
        let timeouts = &self.timeouts;
        let mut timings = StepTimings::default();

        step(
            "ensure-store",
            timeouts.connectivity,
            Lane::Store,
            &mut timings,
            self.store.ping(),
        )
        .await?;
        self.progress(queue, job, 5).await;

        let record = step(
            "load-record",
            timeouts.existence,
            Lane::Store,
            &mut timings,
            self.store.find_by_id(&payload.record_id),
        )
        .await?
        .ok_or_else(|| Error::RecordMissing(payload.record_id.clone()))?;
        self.progress(queue, job, 10).await;

        // At-least-once delivery: a redelivered job whose record is
        // already ready has nothing left to do, and ready is
        // terminal.
        if record.status == VariantStatus::Ready {
            info!(
                record_id = record.id.as_str(),
                "record already ready, acknowledging duplicate delivery"
            );
            self.progress(queue, job, 100).await;
            return Ok(timings);
        }

        step(
            "mark-processing",
            timeouts.mark_processing,
            Lane::Store,
            &mut timings,
            self.store.mark_processing(&record.id),
        )
        .await?
        .ok_or_else(|| Error::RecordMissing(record.id.clone()))?;
        self.progress(queue, job, 20).await;

        let original = match step(
            "download",
            timeouts.download,
            Lane::Objects,
            &mut timings,
            self.objects.get(&payload.original_key),
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(Error::NotFound(msg)) | Err(Error::TransientStore(msg)) => {
                return Err(Error::SourceUnavailable(msg))
            }
            Err(other) => return Err(other),
        };
        if original.is_empty() {
            return Err(Error::SourceUnavailable(format!(
                "empty body for {}",
                payload.original_key
            )));
        }
        self.progress(queue, job, 50).await;

        let rendered = step(
            "render",
            timeouts.render,
            Lane::Render,
            &mut timings,
            render_variant(original, payload.width, payload.height, payload.format),
        )
        .await?;
        self.progress(queue, job, 75).await;

        let content_type = sniff_content_type(&rendered, payload.format);
        let file_size = rendered.len() as u64;
        match step(
            "upload",
            timeouts.upload,
            Lane::Objects,
            &mut timings,
            self.objects.put(
                &payload.variant_key,
                rendered,
                content_type,
                IMMUTABLE_CACHE_CONTROL,
            ),
        )
        .await
        {
            Ok(()) => {}
            Err(err @ Error::Timeout { .. }) | Err(err @ Error::Upload(_)) => return Err(err),
            Err(other) => return Err(Error::Upload(other.to_string())),
        }
        self.progress(queue, job, 90).await;

        step(
            "mark-ready",
            timeouts.mark_ready,
            Lane::Store,
            &mut timings,
            self.store.mark_ready(&record.id, file_size),
        )
        .await?
        .ok_or_else(|| Error::RecordMissing(record.id.clone()))?;
        self.progress(queue, job, 100).await;

        Ok(timings)
    }

    /// Progress is advisory; a dropped report never fails the job.
    async fn progress(&self, queue: &dyn JobQueue, job: &ActiveJob, percent: u8) {
        if let Err(err) = queue.report_progress(job, percent).await {
            debug!(job_id = job.id.as_str(), error = %err, "progress report dropped");
        }
    }

    async fn annotate_failure(&self, record_id: &str, cause: &Error) {
        let cause_string = cause.to_string();
        let annotation = self.store.mark_failed(record_id, &cause_string);
        match timeout(self.timeouts.fail_annotation, annotation).await {
            Ok(Ok(Some(_))) => {}
            Ok(Ok(None)) => debug!(record_id, "failure annotation skipped, record gone"),
            Ok(Err(err)) => warn!(record_id, error = %err, "failure annotation did not stick"),
            Err(_) => warn!(record_id, "failure annotation timed out"),
        }
    }
}
