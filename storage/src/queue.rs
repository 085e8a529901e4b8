// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use shutter_types::{EnqueueOptions, Error, JobPayload};
use std::time::Duration;

/// Broker-level tuning shared by every queue implementation.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub name: String,
    /// Visibility lock held by the processing worker. Must cover the
    /// whole pipeline wall-clock budget.
    pub lock_duration: Duration,
    /// Cadence of the stall sweep.
    pub stalled_interval: Duration,
    /// Re-dispatches granted to a job whose lock expired without
    /// progress before it is handed to the final-failure path.
    pub max_stalled_count: u32,
    /// How long completed job tokens are retained for duplicate
    /// suppression.
    pub completed_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "image-resize".to_string(),
            lock_duration: Duration::from_secs(300),
            stalled_interval: Duration::from_secs(60),
            max_stalled_count: 2,
            completed_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A job leased to one worker slot. Holding the lock token is what
/// authorizes completion and lock extension.
#[derive(Clone, Debug)]
pub struct ActiveJob {
    /// The idempotency token the job was enqueued under.
    pub id: String,
    pub payload: JobPayload,
    /// One-based attempt number of this delivery.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub lock_token: String,
}

/// What the broker decided after a failed delivery.
#[derive(Clone, Debug, PartialEq)]
pub enum FailDisposition {
    /// Rescheduled under exponential backoff.
    Retry { delay: Duration },
    /// All in-cycle attempts are spent; the final-failure hook runs.
    Exhausted,
}

/// A job whose lock expired without progress.
#[derive(Clone, Debug)]
pub struct StalledJob {
    pub id: String,
    pub payload: JobPayload,
    /// True once the stall budget is also spent; such a job is not
    /// re-dispatched and goes to the final-failure path instead.
    pub exhausted: bool,
}

/// Durable at-least-once work queue with visibility locks, retry
/// with backoff, stall detection and delete-on-success.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns false when the token was suppressed as a duplicate
    /// (job still live, or completed inside the retention window).
    async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<bool, Error>;

    /// Leases the next ready job, waiting up to `wait` for one.
    async fn dequeue(&self, wait: Duration) -> Result<Option<ActiveJob>, Error>;

    /// Heartbeat. No-op if the caller no longer holds the lock.
    async fn extend_lock(&self, job: &ActiveJob) -> Result<(), Error>;

    async fn complete(&self, job: &ActiveJob) -> Result<(), Error>;

    /// `retriable = false` short-circuits the remaining attempts:
    /// the job is dropped and the disposition is `Exhausted`. Used
    /// for failures no retry can cure, like a deleted record.
    async fn fail(
        &self,
        job: &ActiveJob,
        reason: &str,
        retriable: bool,
    ) -> Result<FailDisposition, Error>;

    async fn report_progress(&self, job: &ActiveJob, percent: u8) -> Result<(), Error>;

    /// Sweeps the active set for expired locks. Re-dispatches jobs
    /// with stall budget left; returns the rest as exhausted.
    async fn reap_stalled(&self) -> Result<Vec<StalledJob>, Error>;

    /// Periodic housekeeping: promotes delayed jobs whose backoff
    /// has elapsed. The worker runtime calls this on a short cadence.
    async fn maintenance(&self) -> Result<(), Error>;

    async fn ping(&self) -> Result<(), Error>;

    /// Jobs waiting or backing off, for health reporting.
    async fn pending_count(&self) -> Result<u64, Error>;
}

/// Exponential backoff for a delivery that has already been
/// attempted `attempts_made` times.
pub(crate) fn retry_delay(base: Duration, attempts_made: u32) -> Duration {
    base * 2u32.saturating_pow(attempts_made.saturating_sub(1))
}
