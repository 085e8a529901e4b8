// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::queue::{retry_delay, ActiveJob, FailDisposition, JobQueue, QueueConfig, StalledJob};
use async_trait::async_trait;
use shutter_types::{EnqueueOptions, Error, JobPayload};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

const DEQUEUE_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Debug)]
struct JobState {
    payload: JobPayload,
    attempts_made: u32,
    max_attempts: u32,
    backoff_base: Duration,
    remove_on_complete: bool,
    stalled_count: u32,
    progress: Vec<u8>,
    last_error: Option<String>,
}

#[derive(Clone, Debug)]
struct Lease {
    lock_token: String,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, JobState>,
    wait: VecDeque<String>,
    delayed: Vec<(Instant, String)>,
    active: HashMap<String, Lease>,
    completed: HashMap<String, Instant>,
}

/// Queue broker held in memory, with the production contract intact:
/// token dedup within the completed-retention window, visibility
/// locks, exponential backoff between attempts and a bounded stall
/// budget. Uses the tokio clock throughout so paused-time tests run
/// instantly.
pub struct InMemoryJobQueue {
    config: QueueConfig,
    state: Mutex<State>,
    admitted: AtomicU64,
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            admitted: AtomicU64::new(0),
        }
    }

    /// Total jobs ever admitted (duplicates excluded).
    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn live_job_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").jobs.len()
    }

    /// Progress milestones reported so far for a job.
    pub fn progress_history(&self, job_id: &str) -> Vec<u8> {
        self.state
            .lock()
            .expect("lock poisoned")
            .jobs
            .get(job_id)
            .map(|job| job.progress.clone())
            .unwrap_or_default()
    }

    /// Expires a lease immediately, simulating a worker that died
    /// mid-job. The next stall sweep picks it up.
    pub fn expire_lock(&self, job_id: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(lease) = state.active.get_mut(job_id) {
            lease.deadline = Instant::now();
        }
    }

    fn try_dequeue(&self) -> Option<ActiveJob> {
        let mut state = self.state.lock().expect("lock poisoned");
        let id = state.wait.pop_front()?;
        let lock_token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.config.lock_duration;
        let job = state.jobs.get_mut(&id)?;
        job.attempts_made += 1;
        let active_job = ActiveJob {
            id: id.clone(),
            payload: job.payload.clone(),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            lock_token: lock_token.clone(),
        };
        state.active.insert(
            id,
            Lease {
                lock_token,
                deadline,
            },
        );
        Some(active_job)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<bool, Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.jobs.contains_key(&options.job_id) {
            return Ok(false);
        }
        let retention = self.config.completed_retention;
        if let Some(completed_at) = state.completed.get(&options.job_id) {
            if completed_at.elapsed() < retention {
                return Ok(false);
            }
            state.completed.remove(&options.job_id);
        }
        state.jobs.insert(
            options.job_id.clone(),
            JobState {
                payload,
                attempts_made: 0,
                max_attempts: options.attempts,
                backoff_base: options.backoff_base,
                remove_on_complete: options.remove_on_complete,
                stalled_count: 0,
                progress: Vec::new(),
                last_error: None,
            },
        );
        state.wait.push_back(options.job_id);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<ActiveJob>, Error> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.try_dequeue() {
                return Ok(Some(job));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(DEQUEUE_POLL).await;
        }
    }

    async fn extend_lock(&self, job: &ActiveJob) -> Result<(), Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(lease) = state.active.get_mut(&job.id) {
            if lease.lock_token == job.lock_token {
                lease.deadline = Instant::now() + self.config.lock_duration;
            }
        }
        Ok(())
    }

    async fn complete(&self, job: &ActiveJob) -> Result<(), Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.active.remove(&job.id);
        state.completed.insert(job.id.clone(), Instant::now());
        if let Some(stored) = state.jobs.get(&job.id) {
            if stored.remove_on_complete {
                state.jobs.remove(&job.id);
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        job: &ActiveJob,
        reason: &str,
        retriable: bool,
    ) -> Result<FailDisposition, Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.active.remove(&job.id);
        let stored = match state.jobs.get_mut(&job.id) {
            Some(stored) => stored,
            None => return Ok(FailDisposition::Exhausted),
        };
        stored.last_error = Some(reason.to_string());
        if !retriable {
            state.jobs.remove(&job.id);
            return Ok(FailDisposition::Exhausted);
        }
        if stored.attempts_made < stored.max_attempts {
            let delay = retry_delay(stored.backoff_base, stored.attempts_made);
            state
                .delayed
                .push((Instant::now() + delay, job.id.clone()));
            Ok(FailDisposition::Retry { delay })
        } else {
            state.jobs.remove(&job.id);
            Ok(FailDisposition::Exhausted)
        }
    }

    async fn report_progress(&self, job: &ActiveJob, percent: u8) -> Result<(), Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(stored) = state.jobs.get_mut(&job.id) {
            stored.progress.push(percent);
        }
        Ok(())
    }

    async fn reap_stalled(&self) -> Result<Vec<StalledJob>, Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        let now = Instant::now();
        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut stalled = Vec::new();
        for id in expired {
            state.active.remove(&id);
            let max_stalled = self.config.max_stalled_count;
            let (payload, exhausted) = match state.jobs.get_mut(&id) {
                None => continue,
                Some(job) => {
                    job.stalled_count += 1;
                    (job.payload.clone(), job.stalled_count > max_stalled)
                }
            };
            if exhausted {
                state.jobs.remove(&id);
            } else {
                state.wait.push_front(id.clone());
            }
            stalled.push(StalledJob {
                id,
                payload,
                exhausted,
            });
        }
        Ok(stalled)
    }

    async fn maintenance(&self) -> Result<(), Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        let now = Instant::now();
        let mut still_delayed = Vec::new();
        let delayed = std::mem::take(&mut state.delayed);
        for (promote_at, id) in delayed {
            if promote_at <= now {
                state.wait.push_back(id);
            } else {
                still_delayed.push((promote_at, id));
            }
        }
        state.delayed = still_delayed;
        Ok(())
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, Error> {
        let state = self.state.lock().expect("lock poisoned");
        Ok((state.wait.len() + state.delayed.len()) as u64)
    }
}
