// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::queue::{retry_delay, ActiveJob, FailDisposition, JobQueue, QueueConfig, StalledJob};
use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use shutter_types::{EnqueueOptions, Error, JobPayload};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

// How often an idle dequeue re-polls the wait list.
const DEQUEUE_POLL: Duration = Duration::from_millis(200);

// Admits a job unless its token is still live or was completed
// inside the retention window. KEYS: job hash, wait list, completed
// zset. ARGV: id, payload, attempts, backoff ms, remove flag, now
// ms, retention ms.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
local done = redis.call('ZSCORE', KEYS[3], ARGV[1])
if done and (tonumber(ARGV[6]) - tonumber(done)) < tonumber(ARGV[7]) then
  return 0
end
redis.call('HSET', KEYS[1],
  'payload', ARGV[2],
  'attempts_made', 0,
  'max_attempts', ARGV[3],
  'backoff_ms', ARGV[4],
  'remove_on_complete', ARGV[5],
  'stalled_count', 0)
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

// Moves every due delayed job back onto the wait list. KEYS:
// delayed zset, wait list. ARGV: now ms.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('RPUSH', KEYS[2], id)
end
return #due
"#;

// Leases the next job in one atomic step: pop from wait, push to
// active, bump the attempt counter and take the visibility lock.
// The stall sweep treats an active entry without a lock as stalled,
// so the lock must exist from the instant the id is visible in the
// active list. KEYS: wait list, active list. ARGV: job key prefix,
// lock key prefix, lock token, lock duration ms.
const DEQUEUE_SCRIPT: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if not id then
  return nil
end
redis.call('LPUSH', KEYS[2], id)
local job_key = ARGV[1] .. id
if redis.call('EXISTS', job_key) == 0 then
  redis.call('LREM', KEYS[2], 0, id)
  return nil
end
local attempts = redis.call('HINCRBY', job_key, 'attempts_made', 1)
local payload = redis.call('HGET', job_key, 'payload')
local max_attempts = redis.call('HGET', job_key, 'max_attempts')
redis.call('SET', ARGV[2] .. id, ARGV[3], 'PX', ARGV[4])
return {id, payload, max_attempts, attempts}
"#;

// Extends a lock only while the caller still owns it. KEYS: lock.
// ARGV: token, duration ms.
const EXTEND_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Durable queue on Redis. Jobs wait in a list, move to an active
/// list under a visibility lock while leased, and sit in a delayed
/// zset between retry attempts. Leasing is a single script, so a job
/// is never visible as active without its lock. Completed tokens are
/// retained in a zset for duplicate suppression.
pub struct RedisJobQueue {
    conn: ConnectionManager,
    config: QueueConfig,
    enqueue_script: Script,
    dequeue_script: Script,
    promote_script: Script,
    extend_lock_script: Script,
}

impl RedisJobQueue {
    pub async fn connect(url: &str, config: QueueConfig) -> Result<Self, Error> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::FatalConfig(format!("bad queue broker url: {}", e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::FatalConfig(format!("cannot connect to queue broker: {}", e)))?;
        info!(queue = config.name.as_str(), "queue broker connected");
        Ok(Self {
            conn,
            config,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
            extend_lock_script: Script::new(EXTEND_LOCK_SCRIPT),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("shutter:queue:{}:{}", self.config.name, suffix)
    }

    fn job_key(&self, id: &str) -> String {
        self.key(&format!("job:{}", id))
    }

    fn lock_key(&self, id: &str) -> String {
        self.key(&format!("lock:{}", id))
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(&payload)
            .map_err(|e| Error::TransientStore(format!("encode job payload: {}", e)))?;
        let admitted: i64 = self
            .enqueue_script
            .key(self.job_key(&options.job_id))
            .key(self.key("wait"))
            .key(self.key("completed"))
            .arg(&options.job_id)
            .arg(body)
            .arg(options.attempts)
            .arg(options.backoff_base.as_millis() as u64)
            .arg(options.remove_on_complete as u8)
            .arg(Self::now_millis())
            .arg(self.config.completed_retention.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(broker)?;
        if admitted == 0 {
            debug!(job_id = options.job_id.as_str(), "duplicate job suppressed");
        }
        Ok(admitted == 1)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<ActiveJob>, Error> {
        let deadline = Instant::now() + wait;
        loop {
            let mut conn = self.conn.clone();
            let lock_token = Uuid::new_v4().to_string();
            let leased: Option<(String, String, u32, u32)> = self
                .dequeue_script
                .key(self.key("wait"))
                .key(self.key("active"))
                .arg(self.key("job:"))
                .arg(self.key("lock:"))
                .arg(&lock_token)
                .arg(self.config.lock_duration.as_millis() as u64)
                .invoke_async(&mut conn)
                .await
                .map_err(broker)?;

            if let Some((id, payload, max_attempts, attempts_made)) = leased {
                let payload: JobPayload = serde_json::from_str(&payload)
                    .map_err(|e| Error::TransientStore(format!("decode job payload: {}", e)))?;
                return Ok(Some(ActiveJob {
                    id,
                    payload,
                    attempts_made,
                    max_attempts,
                    lock_token,
                }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(DEQUEUE_POLL).await;
        }
    }

    async fn extend_lock(&self, job: &ActiveJob) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_lock_script
            .key(self.lock_key(&job.id))
            .arg(&job.lock_token)
            .arg(self.config.lock_duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(broker)?;
        if extended == 0 {
            warn!(job_id = job.id.as_str(), "lock lost before heartbeat");
        }
        Ok(())
    }

    async fn complete(&self, job: &ActiveJob) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let now = Self::now_millis();
        let horizon = now - self.config.completed_retention.as_millis() as i64;
        let remove: Option<u8> = conn
            .hget(self.job_key(&job.id), "remove_on_complete")
            .await
            .map_err(broker)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.key("active"), 0, &job.id)
            .ignore()
            .del(self.lock_key(&job.id))
            .ignore()
            .zadd(self.key("completed"), &job.id, now)
            .ignore()
            .zrembyscore(self.key("completed"), "-inf", horizon)
            .ignore();
        if remove.unwrap_or(1) == 1 {
            pipe.del(self.job_key(&job.id)).ignore();
        } else {
            pipe.pexpire(
                self.job_key(&job.id),
                self.config.completed_retention.as_millis() as i64,
            )
            .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(broker)?;
        Ok(())
    }

    async fn fail(
        &self,
        job: &ActiveJob,
        reason: &str,
        retriable: bool,
    ) -> Result<FailDisposition, Error> {
        let mut conn = self.conn.clone();
        let job_key = self.job_key(&job.id);
        let _: () = conn
            .lrem(self.key("active"), 0, &job.id)
            .await
            .map_err(broker)?;
        let _: () = conn.del(self.lock_key(&job.id)).await.map_err(broker)?;
        let _: () = conn
            .hset(&job_key, "last_error", reason)
            .await
            .map_err(broker)?;

        if retriable && job.attempts_made < job.max_attempts {
            let backoff_ms: u64 = conn
                .hget(&job_key, "backoff_ms")
                .await
                .map_err(broker)
                .map(|v: Option<u64>| v.unwrap_or(2000))?;
            let delay = retry_delay(Duration::from_millis(backoff_ms), job.attempts_made);
            let promote_at = Self::now_millis() + delay.as_millis() as i64;
            let _: () = conn
                .zadd(self.key("delayed"), &job.id, promote_at)
                .await
                .map_err(broker)?;
            Ok(FailDisposition::Retry { delay })
        } else {
            let _: () = conn.del(&job_key).await.map_err(broker)?;
            Ok(FailDisposition::Exhausted)
        }
    }

    async fn report_progress(&self, job: &ActiveJob, percent: u8) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.job_key(&job.id), "progress", percent)
            .await
            .map_err(broker)?;
        Ok(())
    }

    async fn reap_stalled(&self) -> Result<Vec<StalledJob>, Error> {
        let mut conn = self.conn.clone();
        let active: Vec<String> = conn
            .lrange(self.key("active"), 0, -1)
            .await
            .map_err(broker)?;
        let mut stalled = Vec::new();
        for id in active {
            // The lease script creates the lock in the same atomic
            // step that activates the job, so a missing lock can
            // only mean it expired without progress.
            let locked: bool = conn.exists(self.lock_key(&id)).await.map_err(broker)?;
            if locked {
                continue;
            }
            let job_key = self.job_key(&id);
            let _: () = conn.lrem(self.key("active"), 0, &id).await.map_err(broker)?;
            let payload: Option<String> = conn.hget(&job_key, "payload").await.map_err(broker)?;
            let payload = match payload.map(|p| serde_json::from_str::<JobPayload>(&p)) {
                Some(Ok(payload)) => payload,
                _ => continue,
            };
            let stalled_count: u32 = conn
                .hincr(&job_key, "stalled_count", 1)
                .await
                .map_err(broker)?;
            if stalled_count > self.config.max_stalled_count {
                let _: () = conn.del(&job_key).await.map_err(broker)?;
                warn!(job_id = id.as_str(), "job exceeded stall budget");
                stalled.push(StalledJob {
                    id,
                    payload,
                    exhausted: true,
                });
            } else {
                let _: () = conn.lpush(self.key("wait"), &id).await.map_err(broker)?;
                warn!(job_id = id.as_str(), stalled_count, "stalled job re-dispatched");
                stalled.push(StalledJob {
                    id,
                    payload,
                    exhausted: false,
                });
            }
        }
        Ok(stalled)
    }

    async fn maintenance(&self) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let promoted: i64 = self
            .promote_script
            .key(self.key("delayed"))
            .key(self.key("wait"))
            .arg(Self::now_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(broker)?;
        if promoted > 0 {
            debug!(promoted, "delayed jobs promoted");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(broker)?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        let waiting: u64 = conn.llen(self.key("wait")).await.map_err(broker)?;
        let delayed: u64 = conn.zcard(self.key("delayed")).await.map_err(broker)?;
        Ok(waiting + delayed)
    }
}

fn broker(err: redis::RedisError) -> Error {
    Error::TransientStore(format!("queue broker: {}", err))
}
