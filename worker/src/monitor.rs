// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! Diagnostic side-loops. None of these affect correctness; they
//! exist to make a misbehaving deployment loud.

use shutter_storage::{JobQueue, VariantStore};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::{
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, warn};

pub const BROKER_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const LAG_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
pub const LAG_WARN_THRESHOLD: Duration = Duration::from_secs(1);
pub const STUCK_SCAN_INTERVAL: Duration = Duration::from_secs(300);
pub const STUCK_THRESHOLD: Duration = Duration::from_secs(600);

/// Pings the job broker periodically and logs queue depth.
pub fn spawn_broker_monitor(
    queue: Arc<dyn JobQueue>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !stop.load(Ordering::Relaxed) {
            match queue.ping().await {
                Ok(()) => match queue.pending_count().await {
                    Ok(pending) => debug!(pending, "job broker healthy"),
                    Err(err) => warn!(error = %err, "job broker depth probe failed"),
                },
                Err(err) => warn!(error = %err, "job broker unreachable"),
            }
            sleep(BROKER_PING_INTERVAL).await;
        }
    })
}

/// Samples scheduler latency: sleeps for a fixed interval and warns
/// when the wakeup arrives notably late. A late wakeup means some
/// task is hogging the executor, usually rendering that escaped the
/// blocking pool.
pub fn spawn_lag_probe(stop: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !stop.load(Ordering::Relaxed) {
            let before = Instant::now();
            sleep(LAG_SAMPLE_INTERVAL).await;
            let lag = before.elapsed().saturating_sub(LAG_SAMPLE_INTERVAL);
            if lag > LAG_WARN_THRESHOLD {
                warn!(lag_ms = lag.as_millis() as u64, "scheduler lag detected");
            }
        }
    })
}

/// Flags records sitting in `processing` far longer than the
/// pipeline budget allows. They self-heal through stall detection;
/// the log line is for the operator watching retry tuning.
pub fn spawn_stuck_record_monitor(
    store: Arc<dyn VariantStore>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !stop.load(Ordering::Relaxed) {
            sleep(STUCK_SCAN_INTERVAL).await;
            match store.find_stuck(STUCK_THRESHOLD).await {
                Ok(stuck) if !stuck.is_empty() => {
                    for record in &stuck {
                        warn!(
                            record_id = record.id.as_str(),
                            variant_key = record.variant_key.as_str(),
                            "record stuck in processing"
                        );
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "stuck record scan failed"),
            }
        }
    })
}
