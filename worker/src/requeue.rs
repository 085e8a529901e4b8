// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use shutter_storage::{JobQueue, VariantStore};
use shutter_types::{EnqueueOptions, Error, JobPayload, VariantStatus, MAX_REQUEUES};
use tracing::{info, warn};

/// What the final-failure hook decided for an exhausted job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequeueOutcome {
    /// A fresh cycle was started under a new token.
    Requeued { token: String, cycle: u32 },
    /// The requeue budget is spent; the record stays failed.
    BudgetSpent,
    /// The record no longer exists, nothing to retry for.
    RecordGone,
    /// Another delivery finished the rendition in the meantime.
    AlreadyReady,
}

/// Runs after a job exhausts its in-cycle attempts (or its stall
/// budget). The per-cycle attempt counter resets with the fresh job,
/// so this outer counter is what bounds the total work a single
/// rendition may trigger.
pub async fn run_requeue_policy(
    store: &dyn VariantStore,
    queue: &dyn JobQueue,
    payload: &JobPayload,
) -> Result<RequeueOutcome, Error> {
    let record = match store.find_by_id(&payload.record_id).await? {
        Some(record) => record,
        None => {
            info!(record_id = payload.record_id.as_str(), "exhausted job had no record");
            return Ok(RequeueOutcome::RecordGone);
        }
    };

    if record.status == VariantStatus::Ready {
        info!(
            record_id = record.id.as_str(),
            "record already ready, no requeue"
        );
        return Ok(RequeueOutcome::AlreadyReady);
    }

    if record.requeue_count >= MAX_REQUEUES {
        warn!(
            record_id = record.id.as_str(),
            variant_key = record.variant_key.as_str(),
            requeue_count = record.requeue_count,
            "requeue budget spent, rendition stays failed"
        );
        return Ok(RequeueOutcome::BudgetSpent);
    }

    // Enqueue first, then flip the record back to queued. The brief
    // window with a live job and a still-failed record is harmless:
    // the pipeline marks processing by id, not by status.
    let fresh = JobPayload::for_record(&record);
    let token = fresh.token();
    queue
        .enqueue(fresh, EnqueueOptions::resize(token.clone()))
        .await?;

    match store.requeue(&record.id).await? {
        Some(requeued) => {
            info!(
                record_id = requeued.id.as_str(),
                variant_key = requeued.variant_key.as_str(),
                cycle = requeued.requeue_count,
                "rendition requeued for another cycle"
            );
            Ok(RequeueOutcome::Requeued {
                token,
                cycle: requeued.requeue_count,
            })
        }
        // Lost a race with a delete or a concurrent requeue; the
        // enqueued job will settle it either way.
        None => Ok(RequeueOutcome::RecordGone),
    }
}
