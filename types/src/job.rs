// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::record::{ImageFormat, VariantRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What travels through the queue. Everything the worker needs to
/// run the pipeline without a second resolver round-trip; the record
/// id ties the job back to its metadata row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub image_id: String,
    pub width: u32,
    pub height: u32,
    pub original_key: String,
    pub variant_key: String,
    pub record_id: String,
    pub format: ImageFormat,
}

impl JobPayload {
    pub fn for_record(record: &VariantRecord) -> Self {
        Self {
            image_id: record.image_id.clone(),
            width: record.width,
            height: record.height,
            original_key: record.original_key.clone(),
            variant_key: record.variant_key.clone(),
            record_id: record.id.clone(),
            format: record.format,
        }
    }

    /// Idempotency token:
    /// `{imageId}_{W}x{H}.{format}.{recordId}.{unixMillis}`.
    ///
    /// The trailing timestamp lets the requeue policy deliberately
    /// re-enqueue a quadruple whose previous token is still inside
    /// the broker's completed-job retention window; the broker only
    /// rejects exact duplicates.
    pub fn token(&self) -> String {
        self.token_at(Utc::now().timestamp_millis())
    }

    pub fn token_at(&self, unix_millis: i64) -> String {
        format!(
            "{}_{}x{}.{}.{}.{}",
            self.image_id, self.width, self.height, self.format, self.record_id, unix_millis
        )
    }
}

/// Per-enqueue knobs, mirroring what the broker supports.
#[derive(Clone, Debug)]
pub struct EnqueueOptions {
    /// In-cycle delivery attempts before the job is exhausted.
    pub attempts: u32,
    /// Base delay of the exponential backoff between attempts.
    pub backoff_base: Duration,
    /// Idempotency token; duplicate tokens are suppressed.
    pub job_id: String,
    pub remove_on_complete: bool,
}

impl EnqueueOptions {
    pub fn with_job_id(job_id: String) -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(2),
            job_id,
            remove_on_complete: true,
        }
    }

    /// The options every resize enqueue uses: three attempts under a
    /// five-second exponential base, delete on success.
    pub fn resize(job_id: String) -> Self {
        Self::with_job_id(job_id).backoff_base(Duration::from_secs(5))
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }
}
