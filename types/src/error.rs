// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// This is the error type shared across the resolver, the worker and
/// the storage adapters. The HTTP edge maps read-path variants onto
/// status codes; the worker and queue decide retry disposition from
/// [`Error::is_retriable`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request parameters failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The request path is not allowed to be served.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The referenced image or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A concurrent writer created the record first. The resolver
    /// swallows this and re-reads; it never reaches a client.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The original asset could not be fetched from the object store.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A pipeline step breached its wall-clock budget.
    #[error("{step} timed out after {}s", .timeout.as_secs())]
    Timeout {
        step: &'static str,
        timeout: Duration,
    },

    /// Decoding, resizing or re-encoding the image failed.
    #[error("render failed: {0}")]
    Render(String),

    /// Writing the rendition to the object store failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// The variant record disappeared mid-pipeline. Retrying cannot
    /// succeed without a record, so this is terminal for the job.
    #[error("variant record missing: {0}")]
    RecordMissing(String),

    /// A store call failed in a way that a later attempt may recover.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Startup configuration is unusable. The process exits with 1.
    #[error("fatal config error: {0}")]
    FatalConfig(String),
}

impl Error {
    /// Whether the queue should reschedule a job that failed with
    /// this error.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable(_)
                | Error::Timeout { .. }
                | Error::Render(_)
                | Error::Upload(_)
                | Error::TransientStore(_)
        )
    }

    pub fn timeout(step: &'static str, timeout: Duration) -> Self {
        Error::Timeout { step, timeout }
    }
}
