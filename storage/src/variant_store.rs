// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use shutter_types::{Error, ImageFormat, NewVariantRecord, VariantKey, VariantRecord};
use std::time::Duration;

/// Filter for the delete path: image id always present, the other
/// axes optional. A bare image id matches every variant of it.
#[derive(Clone, Debug)]
pub struct VariantSelector {
    pub image_id: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<ImageFormat>,
}

impl VariantSelector {
    pub fn image(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            width: None,
            height: None,
            format: None,
        }
    }

    pub fn width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    pub fn format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn matches(&self, record: &VariantRecord) -> bool {
        record.image_id == self.image_id
            && self.width.map_or(true, |w| record.width == w)
            && self.height.map_or(true, |h| record.height == h)
            && self.format.map_or(true, |f| record.format == f)
    }
}

/// Repository over the `image_variants` collection. The unique index
/// on `(imageId, width, height, format)` is the arbiter of
/// deduplication between resolver and worker: the status-mutating
/// operations are conditional updates that return the new document,
/// or `None` when the record no longer exists.
#[async_trait]
pub trait VariantStore: Send + Sync {
    /// Connectivity check; the worker refuses to start a pipeline
    /// run against a store it cannot reach.
    async fn ping(&self) -> Result<(), Error>;

    /// Inserts a fresh `queued` record. A concurrent insert of the
    /// same quadruple loses with `Conflict`.
    async fn insert(&self, new: NewVariantRecord) -> Result<VariantRecord, Error>;

    async fn find_by_key(&self, key: &VariantKey) -> Result<Option<VariantRecord>, Error>;

    async fn find_by_id(&self, id: &str) -> Result<Option<VariantRecord>, Error>;

    async fn mark_processing(&self, id: &str) -> Result<Option<VariantRecord>, Error>;

    async fn mark_ready(&self, id: &str, file_size: u64) -> Result<Option<VariantRecord>, Error>;

    async fn mark_failed(&self, id: &str, reason: &str) -> Result<Option<VariantRecord>, Error>;

    /// Resets a failed record for another cycle: status `queued`,
    /// failure fields cleared, requeue counter incremented. Refuses
    /// (returns `None`) once the requeue budget is spent, so the
    /// counter can never pass its bound.
    async fn requeue(&self, id: &str) -> Result<Option<VariantRecord>, Error>;

    async fn delete_by_id(&self, id: &str) -> Result<bool, Error>;

    async fn find_matching(&self, selector: &VariantSelector) -> Result<Vec<VariantRecord>, Error>;

    async fn delete_matching(&self, selector: &VariantSelector) -> Result<u64, Error>;

    /// Records sitting in `processing` longer than `older_than`.
    /// Diagnostic surface for the worker monitor; backed by the
    /// status index.
    async fn find_stuck(&self, older_than: Duration) -> Result<Vec<VariantRecord>, Error>;
}
