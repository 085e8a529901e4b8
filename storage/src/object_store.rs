// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use bytes::Bytes;
use shutter_types::Error;

/// Cache policy stamped on every rendition upload. Variant keys are
/// content-addressed by the request quadruple, so renditions never
/// change under a key and may be cached forever.
pub const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Blob store keyed by string. Originals live under their image id,
/// renditions under the derived variant key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Existence probe without fetching the body.
    async fn head(&self, key: &str) -> Result<bool, Error>;

    /// Fetch the full object. `NotFound` when the key is absent.
    async fn get(&self, key: &str) -> Result<Bytes, Error>;

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        cache_control: &str,
    ) -> Result<(), Error>;

    /// Idempotent: deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Best-effort bulk delete. Partial failure is an error naming
    /// the keys that survived; callers decide whether to proceed.
    async fn delete_batch(&self, keys: &[String]) -> Result<(), Error>;
}
