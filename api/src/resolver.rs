// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use shutter_config::ServiceConfig;
use shutter_storage::{JobQueue, ObjectStore, VariantSelector, VariantStore};
use shutter_types::{
    validate_image_id, EnqueueOptions, Error, ImageFormat, JobPayload, NewVariantRecord,
    VariantKey, VariantStatus,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Rounds the admission loop is willing to lose a duplicate-key race
/// before giving up. Two rounds already cover the force-resize race;
/// a third is slack.
const ADMISSION_ROUNDS: usize = 3;

/// A validated variant request, produced once at the edge so nothing
/// downstream re-parses raw query values.
#[derive(Clone, Debug)]
pub struct VariantRequest {
    pub image_id: String,
    /// Absent means the caller wants the original.
    pub target: Option<RenderTarget>,
    pub force_resize: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

/// Where to send the client, and whether the rendition itself is
/// what they are getting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resolution {
    pub key: String,
    pub serving_original: bool,
}

/// The read path. Decides between serving the cached rendition,
/// serving the original while a render is in flight, and admitting a
/// new render job. Deduplication across concurrent callers rests
/// entirely on the store's unique index; there is no lock here.
pub struct VariantResolver {
    store: Arc<dyn VariantStore>,
    objects: Arc<dyn ObjectStore>,
    queue: Arc<dyn JobQueue>,
    bucket: String,
    public_base: Url,
}

impl VariantResolver {
    pub fn new(
        store: Arc<dyn VariantStore>,
        objects: Arc<dyn ObjectStore>,
        queue: Arc<dyn JobQueue>,
        config: &ServiceConfig,
    ) -> Result<Self, Error> {
        let public_base = Url::parse(&config.object_store.public_url)
            .map_err(|e| Error::FatalConfig(format!("S3_PUBLIC_URL is not a URL: {}", e)))?;
        if public_base.cannot_be_a_base() {
            return Err(Error::FatalConfig(
                "S3_PUBLIC_URL cannot carry path segments".to_string(),
            ));
        }
        Ok(Self {
            store,
            objects,
            queue,
            bucket: config.object_store.bucket.clone(),
            public_base,
        })
    }

    pub async fn resolve_variant(&self, request: &VariantRequest) -> Result<Resolution, Error> {
        validate_image_id(&request.image_id)?;

        let target = match request.target {
            Some(target) => target,
            // No target box: just confirm the original exists.
            None => {
                self.require_original(&request.image_id).await?;
                return Ok(Resolution {
                    key: request.image_id.clone(),
                    serving_original: true,
                });
            }
        };

        let key = VariantKey::new(
            request.image_id.clone(),
            target.width,
            target.height,
            target.format,
        )?;
        if request.force_resize {
            self.displace(&key).await;
        }

        for round in 0..ADMISSION_ROUNDS {
            match self.store.find_by_key(&key).await? {
                Some(record) => match record.status {
                    VariantStatus::Ready => {
                        return Ok(Resolution {
                            key: record.variant_key,
                            serving_original: false,
                        })
                    }
                    VariantStatus::Queued | VariantStatus::Processing => {
                        return Ok(Resolution {
                            key: record.original_key,
                            serving_original: true,
                        })
                    }
                    // A failed record is displaced so the new cycle
                    // starts with a clean lifetime.
                    VariantStatus::Failed => {
                        self.store.delete_by_id(&record.id).await?;
                    }
                },
                None => {}
            }

            self.require_original(&key.image_id).await?;
            match self
                .store
                .insert(NewVariantRecord::new(key.clone(), self.bucket.clone()))
                .await
            {
                Ok(record) => {
                    let payload = JobPayload::for_record(&record);
                    let token = payload.token();
                    let admitted = self
                        .queue
                        .enqueue(payload, EnqueueOptions::resize(token.clone()))
                        .await?;
                    info!(
                        variant_key = record.variant_key.as_str(),
                        token = token.as_str(),
                        admitted,
                        "render admitted"
                    );
                    return Ok(Resolution {
                        key: record.original_key,
                        serving_original: true,
                    });
                }
                // Lost the race; the winner's record is there now.
                Err(Error::Conflict(_)) => {
                    debug!(
                        variant_key = key.variant_key().as_str(),
                        round, "admission race lost, re-reading"
                    );
                }
                Err(other) => return Err(other),
            }
        }

        Err(Error::Conflict(format!(
            "admission kept racing for {}",
            key.variant_key()
        )))
    }

    /// Best-effort removal of an existing rendition so the next
    /// admission re-renders. Failures are logged, never fatal.
    async fn displace(&self, key: &VariantKey) {
        match self.store.find_by_key(key).await {
            Ok(Some(record)) => {
                if let Err(err) = self.store.delete_by_id(&record.id).await {
                    warn!(record_id = record.id.as_str(), error = %err, "force-resize: record delete failed");
                }
                if let Err(err) = self.objects.delete(&record.variant_key).await {
                    warn!(key = record.variant_key.as_str(), error = %err, "force-resize: object delete failed");
                }
            }
            Ok(None) => {
                // No record, but a stray rendition may still exist.
                if let Err(err) = self.objects.delete(&key.variant_key()).await {
                    warn!(key = key.variant_key().as_str(), error = %err, "force-resize: object delete failed");
                }
            }
            Err(err) => {
                warn!(error = %err, "force-resize: record lookup failed");
            }
        }
    }

    /// Removes every variant matching the selector: renditions from
    /// the object store first, then the records. If the batch delete
    /// leaves objects behind the records are kept too, so a retry
    /// can finish the job.
    pub async fn delete_image(&self, selector: &VariantSelector) -> Result<u64, Error> {
        validate_image_id(&selector.image_id)?;
        let records = self.store.find_matching(selector).await?;
        if records.is_empty() {
            return Err(Error::NotFound(format!(
                "no variants for {}",
                selector.image_id
            )));
        }

        let keys: Vec<String> = records
            .iter()
            .map(|record| record.variant_key.clone())
            .collect();
        self.objects.delete_batch(&keys).await.map_err(|err| {
            warn!(image_id = selector.image_id.as_str(), error = %err, "variant batch delete incomplete");
            err
        })?;

        let deleted = self.store.delete_matching(selector).await?;
        info!(
            image_id = selector.image_id.as_str(),
            deleted, "variants deleted"
        );
        Ok(deleted)
    }

    /// The original's key, if it exists.
    pub async fn get_original(&self, image_id: &str) -> Result<String, Error> {
        validate_image_id(image_id)?;
        self.require_original(image_id).await?;
        Ok(image_id.to_string())
    }

    /// Joins a key onto the public base URL, percent-encoding each
    /// path segment.
    pub fn public_url(&self, key: &str) -> String {
        let mut url = self.public_base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .expect("base checked at construction");
            segments.pop_if_empty();
            for segment in key.split('/') {
                segments.push(segment);
            }
        }
        url.to_string()
    }

    async fn require_original(&self, image_id: &str) -> Result<(), Error> {
        if !self.objects.head(image_id).await? {
            return Err(Error::NotFound("Image not found".to_string()));
        }
        Ok(())
    }
}
