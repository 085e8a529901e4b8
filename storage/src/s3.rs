// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::object_store::ObjectStore;
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier},
    Client,
};
use bytes::Bytes;
use shutter_types::Error;
use tracing::{debug, info};

// DeleteObjects accepts at most this many keys per request.
const DELETE_BATCH_LIMIT: usize = 1000;

/// Production object store backed by S3.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(config: &shutter_config::ObjectStoreConfig) -> Result<Self, Error> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let (Some(key_id), Some(secret)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "shutter-config",
            ));
        }
        let shared = loader.load().await;
        info!(
            bucket = config.bucket.as_str(),
            region = config.region.as_str(),
            "object store client ready"
        );
        Ok(Self {
            client: Client::new(&shared),
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head(&self, key: &str) -> Result<bool, Error> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(Error::TransientStore(format!(
                        "head {}: {}",
                        key, service_err
                    )))
                }
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, Error> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Err(Error::NotFound(format!("object {}", key)));
                }
                return Err(Error::TransientStore(format!("get {}: {}", key, service_err)));
            }
        };
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| Error::TransientStore(format!("read body of {}: {}", key, e)))?;
        Ok(body.into_bytes())
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        cache_control: &str,
    ) -> Result<(), Error> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .cache_control(cache_control)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| Error::Upload(format!("put {}: {}", key, e.into_service_error())))?;
        debug!(key, size, "object uploaded");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                Error::TransientStore(format!("delete {}: {}", key, e.into_service_error()))
            })?;
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), Error> {
        for chunk in keys.chunks(DELETE_BATCH_LIMIT) {
            let objects = chunk
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| Error::TransientStore(format!("bad delete key: {}", e)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(|e| Error::TransientStore(format!("bad delete batch: {}", e)))?;
            let output = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| {
                    Error::TransientStore(format!("batch delete: {}", e.into_service_error()))
                })?;
            let errors = output.errors();
            if !errors.is_empty() {
                let failed: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.key())
                    .collect();
                return Err(Error::TransientStore(format!(
                    "batch delete left {} objects behind: {}",
                    failed.len(),
                    failed.join(", ")
                )));
            }
        }
        Ok(())
    }
}
