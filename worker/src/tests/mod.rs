// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

mod pipeline_test;

use async_trait::async_trait;
use bytes::Bytes;
use image::ImageOutputFormat;
use shutter_storage::{
    ActiveJob, InMemoryJobQueue, InMemoryObjectStore, InMemoryVariantStore, JobQueue, ObjectStore,
    QueueConfig, VariantStore,
};
use shutter_types::{
    EnqueueOptions, Error, ImageFormat, JobPayload, NewVariantRecord, VariantKey, VariantRecord,
};
use std::{io::Cursor, sync::Arc, time::Duration};

pub(crate) struct TestEnv {
    pub store: Arc<InMemoryVariantStore>,
    pub objects: Arc<InMemoryObjectStore>,
    pub queue: Arc<InMemoryJobQueue>,
    pub queue_config: QueueConfig,
}

pub(crate) fn test_env() -> TestEnv {
    let queue_config = QueueConfig::default();
    TestEnv {
        store: Arc::new(InMemoryVariantStore::new()),
        objects: Arc::new(InMemoryObjectStore::new()),
        queue: Arc::new(InMemoryJobQueue::new(queue_config.clone())),
        queue_config,
    }
}

pub(crate) fn png_fixture(size: u32) -> Bytes {
    let img = image::RgbaImage::from_fn(size, size, |x, y| {
        if (x / 2 + y / 2) % 2 == 0 {
            image::Rgba([200, 40, 40, 255])
        } else {
            image::Rgba([40, 40, 200, 255])
        }
    });
    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)
        .unwrap();
    Bytes::from(out)
}

/// Inserts a queued record for the quadruple and returns it.
pub(crate) async fn admit_record(
    env: &TestEnv,
    image_id: &str,
    width: u32,
    height: u32,
    format: ImageFormat,
) -> VariantRecord {
    let key = VariantKey::new(image_id, width, height, format).unwrap();
    env.store
        .insert(NewVariantRecord::new(key, "images"))
        .await
        .unwrap()
}

/// Enqueues a job for the record and leases it, the way a worker
/// slot would receive it.
pub(crate) async fn lease_job(env: &TestEnv, record: &VariantRecord) -> ActiveJob {
    let payload = JobPayload::for_record(record);
    let token = payload.token();
    assert!(env
        .queue
        .enqueue(payload, EnqueueOptions::resize(token))
        .await
        .unwrap());
    env.queue
        .dequeue(Duration::from_millis(50))
        .await
        .unwrap()
        .expect("job should be waiting")
}

/// Object store that answers after a fixed delay, for timeout tests.
pub(crate) struct SlowObjectStore {
    inner: Arc<InMemoryObjectStore>,
    delay: Duration,
}

impl SlowObjectStore {
    pub(crate) fn new(inner: Arc<InMemoryObjectStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl ObjectStore for SlowObjectStore {
    async fn head(&self, key: &str) -> Result<bool, Error> {
        tokio::time::sleep(self.delay).await;
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, Error> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        cache_control: &str,
    ) -> Result<(), Error> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(key, body, content_type, cache_control).await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.inner.delete(key).await
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), Error> {
        self.inner.delete_batch(keys).await
    }
}
