// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

mod end_to_end_test;
mod resolver_test;

use crate::{
    context::Context,
    resolver::{RenderTarget, VariantRequest, VariantResolver},
};
use bytes::Bytes;
use image::ImageOutputFormat;
use shutter_config::ServiceConfig;
use shutter_storage::{InMemoryJobQueue, InMemoryObjectStore, InMemoryVariantStore, QueueConfig};
use shutter_types::ImageFormat;
use std::{collections::HashMap, io::Cursor, sync::Arc};

pub(crate) struct TestEnv {
    pub store: Arc<InMemoryVariantStore>,
    pub objects: Arc<InMemoryObjectStore>,
    pub queue: Arc<InMemoryJobQueue>,
    pub queue_config: QueueConfig,
    pub config: ServiceConfig,
    pub resolver: Arc<VariantResolver>,
}

pub(crate) fn test_config(overrides: &[(&str, &str)]) -> ServiceConfig {
    let mut env: HashMap<&str, String> = HashMap::from([
        ("MONGODB_URI", "mongodb://localhost:27017".to_string()),
        ("AWS_REGION", "eu-central-1".to_string()),
        ("S3_BUCKET_NAME", "images".to_string()),
        ("S3_PUBLIC_URL", "https://img.example.com".to_string()),
        ("RESIZED_IMAGE_PATH", "/cache".to_string()),
        ("NODE_ENV", "test".to_string()),
    ]);
    for (key, value) in overrides {
        env.insert(key, value.to_string());
    }
    ServiceConfig::from_lookup(|key| env.get(key).cloned()).expect("test config is valid")
}

pub(crate) fn test_env() -> TestEnv {
    test_env_with(test_config(&[]))
}

pub(crate) fn test_env_with(config: ServiceConfig) -> TestEnv {
    let queue_config = QueueConfig::default();
    let store = Arc::new(InMemoryVariantStore::new());
    let objects = Arc::new(InMemoryObjectStore::new());
    let queue = Arc::new(InMemoryJobQueue::new(queue_config.clone()));
    let resolver = Arc::new(
        VariantResolver::new(store.clone(), objects.clone(), queue.clone(), &config)
            .expect("test config is valid"),
    );
    TestEnv {
        store,
        objects,
        queue,
        queue_config,
        config,
        resolver,
    }
}

pub(crate) fn test_context(env: &TestEnv) -> Context {
    Context::new(env.config.clone(), env.resolver.clone())
}

pub(crate) fn png_fixture(size: u32) -> Bytes {
    let img = image::RgbaImage::from_fn(size, size, |x, y| {
        image::Rgba([(x * 16) as u8, (y * 16) as u8, 128, 255])
    });
    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)
        .unwrap();
    Bytes::from(out)
}

pub(crate) fn original_request(image_id: &str) -> VariantRequest {
    VariantRequest {
        image_id: image_id.to_string(),
        target: None,
        force_resize: false,
    }
}

pub(crate) fn resize_request(
    image_id: &str,
    width: u32,
    height: u32,
    format: ImageFormat,
) -> VariantRequest {
    VariantRequest {
        image_id: image_id.to_string(),
        target: Some(RenderTarget {
            width,
            height,
            format,
        }),
        force_resize: false,
    }
}
