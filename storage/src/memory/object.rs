// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::object_store::ObjectStore;
use async_trait::async_trait;
use bytes::Bytes;
use shutter_types::Error;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

#[derive(Clone, Debug)]
struct StoredObject {
    body: Bytes,
    content_type: String,
    cache_control: String,
}

/// Blob store held in a map.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    fail_batch_deletes: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object, for tests and local bootstrapping.
    pub fn insert_object(&self, key: &str, body: Bytes, content_type: &str) {
        self.objects.lock().expect("lock poisoned").insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                cache_control: String::new(),
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().expect("lock poisoned").contains_key(key)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .expect("lock poisoned")
            .get(key)
            .map(|o| o.body.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .expect("lock poisoned")
            .get(key)
            .map(|o| o.content_type.clone())
    }

    pub fn cache_control(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .expect("lock poisoned")
            .get(key)
            .map(|o| o.cache_control.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().expect("lock poisoned").len()
    }

    /// Makes every subsequent batch delete fail without removing
    /// anything, to exercise the partial-failure path.
    pub fn poison_batch_deletes(&self) {
        self.fail_batch_deletes.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn head(&self, key: &str) -> Result<bool, Error> {
        Ok(self.contains(key))
    }

    async fn get(&self, key: &str) -> Result<Bytes, Error> {
        self.object(key)
            .ok_or_else(|| Error::NotFound(format!("object {}", key)))
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        cache_control: &str,
    ) -> Result<(), Error> {
        self.objects.lock().expect("lock poisoned").insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                cache_control: cache_control.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.objects.lock().expect("lock poisoned").remove(key);
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), Error> {
        if self.fail_batch_deletes.load(Ordering::Relaxed) {
            return Err(Error::TransientStore(format!(
                "batch delete left {} objects behind: {}",
                keys.len(),
                keys.join(", ")
            )));
        }
        let mut objects = self.objects.lock().expect("lock poisoned");
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }
}
