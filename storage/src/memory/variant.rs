// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::variant_store::{VariantSelector, VariantStore};
use async_trait::async_trait;
use chrono::Utc;
use shutter_types::{Error, NewVariantRecord, VariantKey, VariantRecord, VariantStatus, MAX_REQUEUES};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

/// Metadata store held in a map, with the same uniqueness and
/// conditional-update semantics as the MongoDB adapter. Every status
/// change is appended to a transition log so tests can assert the
/// state machine stayed monotonic.
#[derive(Default)]
pub struct InMemoryVariantStore {
    records: Mutex<HashMap<String, VariantRecord>>,
    transitions: Mutex<Vec<(String, VariantStatus, VariantStatus)>>,
    next_id: AtomicU64,
}

impl InMemoryVariantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().expect("lock poisoned").len()
    }

    /// `(record id, from, to)` tuples in observation order.
    pub fn transition_log(&self) -> Vec<(String, VariantStatus, VariantStatus)> {
        self.transitions.lock().expect("lock poisoned").clone()
    }

    fn transition(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut VariantRecord),
    ) -> Option<VariantRecord> {
        let mut records = self.records.lock().expect("lock poisoned");
        let record = records.get_mut(id)?;
        let from = record.status;
        mutate(record);
        self.transitions
            .lock()
            .expect("lock poisoned")
            .push((id.to_string(), from, record.status));
        Some(record.clone())
    }
}

#[async_trait]
impl VariantStore for InMemoryVariantStore {
    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn insert(&self, new: NewVariantRecord) -> Result<VariantRecord, Error> {
        let mut records = self.records.lock().expect("lock poisoned");
        if records.values().any(|existing| {
            existing.image_id == new.key.image_id
                && existing.width == new.key.width
                && existing.height == new.key.height
                && existing.format == new.key.format
        }) {
            return Err(Error::Conflict(format!(
                "variant already admitted: {}",
                new.key.variant_key()
            )));
        }
        let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = new.into_record(id.clone());
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn find_by_key(&self, key: &VariantKey) -> Result<Option<VariantRecord>, Error> {
        let records = self.records.lock().expect("lock poisoned");
        Ok(records
            .values()
            .find(|record| {
                record.image_id == key.image_id
                    && record.width == key.width
                    && record.height == key.height
                    && record.format == key.format
            })
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<VariantRecord>, Error> {
        Ok(self.records.lock().expect("lock poisoned").get(id).cloned())
    }

    async fn mark_processing(&self, id: &str) -> Result<Option<VariantRecord>, Error> {
        Ok(self.transition(id, |record| {
            record.status = VariantStatus::Processing;
        }))
    }

    async fn mark_ready(&self, id: &str, file_size: u64) -> Result<Option<VariantRecord>, Error> {
        Ok(self.transition(id, |record| {
            record.status = VariantStatus::Ready;
            record.file_size = file_size;
            record.completed_at = Some(Utc::now());
        }))
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> Result<Option<VariantRecord>, Error> {
        let reason = reason.to_string();
        Ok(self.transition(id, move |record| {
            record.status = VariantStatus::Failed;
            record.failed_reason = Some(reason);
            record.failed_at = Some(Utc::now());
        }))
    }

    async fn requeue(&self, id: &str) -> Result<Option<VariantRecord>, Error> {
        let over_budget = {
            let records = self.records.lock().expect("lock poisoned");
            match records.get(id) {
                None => return Ok(None),
                Some(record) => record.requeue_count >= MAX_REQUEUES,
            }
        };
        if over_budget {
            return Ok(None);
        }
        Ok(self.transition(id, |record| {
            record.status = VariantStatus::Queued;
            record.failed_reason = None;
            record.failed_at = None;
            record.requeue_count += 1;
        }))
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool, Error> {
        Ok(self
            .records
            .lock()
            .expect("lock poisoned")
            .remove(id)
            .is_some())
    }

    async fn find_matching(&self, selector: &VariantSelector) -> Result<Vec<VariantRecord>, Error> {
        let records = self.records.lock().expect("lock poisoned");
        Ok(records
            .values()
            .filter(|record| selector.matches(record))
            .cloned()
            .collect())
    }

    async fn delete_matching(&self, selector: &VariantSelector) -> Result<u64, Error> {
        let mut records = self.records.lock().expect("lock poisoned");
        let before = records.len();
        records.retain(|_, record| !selector.matches(record));
        Ok((before - records.len()) as u64)
    }

    async fn find_stuck(&self, older_than: Duration) -> Result<Vec<VariantRecord>, Error> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| Error::TransientStore(e.to_string()))?;
        let records = self.records.lock().expect("lock poisoned");
        Ok(records
            .values()
            .filter(|record| {
                record.status == VariantStatus::Processing && record.created_at < cutoff
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use claims::{assert_err, assert_ok, assert_some};
    use shutter_types::ImageFormat;

    fn key() -> VariantKey {
        VariantKey::new("pic.png", 200, 100, ImageFormat::Webp).unwrap()
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = InMemoryVariantStore::new();
        assert_ok!(store.insert(NewVariantRecord::new(key(), "images")).await);
        let err = assert_err!(store.insert(NewVariantRecord::new(key(), "images")).await);
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn requeue_respects_budget() {
        let store = InMemoryVariantStore::new();
        let record = store
            .insert(NewVariantRecord::new(key(), "images"))
            .await
            .unwrap();
        for expected in 1..=MAX_REQUEUES {
            store.mark_failed(&record.id, "boom").await.unwrap();
            let requeued = assert_some!(store.requeue(&record.id).await.unwrap());
            assert_eq!(requeued.requeue_count, expected);
            assert_eq!(requeued.status, VariantStatus::Queued);
            assert_eq!(requeued.failed_reason, None);
            assert_eq!(requeued.failed_at, None);
        }
        store.mark_failed(&record.id, "boom").await.unwrap();
        assert_eq!(store.requeue(&record.id).await.unwrap(), None);
        let last = assert_some!(store.find_by_id(&record.id).await.unwrap());
        assert_eq!(last.requeue_count, MAX_REQUEUES);
        assert_eq!(last.status, VariantStatus::Failed);
    }

    #[tokio::test]
    async fn conditional_updates_miss_absent_records() {
        let store = InMemoryVariantStore::new();
        assert_eq!(store.mark_processing("nope").await.unwrap(), None);
        assert_eq!(store.mark_ready("nope", 1).await.unwrap(), None);
        assert_eq!(store.mark_failed("nope", "x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn selector_axes() {
        let store = InMemoryVariantStore::new();
        for (w, h, f) in [
            (50, 50, ImageFormat::Webp),
            (50, 50, ImageFormat::Png),
            (90, 90, ImageFormat::Webp),
        ] {
            let key = VariantKey::new("a.jpg", w, h, f).unwrap();
            store
                .insert(NewVariantRecord::new(key, "images"))
                .await
                .unwrap();
        }
        let all = store
            .find_matching(&VariantSelector::image("a.jpg"))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        let narrowed = store
            .find_matching(
                &VariantSelector::image("a.jpg")
                    .width(50)
                    .height(50)
                    .format(ImageFormat::Webp),
            )
            .await
            .unwrap();
        assert_eq!(narrowed.len(), 1);
        assert_eq!(
            store
                .delete_matching(&VariantSelector::image("a.jpg").width(50))
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.record_count(), 1);
    }
}
