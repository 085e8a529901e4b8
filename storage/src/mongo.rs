// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::variant_store::{VariantSelector, VariantStore};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::TryStreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, Bson, Document},
    error::{ErrorKind, WriteFailure},
    options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument},
    Client, Collection, Database, IndexModel,
};
use shutter_types::{Error, NewVariantRecord, VariantKey, VariantRecord, MAX_REQUEUES};
use std::time::Duration;
use tracing::info;

pub const COLLECTION_NAME: &str = "image_variants";

/// Production metadata store backed by MongoDB. The unique index on
/// the request quadruple is created at startup and turns concurrent
/// admissions of the same rendition into a duplicate-key loss for
/// all but one writer.
pub struct MongoVariantStore {
    db: Database,
    collection: Collection<VariantRecord>,
}

impl MongoVariantStore {
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, Error> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| Error::FatalConfig(format!("cannot connect to metadata store: {}", e)))?;
        let db = client.database(db_name);
        let collection = db.collection::<VariantRecord>(COLLECTION_NAME);
        let store = Self { db, collection };
        store.ensure_indexes().await?;
        info!(db = db_name, collection = COLLECTION_NAME, "metadata store connected");
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<(), Error> {
        let unique_quadruple = IndexModel::builder()
            .keys(doc! { "imageId": 1, "width": 1, "height": 1, "format": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let by_status = IndexModel::builder().keys(doc! { "status": 1 }).build();
        self.collection
            .create_indexes([unique_quadruple, by_status], None)
            .await
            .map_err(transient)?;
        Ok(())
    }

    fn selector_filter(selector: &VariantSelector) -> Document {
        let mut filter = doc! { "imageId": &selector.image_id };
        if let Some(width) = selector.width {
            filter.insert("width", width as i64);
        }
        if let Some(height) = selector.height {
            filter.insert("height", height as i64);
        }
        if let Some(format) = selector.format {
            filter.insert("format", format.extension());
        }
        filter
    }

    async fn update_by_id(
        &self,
        id: &str,
        filter_extra: Option<Document>,
        update: Document,
    ) -> Result<Option<VariantRecord>, Error> {
        let mut filter = doc! { "_id": id };
        if let Some(extra) = filter_extra {
            filter.extend(extra);
        }
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        self.collection
            .find_one_and_update(filter, update, options)
            .await
            .map_err(transient)
    }
}

#[async_trait]
impl VariantStore for MongoVariantStore {
    async fn ping(&self) -> Result<(), Error> {
        self.db
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn insert(&self, new: NewVariantRecord) -> Result<VariantRecord, Error> {
        let record = new.into_record(ObjectId::new().to_hex());
        match self.collection.insert_one(&record, None).await {
            Ok(_) => Ok(record),
            Err(err) if is_duplicate_key(&err) => Err(Error::Conflict(format!(
                "variant already admitted: {}",
                record.variant_key
            ))),
            Err(err) => Err(transient(err)),
        }
    }

    async fn find_by_key(&self, key: &VariantKey) -> Result<Option<VariantRecord>, Error> {
        let filter = doc! {
            "imageId": &key.image_id,
            "width": key.width as i64,
            "height": key.height as i64,
            "format": key.format.extension(),
        };
        self.collection.find_one(filter, None).await.map_err(transient)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<VariantRecord>, Error> {
        self.collection
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(transient)
    }

    async fn mark_processing(&self, id: &str) -> Result<Option<VariantRecord>, Error> {
        self.update_by_id(id, None, doc! { "$set": { "status": "processing" } })
            .await
    }

    async fn mark_ready(&self, id: &str, file_size: u64) -> Result<Option<VariantRecord>, Error> {
        self.update_by_id(
            id,
            None,
            doc! { "$set": {
                "status": "ready",
                "fileSize": file_size as i64,
                "completedAt": Utc::now().to_rfc3339(),
            }},
        )
        .await
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> Result<Option<VariantRecord>, Error> {
        self.update_by_id(
            id,
            None,
            doc! { "$set": {
                "status": "failed",
                "failedReason": reason,
                "failedAt": Utc::now().to_rfc3339(),
            }},
        )
        .await
    }

    async fn requeue(&self, id: &str) -> Result<Option<VariantRecord>, Error> {
        self.update_by_id(
            id,
            Some(doc! { "requeueCount": { "$lt": MAX_REQUEUES as i64 } }),
            doc! {
                "$set": {
                    "status": "queued",
                    "failedReason": Bson::Null,
                    "failedAt": Bson::Null,
                },
                "$inc": { "requeueCount": 1_i64 },
            },
        )
        .await
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool, Error> {
        let result = self
            .collection
            .delete_one(doc! { "_id": id }, None)
            .await
            .map_err(transient)?;
        Ok(result.deleted_count > 0)
    }

    async fn find_matching(&self, selector: &VariantSelector) -> Result<Vec<VariantRecord>, Error> {
        let cursor = self
            .collection
            .find(Self::selector_filter(selector), None)
            .await
            .map_err(transient)?;
        cursor.try_collect().await.map_err(transient)
    }

    async fn delete_matching(&self, selector: &VariantSelector) -> Result<u64, Error> {
        let result = self
            .collection
            .delete_many(Self::selector_filter(selector), None)
            .await
            .map_err(transient)?;
        Ok(result.deleted_count)
    }

    async fn find_stuck(&self, older_than: Duration) -> Result<Vec<VariantRecord>, Error> {
        let cursor = self
            .collection
            .find(doc! { "status": "processing" }, None)
            .await
            .map_err(transient)?;
        let processing: Vec<VariantRecord> = cursor.try_collect().await.map_err(transient)?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| Error::TransientStore(e.to_string()))?;
        Ok(processing
            .into_iter()
            .filter(|record| record.created_at < cutoff)
            .collect())
    }
}

fn transient(err: mongodb::error::Error) -> Error {
    Error::TransientStore(format!("metadata store: {}", err))
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        _ => false,
    }
}
