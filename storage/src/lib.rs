// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! Adapter seams for the three external services the core consumes:
//! the object store holding originals and renditions, the metadata
//! store holding variant records, and the durable job queue feeding
//! the resize worker. Each seam is a trait with a production
//! implementation and an in-memory one; tests and local development
//! run entirely on the in-memory set.

pub mod memory;
pub mod mongo;
pub mod object_store;
pub mod queue;
pub mod redis_queue;
pub mod s3;
pub mod variant_store;

pub use memory::{InMemoryJobQueue, InMemoryObjectStore, InMemoryVariantStore};
pub use mongo::MongoVariantStore;
pub use object_store::{ObjectStore, IMMUTABLE_CACHE_CONTROL};
pub use queue::{ActiveJob, FailDisposition, JobQueue, QueueConfig, StalledJob};
pub use redis_queue::RedisJobQueue;
pub use s3::S3ObjectStore;
pub use variant_store::{VariantSelector, VariantStore};
