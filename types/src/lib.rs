// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

pub mod error;
pub mod job;
pub mod record;

pub use error::Error;
pub use job::{EnqueueOptions, JobPayload};
pub use record::{
    validate_image_id, ImageFormat, NewVariantRecord, VariantKey, VariantRecord, VariantStatus,
};

/// Upper bound on full retry cycles a single rendition may trigger.
/// Once a record reaches this count its `failed` state is final.
pub const MAX_REQUEUES: u32 = 2;

/// Largest accepted value for either target dimension, in pixels.
pub const MAX_DIMENSION: u32 = 5000;
