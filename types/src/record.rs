// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::{error::Error, MAX_DIMENSION};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Image ids are plain file names: word characters, dots and dashes,
/// with at least one extension dot. Path separators never match, so
/// derived object keys stay in a flat namespace.
static IMAGE_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w.\-]+$").unwrap());

pub fn validate_image_id(image_id: &str) -> Result<(), Error> {
    if !IMAGE_ID_PATTERN.is_match(image_id) || !image_id.contains('.') {
        return Err(Error::Validation(format!(
            "invalid image id: {:?}",
            image_id
        )));
    }
    Ok(())
}

/// Target encoding of a rendition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "png" => Ok(ImageFormat::Png),
            // jpg is accepted as an alias on the request surface.
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            other => Err(Error::Validation(format!(
                "unsupported format: {:?} (expected png, jpeg or webp)",
                other
            ))),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Lifecycle state of a variant record.
///
/// Transitions within a cycle are monotonic:
/// `queued -> processing -> (ready | failed)`. A `failed` record may
/// only be reset to `queued` by the requeue policy while the requeue
/// budget lasts. `ready` is final for the record's lifetime.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantStatus {
    Queued,
    Processing,
    Ready,
    Failed,
}

impl VariantStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VariantStatus::Ready)
    }
}

impl fmt::Display for VariantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VariantStatus::Queued => "queued",
            VariantStatus::Processing => "processing",
            VariantStatus::Ready => "ready",
            VariantStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The deduplication key of a rendition. Globally unique across the
/// metadata store; every derived object key is a pure function of it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct VariantKey {
    pub image_id: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

impl VariantKey {
    pub fn new(
        image_id: impl Into<String>,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Result<Self, Error> {
        let image_id = image_id.into();
        validate_image_id(&image_id)?;
        for (name, value) in [("width", width), ("height", height)] {
            if value < 1 || value > MAX_DIMENSION {
                return Err(Error::Validation(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_DIMENSION, value
                )));
            }
        }
        Ok(Self {
            image_id,
            width,
            height,
            format,
        })
    }

    /// Originals are stored under their id verbatim.
    pub fn original_key(&self) -> &str {
        &self.image_id
    }

    /// `<name>___<W>x<H>.<format>`, where `<name>` is the image id
    /// minus its final extension. Stable across restarts.
    pub fn variant_key(&self) -> String {
        let stem = self
            .image_id
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.image_id);
        format!(
            "{}___{}x{}.{}",
            stem,
            self.width,
            self.height,
            self.format.extension()
        )
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}x{}.{}",
            self.image_id, self.width, self.height, self.format
        )
    }
}

/// One variant rendition and its lifecycle state. Field names
/// serialize in camelCase to match the `image_variants` collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub image_id: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub original_key: String,
    pub variant_key: String,
    pub bucket: String,
    pub status: VariantStatus,
    /// Rendition size in bytes. Zero until the record is ready.
    pub file_size: u64,
    pub failed_reason: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Full retry cycles consumed so far. Never exceeds
    /// [`crate::MAX_REQUEUES`].
    pub requeue_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VariantRecord {
    pub fn key(&self) -> VariantKey {
        VariantKey {
            image_id: self.image_id.clone(),
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }
}

/// What the resolver hands the store on admission. The store assigns
/// the id; everything else is derived here so both production and
/// in-memory stores insert identical documents.
#[derive(Clone, Debug)]
pub struct NewVariantRecord {
    pub key: VariantKey,
    pub bucket: String,
}

impl NewVariantRecord {
    pub fn new(key: VariantKey, bucket: impl Into<String>) -> Self {
        Self {
            key,
            bucket: bucket.into(),
        }
    }

    pub fn into_record(self, id: String) -> VariantRecord {
        let variant_key = self.key.variant_key();
        let original_key = self.key.original_key().to_string();
        VariantRecord {
            id,
            image_id: self.key.image_id,
            width: self.key.width,
            height: self.key.height,
            format: self.key.format,
            original_key,
            variant_key,
            bucket: self.bucket,
            status: VariantStatus::Queued,
            file_size: 0,
            failed_reason: None,
            failed_at: None,
            requeue_count: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[test]
    fn image_id_character_class() {
        assert_ok!(validate_image_id("pic.png"));
        assert_ok!(validate_image_id("photo-2024_final.v2.jpeg"));
        assert_err!(validate_image_id("no-extension"));
        assert_err!(validate_image_id("a/b.png"));
        assert_err!(validate_image_id("../escape.png"));
        assert_err!(validate_image_id(""));
        assert_err!(validate_image_id("sp ace.png"));
    }

    #[test]
    fn format_aliases_and_labels() {
        assert_eq!(assert_ok!("jpg".parse::<ImageFormat>()), ImageFormat::Jpeg);
        assert_eq!(assert_ok!("jpeg".parse::<ImageFormat>()), ImageFormat::Jpeg);
        assert_eq!(assert_ok!("webp".parse::<ImageFormat>()), ImageFormat::Webp);
        assert_err!("gif".parse::<ImageFormat>());
        assert_eq!(ImageFormat::Jpeg.content_type(), "image/jpeg");
    }

    #[test]
    fn variant_key_derivation_is_deterministic() {
        let key = assert_ok!(VariantKey::new("pic.png", 200, 100, ImageFormat::Webp));
        assert_eq!(key.variant_key(), "pic___200x100.webp");
        assert_eq!(key.original_key(), "pic.png");
        // Stable: deriving twice gives the same key.
        assert_eq!(key.variant_key(), key.variant_key());
    }

    #[test]
    fn variant_key_strips_only_the_final_extension() {
        let key = assert_ok!(VariantKey::new(
            "archive.tar.png",
            50,
            50,
            ImageFormat::Jpeg
        ));
        assert_eq!(key.variant_key(), "archive.tar___50x50.jpeg");
    }

    #[test]
    fn dimension_bounds() {
        assert_ok!(VariantKey::new("a.png", 1, 1, ImageFormat::Png));
        assert_ok!(VariantKey::new("a.png", 5000, 5000, ImageFormat::Png));
        assert_err!(VariantKey::new("a.png", 0, 10, ImageFormat::Png));
        assert_err!(VariantKey::new("a.png", 10, 5001, ImageFormat::Png));
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = NewVariantRecord::new(
            VariantKey::new("pic.png", 200, 100, ImageFormat::Webp).unwrap(),
            "images",
        )
        .into_record("abc123".to_string());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["_id"], "abc123");
        assert_eq!(json["imageId"], "pic.png");
        assert_eq!(json["variantKey"], "pic___200x100.webp");
        assert_eq!(json["originalKey"], "pic.png");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["fileSize"], 0);
        assert_eq!(json["requeueCount"], 0);
    }
}
