// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use image::{imageops::FilterType, ImageOutputFormat};
use shutter_types::{Error, ImageFormat};
use std::io::Cursor;

const JPEG_QUALITY: u8 = 80;

/// Decodes the original, scales it to cover the target box with a
/// centered crop, and re-encodes in the requested format. Decoding
/// and scaling are CPU-bound, so the whole call runs on the blocking
/// pool to keep the scheduler responsive for peer jobs.
pub async fn render_variant(
    original: Bytes,
    width: u32,
    height: u32,
    format: ImageFormat,
) -> Result<Bytes, Error> {
    tokio::task::spawn_blocking(move || render_blocking(&original, width, height, format))
        .await
        .map_err(|e| Error::Render(format!("render task aborted: {}", e)))?
}

fn render_blocking(
    original: &[u8],
    width: u32,
    height: u32,
    format: ImageFormat,
) -> Result<Bytes, Error> {
    let decoded = image::load_from_memory(original)
        .map_err(|e| Error::Render(format!("decode original: {}", e)))?;
    let resized = decoded.resize_to_fill(width, height, FilterType::Lanczos3);
    let output_format = match format {
        ImageFormat::Png => ImageOutputFormat::Png,
        ImageFormat::Jpeg => ImageOutputFormat::Jpeg(JPEG_QUALITY),
        ImageFormat::Webp => ImageOutputFormat::WebP,
    };
    let mut rendered = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut rendered), output_format)
        .map_err(|e| Error::Render(format!("encode {}: {}", format, e)))?;
    Ok(Bytes::from(rendered))
}

/// Content type for the upload, sniffed from the rendered bytes
/// rather than trusted from the request.
pub fn sniff_content_type(rendered: &[u8], requested: ImageFormat) -> &'static str {
    match image::guess_format(rendered) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::WebP) => "image/webp",
        _ => requested.content_type(),
    }
}
