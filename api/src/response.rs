// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use shutter_storage::IMMUTABLE_CACHE_CONTROL;
use shutter_types::Error;
use warp::http::{header, Response, StatusCode};

/// Renditions still being produced must never be cached: the next
/// request should come back to us and pick up the finished variant.
pub const PROCESSING_CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate";

pub const IMAGE_STATUS_HEADER: &str = "X-Image-Status";

/// The redirect the edge answers with, carrying where the bytes are
/// in their lifecycle.
pub fn redirect(location: &str, serving_original: bool) -> warp::reply::Response {
    let (status_label, cache_control) = if serving_original {
        ("processing", PROCESSING_CACHE_CONTROL)
    } else {
        ("ready", IMMUTABLE_CACHE_CONTROL)
    };
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .header(IMAGE_STATUS_HEADER, status_label)
        .header(header::CACHE_CONTROL, cache_control)
        .body(warp::hyper::Body::empty())
        .expect("static response headers")
}

pub fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Forbidden(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        // Everything else is the service's problem, not the caller's.
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// What the caller gets to see. Internal failure detail stays in the
/// logs.
pub fn client_message(err: &Error) -> String {
    match err {
        Error::Validation(message)
        | Error::Forbidden(message)
        | Error::NotFound(message) => message.clone(),
        _ => "Internal server error".to_string(),
    }
}
