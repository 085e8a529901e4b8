// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::{
    context::Context,
    resolver::{RenderTarget, VariantRequest},
    response,
};
use chrono::Utc;
use serde::Deserialize;
use shutter_storage::VariantSelector;
use shutter_types::{validate_image_id, Error, ImageFormat};
use std::net::SocketAddr;
use tracing::{error, warn};
use warp::{
    http::StatusCode,
    path::Tail,
    reject::{self, Reject, Rejection},
    reply, Filter, Reply,
};

#[derive(Debug)]
struct ApiRejection(Error);
impl Reject for ApiRejection {}

#[derive(Debug)]
struct RateLimited;
impl Reject for RateLimited {}

fn api_error(err: Error) -> Rejection {
    reject::custom(ApiRejection(err))
}

#[derive(Debug, Deserialize)]
pub struct RawImageQuery {
    w: Option<u32>,
    h: Option<u32>,
    format: Option<String>,
    force_resize: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawDeleteQuery {
    w: Option<u32>,
    h: Option<u32>,
    format: Option<String>,
}

pub fn routes(
    context: Context,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let cors = cors_layer(&context);

    let health = warp::path!("health").and(warp::get()).and_then(handle_health);

    let get_image = context
        .clone()
        .filter()
        .and(warp::get())
        .and(warp::addr::remote())
        .and(warp::path::tail())
        .and(warp::query::<RawImageQuery>())
        .and_then(handle_get_image);

    let delete_image = context
        .clone()
        .filter()
        .and(warp::delete())
        .and(warp::addr::remote())
        .and(warp::path::tail())
        .and(warp::query::<RawDeleteQuery>())
        .and_then(handle_delete_image);

    health
        .or(get_image)
        .or(delete_image)
        .recover(handle_rejection)
        .with(cors)
        .with(warp::log("shutter::http"))
}

fn cors_layer(context: &Context) -> warp::filters::cors::Builder {
    let origins = &context.config().allowed_origins;
    let cors = warp::cors()
        .allow_methods(vec!["GET", "DELETE"])
        .allow_headers(vec!["content-type"]);
    if origins.is_empty() {
        cors.allow_any_origin()
    } else {
        cors.allow_origins(origins.iter().map(|origin| origin.as_str()))
    }
}

async fn handle_health() -> Result<impl Reply, Rejection> {
    Ok(reply::json(&serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

async fn handle_get_image(
    context: Context,
    addr: Option<SocketAddr>,
    tail: Tail,
    raw: RawImageQuery,
) -> Result<warp::reply::Response, Rejection> {
    // The prefix guard runs before anything that could touch a
    // store: a request for an already-resized path must do no work.
    guard_resized_prefix(&context, tail.as_str())?;
    if !context.rate_limiter().check(addr.map(|a| a.ip())) {
        return Err(reject::custom(RateLimited));
    }

    let request = validate_image_request(tail.as_str(), raw).map_err(api_error)?;
    let resolution = context
        .resolver()
        .resolve_variant(&request)
        .await
        .map_err(api_error)?;
    let location = context.resolver().public_url(&resolution.key);
    Ok(response::redirect(&location, resolution.serving_original))
}

async fn handle_delete_image(
    context: Context,
    addr: Option<SocketAddr>,
    tail: Tail,
    raw: RawDeleteQuery,
) -> Result<impl Reply, Rejection> {
    guard_resized_prefix(&context, tail.as_str())?;
    if !context.rate_limiter().check(addr.map(|a| a.ip())) {
        return Err(reject::custom(RateLimited));
    }

    let selector = validate_delete_selector(tail.as_str(), raw).map_err(api_error)?;
    context
        .resolver()
        .delete_image(&selector)
        .await
        .map_err(api_error)?;
    Ok(reply::json(&serde_json::json!({
        "message": "Image deleted successfully",
    })))
}

/// 403 for anything under the configured rendition prefix, so the
/// service cannot loop on itself when it fronts its own bucket.
fn guard_resized_prefix(context: &Context, tail: &str) -> Result<(), Rejection> {
    if let Some(prefix) = &context.config().resized_image_path {
        let path = format!("/{}", tail);
        if path.starts_with(prefix.as_str()) {
            return Err(api_error(Error::Forbidden(format!(
                "requests under {} are not served",
                prefix
            ))));
        }
    }
    Ok(())
}

fn validate_image_request(tail: &str, raw: RawImageQuery) -> Result<VariantRequest, Error> {
    validate_image_id(tail)?;

    let target = match (raw.w, raw.h) {
        (None, None) => None,
        (Some(width), Some(height)) => {
            let format = resolve_format(tail, raw.format.as_deref())?;
            Some(RenderTarget {
                width,
                height,
                format,
            })
        }
        _ => {
            return Err(Error::Validation(
                "w and h must be provided together".to_string(),
            ))
        }
    };

    let force_resize = match raw.force_resize.as_deref() {
        None | Some("false") => false,
        Some("true") => true,
        Some(other) => {
            return Err(Error::Validation(format!(
                "force_resize must be \"true\" or \"false\", got {:?}",
                other
            )))
        }
    };

    Ok(VariantRequest {
        image_id: tail.to_string(),
        target,
        force_resize,
    })
}

/// The output format: explicit query value, or the original's own
/// extension when the caller only wants a resize.
fn resolve_format(image_id: &str, format: Option<&str>) -> Result<ImageFormat, Error> {
    match format {
        Some(format) => format.to_ascii_lowercase().parse(),
        None => image_id
            .rsplit_once('.')
            .map(|(_, extension)| extension.to_ascii_lowercase())
            .unwrap_or_default()
            .parse()
            .map_err(|_| {
                Error::Validation(format!(
                    "format is required: {:?} is not a supported output format",
                    image_id
                ))
            }),
    }
}

fn validate_delete_selector(tail: &str, raw: RawDeleteQuery) -> Result<VariantSelector, Error> {
    validate_image_id(tail)?;
    let mut selector = VariantSelector::image(tail);
    if let Some(width) = raw.w {
        selector = selector.width(width);
    }
    if let Some(height) = raw.h {
        selector = selector.height(height);
    }
    if let Some(format) = raw.format {
        selector = selector.format(format.to_ascii_lowercase().parse()?);
    }
    Ok(selector)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Rejection> {
    let (status, message) = if let Some(ApiRejection(api_err)) = err.find() {
        let status = response::error_status(api_err);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %api_err, "request failed");
        } else {
            warn!(error = %api_err, status = status.as_u16(), "request rejected");
        }
        (status, response::client_message(api_err))
    } else if err.find::<RateLimited>().is_some() {
        (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "Invalid query string".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed".to_string(),
        )
    } else {
        error!(rejection = ?err, "unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };

    Ok(reply::with_status(
        reply::json(&serde_json::json!({ "error": message })),
        status,
    ))
}
