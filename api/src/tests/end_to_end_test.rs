// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! Resolver and worker running against the same stores, the way the
//! two processes share them in production.

use crate::{
    response::IMAGE_STATUS_HEADER,
    routes::routes,
    tests::{png_fixture, test_context, test_env},
};
use claims::assert_some;
use shutter_storage::VariantStore;
use shutter_types::{ImageFormat, VariantKey, VariantStatus};
use shutter_worker::{pipeline::ResizePipeline, ResizeWorker};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;

#[tokio::test]
async fn cold_miss_renders_in_the_background_and_round_trips() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(16), "image/png");
    let filter = routes(test_context(&env));

    // Cold miss: the caller is sent to the original immediately.
    let res = warp::test::request()
        .method("GET")
        .path("/pic.png?w=8&h=4&format=webp")
        .reply(&filter)
        .await;
    assert_eq!(res.status(), 302);
    assert_eq!(res.headers()["location"], "https://img.example.com/pic.png");
    assert_eq!(res.headers()[IMAGE_STATUS_HEADER], "processing");

    // The worker picks the job up from the shared queue.
    let pipeline = ResizePipeline::new(env.store.clone(), env.objects.clone());
    let worker = Arc::new(ResizeWorker::new(
        env.store.clone(),
        env.queue.clone(),
        pipeline,
        env.queue_config.clone(),
        2,
    ));
    tokio::spawn(worker.clone().run());

    let key = VariantKey::new("pic.png", 8, 4, ImageFormat::Webp).unwrap();
    let mut ready = false;
    for _ in 0..600 {
        if let Some(record) = env.store.find_by_key(&key).await.unwrap() {
            if record.status == VariantStatus::Ready {
                ready = true;
                break;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(ready, "render never completed");
    assert!(env.objects.contains("pic___8x4.webp"));

    // Same request again: the rendition itself, no new admission.
    let res = warp::test::request()
        .method("GET")
        .path("/pic.png?w=8&h=4&format=webp")
        .reply(&filter)
        .await;
    assert_eq!(res.status(), 302);
    assert_eq!(
        res.headers()["location"],
        "https://img.example.com/pic___8x4.webp"
    );
    assert_eq!(res.headers()[IMAGE_STATUS_HEADER], "ready");
    assert_eq!(env.queue.admitted_count(), 1);
    assert_eq!(env.queue.live_job_count(), 0);

    // Ready is terminal across the whole exchange.
    let log = env.store.transition_log();
    assert!(log.iter().all(|(_, from, _)| *from != VariantStatus::Ready));

    worker.request_stop();
}

#[tokio::test]
async fn force_resize_end_to_end_replaces_the_rendition() {
    let env = test_env();
    env.objects
        .insert_object("a.jpg", png_fixture(16), "image/jpeg");
    let filter = routes(test_context(&env));

    let pipeline = ResizePipeline::new(env.store.clone(), env.objects.clone());
    let worker = Arc::new(ResizeWorker::new(
        env.store.clone(),
        env.queue.clone(),
        pipeline,
        env.queue_config.clone(),
        1,
    ));
    tokio::spawn(worker.clone().run());

    warp::test::request()
        .method("GET")
        .path("/a.jpg?w=8&h=8&format=webp")
        .reply(&filter)
        .await;

    let key = VariantKey::new("a.jpg", 8, 8, ImageFormat::Webp).unwrap();
    let mut first = None;
    for _ in 0..600 {
        if let Some(record) = env.store.find_by_key(&key).await.unwrap() {
            if record.status == VariantStatus::Ready {
                first = Some(record);
                break;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    let first = assert_some!(first);
    assert!(env.objects.contains("a___8x8.webp"));

    // Force a re-render; the record is re-created and rendered anew.
    let res = warp::test::request()
        .method("GET")
        .path("/a.jpg?w=8&h=8&format=webp&force_resize=true")
        .reply(&filter)
        .await;
    assert_eq!(res.status(), 302);
    assert_eq!(res.headers()[IMAGE_STATUS_HEADER], "processing");

    let mut second = None;
    for _ in 0..600 {
        if let Some(record) = env.store.find_by_key(&key).await.unwrap() {
            if record.status == VariantStatus::Ready && record.id != first.id {
                second = Some(record);
                break;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    let second = assert_some!(second);
    assert_eq!(second.requeue_count, 0);
    assert!(env.objects.contains("a___8x8.webp"));
    assert_eq!(env.queue.admitted_count(), 2);

    worker.request_stop();
}
