// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::tests::{original_request, png_fixture, resize_request, test_env};
use claims::{assert_err, assert_ok, assert_some};
use futures::future::join_all;
use shutter_storage::{VariantSelector, VariantStore};
use shutter_types::{Error, ImageFormat, VariantStatus};

#[tokio::test]
async fn serves_the_original_when_no_target_is_given() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(8), "image/png");

    let resolution = assert_ok!(
        env.resolver
            .resolve_variant(&original_request("pic.png"))
            .await
    );
    assert_eq!(resolution.key, "pic.png");
    assert!(resolution.serving_original);
    assert_eq!(env.store.record_count(), 0);
    assert_eq!(env.queue.admitted_count(), 0);
}

#[tokio::test]
async fn cold_miss_admits_one_job_and_serves_the_original() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(8), "image/png");
    let request = resize_request("pic.png", 200, 100, ImageFormat::Webp);

    let resolution = assert_ok!(env.resolver.resolve_variant(&request).await);
    assert_eq!(resolution.key, "pic.png");
    assert!(resolution.serving_original);

    assert_eq!(env.store.record_count(), 1);
    assert_eq!(env.queue.admitted_count(), 1);
    let record = assert_some!(env
        .store
        .find_by_key(&shutter_types::VariantKey::new("pic.png", 200, 100, ImageFormat::Webp).unwrap())
        .await
        .unwrap());
    assert_eq!(record.status, VariantStatus::Queued);
    assert_eq!(record.variant_key, "pic___200x100.webp");
    assert_eq!(record.file_size, 0);

    // A second request while the render is in flight admits nothing
    // new and still serves the original.
    let resolution = assert_ok!(env.resolver.resolve_variant(&request).await);
    assert!(resolution.serving_original);
    assert_eq!(env.store.record_count(), 1);
    assert_eq!(env.queue.admitted_count(), 1);
}

#[tokio::test]
async fn ready_records_serve_the_rendition_without_new_work() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(8), "image/png");
    let request = resize_request("pic.png", 200, 100, ImageFormat::Webp);
    assert_ok!(env.resolver.resolve_variant(&request).await);

    let record = assert_some!(env
        .store
        .find_by_key(&shutter_types::VariantKey::new("pic.png", 200, 100, ImageFormat::Webp).unwrap())
        .await
        .unwrap());
    env.store.mark_processing(&record.id).await.unwrap();
    env.store.mark_ready(&record.id, 512).await.unwrap();

    let resolution = assert_ok!(env.resolver.resolve_variant(&request).await);
    assert_eq!(resolution.key, "pic___200x100.webp");
    assert!(!resolution.serving_original);
    assert_eq!(env.queue.admitted_count(), 1);
    assert_eq!(env.store.record_count(), 1);
}

#[tokio::test]
async fn fifty_concurrent_misses_create_one_record_and_one_job() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(8), "image/png");
    let request = resize_request("pic.png", 200, 100, ImageFormat::Webp);

    let resolutions = join_all(
        (0..50).map(|_| env.resolver.resolve_variant(&request)),
    )
    .await;

    for resolution in resolutions {
        let resolution = assert_ok!(resolution);
        assert_eq!(resolution.key, "pic.png");
        assert!(resolution.serving_original);
    }
    assert_eq!(env.store.record_count(), 1);
    assert_eq!(env.queue.admitted_count(), 1);
}

#[tokio::test]
async fn missing_original_leaves_no_trace() {
    let env = test_env();
    let err = assert_err!(
        env.resolver
            .resolve_variant(&resize_request("absent.jpg", 10, 10, ImageFormat::Jpeg))
            .await
    );
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(env.store.record_count(), 0);
    assert_eq!(env.queue.admitted_count(), 0);
}

#[tokio::test]
async fn force_resize_displaces_a_ready_rendition() {
    let env = test_env();
    env.objects
        .insert_object("a.jpg", png_fixture(8), "image/jpeg");
    let request = resize_request("a.jpg", 50, 50, ImageFormat::Webp);
    assert_ok!(env.resolver.resolve_variant(&request).await);

    let key = shutter_types::VariantKey::new("a.jpg", 50, 50, ImageFormat::Webp).unwrap();
    let record = assert_some!(env.store.find_by_key(&key).await.unwrap());
    env.store.mark_processing(&record.id).await.unwrap();
    env.store.mark_ready(&record.id, 64).await.unwrap();
    env.objects
        .insert_object("a___50x50.webp", png_fixture(4), "image/webp");

    let mut forced = request.clone();
    forced.force_resize = true;
    let resolution = assert_ok!(env.resolver.resolve_variant(&forced).await);
    assert!(resolution.serving_original);
    assert_eq!(resolution.key, "a.jpg");

    // The stale rendition is gone and a fresh cycle is queued.
    assert!(!env.objects.contains("a___50x50.webp"));
    let fresh = assert_some!(env.store.find_by_key(&key).await.unwrap());
    assert_ne!(fresh.id, record.id);
    assert_eq!(fresh.status, VariantStatus::Queued);
    assert_eq!(fresh.file_size, 0);
    assert_eq!(env.queue.admitted_count(), 2);
    assert_eq!(env.store.record_count(), 1);
}

#[tokio::test]
async fn failed_records_are_displaced_on_the_next_request() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(8), "image/png");
    let request = resize_request("pic.png", 20, 20, ImageFormat::Png);
    assert_ok!(env.resolver.resolve_variant(&request).await);

    let key = shutter_types::VariantKey::new("pic.png", 20, 20, ImageFormat::Png).unwrap();
    let record = assert_some!(env.store.find_by_key(&key).await.unwrap());
    env.store.mark_failed(&record.id, "render failed").await.unwrap();

    let resolution = assert_ok!(env.resolver.resolve_variant(&request).await);
    assert!(resolution.serving_original);
    let fresh = assert_some!(env.store.find_by_key(&key).await.unwrap());
    assert_ne!(fresh.id, record.id);
    assert_eq!(fresh.status, VariantStatus::Queued);
    assert_eq!(fresh.requeue_count, 0);
    assert_eq!(env.queue.admitted_count(), 2);
}

#[tokio::test]
async fn delete_narrows_to_the_selector() {
    let env = test_env();
    env.objects
        .insert_object("a.jpg", png_fixture(8), "image/jpeg");
    for (w, h, f) in [(50, 50, ImageFormat::Webp), (90, 90, ImageFormat::Png)] {
        assert_ok!(
            env.resolver
                .resolve_variant(&resize_request("a.jpg", w, h, f))
                .await
        );
    }
    env.objects
        .insert_object("a___50x50.webp", png_fixture(4), "image/webp");
    env.objects
        .insert_object("a___90x90.png", png_fixture(4), "image/png");

    let deleted = assert_ok!(
        env.resolver
            .delete_image(
                &VariantSelector::image("a.jpg")
                    .width(50)
                    .height(50)
                    .format(ImageFormat::Webp),
            )
            .await
    );
    assert_eq!(deleted, 1);
    assert!(!env.objects.contains("a___50x50.webp"));
    assert!(env.objects.contains("a___90x90.png"));
    assert_eq!(env.store.record_count(), 1);

    // Bare image id removes everything that is left.
    let deleted = assert_ok!(
        env.resolver
            .delete_image(&VariantSelector::image("a.jpg"))
            .await
    );
    assert_eq!(deleted, 1);
    assert!(!env.objects.contains("a___90x90.png"));
    assert_eq!(env.store.record_count(), 0);

    let err = assert_err!(
        env.resolver
            .delete_image(&VariantSelector::image("a.jpg"))
            .await
    );
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn partial_batch_delete_failure_keeps_the_records() {
    let env = test_env();
    env.objects
        .insert_object("a.jpg", png_fixture(8), "image/jpeg");
    assert_ok!(
        env.resolver
            .resolve_variant(&resize_request("a.jpg", 50, 50, ImageFormat::Webp))
            .await
    );

    env.objects.poison_batch_deletes();
    let err = assert_err!(
        env.resolver
            .delete_image(&VariantSelector::image("a.jpg"))
            .await
    );
    assert!(matches!(err, Error::TransientStore(_)));
    // The record survives so a retry can finish the cleanup.
    assert_eq!(env.store.record_count(), 1);
}

#[tokio::test]
async fn public_urls_join_and_encode_keys() {
    let env = test_env();
    assert_eq!(
        env.resolver.public_url("pic___200x100.webp"),
        "https://img.example.com/pic___200x100.webp"
    );
}

#[tokio::test]
async fn public_urls_respect_a_base_path() {
    let env = crate::tests::test_env_with(crate::tests::test_config(&[(
        "S3_PUBLIC_URL",
        "https://cdn.example.com/images",
    )]));
    assert_eq!(
        env.resolver.public_url("pic.png"),
        "https://cdn.example.com/images/pic.png"
    );
}

#[tokio::test]
async fn get_original_checks_existence() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(8), "image/png");
    assert_eq!(assert_ok!(env.resolver.get_original("pic.png").await), "pic.png");
    let err = assert_err!(env.resolver.get_original("gone.png").await);
    assert!(matches!(err, Error::NotFound(_)));
}
