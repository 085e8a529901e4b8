// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::{
    pipeline::{ResizePipeline, StepTimeouts},
    tests::{admit_record, lease_job, png_fixture, test_env, SlowObjectStore},
};
use bytes::Bytes;
use claims::{assert_err, assert_ok, assert_some};
use shutter_storage::{VariantStore, IMMUTABLE_CACHE_CONTROL};
use shutter_types::{Error, ImageFormat, VariantStatus};
use std::{sync::Arc, time::Duration};

#[tokio::test]
async fn drives_a_queued_record_to_ready() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(16), "image/png");
    let record = admit_record(&env, "pic.png", 8, 8, ImageFormat::Webp).await;
    let job = lease_job(&env, &record).await;

    let pipeline = ResizePipeline::new(env.store.clone(), env.objects.clone());
    assert_ok!(pipeline.execute(&job, env.queue.as_ref()).await);

    let record = assert_some!(env.store.find_by_id(&record.id).await.unwrap());
    assert_eq!(record.status, VariantStatus::Ready);
    assert!(record.completed_at.is_some());
    assert!(record.file_size > 0);

    let rendered = assert_some!(env.objects.object("pic___8x8.webp"));
    assert_eq!(rendered.len() as u64, record.file_size);
    assert_eq!(
        env.objects.content_type("pic___8x8.webp").as_deref(),
        Some("image/webp")
    );
    assert_eq!(
        env.objects.cache_control("pic___8x8.webp").as_deref(),
        Some(IMMUTABLE_CACHE_CONTROL)
    );
    assert_eq!(
        env.queue.progress_history(&job.id),
        vec![5, 10, 20, 50, 75, 90, 100]
    );
}

#[tokio::test]
async fn duplicate_delivery_of_a_ready_record_does_nothing() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(16), "image/png");
    let record = admit_record(&env, "pic.png", 8, 8, ImageFormat::Webp).await;
    let job = lease_job(&env, &record).await;

    env.store.mark_processing(&record.id).await.unwrap();
    env.store.mark_ready(&record.id, 64).await.unwrap();

    let pipeline = ResizePipeline::new(env.store.clone(), env.objects.clone());
    assert_ok!(pipeline.execute(&job, env.queue.as_ref()).await);

    // The record never left ready and no rendition was re-uploaded.
    let record = assert_some!(env.store.find_by_id(&record.id).await.unwrap());
    assert_eq!(record.status, VariantStatus::Ready);
    assert_eq!(record.file_size, 64);
    assert!(!env.objects.contains("pic___8x8.webp"));
    let log = env.store.transition_log();
    assert!(log.iter().all(|(_, from, _)| *from != VariantStatus::Ready));
}

#[tokio::test]
async fn missing_record_is_terminal() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(16), "image/png");
    let record = admit_record(&env, "pic.png", 8, 8, ImageFormat::Png).await;
    let job = lease_job(&env, &record).await;
    env.store.delete_by_id(&record.id).await.unwrap();

    let pipeline = ResizePipeline::new(env.store.clone(), env.objects.clone());
    let err = assert_err!(pipeline.execute(&job, env.queue.as_ref()).await);
    assert!(matches!(err, Error::RecordMissing(_)));
    assert!(!err.is_retriable());
}

#[tokio::test]
async fn missing_original_fails_as_source_unavailable() {
    let env = test_env();
    let record = admit_record(&env, "pic.png", 8, 8, ImageFormat::Png).await;
    let job = lease_job(&env, &record).await;

    let pipeline = ResizePipeline::new(env.store.clone(), env.objects.clone());
    let err = assert_err!(pipeline.execute(&job, env.queue.as_ref()).await);
    assert!(matches!(err, Error::SourceUnavailable(_)));
    assert!(err.is_retriable());

    let record = assert_some!(env.store.find_by_id(&record.id).await.unwrap());
    assert_eq!(record.status, VariantStatus::Failed);
    assert!(record.failed_at.is_some());
    assert_some!(record.failed_reason);
}

#[tokio::test]
async fn empty_original_fails_as_source_unavailable() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", Bytes::new(), "image/png");
    let record = admit_record(&env, "pic.png", 8, 8, ImageFormat::Png).await;
    let job = lease_job(&env, &record).await;

    let pipeline = ResizePipeline::new(env.store.clone(), env.objects.clone());
    let err = assert_err!(pipeline.execute(&job, env.queue.as_ref()).await);
    assert!(matches!(err, Error::SourceUnavailable(_)));
}

#[tokio::test]
async fn corrupt_original_fails_the_render_step() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", Bytes::from_static(b"not an image"), "image/png");
    let record = admit_record(&env, "pic.png", 8, 8, ImageFormat::Webp).await;
    let job = lease_job(&env, &record).await;

    let pipeline = ResizePipeline::new(env.store.clone(), env.objects.clone());
    let err = assert_err!(pipeline.execute(&job, env.queue.as_ref()).await);
    assert!(matches!(err, Error::Render(_)));

    let record = assert_some!(env.store.find_by_id(&record.id).await.unwrap());
    assert_eq!(record.status, VariantStatus::Failed);
    let reason = assert_some!(record.failed_reason);
    assert!(reason.contains("render failed"), "reason: {}", reason);
}

#[tokio::test(start_paused = true)]
async fn slow_download_breaches_the_step_budget() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(16), "image/png");
    let record = admit_record(&env, "pic.png", 8, 8, ImageFormat::Png).await;
    let job = lease_job(&env, &record).await;

    let slow = Arc::new(SlowObjectStore::new(
        env.objects.clone(),
        Duration::from_secs(300),
    ));
    let pipeline = ResizePipeline::new(env.store.clone(), slow);
    let err = assert_err!(pipeline.execute(&job, env.queue.as_ref()).await);
    match err {
        Error::Timeout { step, timeout } => {
            assert_eq!(step, "download");
            assert_eq!(timeout, Duration::from_secs(120));
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    let record = assert_some!(env.store.find_by_id(&record.id).await.unwrap());
    assert_eq!(record.status, VariantStatus::Failed);
    let reason = assert_some!(record.failed_reason);
    assert!(reason.contains("timed out"), "reason: {}", reason);
}

#[tokio::test]
async fn tight_budgets_are_configurable() {
    let env = test_env();
    env.objects
        .insert_object("pic.png", png_fixture(64), "image/png");
    let record = admit_record(&env, "pic.png", 32, 32, ImageFormat::Jpeg).await;
    let job = lease_job(&env, &record).await;

    let mut timeouts = StepTimeouts::default();
    timeouts.download = Duration::from_secs(1);
    let pipeline = ResizePipeline::with_timeouts(env.store.clone(), env.objects.clone(), timeouts);
    assert_ok!(pipeline.execute(&job, env.queue.as_ref()).await);
}
