//! End-to-end admission scenarios over the in-memory record store and a
//! temp-dir blob store.

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use photogate_core::{
    AdmissionOptions, AdmissionService, AnalyzerSettings, ImageStatus, LocalBlobStore,
    MemoryRecordStore, Pipeline, RecordStore, UploadFile, ValidationCode,
};

struct Harness {
    _dir: tempfile::TempDir,
    records: Arc<MemoryRecordStore>,
    service: AdmissionService,
    pipeline: Pipeline,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let records: Arc<MemoryRecordStore> = Arc::new(MemoryRecordStore::new());
    let blobs = Arc::new(LocalBlobStore::new(
        dir.path().to_path_buf(),
        "http://localhost:3000/uploads",
    ));
    let settings = Arc::new(AnalyzerSettings::default());

    let service = AdmissionService::new(
        records.clone(),
        blobs.clone(),
        settings.clone(),
        AdmissionOptions {
            worker_concurrency: 2,
            ..AdmissionOptions::default()
        },
    );
    let pipeline = Pipeline::new(records.clone(), blobs, settings, false);

    Harness {
        _dir: dir,
        records,
        service,
        pipeline,
    }
}

fn upload(name: &str, bytes: Vec<u8>) -> UploadFile {
    UploadFile {
        original_name: name.to_string(),
        content_type: "image/png".to_string(),
        bytes: Bytes::from(bytes),
    }
}

async fn wait_terminal(records: &MemoryRecordStore, id: Uuid) -> photogate_core::ImageRecord {
    for _ in 0..6000 {
        if let Some(record) = records.get(id).await.unwrap() {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("record {id} never reached a terminal status");
}

fn noise(width: u32, height: u32, seed: u64) -> DynamicImage {
    let mut state = seed | 1;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) as u8
    };
    let mut img = RgbImage::new(width, height);
    for pixel in img.pixels_mut() {
        *pixel = Rgb([next(), next(), next()]);
    }
    DynamicImage::ImageRgb8(img)
}

/// Dark noisy left half, bright noisy right half: large files, strong color
/// spread, no compression surprises.
fn split_noise(width: u32, height: u32) -> DynamicImage {
    let mut state = 12345u64;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((state >> 33) & 0x1f) as u8
    };
    let mut img = RgbImage::new(width, height);
    for (x, _y, pixel) in img.enumerate_pixels_mut() {
        let base = if x < width / 2 { 20 } else { 200 };
        let jitter = next();
        *pixel = Rgb([base + jitter, base + jitter, base + jitter]);
    }
    DynamicImage::ImageRgb8(img)
}

fn png(img: &DynamicImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn jpeg(img: &DynamicImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

#[tokio::test]
async fn sharp_unique_image_is_accepted_with_a_derivative() {
    let h = harness();
    let bytes = png(&noise(900, 900, 1));
    assert!(bytes.len() as u64 >= 100 * 1024);

    let summaries = h.service.upload_batch(vec![upload("unique.png", bytes)]).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].status, ImageStatus::Pending);

    let record = wait_terminal(&h.records, summaries[0].id).await;
    assert_eq!(record.status, ImageStatus::Processed);

    // processedPath present iff PROCESSED, and the derivative really is a
    // bounded JPEG.
    let processed_path = record.processed_path.as_deref().expect("derivative key");
    assert!(processed_path.starts_with("processed/"));
    let meta = &record.meta_data;
    assert!(meta.width.unwrap() <= 800);
    assert!(meta.height.unwrap() <= 800);
    assert_eq!(meta.format.as_deref(), Some("jpeg"));

    let p_hash = meta.p_hash.as_deref().expect("pHash");
    assert_eq!(p_hash.len(), 32);
    assert!(p_hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    // Original dimensions were recorded along the way.
    assert_eq!(record.width, Some(900));
    assert_eq!(record.height, Some(900));
}

#[tokio::test]
async fn undersized_resolution_fails_quoting_both_geometries() {
    let h = harness();
    let summaries = h
        .service
        .upload_batch(vec![upload("small.png", png(&noise(500, 500, 2)))])
        .await
        .unwrap();

    let record = wait_terminal(&h.records, summaries[0].id).await;
    assert_eq!(record.status, ImageStatus::Failed);
    assert!(record.processed_path.is_none());
    assert_eq!(
        record.meta_data.validation_errors,
        vec![ValidationCode::SizeValidationFailed]
    );
    let reason = record.meta_data.rejection_reason.as_deref().unwrap();
    assert!(reason.contains("800x800"), "{reason}");
    assert!(reason.contains("500x500"), "{reason}");
}

#[tokio::test]
async fn undersized_file_fails_quoting_kilobytes() {
    let h = harness();
    // Flat 900x900 PNG: plenty of pixels, almost no bytes.
    let bytes = png(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
        900,
        900,
        Rgb([64, 64, 64]),
    )));
    let observed = format!("{:.1}KB", bytes.len() as f64 / 1024.0);
    assert!((bytes.len() as u64) < 100 * 1024);

    let summaries = h.service.upload_batch(vec![upload("tiny.png", bytes)]).await.unwrap();
    let record = wait_terminal(&h.records, summaries[0].id).await;

    assert_eq!(record.status, ImageStatus::Failed);
    assert_eq!(
        record.meta_data.validation_errors,
        vec![ValidationCode::SizeValidationFailed]
    );
    let reason = record.meta_data.rejection_reason.as_deref().unwrap();
    assert!(reason.contains("100KB"), "{reason}");
    assert!(reason.contains(&observed), "{reason}");
}

#[tokio::test]
async fn reupload_of_an_accepted_image_is_a_duplicate() {
    let h = harness();
    let bytes = png(&noise(900, 900, 3));

    let first = h
        .service
        .upload_batch(vec![upload("portrait.png", bytes.clone())])
        .await
        .unwrap();
    let original = wait_terminal(&h.records, first[0].id).await;
    assert_eq!(original.status, ImageStatus::Processed);

    let second = h
        .service
        .upload_batch(vec![upload("portrait.png", bytes)])
        .await
        .unwrap();
    let duplicate = wait_terminal(&h.records, second[0].id).await;

    assert_eq!(duplicate.status, ImageStatus::Failed);
    assert_eq!(
        duplicate.meta_data.validation_errors,
        vec![ValidationCode::DuplicateImageDetected]
    );
    assert_eq!(duplicate.meta_data.similar_to, Some(original.id));
    // The computed hash still persists on the duplicate reject.
    assert_eq!(duplicate.meta_data.p_hash, original.meta_data.p_hash);
    let reason = duplicate.meta_data.rejection_reason.as_deref().unwrap();
    assert!(reason.contains(&original.id.to_string()), "{reason}");
    assert!(reason.contains("portrait.png"), "{reason}");
}

#[tokio::test]
async fn gaussian_blur_is_rejected() {
    let h = harness();
    let blurred = noise(900, 900, 4).blur(8.0);
    let bytes = png(&blurred);
    assert!(bytes.len() as u64 >= 100 * 1024, "fixture must clear the size gate");

    let summaries = h.service.upload_batch(vec![upload("blurry.png", bytes)]).await.unwrap();
    let record = wait_terminal(&h.records, summaries[0].id).await;

    assert_eq!(record.status, ImageStatus::Failed);
    assert_eq!(
        record.meta_data.validation_errors,
        vec![ValidationCode::BlurryImageDetected]
    );
}

#[tokio::test]
async fn very_large_landscape_fails_the_face_gate() {
    let h = harness();
    let bytes = jpeg(&split_noise(6000, 3000));
    assert!(bytes.len() as u64 >= 100 * 1024);

    let summaries = h.service.upload_batch(vec![upload("crowd.jpg", bytes)]).await.unwrap();
    let record = wait_terminal(&h.records, summaries[0].id).await;

    assert_eq!(record.status, ImageStatus::Failed);
    assert_eq!(
        record.meta_data.validation_errors,
        vec![ValidationCode::MultipleFacesDetected]
    );
}

#[tokio::test]
async fn reprocess_resets_failed_records_and_reruns() {
    let h = harness();
    let summaries = h
        .service
        .upload_batch(vec![upload("small.png", png(&noise(500, 500, 5)))])
        .await
        .unwrap();
    let id = summaries[0].id;
    let failed = wait_terminal(&h.records, id).await;
    assert_eq!(failed.status, ImageStatus::Failed);

    h.service.reprocess(id).await.unwrap();
    let rerun = wait_terminal(&h.records, id).await;
    assert_eq!(rerun.status, ImageStatus::Failed);
    assert_eq!(
        rerun.meta_data.validation_errors,
        vec![ValidationCode::SizeValidationFailed]
    );
}

#[tokio::test]
async fn reprocess_refuses_processed_records() {
    let h = harness();
    let summaries = h
        .service
        .upload_batch(vec![upload("good.png", png(&noise(900, 900, 6)))])
        .await
        .unwrap();
    let id = summaries[0].id;
    let record = wait_terminal(&h.records, id).await;
    assert_eq!(record.status, ImageStatus::Processed);

    let err = h.service.reprocess(id).await.unwrap_err();
    assert!(matches!(err, photogate_core::AdmissionError::AlreadyProcessed));
}

#[tokio::test]
async fn pipeline_run_is_idempotent_off_pending() {
    let h = harness();
    let summaries = h
        .service
        .upload_batch(vec![upload("good.png", png(&noise(900, 900, 7)))])
        .await
        .unwrap();
    let id = summaries[0].id;
    let processed = wait_terminal(&h.records, id).await;

    let unchanged = h.pipeline.run(id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, ImageStatus::Processed);
    assert_eq!(unchanged.updated_at, processed.updated_at);
    assert_eq!(unchanged.processed_path, processed.processed_path);
}

#[tokio::test]
async fn delete_during_a_run_is_tolerated() {
    let h = harness();
    let summaries = h
        .service
        .upload_batch(vec![upload("doomed.png", png(&noise(900, 900, 8)))])
        .await
        .unwrap();
    let id = summaries[0].id;

    // Delete while the background run is (most likely) still going.
    h.service.delete(id).await.unwrap();

    // Whatever the interleaving, the record must end up absent and nothing
    // may panic or wedge the worker.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.records.get(id).await.unwrap().is_none());

    // The worker pool is still healthy afterwards.
    let after = h
        .service
        .upload_batch(vec![upload("after.png", png(&noise(900, 900, 9)))])
        .await
        .unwrap();
    let record = wait_terminal(&h.records, after[0].id).await;
    assert_eq!(record.status, ImageStatus::Processed);
}

#[tokio::test]
async fn deleting_processed_images_removes_both_blobs() {
    let h = harness();
    let summaries = h
        .service
        .upload_batch(vec![upload("gone.png", png(&noise(900, 900, 10)))])
        .await
        .unwrap();
    let id = summaries[0].id;
    let record = wait_terminal(&h.records, id).await;
    assert_eq!(record.status, ImageStatus::Processed);

    h.service.delete(id).await.unwrap();
    assert!(h.records.get(id).await.unwrap().is_none());
    let err = h.service.get(id).await.unwrap_err();
    assert!(matches!(err, photogate_core::AdmissionError::NotFound(_)));
}

#[tokio::test]
async fn shutdown_refuses_new_work_after_draining() {
    let h = harness();
    h.service.shutdown(Duration::from_secs(5)).await;

    let err = h
        .service
        .upload_batch(vec![upload("late.png", png(&noise(900, 900, 11)))])
        .await
        .unwrap_err();
    assert!(matches!(err, photogate_core::AdmissionError::Unavailable(_)));
}
