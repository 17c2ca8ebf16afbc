//! Pipeline orchestrator: runs the analyzer stages in a fixed order against
//! one record, threading verdicts into atomic status transitions.
//!
//! Stage order is cheapest-first: size, then the face and blur heuristics,
//! then duplicate detection last because it reads the whole accepted corpus.
//! CPU-bound stage work runs on the blocking-task pool.

use bytes::Bytes;
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::{blur, faces, phash, size, Verdict};
use crate::blob::{BlobStore, Namespace};
use crate::error::{AdmissionError, Result};
use crate::record::{ImageMeta, ImageRecord, ImageStatus, RecordPatch, ValidationCode};
use crate::settings::AnalyzerSettings;
use crate::store::RecordStore;

pub struct Pipeline {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    settings: Arc<AnalyzerSettings>,
    /// Attach raw analyzer errors to failed records.
    dev_mode: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("dev_mode", &self.dev_mode)
            .finish_non_exhaustive()
    }
}

/// Outcome of the stage sequence for one image.
enum StageResult {
    Rejected {
        code: ValidationCode,
        message: String,
        diagnostics: Value,
        p_hash: Option<String>,
        similar_to: Option<Uuid>,
    },
    Accepted {
        p_hash: String,
    },
}

impl Pipeline {
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        settings: Arc<AnalyzerSettings>,
        dev_mode: bool,
    ) -> Self {
        Self {
            records,
            blobs,
            settings,
            dev_mode,
        }
    }

    /// Runs the admission pipeline for `id`.
    ///
    /// Idempotent on any status other than PENDING: the record is returned
    /// unchanged. Returns `None` when the record does not exist (including
    /// deletion mid-run, which is a tolerated no-op).
    pub async fn run(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        let Some(record) = self.records.get(id).await? else {
            return Ok(None);
        };
        if record.status != ImageStatus::Pending {
            debug!(%id, status = %record.status, "pipeline run skipped, record not pending");
            return Ok(Some(record));
        }

        // Claim the record. Losing the race means another run owns it.
        let Some(record) = self
            .records
            .transition(id, ImageStatus::Pending, ImageStatus::Processing, RecordPatch::default())
            .await?
        else {
            return self.records.get(id).await;
        };

        info!(%id, name = %record.original_name, "admission pipeline started");

        let bytes = match self.blobs.get(&record.original_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%id, "original blob unavailable: {e}");
                return self
                    .fail(
                        &record,
                        ValidationCode::ProcessingError,
                        "Image processing failed".to_string(),
                        Value::Null,
                        None,
                        None,
                        Some(e.to_string()),
                    )
                    .await;
            }
        };

        match self.run_stages(&record, bytes.clone()).await {
            Ok(StageResult::Rejected {
                code,
                message,
                diagnostics,
                p_hash,
                similar_to,
            }) => {
                info!(%id, %code, "image rejected: {message}");
                self.fail(&record, code, message, diagnostics, p_hash, similar_to, None)
                    .await
            }
            Ok(StageResult::Accepted { p_hash }) => self.finish(&record, bytes, p_hash).await,
            Err(e) => {
                error!(%id, "pipeline error: {e}");
                let (code, message) = categorize_failure(&e.to_string());
                self.fail(
                    &record,
                    code,
                    message.to_string(),
                    Value::Null,
                    None,
                    None,
                    Some(e.to_string()),
                )
                .await
            }
        }
    }

    /// Stages in order; the first reject wins.
    async fn run_stages(&self, record: &ImageRecord, bytes: Bytes) -> Result<StageResult> {
        let settings = Arc::clone(&self.settings);

        // a. Size: cheapest, runs first.
        let verdict = {
            let bytes = bytes.clone();
            let settings = Arc::clone(&settings);
            spawn_stage(move || size::analyze(&bytes, &settings.size)).await??
        };
        match verdict {
            Verdict::Reject {
                code,
                message,
                diagnostics,
            } => {
                return Ok(StageResult::Rejected {
                    code,
                    message,
                    diagnostics,
                    p_hash: None,
                    similar_to: None,
                })
            }
            Verdict::Accept { ref diagnostics } => {
                // Observed original dimensions become part of the record as
                // soon as they are known.
                let patch = RecordPatch {
                    width: diagnostics["width"].as_u64().map(|w| w as u32),
                    height: diagnostics["height"].as_u64().map(|h| h as u32),
                    ..RecordPatch::default()
                };
                self.records.update(record.id, patch).await?;
            }
        }

        // b. Face heuristic, guarded with the portrait override. The stage
        // is fail-open end to end, so an analyzer problem can only ever
        // surface as an Accept, never abort the pipeline.
        let verdict = {
            let bytes = bytes.clone();
            let settings = Arc::clone(&settings);
            spawn_stage(move || faces::analyze_guarded(&bytes, &settings.faces)).await?
        };
        if let Verdict::Reject {
            code,
            message,
            diagnostics,
        } = verdict
        {
            return Ok(StageResult::Rejected {
                code,
                message,
                diagnostics,
                p_hash: None,
                similar_to: None,
            });
        }

        // c. Blur heuristic.
        let verdict = {
            let bytes = bytes.clone();
            let settings = Arc::clone(&settings);
            spawn_stage(move || blur::analyze(&bytes, &settings.blur)).await??
        };
        if let Verdict::Reject {
            code,
            message,
            diagnostics,
        } = verdict
        {
            return Ok(StageResult::Rejected {
                code,
                message,
                diagnostics,
                p_hash: None,
                similar_to: None,
            });
        }

        // d. Perceptual hash plus duplicate check, last because it needs a
        // corpus-wide read.
        let p_hash = {
            let bytes = bytes.clone();
            spawn_stage(move || phash::compute(&bytes)).await??
        };

        // Corpus scan is fail-open: never turn a lookup problem into a
        // user-facing rejection.
        let candidates = match self.records.find_processed_with_hash().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(id = %record.id, "duplicate corpus scan failed, skipping check: {e}");
                Vec::new()
            }
        };
        let candidates: Vec<_> = candidates.into_iter().filter(|c| c.id != record.id).collect();

        if let Some(hit) = phash::find_duplicate(
            &p_hash,
            &record.original_name,
            &candidates,
            &self.settings.duplicate,
        ) {
            let verdict = phash::duplicate_verdict(&hit);
            if let Verdict::Reject {
                code,
                message,
                diagnostics,
            } = verdict
            {
                return Ok(StageResult::Rejected {
                    code,
                    message,
                    diagnostics,
                    p_hash: Some(p_hash),
                    similar_to: Some(hit.id),
                });
            }
        }

        Ok(StageResult::Accepted { p_hash })
    }

    /// Builds and persists the canonical derivative, then commits PROCESSED.
    async fn finish(
        &self,
        record: &ImageRecord,
        bytes: Bytes,
        p_hash: String,
    ) -> Result<Option<ImageRecord>> {
        let rules = self.settings.derivative.clone();
        let (jpeg, width, height) =
            spawn_stage(move || make_derivative(&bytes, rules.max_width, rules.max_height, rules.jpeg_quality))
                .await??;

        let leaf = derivative_leaf(&record.original_name, Utc::now().timestamp_millis());
        let processed_size = jpeg.len() as u64;
        let processed_path = self
            .blobs
            .put(Namespace::Processed, &leaf, Bytes::from(jpeg), "image/jpeg")
            .await?;

        let meta = ImageMeta {
            p_hash: Some(p_hash),
            width: Some(width),
            height: Some(height),
            format: Some("jpeg".to_string()),
            processing_time: Some(Utc::now()),
            ..ImageMeta::default()
        };
        let patch = RecordPatch {
            processed_path: Some(processed_path.clone()),
            processed_size: Some(processed_size),
            meta: Some(meta),
            ..RecordPatch::default()
        };

        let updated = self
            .records
            .transition(record.id, ImageStatus::Processing, ImageStatus::Processed, patch)
            .await?;
        if updated.is_none() {
            // Deleted mid-run: tolerated no-op, but don't orphan the derivative.
            debug!(id = %record.id, "record vanished before completion");
            let _ = self.blobs.delete(&processed_path).await;
        } else {
            info!(id = %record.id, "image accepted");
        }
        Ok(updated)
    }

    /// Commits FAILED with the rejecting stage's verdict.
    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        record: &ImageRecord,
        code: ValidationCode,
        message: String,
        diagnostics: Value,
        p_hash: Option<String>,
        similar_to: Option<Uuid>,
        raw_error: Option<String>,
    ) -> Result<Option<ImageRecord>> {
        let meta = ImageMeta {
            rejection_reason: Some(message),
            validation_errors: vec![code],
            diagnostics: (!diagnostics.is_null()).then_some(diagnostics),
            p_hash,
            similar_to,
            raw_error: raw_error.filter(|_| self.dev_mode),
            ..ImageMeta::default()
        };
        let patch = RecordPatch {
            meta: Some(meta),
            ..RecordPatch::default()
        };
        let updated = self
            .records
            .transition(record.id, ImageStatus::Processing, ImageStatus::Failed, patch)
            .await?;
        if updated.is_none() {
            debug!(id = %record.id, "record vanished before failure could be recorded");
        }
        Ok(updated)
    }
}

async fn spawn_stage<T: Send + 'static>(work: impl FnOnce() -> T + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AdmissionError::Internal(format!("stage task failed: {e}")))
}

/// Fit within `max_width` x `max_height` without enlargement, re-encoded as
/// JPEG at the configured quality.
fn make_derivative(
    bytes: &[u8],
    max_width: u32,
    max_height: u32,
    quality: u8,
) -> Result<(Vec<u8>, u32, u32)> {
    let img = image::load_from_memory(bytes)?;
    let img = if img.width() > max_width || img.height() > max_height {
        img.resize(max_width, max_height, FilterType::Lanczos3)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    rgb.write_with_encoder(encoder)?;
    Ok((out, width, height))
}

/// `processed/` key leaf: original basename plus a time suffix.
fn derivative_leaf(original_name: &str, timestamp_millis: i64) -> String {
    let stem = std::path::Path::new(original_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let stem: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{stem}-{timestamp_millis}.jpg")
}

/// Maps an uncaught pipeline error onto a user-facing code and message.
fn categorize_failure(error_text: &str) -> (ValidationCode, &'static str) {
    let lowered = error_text.to_ascii_lowercase();
    if lowered.contains("duplicate") {
        (
            ValidationCode::DuplicateImageDetected,
            "This image appears to be a duplicate of an existing image.",
        )
    } else if lowered.contains("resolution") || lowered.contains("dimensions") {
        (
            ValidationCode::SizeValidationFailed,
            "Image resolution is too low. Please upload a higher resolution image.",
        )
    } else if lowered.contains("size") {
        (
            ValidationCode::SizeValidationFailed,
            "Image file size is too small. Please upload a larger image.",
        )
    } else if lowered.contains("format") || lowered.contains("unsupported") {
        (
            ValidationCode::FormatValidationFailed,
            "Unsupported image format. Please upload a JPEG, PNG, or HEIC image.",
        )
    } else if lowered.contains("face") {
        (
            ValidationCode::MultipleFacesDetected,
            "Multiple faces detected. Please upload a photo with only one person.",
        )
    } else {
        (ValidationCode::ProcessingError, "Image processing failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_categorizer_follows_the_substring_map() {
        let cases = [
            ("found a Duplicate image", ValidationCode::DuplicateImageDetected),
            ("bad resolution", ValidationCode::SizeValidationFailed),
            ("image dimensions unreadable", ValidationCode::SizeValidationFailed),
            ("file size too small", ValidationCode::SizeValidationFailed),
            ("The image format could not be determined", ValidationCode::FormatValidationFailed),
            ("unsupported codec", ValidationCode::FormatValidationFailed),
            ("face detector exploded", ValidationCode::MultipleFacesDetected),
            ("something else entirely", ValidationCode::ProcessingError),
        ];
        for (input, expected) in cases {
            let (code, _) = categorize_failure(input);
            assert_eq!(code, expected, "input: {input}");
        }
    }

    #[test]
    fn resolution_outranks_size_in_the_substring_map() {
        // "resolution" messages frequently mention a size too.
        let (code, message) = categorize_failure("resolution below size floor");
        assert_eq!(code, ValidationCode::SizeValidationFailed);
        assert!(message.contains("resolution"));
    }

    #[test]
    fn derivative_fits_within_bounds_without_enlargement() {
        use crate::analysis::testutil::{encode_png, lcg_noise};

        // Larger than the box on one side: scaled down, aspect preserved.
        let bytes = encode_png(&lcg_noise(1600, 1200, 5));
        let (jpeg, width, height) = make_derivative(&bytes, 800, 800, 80).unwrap();
        assert!(width <= 800 && height <= 800);
        assert_eq!((width, height), (800, 600));
        assert_eq!(image::guess_format(&jpeg).unwrap(), image::ImageFormat::Jpeg);

        // Smaller than the box: untouched dimensions.
        let bytes = encode_png(&lcg_noise(640, 480, 5));
        let (_, width, height) = make_derivative(&bytes, 800, 800, 80).unwrap();
        assert_eq!((width, height), (640, 480));
    }

    #[test]
    fn derivative_leaf_is_sanitized_and_time_suffixed() {
        assert_eq!(derivative_leaf("my photo.png", 1700000000000), "my_photo-1700000000000.jpg");
        assert_eq!(derivative_leaf("x", 7), "x-7.jpg");
        assert_eq!(derivative_leaf(".hidden", 7), "_hidden-7.jpg");
    }
}
