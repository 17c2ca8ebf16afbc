//! Persistent image records and the patch/filter types the record store
//! operates on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Admission state of an uploaded image.
///
/// Transitions are monotone: `Pending → Processing → {Processed, Failed}`.
/// Legacy literals ("REJECTED", "ERROR") from earlier deployments normalize
/// to [`ImageStatus::Failed`] on read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageStatus {
    Pending,
    Processing,
    Processed,
    #[serde(alias = "REJECTED", alias = "ERROR")]
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "PENDING",
            ImageStatus::Processing => "PROCESSING",
            ImageStatus::Processed => "PROCESSED",
            ImageStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageStatus::Processed | ImageStatus::Failed)
    }
}

impl FromStr for ImageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ImageStatus::Pending),
            "PROCESSING" => Ok(ImageStatus::Processing),
            "PROCESSED" => Ok(ImageStatus::Processed),
            // Legacy status literals normalize to FAILED.
            "FAILED" | "REJECTED" | "ERROR" => Ok(ImageStatus::Failed),
            other => Err(format!("unknown image status: {other}")),
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of machine-readable rejection tags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    SizeValidationFailed,
    MultipleFacesDetected,
    BlurryImageDetected,
    DuplicateImageDetected,
    FormatValidationFailed,
    ProcessingError,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::SizeValidationFailed => "size_validation_failed",
            ValidationCode::MultipleFacesDetected => "multiple_faces_detected",
            ValidationCode::BlurryImageDetected => "blurry_image_detected",
            ValidationCode::DuplicateImageDetected => "duplicate_image_detected",
            ValidationCode::FormatValidationFailed => "format_validation_failed",
            ValidationCode::ProcessingError => "processing_error",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured metadata written atomically alongside status transitions.
///
/// Every key is optional; analyzer diagnostics are forwarded opaquely under
/// `diagnostics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<ValidationCode>,

    /// 32 lowercase hex characters; present on PROCESSED records and on
    /// duplicate rejections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_hash: Option<String>,

    /// Id of the colliding record on a duplicate rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similar_to: Option<Uuid>,

    // Derivative metadata on PROCESSED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<DateTime<Utc>>,

    /// Opaque per-stage diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,

    /// Raw error text, attached only when the development flag is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_error: Option<String>,
}

impl ImageMeta {
    /// True when this record can serve as a duplicate-detection candidate.
    pub fn has_hash(&self) -> bool {
        self.p_hash.is_some()
    }
}

/// The one persistent entity: an uploaded image and its admission outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: Uuid,
    pub original_name: String,
    pub original_size: u64,
    /// Blob-store key of the uploaded original.
    pub original_path: String,
    /// Blob-store key of the canonical derivative; set iff status is PROCESSED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_size: Option<u64>,
    /// Lowercase extension of the upload.
    pub file_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub status: ImageStatus,
    pub meta_data: ImageMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields for record creation; the store assigns id,
/// timestamps, and the initial PENDING status.
#[derive(Debug, Clone)]
pub struct NewImageRecord {
    pub original_name: String,
    pub original_size: u64,
    pub original_path: String,
    pub file_type: String,
}

/// Shallow field merge applied atomically to one record.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub status: Option<ImageStatus>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub processed_path: Option<String>,
    pub processed_size: Option<u64>,
    /// Replaces the metadata map wholesale when present.
    pub meta: Option<ImageMeta>,
    /// Resets derivative fields (processed path/size, dimensions) to absent.
    pub clear_processed: bool,
}

impl RecordPatch {
    pub fn status(status: ImageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Applies the patch in place, bumping `updated_at`.
    pub fn apply(&self, record: &mut ImageRecord) {
        if self.clear_processed {
            record.processed_path = None;
            record.processed_size = None;
            record.width = None;
            record.height = None;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(width) = self.width {
            record.width = Some(width);
        }
        if let Some(height) = self.height {
            record.height = Some(height);
        }
        if let Some(ref path) = self.processed_path {
            record.processed_path = Some(path.clone());
        }
        if let Some(size) = self.processed_size {
            record.processed_size = Some(size);
        }
        if let Some(ref meta) = self.meta {
            record.meta_data = meta.clone();
        }
        record.updated_at = Utc::now();
    }
}

/// Optional constraints for listing queries.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub status: Option<ImageStatus>,
}

/// Projection used by duplicate detection: only what the hash comparison
/// needs, never the full record.
#[derive(Debug, Clone)]
pub struct HashCandidate {
    pub id: Uuid,
    pub original_name: String,
    pub meta_data: ImageMeta,
}
