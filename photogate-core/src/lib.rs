//! # Photogate Core
//!
//! Domain crate for the photo admission service: uploaded images run
//! through a fixed-order pipeline of analyzer stages (size, face
//! heuristic, blur heuristic, perceptual-hash duplicate detection) and
//! either earn a canonical JPEG derivative or a coded rejection. Records
//! live in a pluggable store; bytes live in a pluggable blob store.

pub mod admission;
pub mod analysis;
pub mod blob;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod settings;
pub mod store;

pub use admission::{AdmissionOptions, AdmissionService, ImageWithUrls, UploadFile, UploadSummary};
pub use blob::{BlobStore, LocalBlobStore, Namespace};
#[cfg(feature = "s3")]
pub use blob::S3BlobStore;
pub use error::{AdmissionError, Result};
pub use pipeline::Pipeline;
pub use record::{ImageMeta, ImageRecord, ImageStatus, NewImageRecord, RecordFilter, RecordPatch, ValidationCode};
pub use settings::AnalyzerSettings;
pub use store::{MemoryRecordStore, RecordStore};
#[cfg(feature = "postgres")]
pub use store::PostgresRecordStore;
