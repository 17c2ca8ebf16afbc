//! Admission service: the entry point uploads, listings, deletes, and
//! manual re-processing go through.
//!
//! Uploads persist bytes and a PENDING record, then hand the id to a
//! bounded background worker pool. An in-flight guard keeps runs
//! single-writer per image id; saturation queues runs without refusing
//! uploads.

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blob::{BlobStore, Namespace};
use crate::error::{AdmissionError, Result};
use crate::pipeline::Pipeline;
use crate::record::{ImageRecord, ImageStatus, NewImageRecord, RecordFilter};
use crate::settings::AnalyzerSettings;
use crate::store::RecordStore;

/// One file of an upload batch, as received from the HTTP layer.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub original_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// Immediate per-file answer to an upload; the pipeline continues in the
/// background.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub id: Uuid,
    pub status: ImageStatus,
    pub original_name: String,
}

/// A record decorated with read URLs for its blobs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageWithUrls {
    #[serde(flatten)]
    pub record: ImageRecord,
    pub original_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AdmissionOptions {
    /// Maximum concurrently executing pipeline runs.
    pub worker_concurrency: usize,
    /// Read-URL lifetime for backends that honor one.
    pub signed_url_ttl: Duration,
    /// Attach raw analyzer errors to failed records.
    pub dev_mode: bool,
}

impl Default for AdmissionOptions {
    fn default() -> Self {
        Self {
            worker_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            signed_url_ttl: Duration::from_secs(3600),
            dev_mode: false,
        }
    }
}

#[derive(Clone)]
pub struct AdmissionService {
    inner: Arc<Inner>,
}

struct Inner {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    pipeline: Pipeline,
    permits: Semaphore,
    in_flight: DashMap<Uuid, ()>,
    shutting_down: AtomicBool,
    signed_url_ttl: Duration,
}

impl std::fmt::Debug for AdmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("in_flight", &self.inner.in_flight.len())
            .field("permits_available", &self.inner.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl AdmissionService {
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        settings: Arc<AnalyzerSettings>,
        options: AdmissionOptions,
    ) -> Self {
        let pipeline = Pipeline::new(
            Arc::clone(&records),
            Arc::clone(&blobs),
            settings,
            options.dev_mode,
        );
        Self {
            inner: Arc::new(Inner {
                records,
                blobs,
                pipeline,
                permits: Semaphore::new(options.worker_concurrency.max(1)),
                in_flight: DashMap::new(),
                shutting_down: AtomicBool::new(false),
                signed_url_ttl: options.signed_url_ttl,
            }),
        }
    }

    /// Stores each file, creates its PENDING record, and schedules a
    /// pipeline run. Failures are isolated per file: successful creations
    /// persist even when siblings fail.
    pub async fn upload_batch(&self, files: Vec<UploadFile>) -> Result<Vec<UploadSummary>> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(AdmissionError::Unavailable("shutting down".into()));
        }

        let mut summaries = Vec::with_capacity(files.len());
        let mut first_error = None;

        for file in files {
            match self.admit_one(file).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    warn!("upload failed for one file: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        if summaries.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(summaries)
    }

    async fn admit_one(&self, file: UploadFile) -> Result<UploadSummary> {
        let file_type = extension_of(&file.original_name);
        let leaf = format!("{}.{file_type}", Uuid::new_v4());
        let original_path = self
            .inner
            .blobs
            .put(Namespace::Original, &leaf, file.bytes.clone(), &file.content_type)
            .await?;

        let record = self
            .inner
            .records
            .create(NewImageRecord {
                original_name: file.original_name,
                original_size: file.bytes.len() as u64,
                original_path,
                file_type,
            })
            .await?;

        info!(id = %record.id, name = %record.original_name, "upload admitted, pipeline scheduled");
        self.schedule(record.id);

        Ok(UploadSummary {
            id: record.id,
            status: record.status,
            original_name: record.original_name,
        })
    }

    /// Queues a pipeline run for `id`. A no-op when a run is already in
    /// flight; the running worker re-checks for a PENDING reset before it
    /// releases the id, so resets during a run are not lost.
    fn schedule(&self, id: Uuid) {
        use dashmap::mapref::entry::Entry;

        match self.inner.in_flight.entry(id) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            'guard: loop {
                loop {
                    let Ok(_permit) = inner.permits.acquire().await else {
                        break;
                    };
                    if let Err(e) = inner.pipeline.run(id).await {
                        error!(%id, "pipeline run errored: {e}");
                        break;
                    }

                    // Run again when the record was reset to PENDING
                    // underneath the finished run (manual reprocess racing
                    // a worker).
                    if !pending_again(&inner, id).await {
                        break;
                    }
                }

                inner.in_flight.remove(&id);

                // A reset may have slipped in between the last check and
                // the guard release; reclaim the id rather than strand a
                // PENDING record.
                if pending_again(&inner, id).await {
                    match inner.in_flight.entry(id) {
                        Entry::Vacant(slot) => {
                            slot.insert(());
                            continue 'guard;
                        }
                        Entry::Occupied(_) => break,
                    }
                }
                break;
            }
        });
    }

    /// Paginated listing, newest first, with minted URLs.
    pub async fn list(
        &self,
        status: Option<ImageStatus>,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<ImageWithUrls>, u64)> {
        if page < 1 || limit < 1 {
            return Err(AdmissionError::InvalidRequest(
                "page and limit must be at least 1".into(),
            ));
        }

        let (records, total) = self
            .inner
            .records
            .list(RecordFilter { status }, (page - 1) * limit, limit)
            .await?;

        let mut decorated = Vec::with_capacity(records.len());
        for record in records {
            decorated.push(self.with_urls(record).await?);
        }
        Ok((decorated, total))
    }

    pub async fn get(&self, id: Uuid) -> Result<ImageWithUrls> {
        let record = self
            .inner
            .records
            .get(id)
            .await?
            .ok_or_else(|| AdmissionError::NotFound(format!("image {id}")))?;
        self.with_urls(record).await
    }

    /// Removes blobs first, then the record. Blob-delete failures are
    /// logged and tolerated; the record still disappears.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let record = self
            .inner
            .records
            .get(id)
            .await?
            .ok_or_else(|| AdmissionError::NotFound(format!("image {id}")))?;

        if let Err(e) = self.inner.blobs.delete(&record.original_path).await {
            warn!(%id, "failed to delete original blob: {e}");
        }
        if let Some(processed) = &record.processed_path {
            if let Err(e) = self.inner.blobs.delete(processed).await {
                warn!(%id, "failed to delete processed blob: {e}");
            }
        }

        self.inner.records.delete(id).await?;
        info!(%id, "image deleted");
        Ok(())
    }

    /// Resets a non-PROCESSED record to PENDING and schedules a fresh run.
    pub async fn reprocess(&self, id: Uuid) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(AdmissionError::Unavailable("shutting down".into()));
        }

        let record = self
            .inner
            .records
            .get(id)
            .await?
            .ok_or_else(|| AdmissionError::NotFound(format!("image {id}")))?;
        if record.status == ImageStatus::Processed {
            return Err(AdmissionError::AlreadyProcessed);
        }

        let patch = crate::record::RecordPatch {
            status: Some(ImageStatus::Pending),
            meta: Some(crate::record::ImageMeta::default()),
            clear_processed: true,
            ..crate::record::RecordPatch::default()
        };
        self.inner.records.update(id, patch).await?;
        info!(%id, "image queued for re-processing");
        self.schedule(id);
        Ok(())
    }

    /// Stops accepting work and waits for in-flight runs to drain, up to
    /// `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        while !self.inner.in_flight.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.inner.in_flight.len();
        if remaining > 0 {
            warn!(remaining, "shutdown timeout reached with runs still in flight");
        }
    }

    async fn with_urls(&self, record: ImageRecord) -> Result<ImageWithUrls> {
        let ttl = self.inner.signed_url_ttl;
        let original_url = self.inner.blobs.signed_url(&record.original_path, ttl).await?;
        let processed_url = match &record.processed_path {
            Some(path) => Some(self.inner.blobs.signed_url(path, ttl).await?),
            None => None,
        };
        Ok(ImageWithUrls {
            record,
            original_url,
            processed_url,
        })
    }
}

async fn pending_again(inner: &Inner, id: Uuid) -> bool {
    !inner.shutting_down.load(Ordering::SeqCst)
        && matches!(
            inner.records.get(id).await,
            Ok(Some(record)) if record.status == ImageStatus::Pending
        )
}

/// Lowercase extension of an uploaded filename; bare names fall back to
/// a generic binary tag so the storage key still has a suffix.
fn extension_of(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}
