//! Record store: persistent mapping from image id to [`ImageRecord`].
//!
//! Two backends implement the same port: Postgres for deployments and an
//! in-memory map for tests and single-process development. Per-record
//! updates are linearizable in both; the duplicate-detection bulk read is a
//! snapshot that tolerates concurrent inserts.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryRecordStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRecordStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::record::{
    HashCandidate, ImageRecord, ImageStatus, NewImageRecord, RecordFilter, RecordPatch,
};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Assigns an id and timestamps, sets status PENDING, and persists.
    async fn create(&self, new: NewImageRecord) -> Result<ImageRecord>;

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>>;

    /// Shallow merge of patch fields; bumps `updated_at`. Atomic per record.
    /// Returns `None` when the id is unknown.
    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<Option<ImageRecord>>;

    /// Compare-and-set status transition: applies the patch only when the
    /// record currently has status `from`. Returns `None` when the record is
    /// missing or the precondition fails.
    async fn transition(
        &self,
        id: Uuid,
        from: ImageStatus,
        to: ImageStatus,
        patch: RecordPatch,
    ) -> Result<Option<ImageRecord>>;

    /// Newest-first page of records plus the unpaged total.
    async fn list(
        &self,
        filter: RecordFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ImageRecord>, u64)>;

    /// Every PROCESSED record carrying a perceptual hash, projected down to
    /// what duplicate detection needs.
    async fn find_processed_with_hash(&self) -> Result<Vec<HashCandidate>>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}
