//! In-memory record store used by tests and single-process deployments.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::record::{
    HashCandidate, ImageMeta, ImageRecord, ImageStatus, NewImageRecord, RecordFilter, RecordPatch,
};
use crate::store::RecordStore;

/// DashMap-backed store. Entry-level locking gives the same per-record
/// linearizability the Postgres backend gets from row locks.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<Uuid, ImageRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, new: NewImageRecord) -> Result<ImageRecord> {
        let now = Utc::now();
        let record = ImageRecord {
            id: Uuid::new_v4(),
            original_name: new.original_name,
            original_size: new.original_size,
            original_path: new.original_path,
            processed_path: None,
            processed_size: None,
            file_type: new.file_type,
            width: None,
            height: None,
            status: ImageStatus::Pending,
            meta_data: ImageMeta::default(),
            created_at: now,
            updated_at: now,
        };
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        Ok(self.records.get(&id).map(|entry| entry.clone()))
    }

    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<Option<ImageRecord>> {
        Ok(self.records.get_mut(&id).map(|mut entry| {
            patch.apply(entry.value_mut());
            entry.clone()
        }))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: ImageStatus,
        to: ImageStatus,
        mut patch: RecordPatch,
    ) -> Result<Option<ImageRecord>> {
        patch.status = Some(to);
        let updated = self.records.get_mut(&id).and_then(|mut entry| {
            if entry.status != from {
                return None;
            }
            patch.apply(entry.value_mut());
            Some(entry.clone())
        });
        Ok(updated)
    }

    async fn list(
        &self,
        filter: RecordFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ImageRecord>, u64)> {
        let mut matching: Vec<ImageRecord> = self
            .records
            .iter()
            .filter(|entry| {
                filter
                    .status
                    .map(|status| entry.status == status)
                    .unwrap_or(true)
            })
            .map(|entry| entry.clone())
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn find_processed_with_hash(&self) -> Result<Vec<HashCandidate>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.status == ImageStatus::Processed && entry.meta_data.has_hash())
            .map(|entry| HashCandidate {
                id: entry.id,
                original_name: entry.original_name.clone(),
                meta_data: entry.meta_data.clone(),
            })
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.records.remove(&id).is_some())
    }
}
