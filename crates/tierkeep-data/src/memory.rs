//! In-process store used by tests and database-less deployments.
//!
//! # Design
//! - A single async mutex serialises transactions; each transaction owns the guard.
//! - A snapshot taken at `begin` is restored when the transaction is dropped uncommitted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{DataError, DataResult};
use crate::model::{
    ColdStorageLocation, Criterion, FileInventoryEntry, FileRecord, FileStatus, InventoryFilter,
    MonitoredPath, OperationFailure, PinnedFile, ScanOutcome,
};
use crate::store::{Store, StoreTx};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    paths: HashMap<Uuid, MonitoredPath>,
    criteria: HashMap<Uuid, Criterion>,
    locations: HashMap<Uuid, ColdStorageLocation>,
    inventory: HashMap<Uuid, FileInventoryEntry>,
    records: HashMap<Uuid, FileRecord>,
    pins: Vec<PinnedFile>,
    failures: Vec<OperationFailure>,
}

/// Store keeping every entity in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> DataResult<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

fn sorted_by<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(key);
    items
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_path(&mut self, id: Uuid) -> DataResult<Option<MonitoredPath>> {
        Ok(self.guard.paths.get(&id).cloned())
    }

    async fn list_paths(&mut self) -> DataResult<Vec<MonitoredPath>> {
        let paths = self.guard.paths.values().cloned().collect();
        Ok(sorted_by(paths, |path: &MonitoredPath| path.name.clone()))
    }

    async fn upsert_path(&mut self, path: &MonitoredPath) -> DataResult<()> {
        self.guard.paths.insert(path.id, path.clone());
        Ok(())
    }

    async fn delete_path(&mut self, id: Uuid) -> DataResult<bool> {
        let state = &mut *self.guard;
        let removed = state.paths.remove(&id).is_some();
        state.criteria.retain(|_, criterion| criterion.path_id != id);
        state.inventory.retain(|_, entry| entry.path_id != id);
        state.records.retain(|_, record| record.path_id != id);
        state.pins.retain(|pin| pin.path_id != id);
        Ok(removed)
    }

    async fn set_path_error(&mut self, id: Uuid, message: Option<&str>) -> DataResult<()> {
        if let Some(path) = self.guard.paths.get_mut(&id) {
            path.error_message = message.map(str::to_string);
        }
        Ok(())
    }

    async fn record_scan_outcome(
        &mut self,
        id: Uuid,
        at: DateTime<Utc>,
        outcome: ScanOutcome,
    ) -> DataResult<()> {
        if let Some(path) = self.guard.paths.get_mut(&id) {
            path.last_scan_at = Some(at);
            path.last_scan_outcome = Some(outcome);
        }
        Ok(())
    }

    async fn list_criteria(&mut self, path_id: Uuid) -> DataResult<Vec<Criterion>> {
        let criteria = self
            .guard
            .criteria
            .values()
            .filter(|criterion| criterion.path_id == path_id)
            .cloned()
            .collect();
        Ok(sorted_by(criteria, |criterion: &Criterion| criterion.id))
    }

    async fn upsert_criterion(&mut self, criterion: &Criterion) -> DataResult<()> {
        self.guard.criteria.insert(criterion.id, criterion.clone());
        Ok(())
    }

    async fn delete_criterion(&mut self, id: Uuid) -> DataResult<bool> {
        Ok(self.guard.criteria.remove(&id).is_some())
    }

    async fn get_location(&mut self, id: Uuid) -> DataResult<Option<ColdStorageLocation>> {
        Ok(self.guard.locations.get(&id).cloned())
    }

    async fn list_locations(&mut self) -> DataResult<Vec<ColdStorageLocation>> {
        let locations = self.guard.locations.values().cloned().collect();
        Ok(sorted_by(locations, |location: &ColdStorageLocation| {
            location.name.clone()
        }))
    }

    async fn list_path_locations(
        &mut self,
        path_id: Uuid,
    ) -> DataResult<Vec<ColdStorageLocation>> {
        let state = &*self.guard;
        Ok(state
            .paths
            .get(&path_id)
            .map(|path| {
                path.cold_location_ids
                    .iter()
                    .filter_map(|id| state.locations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_location(&mut self, location: &ColdStorageLocation) -> DataResult<()> {
        self.guard.locations.insert(location.id, location.clone());
        Ok(())
    }

    async fn delete_location(&mut self, id: Uuid) -> DataResult<bool> {
        let state = &mut *self.guard;
        for path in state.paths.values_mut() {
            path.cold_location_ids.retain(|location_id| *location_id != id);
        }
        Ok(state.locations.remove(&id).is_some())
    }

    async fn get_inventory(&mut self, id: Uuid) -> DataResult<Option<FileInventoryEntry>> {
        Ok(self.guard.inventory.get(&id).cloned())
    }

    async fn find_inventory(
        &mut self,
        path_id: Uuid,
        file_path: &Path,
    ) -> DataResult<Option<FileInventoryEntry>> {
        Ok(self
            .guard
            .inventory
            .values()
            .find(|entry| entry.path_id == path_id && entry.file_path == file_path)
            .cloned())
    }

    async fn query_inventory(
        &mut self,
        filter: &InventoryFilter,
    ) -> DataResult<Vec<FileInventoryEntry>> {
        let entries = self
            .guard
            .inventory
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        Ok(sorted_by(entries, |entry: &FileInventoryEntry| {
            entry.file_path.clone()
        }))
    }

    async fn upsert_inventory(
        &mut self,
        entry: &FileInventoryEntry,
    ) -> DataResult<FileInventoryEntry> {
        let existing = self
            .guard
            .inventory
            .values()
            .find(|row| row.path_id == entry.path_id && row.file_path == entry.file_path)
            .map(|row| row.id);
        let mut stored = entry.clone();
        if let Some(id) = existing {
            stored.id = id;
        }
        self.guard.inventory.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn delete_inventory(&mut self, id: Uuid) -> DataResult<bool> {
        Ok(self.guard.inventory.remove(&id).is_some())
    }

    async fn bulk_update_status(&mut self, ids: &[Uuid], status: FileStatus) -> DataResult<u64> {
        let mut changed = 0;
        for id in ids {
            if let Some(entry) = self.guard.inventory.get_mut(id) {
                entry.status = status;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn count_inventory_for_location(&mut self, location_id: Uuid) -> DataResult<u64> {
        let count = self
            .guard
            .inventory
            .values()
            .filter(|entry| entry.cold_location_id == Some(location_id))
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn insert_record(&mut self, record: &FileRecord) -> DataResult<()> {
        self.guard.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_record(&mut self, id: Uuid) -> DataResult<Option<FileRecord>> {
        Ok(self.guard.records.get(&id).cloned())
    }

    async fn update_record(&mut self, record: &FileRecord) -> DataResult<()> {
        match self.guard.records.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(DataError::NotFound {
                entity: "file_record",
                id: record.id,
            }),
        }
    }

    async fn list_records(&mut self, path_id: Uuid) -> DataResult<Vec<FileRecord>> {
        let records = self
            .guard
            .records
            .values()
            .filter(|record| record.path_id == path_id)
            .cloned()
            .collect();
        Ok(sorted_by(records, |record: &FileRecord| record.timestamp))
    }

    async fn find_record_by_cold_path(
        &mut self,
        cold_path: &Path,
    ) -> DataResult<Option<FileRecord>> {
        Ok(self
            .guard
            .records
            .values()
            .filter(|record| record.cold_storage_path == cold_path)
            .max_by_key(|record| record.timestamp)
            .cloned())
    }

    async fn find_records_by_original(
        &mut self,
        path_id: Uuid,
        original_path: &Path,
    ) -> DataResult<Vec<FileRecord>> {
        let mut records: Vec<FileRecord> = self
            .guard
            .records
            .values()
            .filter(|record| record.path_id == path_id && record.original_path == original_path)
            .cloned()
            .collect();
        records.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
        Ok(records)
    }

    async fn delete_record(&mut self, id: Uuid) -> DataResult<bool> {
        Ok(self.guard.records.remove(&id).is_some())
    }

    async fn list_pins(&mut self, path_id: Uuid) -> DataResult<Vec<PinnedFile>> {
        Ok(self
            .guard
            .pins
            .iter()
            .filter(|pin| pin.path_id == path_id)
            .cloned()
            .collect())
    }

    async fn pin(&mut self, path_id: Uuid, file_path: &Path) -> DataResult<PinnedFile> {
        if let Some(existing) = self
            .guard
            .pins
            .iter()
            .find(|pin| pin.path_id == path_id && pin.file_path == file_path)
        {
            return Ok(existing.clone());
        }
        let pin = PinnedFile {
            id: Uuid::new_v4(),
            path_id,
            file_path: file_path.to_path_buf(),
            pinned_at: Utc::now(),
        };
        self.guard.pins.push(pin.clone());
        Ok(pin)
    }

    async fn unpin(&mut self, path_id: Uuid, file_path: &Path) -> DataResult<bool> {
        let before = self.guard.pins.len();
        self.guard
            .pins
            .retain(|pin| !(pin.path_id == path_id && pin.file_path == file_path));
        Ok(self.guard.pins.len() != before)
    }

    async fn is_pinned(&mut self, path_id: Uuid, file_path: &Path) -> DataResult<bool> {
        Ok(self
            .guard
            .pins
            .iter()
            .any(|pin| pin.path_id == path_id && pin.file_path == file_path))
    }

    async fn record_failure(&mut self, failure: &OperationFailure) -> DataResult<()> {
        self.guard.failures.push(failure.clone());
        Ok(())
    }

    async fn count_failures_since(
        &mut self,
        location_id: Uuid,
        since: DateTime<Utc>,
    ) -> DataResult<u64> {
        let count = self
            .guard
            .failures
            .iter()
            .filter(|failure| failure.location_id == location_id && failure.occurred_at >= since)
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn commit(self: Box<Self>) -> DataResult<()> {
        let mut tx = self;
        tx.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DataResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OperationMode, StorageTier};
    use std::path::PathBuf;

    type TestResult<T> = anyhow::Result<T>;

    fn entry(path_id: Uuid, file: &str) -> FileInventoryEntry {
        let now = Utc::now();
        FileInventoryEntry {
            id: Uuid::new_v4(),
            path_id,
            file_path: PathBuf::from(file),
            storage_tier: StorageTier::Hot,
            file_size: 10,
            modified_at: now,
            accessed_at: now,
            changed_at: now,
            checksum: None,
            status: FileStatus::Active,
            cold_location_id: None,
            last_seen: now,
        }
    }

    #[tokio::test]
    async fn uncommitted_transaction_rolls_back_on_drop() -> TestResult<()> {
        let store = MemoryStore::new();
        let path = MonitoredPath::new("docs", "/srv/docs", OperationMode::Move);
        {
            let mut tx = store.begin().await?;
            tx.upsert_path(&path).await?;
        }
        let mut tx = store.begin().await?;
        assert!(tx.get_path(path.id).await?.is_none());
        tx.upsert_path(&path).await?;
        tx.commit().await?;

        let mut tx = store.begin().await?;
        assert!(tx.get_path(path.id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn inventory_upsert_keeps_identity_per_file() -> TestResult<()> {
        let store = MemoryStore::new();
        let path_id = Uuid::new_v4();
        let mut tx = store.begin().await?;
        let first = tx.upsert_inventory(&entry(path_id, "/srv/docs/a.txt")).await?;
        let mut second = entry(path_id, "/srv/docs/a.txt");
        second.file_size = 99;
        let stored = tx.upsert_inventory(&second).await?;
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.file_size, 99);
        assert_eq!(
            tx.query_inventory(&InventoryFilter::for_path(path_id))
                .await?
                .len(),
            1
        );

        let changed = tx.bulk_update_status(&[first.id], FileStatus::Missing).await?;
        assert_eq!(changed, 1);
        let missing = tx
            .query_inventory(&InventoryFilter::for_path(path_id).with_status(FileStatus::Missing))
            .await?;
        assert_eq!(missing.len(), 1);
        tx.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn delete_path_cascades() -> TestResult<()> {
        let store = MemoryStore::new();
        let path = MonitoredPath::new("docs", "/srv/docs", OperationMode::Copy);
        let mut tx = store.begin().await?;
        tx.upsert_path(&path).await?;
        tx.upsert_criterion(&Criterion::new(
            path.id,
            crate::model::CriterionType::Size,
            "<",
            "10MB",
        ))
        .await?;
        tx.upsert_inventory(&entry(path.id, "/srv/docs/a.txt")).await?;
        tx.pin(path.id, Path::new("/srv/docs/a.txt")).await?;
        assert!(tx.delete_path(path.id).await?);
        assert!(tx.list_criteria(path.id).await?.is_empty());
        assert!(
            tx.query_inventory(&InventoryFilter::for_path(path.id))
                .await?
                .is_empty()
        );
        assert!(!tx.is_pinned(path.id, Path::new("/srv/docs/a.txt")).await?);
        tx.commit().await?;
        Ok(())
    }
}
