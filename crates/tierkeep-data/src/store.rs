//! Repository traits consumed by the engine.
//!
//! # Design
//! - One [`StoreTx`] is one unit of work; dropping it without [`StoreTx::commit`] rolls back.
//! - Transaction handles are never shared across tasks; each worker begins its own.
//! - Callers must not begin a second transaction while holding one in the same task.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DataResult;
use crate::model::{
    ColdStorageLocation, Criterion, FileInventoryEntry, FileRecord, FileStatus, InventoryFilter,
    MonitoredPath, OperationFailure, PinnedFile, ScanOutcome,
};

/// Factory for transactional units of work.
#[async_trait]
pub trait Store: Send + Sync {
    /// Begin a new transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot open a transaction.
    async fn begin(&self) -> DataResult<Box<dyn StoreTx>>;
}

/// Operations available inside one transaction.
///
/// Every method returns an error only when the backing store fails; lookups
/// that find nothing return `None` or an empty collection.
#[allow(missing_docs)]
#[async_trait]
pub trait StoreTx: Send {
    // Monitored paths.
    async fn get_path(&mut self, id: Uuid) -> DataResult<Option<MonitoredPath>>;
    async fn list_paths(&mut self) -> DataResult<Vec<MonitoredPath>>;
    async fn upsert_path(&mut self, path: &MonitoredPath) -> DataResult<()>;
    /// Delete a path with its criteria, inventory, records and pins.
    async fn delete_path(&mut self, id: Uuid) -> DataResult<bool>;
    async fn set_path_error(&mut self, id: Uuid, message: Option<&str>) -> DataResult<()>;
    async fn record_scan_outcome(
        &mut self,
        id: Uuid,
        at: DateTime<Utc>,
        outcome: ScanOutcome,
    ) -> DataResult<()>;

    // Criteria.
    async fn list_criteria(&mut self, path_id: Uuid) -> DataResult<Vec<Criterion>>;
    async fn upsert_criterion(&mut self, criterion: &Criterion) -> DataResult<()>;
    async fn delete_criterion(&mut self, id: Uuid) -> DataResult<bool>;

    // Cold storage locations.
    async fn get_location(&mut self, id: Uuid) -> DataResult<Option<ColdStorageLocation>>;
    async fn list_locations(&mut self) -> DataResult<Vec<ColdStorageLocation>>;
    /// Locations associated with a path, in the path's preference order.
    async fn list_path_locations(&mut self, path_id: Uuid)
    -> DataResult<Vec<ColdStorageLocation>>;
    async fn upsert_location(&mut self, location: &ColdStorageLocation) -> DataResult<()>;
    async fn delete_location(&mut self, id: Uuid) -> DataResult<bool>;

    // Inventory.
    async fn get_inventory(&mut self, id: Uuid) -> DataResult<Option<FileInventoryEntry>>;
    async fn find_inventory(
        &mut self,
        path_id: Uuid,
        file_path: &Path,
    ) -> DataResult<Option<FileInventoryEntry>>;
    async fn query_inventory(
        &mut self,
        filter: &InventoryFilter,
    ) -> DataResult<Vec<FileInventoryEntry>>;
    /// Insert or update keyed by `(path_id, file_path)`; returns the stored row,
    /// which keeps the existing id on update.
    async fn upsert_inventory(
        &mut self,
        entry: &FileInventoryEntry,
    ) -> DataResult<FileInventoryEntry>;
    async fn delete_inventory(&mut self, id: Uuid) -> DataResult<bool>;
    /// Set `status` on every listed row; returns the number of rows changed.
    async fn bulk_update_status(&mut self, ids: &[Uuid], status: FileStatus) -> DataResult<u64>;
    /// Number of inventory rows stored on a cold location.
    async fn count_inventory_for_location(&mut self, location_id: Uuid) -> DataResult<u64>;

    // File records.
    async fn insert_record(&mut self, record: &FileRecord) -> DataResult<()>;
    async fn get_record(&mut self, id: Uuid) -> DataResult<Option<FileRecord>>;
    async fn update_record(&mut self, record: &FileRecord) -> DataResult<()>;
    async fn list_records(&mut self, path_id: Uuid) -> DataResult<Vec<FileRecord>>;
    async fn find_record_by_cold_path(&mut self, cold_path: &Path)
    -> DataResult<Option<FileRecord>>;
    /// Records for an original hot path, newest first.
    async fn find_records_by_original(
        &mut self,
        path_id: Uuid,
        original_path: &Path,
    ) -> DataResult<Vec<FileRecord>>;
    async fn delete_record(&mut self, id: Uuid) -> DataResult<bool>;

    // Pins.
    async fn list_pins(&mut self, path_id: Uuid) -> DataResult<Vec<PinnedFile>>;
    async fn pin(&mut self, path_id: Uuid, file_path: &Path) -> DataResult<PinnedFile>;
    async fn unpin(&mut self, path_id: Uuid, file_path: &Path) -> DataResult<bool>;
    async fn is_pinned(&mut self, path_id: Uuid, file_path: &Path) -> DataResult<bool>;

    // Operation failures.
    async fn record_failure(&mut self, failure: &OperationFailure) -> DataResult<()>;
    async fn count_failures_since(
        &mut self,
        location_id: Uuid,
        since: DateTime<Utc>,
    ) -> DataResult<u64>;

    /// Make every change in this transaction durable.
    async fn commit(self: Box<Self>) -> DataResult<()>;
    /// Discard every change in this transaction.
    async fn rollback(self: Box<Self>) -> DataResult<()>;
}
