//! Inventory listing and per-path statistics.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::Serialize;
use tierkeep_data::{FileInventoryEntry, FileStatus, InventoryFilter, StorageTier};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::workflow::FileWorkflow;

/// Field an inventory listing can be sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InventorySortKey {
    /// File path.
    #[default]
    Path,
    /// File size.
    Size,
    /// Modification time.
    Modified,
    /// Access time.
    Accessed,
    /// Last time the scan observed the file.
    LastSeen,
    /// Storage tier.
    Tier,
    /// Status.
    Status,
}

type Comparator = fn(&FileInventoryEntry, &FileInventoryEntry) -> Ordering;

const SORT_TABLE: &[(InventorySortKey, &str, Comparator)] = &[
    (InventorySortKey::Path, "path", |a, b| a.file_path.cmp(&b.file_path)),
    (InventorySortKey::Size, "size", |a, b| a.file_size.cmp(&b.file_size)),
    (InventorySortKey::Modified, "modified", |a, b| a.modified_at.cmp(&b.modified_at)),
    (InventorySortKey::Accessed, "accessed", |a, b| a.accessed_at.cmp(&b.accessed_at)),
    (InventorySortKey::LastSeen, "last_seen", |a, b| a.last_seen.cmp(&b.last_seen)),
    (InventorySortKey::Tier, "tier", |a, b| {
        a.storage_tier.as_str().cmp(b.storage_tier.as_str())
    }),
    (InventorySortKey::Status, "status", |a, b| a.status.as_str().cmp(b.status.as_str())),
];

impl InventorySortKey {
    /// Query-string name of the key.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        SORT_TABLE
            .iter()
            .find(|(key, _, _)| *key == self)
            .map_or("path", |(_, name, _)| name)
    }

    fn comparator(self) -> Comparator {
        SORT_TABLE
            .iter()
            .find(|(key, _, _)| *key == self)
            .map_or(SORT_TABLE[0].2, |(_, _, compare)| *compare)
    }
}

impl FromStr for InventorySortKey {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SORT_TABLE
            .iter()
            .find(|(_, name, _)| *name == value)
            .map(|(key, _, _)| *key)
            .ok_or_else(|| EngineError::invalid("sort", "unknown_key", value))
    }
}

/// Filtered, sorted, paginated inventory request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryQuery {
    /// Row filter.
    pub filter: InventoryFilter,
    /// Sort field.
    pub sort: InventorySortKey,
    /// Sort descending.
    pub descending: bool,
    /// Rows to skip.
    pub offset: usize,
    /// Maximum rows to return.
    pub limit: Option<usize>,
}

/// One page of inventory rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryPage {
    /// Rows matching the filter before pagination.
    pub total: usize,
    /// Rows on this page.
    pub entries: Vec<FileInventoryEntry>,
}

/// File counts and byte totals for one monitored path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PathStats {
    /// Path identifier.
    pub path_id: Uuid,
    /// Active hot files.
    pub hot_files: u64,
    /// Bytes in active hot files.
    pub hot_bytes: u64,
    /// Active cold files.
    pub cold_files: u64,
    /// Bytes in active cold files.
    pub cold_bytes: u64,
    /// Rows marked missing.
    pub missing_files: u64,
    /// Rows being relocated.
    pub migrating_files: u64,
    /// History records.
    pub frozen_records: u64,
    /// Bytes covered by history records.
    pub frozen_bytes: u64,
}

/// Sort and paginate rows in memory.
#[must_use]
pub fn apply_query(mut rows: Vec<FileInventoryEntry>, query: &InventoryQuery) -> InventoryPage {
    let compare = query.sort.comparator();
    rows.retain(|entry| query.filter.matches(entry));
    rows.sort_by(|a, b| {
        let ordering = compare(a, b).then_with(|| a.id.cmp(&b.id));
        if query.descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
    let total = rows.len();
    let entries = rows
        .into_iter()
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();
    InventoryPage { total, entries }
}

impl FileWorkflow {
    /// List inventory rows.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn list_inventory(&self, query: &InventoryQuery) -> EngineResult<InventoryPage> {
        let mut tx = self.inner.store.begin().await?;
        let rows = tx.query_inventory(&query.filter).await?;
        tx.commit().await?;
        Ok(apply_query(rows, query))
    }

    /// Aggregate statistics for a path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown path.
    pub async fn path_stats(&self, path_id: Uuid) -> EngineResult<PathStats> {
        let mut tx = self.inner.store.begin().await?;
        if tx.get_path(path_id).await?.is_none() {
            return Err(EngineError::not_found("monitored_path", path_id));
        }
        let rows = tx.query_inventory(&InventoryFilter::for_path(path_id)).await?;
        let records = tx.list_records(path_id).await?;
        tx.commit().await?;

        let mut stats = PathStats {
            path_id,
            ..PathStats::default()
        };
        for row in &rows {
            match (row.status, row.storage_tier) {
                (FileStatus::Active, StorageTier::Hot) => {
                    stats.hot_files += 1;
                    stats.hot_bytes += row.file_size;
                }
                (FileStatus::Active, StorageTier::Cold) => {
                    stats.cold_files += 1;
                    stats.cold_bytes += row.file_size;
                }
                (FileStatus::Missing, _) => stats.missing_files += 1,
                (FileStatus::Migrating, _) => stats.migrating_files += 1,
                _ => {}
            }
        }
        stats.frozen_records = records.len() as u64;
        stats.frozen_bytes = records.iter().map(|record| record.file_size).sum();
        Ok(stats)
    }
}
