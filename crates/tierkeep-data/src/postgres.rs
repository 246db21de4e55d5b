//! `PostgreSQL` store backed by `sqlx` transactions.
//!
//! # Design
//! - Every `StoreTx` wraps one `sqlx::Transaction`; dropping it rolls back.
//! - SQL lives in constants next to the call sites; rows are decoded by hand.
//! - Unsigned sizes are clamped into `BIGINT` rather than failing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Decode, PgPool, Postgres, Row, Transaction, Type};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DataError, DataResult};
use crate::model::{
    ColdStorageLocation, Criterion, CriterionOperator, FileInventoryEntry, FileRecord, FileStatus,
    InventoryFilter, MonitoredPath, OperationFailure, PinnedFile, ScanOutcome, StorageTier,
};
use crate::store::{Store, StoreTx};

const SELECT_PATH_BY_ID: &str = r"
    SELECT id, name, source_path, operation_mode, check_interval_secs, enabled,
           prevent_indexing, error_message, last_scan_at, last_scan_outcome
    FROM monitored_paths
    WHERE id = $1
";

const SELECT_PATHS: &str = r"
    SELECT id, name, source_path, operation_mode, check_interval_secs, enabled,
           prevent_indexing, error_message, last_scan_at, last_scan_outcome
    FROM monitored_paths
    ORDER BY name
";

const SELECT_CRITERIA: &str = r"
    SELECT id, path_id, criterion_type, operator, value, enabled
    FROM criteria
    WHERE path_id = $1 ORDER BY id
";

const SELECT_LOCATION_BY_ID: &str = r"
    SELECT id, name, path, is_available, is_encrypted,
           caution_threshold_percent, critical_threshold_percent
    FROM cold_storage_locations
    WHERE id = $1
";

const SELECT_LOCATIONS: &str = r"
    SELECT id, name, path, is_available, is_encrypted,
           caution_threshold_percent, critical_threshold_percent
    FROM cold_storage_locations
    ORDER BY name
";

const SELECT_INVENTORY_BY_ID: &str = r"
    SELECT id, path_id, file_path, storage_tier, file_size, modified_at,
           accessed_at, changed_at, checksum, status, cold_location_id, last_seen
    FROM file_inventory
    WHERE id = $1
";

const SELECT_INVENTORY_BY_FILE: &str = r"
    SELECT id, path_id, file_path, storage_tier, file_size, modified_at,
           accessed_at, changed_at, checksum, status, cold_location_id, last_seen
    FROM file_inventory
    WHERE path_id = $1 AND file_path = $2
";

const SELECT_RECORD_BY_ID: &str = r"
    SELECT id, path_id, original_path, cold_storage_path, cold_location_id,
           file_size, operation_mode, criteria_matched, timestamp
    FROM file_records
    WHERE id = $1
";

const SELECT_RECORDS_FOR_PATH: &str = r"
    SELECT id, path_id, original_path, cold_storage_path, cold_location_id,
           file_size, operation_mode, criteria_matched, timestamp
    FROM file_records
    WHERE path_id = $1 ORDER BY timestamp
";

const SELECT_RECORD_BY_COLD_PATH: &str = r"
    SELECT id, path_id, original_path, cold_storage_path, cold_location_id,
           file_size, operation_mode, criteria_matched, timestamp
    FROM file_records
    WHERE cold_storage_path = $1
    ORDER BY timestamp DESC
    LIMIT 1
";

const SELECT_RECORDS_BY_ORIGINAL: &str = r"
    SELECT id, path_id, original_path, cold_storage_path, cold_location_id,
           file_size, operation_mode, criteria_matched, timestamp
    FROM file_records
    WHERE path_id = $1 AND original_path = $2
    ORDER BY timestamp DESC
";

const UPSERT_PATH: &str = r"
    INSERT INTO monitored_paths (
        id, name, source_path, operation_mode, check_interval_secs, enabled,
        prevent_indexing, error_message, last_scan_at, last_scan_outcome
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (id) DO UPDATE SET
        name = EXCLUDED.name,
        source_path = EXCLUDED.source_path,
        operation_mode = EXCLUDED.operation_mode,
        check_interval_secs = EXCLUDED.check_interval_secs,
        enabled = EXCLUDED.enabled,
        prevent_indexing = EXCLUDED.prevent_indexing,
        error_message = EXCLUDED.error_message,
        last_scan_at = EXCLUDED.last_scan_at,
        last_scan_outcome = EXCLUDED.last_scan_outcome
";

const SELECT_PATH_LOCATION_IDS: &str = r"
    SELECT path_id, location_id
    FROM monitored_path_locations
    ORDER BY path_id, position
";

const UPSERT_CRITERION: &str = r"
    INSERT INTO criteria (id, path_id, criterion_type, operator, value, enabled)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (id) DO UPDATE SET
        criterion_type = EXCLUDED.criterion_type,
        operator = EXCLUDED.operator,
        value = EXCLUDED.value,
        enabled = EXCLUDED.enabled
";

const UPSERT_LOCATION: &str = r"
    INSERT INTO cold_storage_locations (
        id, name, path, is_available, is_encrypted,
        caution_threshold_percent, critical_threshold_percent
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (id) DO UPDATE SET
        name = EXCLUDED.name,
        path = EXCLUDED.path,
        is_available = EXCLUDED.is_available,
        is_encrypted = EXCLUDED.is_encrypted,
        caution_threshold_percent = EXCLUDED.caution_threshold_percent,
        critical_threshold_percent = EXCLUDED.critical_threshold_percent
";

const SELECT_PATH_LOCATIONS: &str = r"
    SELECT l.id, l.name, l.path, l.is_available, l.is_encrypted,
           l.caution_threshold_percent, l.critical_threshold_percent
    FROM monitored_path_locations pl
    JOIN cold_storage_locations l ON l.id = pl.location_id
    WHERE pl.path_id = $1
    ORDER BY pl.position
";

const SELECT_INVENTORY_FILTERED: &str = r"
    SELECT id, path_id, file_path, storage_tier, file_size, modified_at,
           accessed_at, changed_at, checksum, status, cold_location_id, last_seen
    FROM file_inventory
    WHERE ($1::uuid IS NULL OR path_id = $1)
      AND ($2::text IS NULL OR status = $2)
      AND ($3::text IS NULL OR storage_tier = $3)
      AND ($4::uuid IS NULL OR cold_location_id = $4)
    ORDER BY file_path
";

const UPDATE_INVENTORY_BY_ID: &str = r"
    UPDATE file_inventory SET
        path_id = $2,
        file_path = $3,
        storage_tier = $4,
        file_size = $5,
        modified_at = $6,
        accessed_at = $7,
        changed_at = $8,
        checksum = $9,
        status = $10,
        cold_location_id = $11,
        last_seen = $12
    WHERE id = $1
";

const INSERT_INVENTORY: &str = r"
    INSERT INTO file_inventory (
        id, path_id, file_path, storage_tier, file_size, modified_at,
        accessed_at, changed_at, checksum, status, cold_location_id, last_seen
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (id) DO UPDATE SET
        path_id = EXCLUDED.path_id,
        file_path = EXCLUDED.file_path,
        storage_tier = EXCLUDED.storage_tier,
        file_size = EXCLUDED.file_size,
        modified_at = EXCLUDED.modified_at,
        accessed_at = EXCLUDED.accessed_at,
        changed_at = EXCLUDED.changed_at,
        checksum = EXCLUDED.checksum,
        status = EXCLUDED.status,
        cold_location_id = EXCLUDED.cold_location_id,
        last_seen = EXCLUDED.last_seen
";

const INSERT_RECORD: &str = r"
    INSERT INTO file_records (
        id, path_id, original_path, cold_storage_path, cold_location_id,
        file_size, operation_mode, criteria_matched, timestamp
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
";

const UPDATE_RECORD: &str = r"
    UPDATE file_records SET
        original_path = $2,
        cold_storage_path = $3,
        cold_location_id = $4,
        file_size = $5,
        operation_mode = $6,
        criteria_matched = $7,
        timestamp = $8
    WHERE id = $1
";

const INSERT_PIN: &str = r"
    INSERT INTO pinned_files (id, path_id, file_path, pinned_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (path_id, file_path) DO UPDATE SET file_path = EXCLUDED.file_path
    RETURNING id, path_id, file_path, pinned_at
";

const INSERT_FAILURE: &str = r"
    INSERT INTO operation_failures (id, location_id, path_id, file_path, occurred_at, message)
    VALUES ($1, $2, $3, $4, $5, $6)
";

/// Store persisting entities in `PostgreSQL`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Initialise the store, applying pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail or the database is unreachable.
    pub async fn new(pool: PgPool) -> DataResult<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|source| DataError::MigrationFailed { source })?;
        Ok(Self { pool })
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> DataResult<Box<dyn StoreTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|source| DataError::query("begin transaction", source))?;
        Ok(Box::new(PgStoreTx { tx }))
    }
}

struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

fn column<T>(row: &PgRow, name: &'static str) -> DataResult<T>
where
    T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<T, _>(name)
        .map_err(|source| DataError::query("decode row", source))
}

fn path_text<'a>(field: &'static str, path: &'a Path) -> DataResult<&'a str> {
    path.to_str().ok_or_else(|| DataError::PathNotUtf8 {
        field,
        path: path.to_path_buf(),
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn decode_path(row: &PgRow, cold_location_ids: Vec<Uuid>) -> DataResult<MonitoredPath> {
    let mode: String = column(row, "operation_mode")?;
    let outcome: Option<String> = column(row, "last_scan_outcome")?;
    Ok(MonitoredPath {
        id: column(row, "id")?,
        name: column(row, "name")?,
        source_path: PathBuf::from(column::<String>(row, "source_path")?),
        operation_mode: mode.parse()?,
        check_interval_secs: to_u64(column(row, "check_interval_secs")?),
        enabled: column(row, "enabled")?,
        prevent_indexing: column(row, "prevent_indexing")?,
        error_message: column(row, "error_message")?,
        cold_location_ids,
        last_scan_at: column(row, "last_scan_at")?,
        last_scan_outcome: outcome.map(|raw| raw.parse()).transpose()?,
    })
}

fn decode_criterion(row: &PgRow) -> DataResult<Criterion> {
    let criterion_type: String = column(row, "criterion_type")?;
    let operator: String = column(row, "operator")?;
    let Ok(operator) = operator.parse::<CriterionOperator>();
    Ok(Criterion {
        id: column(row, "id")?,
        path_id: column(row, "path_id")?,
        criterion_type: criterion_type.parse()?,
        operator,
        value: column(row, "value")?,
        enabled: column(row, "enabled")?,
    })
}

fn decode_location(row: &PgRow) -> DataResult<ColdStorageLocation> {
    Ok(ColdStorageLocation {
        id: column(row, "id")?,
        name: column(row, "name")?,
        path: PathBuf::from(column::<String>(row, "path")?),
        is_available: column(row, "is_available")?,
        is_encrypted: column(row, "is_encrypted")?,
        caution_threshold_percent: column(row, "caution_threshold_percent")?,
        critical_threshold_percent: column(row, "critical_threshold_percent")?,
    })
}

fn decode_inventory(row: &PgRow) -> DataResult<FileInventoryEntry> {
    let tier: String = column(row, "storage_tier")?;
    let status: String = column(row, "status")?;
    Ok(FileInventoryEntry {
        id: column(row, "id")?,
        path_id: column(row, "path_id")?,
        file_path: PathBuf::from(column::<String>(row, "file_path")?),
        storage_tier: tier.parse()?,
        file_size: to_u64(column(row, "file_size")?),
        modified_at: column(row, "modified_at")?,
        accessed_at: column(row, "accessed_at")?,
        changed_at: column(row, "changed_at")?,
        checksum: column(row, "checksum")?,
        status: status.parse()?,
        cold_location_id: column(row, "cold_location_id")?,
        last_seen: column(row, "last_seen")?,
    })
}

fn decode_record(row: &PgRow) -> DataResult<FileRecord> {
    let mode: String = column(row, "operation_mode")?;
    Ok(FileRecord {
        id: column(row, "id")?,
        path_id: column(row, "path_id")?,
        original_path: PathBuf::from(column::<String>(row, "original_path")?),
        cold_storage_path: PathBuf::from(column::<String>(row, "cold_storage_path")?),
        cold_location_id: column(row, "cold_location_id")?,
        file_size: to_u64(column(row, "file_size")?),
        operation_mode: mode.parse()?,
        criteria_matched: column(row, "criteria_matched")?,
        timestamp: column(row, "timestamp")?,
    })
}

fn decode_pin(row: &PgRow) -> DataResult<PinnedFile> {
    Ok(PinnedFile {
        id: column(row, "id")?,
        path_id: column(row, "path_id")?,
        file_path: PathBuf::from(column::<String>(row, "file_path")?),
        pinned_at: column(row, "pinned_at")?,
    })
}

impl PgStoreTx {
    async fn location_ids_for(&mut self, path_id: Uuid) -> DataResult<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT location_id FROM monitored_path_locations WHERE path_id = $1 ORDER BY position",
        )
        .bind(path_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("list path location ids", source))
    }

    async fn count(
        &mut self,
        operation: &'static str,
        sql: &'static str,
        id: Uuid,
    ) -> DataResult<u64> {
        let count: i64 = sqlx::query_scalar(sql)
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|source| DataError::query(operation, source))?;
        Ok(to_u64(count))
    }

    async fn delete_by_id(
        &mut self,
        operation: &'static str,
        sql: &'static str,
        id: Uuid,
    ) -> DataResult<bool> {
        let result = sqlx::query(sql)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query(operation, source))?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_inventory(
        &mut self,
        sql: &'static str,
        entry: &FileInventoryEntry,
    ) -> DataResult<u64> {
        let result = sqlx::query(sql)
            .bind(entry.id)
            .bind(entry.path_id)
            .bind(path_text("file_path", &entry.file_path)?)
            .bind(entry.storage_tier.as_str())
            .bind(to_i64(entry.file_size))
            .bind(entry.modified_at)
            .bind(entry.accessed_at)
            .bind(entry.changed_at)
            .bind(entry.checksum.as_deref())
            .bind(entry.status.as_str())
            .bind(entry.cold_location_id)
            .bind(entry.last_seen)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("write inventory entry", source))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn get_path(&mut self, id: Uuid) -> DataResult<Option<MonitoredPath>> {
        let row = sqlx::query(SELECT_PATH_BY_ID)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("get path", source))?;
        match row {
            Some(row) => {
                let location_ids = self.location_ids_for(id).await?;
                decode_path(&row, location_ids).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn list_paths(&mut self) -> DataResult<Vec<MonitoredPath>> {
        let rows = sqlx::query(SELECT_PATHS)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("list paths", source))?;
        let links = sqlx::query(SELECT_PATH_LOCATION_IDS)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("list path locations", source))?;
        let mut by_path: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for link in &links {
            by_path
                .entry(column(link, "path_id")?)
                .or_default()
                .push(column(link, "location_id")?);
        }
        rows.iter()
            .map(|row| {
                let id: Uuid = column(row, "id")?;
                decode_path(row, by_path.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    async fn upsert_path(&mut self, path: &MonitoredPath) -> DataResult<()> {
        sqlx::query(UPSERT_PATH)
            .bind(path.id)
            .bind(&path.name)
            .bind(path_text("source_path", &path.source_path)?)
            .bind(path.operation_mode.as_str())
            .bind(to_i64(path.check_interval_secs))
            .bind(path.enabled)
            .bind(path.prevent_indexing)
            .bind(path.error_message.as_deref())
            .bind(path.last_scan_at)
            .bind(path.last_scan_outcome.map(ScanOutcome::as_str))
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("upsert path", source))?;
        sqlx::query("DELETE FROM monitored_path_locations WHERE path_id = $1")
            .bind(path.id)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("clear path locations", source))?;
        for (position, location_id) in path.cold_location_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO monitored_path_locations (path_id, location_id, position) \
                 VALUES ($1, $2, $3)",
            )
            .bind(path.id)
            .bind(location_id)
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("link path location", source))?;
        }
        debug!(path_id = %path.id, "path upserted");
        Ok(())
    }

    async fn delete_path(&mut self, id: Uuid) -> DataResult<bool> {
        self.delete_by_id("delete path", "DELETE FROM monitored_paths WHERE id = $1", id)
            .await
    }

    async fn set_path_error(&mut self, id: Uuid, message: Option<&str>) -> DataResult<()> {
        sqlx::query("UPDATE monitored_paths SET error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(message)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("set path error", source))?;
        Ok(())
    }

    async fn record_scan_outcome(
        &mut self,
        id: Uuid,
        at: DateTime<Utc>,
        outcome: ScanOutcome,
    ) -> DataResult<()> {
        sqlx::query(
            "UPDATE monitored_paths SET last_scan_at = $2, last_scan_outcome = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .bind(outcome.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("record scan outcome", source))?;
        Ok(())
    }

    async fn list_criteria(&mut self, path_id: Uuid) -> DataResult<Vec<Criterion>> {
        let rows = sqlx::query(SELECT_CRITERIA)
        .bind(path_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("list criteria", source))?;
        rows.iter().map(decode_criterion).collect()
    }

    async fn upsert_criterion(&mut self, criterion: &Criterion) -> DataResult<()> {
        sqlx::query(UPSERT_CRITERION)
            .bind(criterion.id)
            .bind(criterion.path_id)
            .bind(criterion.criterion_type.as_str())
            .bind(criterion.operator.as_str())
            .bind(&criterion.value)
            .bind(criterion.enabled)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("upsert criterion", source))?;
        Ok(())
    }

    async fn delete_criterion(&mut self, id: Uuid) -> DataResult<bool> {
        self.delete_by_id("delete criterion", "DELETE FROM criteria WHERE id = $1", id)
            .await
    }

    async fn get_location(&mut self, id: Uuid) -> DataResult<Option<ColdStorageLocation>> {
        let row = sqlx::query(SELECT_LOCATION_BY_ID)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("get location", source))?;
        row.as_ref().map(decode_location).transpose()
    }

    async fn list_locations(&mut self) -> DataResult<Vec<ColdStorageLocation>> {
        let rows = sqlx::query(SELECT_LOCATIONS)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("list locations", source))?;
        rows.iter().map(decode_location).collect()
    }

    async fn list_path_locations(
        &mut self,
        path_id: Uuid,
    ) -> DataResult<Vec<ColdStorageLocation>> {
        let rows = sqlx::query(SELECT_PATH_LOCATIONS)
            .bind(path_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("list path locations", source))?;
        rows.iter().map(decode_location).collect()
    }

    async fn upsert_location(&mut self, location: &ColdStorageLocation) -> DataResult<()> {
        sqlx::query(UPSERT_LOCATION)
            .bind(location.id)
            .bind(&location.name)
            .bind(path_text("path", &location.path)?)
            .bind(location.is_available)
            .bind(location.is_encrypted)
            .bind(location.caution_threshold_percent)
            .bind(location.critical_threshold_percent)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("upsert location", source))?;
        Ok(())
    }

    async fn delete_location(&mut self, id: Uuid) -> DataResult<bool> {
        self.delete_by_id(
            "delete location",
            "DELETE FROM cold_storage_locations WHERE id = $1",
            id,
        )
        .await
    }

    async fn get_inventory(&mut self, id: Uuid) -> DataResult<Option<FileInventoryEntry>> {
        let row = sqlx::query(SELECT_INVENTORY_BY_ID)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("get inventory entry", source))?;
        row.as_ref().map(decode_inventory).transpose()
    }

    async fn find_inventory(
        &mut self,
        path_id: Uuid,
        file_path: &Path,
    ) -> DataResult<Option<FileInventoryEntry>> {
        let row = sqlx::query(SELECT_INVENTORY_BY_FILE)
        .bind(path_id)
        .bind(path_text("file_path", file_path)?)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("find inventory entry", source))?;
        row.as_ref().map(decode_inventory).transpose()
    }

    async fn query_inventory(
        &mut self,
        filter: &InventoryFilter,
    ) -> DataResult<Vec<FileInventoryEntry>> {
        let rows = sqlx::query(SELECT_INVENTORY_FILTERED)
            .bind(filter.path_id)
            .bind(filter.status.map(FileStatus::as_str))
            .bind(filter.tier.map(StorageTier::as_str))
            .bind(filter.cold_location_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("query inventory", source))?;
        rows.iter().map(decode_inventory).collect()
    }

    async fn upsert_inventory(
        &mut self,
        entry: &FileInventoryEntry,
    ) -> DataResult<FileInventoryEntry> {
        let existing = self.find_inventory(entry.path_id, &entry.file_path).await?;
        let mut stored = entry.clone();
        match existing {
            Some(current) => {
                stored.id = current.id;
                self.write_inventory(UPDATE_INVENTORY_BY_ID, &stored).await?;
            }
            None => {
                self.write_inventory(INSERT_INVENTORY, &stored).await?;
            }
        }
        Ok(stored)
    }

    async fn delete_inventory(&mut self, id: Uuid) -> DataResult<bool> {
        self.delete_by_id(
            "delete inventory entry",
            "DELETE FROM file_inventory WHERE id = $1",
            id,
        )
        .await
    }

    async fn bulk_update_status(&mut self, ids: &[Uuid], status: FileStatus) -> DataResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("UPDATE file_inventory SET status = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("bulk update status", source))?;
        Ok(result.rows_affected())
    }

    async fn count_inventory_for_location(&mut self, location_id: Uuid) -> DataResult<u64> {
        self.count(
            "count inventory for location",
            "SELECT COUNT(*) FROM file_inventory WHERE cold_location_id = $1",
            location_id,
        )
        .await
    }

    async fn insert_record(&mut self, record: &FileRecord) -> DataResult<()> {
        sqlx::query(INSERT_RECORD)
            .bind(record.id)
            .bind(record.path_id)
            .bind(path_text("original_path", &record.original_path)?)
            .bind(path_text("cold_storage_path", &record.cold_storage_path)?)
            .bind(record.cold_location_id)
            .bind(to_i64(record.file_size))
            .bind(record.operation_mode.as_str())
            .bind(&record.criteria_matched)
            .bind(record.timestamp)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("insert file record", source))?;
        Ok(())
    }

    async fn get_record(&mut self, id: Uuid) -> DataResult<Option<FileRecord>> {
        let row = sqlx::query(SELECT_RECORD_BY_ID)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("get file record", source))?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn update_record(&mut self, record: &FileRecord) -> DataResult<()> {
        let result = sqlx::query(UPDATE_RECORD)
            .bind(record.id)
            .bind(path_text("original_path", &record.original_path)?)
            .bind(path_text("cold_storage_path", &record.cold_storage_path)?)
            .bind(record.cold_location_id)
            .bind(to_i64(record.file_size))
            .bind(record.operation_mode.as_str())
            .bind(&record.criteria_matched)
            .bind(record.timestamp)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("update file record", source))?;
        if result.rows_affected() == 0 {
            return Err(DataError::NotFound {
                entity: "file_record",
                id: record.id,
            });
        }
        Ok(())
    }

    async fn list_records(&mut self, path_id: Uuid) -> DataResult<Vec<FileRecord>> {
        let rows = sqlx::query(SELECT_RECORDS_FOR_PATH)
        .bind(path_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("list file records", source))?;
        rows.iter().map(decode_record).collect()
    }

    async fn find_record_by_cold_path(
        &mut self,
        cold_path: &Path,
    ) -> DataResult<Option<FileRecord>> {
        let row = sqlx::query(SELECT_RECORD_BY_COLD_PATH)
        .bind(path_text("cold_storage_path", cold_path)?)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("find record by cold path", source))?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn find_records_by_original(
        &mut self,
        path_id: Uuid,
        original_path: &Path,
    ) -> DataResult<Vec<FileRecord>> {
        let rows = sqlx::query(SELECT_RECORDS_BY_ORIGINAL)
        .bind(path_id)
        .bind(path_text("original_path", original_path)?)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("find records by original path", source))?;
        rows.iter().map(decode_record).collect()
    }

    async fn delete_record(&mut self, id: Uuid) -> DataResult<bool> {
        self.delete_by_id(
            "delete file record",
            "DELETE FROM file_records WHERE id = $1",
            id,
        )
        .await
    }

    async fn list_pins(&mut self, path_id: Uuid) -> DataResult<Vec<PinnedFile>> {
        let rows = sqlx::query(
            "SELECT id, path_id, file_path, pinned_at FROM pinned_files WHERE path_id = $1 \
             ORDER BY pinned_at",
        )
        .bind(path_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("list pins", source))?;
        rows.iter().map(decode_pin).collect()
    }

    async fn pin(&mut self, path_id: Uuid, file_path: &Path) -> DataResult<PinnedFile> {
        let row = sqlx::query(INSERT_PIN)
            .bind(Uuid::new_v4())
            .bind(path_id)
            .bind(path_text("file_path", file_path)?)
            .bind(Utc::now())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("pin file", source))?;
        decode_pin(&row)
    }

    async fn unpin(&mut self, path_id: Uuid, file_path: &Path) -> DataResult<bool> {
        let result = sqlx::query("DELETE FROM pinned_files WHERE path_id = $1 AND file_path = $2")
            .bind(path_id)
            .bind(path_text("file_path", file_path)?)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("unpin file", source))?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_pinned(&mut self, path_id: Uuid, file_path: &Path) -> DataResult<bool> {
        let pinned: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pinned_files WHERE path_id = $1 AND file_path = $2)",
        )
        .bind(path_id)
        .bind(path_text("file_path", file_path)?)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("check pin", source))?;
        Ok(pinned)
    }

    async fn record_failure(&mut self, failure: &OperationFailure) -> DataResult<()> {
        sqlx::query(INSERT_FAILURE)
            .bind(failure.id)
            .bind(failure.location_id)
            .bind(failure.path_id)
            .bind(path_text("file_path", &failure.file_path)?)
            .bind(failure.occurred_at)
            .bind(&failure.message)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| DataError::query("record operation failure", source))?;
        Ok(())
    }

    async fn count_failures_since(
        &mut self,
        location_id: Uuid,
        since: DateTime<Utc>,
    ) -> DataResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM operation_failures WHERE location_id = $1 AND occurred_at >= $2",
        )
        .bind(location_id)
        .bind(since)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|source| DataError::query("count operation failures", source))?;
        Ok(to_u64(count))
    }

    async fn commit(self: Box<Self>) -> DataResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|source| DataError::query("commit transaction", source))
    }

    async fn rollback(self: Box<Self>) -> DataResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|source| DataError::query("rollback transaction", source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_clamp_into_bigint() {
        assert_eq!(to_i64(u64::MAX), i64::MAX);
        assert_eq!(to_i64(42), 42);
        assert_eq!(to_u64(-1), 0);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_paths_are_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new(OsStr::from_bytes(b"/srv/\xff.bin"));
        assert!(matches!(
            path_text("file_path", path),
            Err(DataError::PathNotUtf8 { field: "file_path", .. })
        ));
    }
}
