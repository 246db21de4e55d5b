use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use tierkeep_data::{
    ColdStorageLocation, Criterion, CriterionOperator, CriterionType, FileInventoryEntry,
    FileRecord, FileStatus, InventoryFilter, MonitoredPath, OperationFailure, OperationMode,
    PgStore, ScanOutcome, Store, StorageTier,
};
use tierkeep_test_support::postgres::start_postgres;
use uuid::Uuid;

async fn connect() -> Result<Option<(PgStore, tierkeep_test_support::postgres::TestDatabase)>> {
    let database = match start_postgres() {
        Ok(db) => db,
        Err(err) => {
            eprintln!("skipping postgres store tests: {err}");
            return Ok(None);
        }
    };
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(database.connection_string())
        .await?;
    let store = PgStore::new(pool).await?;
    Ok(Some((store, database)))
}

fn hot_entry(path_id: Uuid, file: &Path) -> FileInventoryEntry {
    let now = Utc::now();
    FileInventoryEntry {
        id: Uuid::new_v4(),
        path_id,
        file_path: file.to_path_buf(),
        storage_tier: StorageTier::Hot,
        file_size: 2048,
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
async fn postgres_store_round_trips_entities() -> Result<()> {
    let Some((store, _database)) = connect().await? else {
        return Ok(());
    };

    let cold = ColdStorageLocation::new("archive", "/mnt/archive");
    let mut path = MonitoredPath::new("documents", "/srv/documents", OperationMode::Symlink);
    path.cold_location_ids = vec![cold.id];
    let criterion = Criterion::new(path.id, CriterionType::Size, "~", "10MB");

    let mut tx = store.begin().await?;
    tx.upsert_location(&cold).await?;
    tx.upsert_path(&path).await?;
    tx.upsert_criterion(&criterion).await?;
    tx.commit().await?;

    let mut tx = store.begin().await?;
    let loaded = tx.get_path(path.id).await?;
    assert_eq!(loaded.as_ref(), Some(&path));
    let criteria = tx.list_criteria(path.id).await?;
    assert_eq!(
        criteria[0].operator,
        CriterionOperator::Unknown("~".to_string())
    );
    let locations = tx.list_path_locations(path.id).await?;
    assert_eq!(locations, vec![cold.clone()]);

    tx.set_path_error(path.id, Some("source directory missing"))
        .await?;
    tx.record_scan_outcome(path.id, Utc::now(), ScanOutcome::Failed)
        .await?;
    let errored = tx.get_path(path.id).await?;
    assert_eq!(
        errored.as_ref().and_then(|p| p.error_message.as_deref()),
        Some("source directory missing")
    );
    assert_eq!(
        errored.and_then(|p| p.last_scan_outcome),
        Some(ScanOutcome::Failed)
    );
    tx.commit().await?;
    Ok(())
}

#[tokio::test]
async fn postgres_inventory_records_and_pins() -> Result<()> {
    let Some((store, _database)) = connect().await? else {
        return Ok(());
    };

    let cold = ColdStorageLocation::new("archive", "/mnt/archive");
    let path = MonitoredPath::new("media", "/srv/media", OperationMode::Move);
    let file = PathBuf::from("/srv/media/clip.mp4");

    let mut tx = store.begin().await?;
    tx.upsert_location(&cold).await?;
    tx.upsert_path(&path).await?;
    let first = tx.upsert_inventory(&hot_entry(path.id, &file)).await?;
    let mut updated = hot_entry(path.id, &file);
    updated.storage_tier = StorageTier::Cold;
    updated.cold_location_id = Some(cold.id);
    let stored = tx.upsert_inventory(&updated).await?;
    assert_eq!(stored.id, first.id);
    assert_eq!(tx.count_inventory_for_location(cold.id).await?, 1);

    let changed = tx
        .bulk_update_status(&[stored.id], FileStatus::Missing)
        .await?;
    assert_eq!(changed, 1);
    let missing = tx
        .query_inventory(&InventoryFilter::for_path(path.id).with_status(FileStatus::Missing))
        .await?;
    assert_eq!(missing.len(), 1);

    let record = FileRecord {
        id: Uuid::new_v4(),
        path_id: path.id,
        original_path: file.clone(),
        cold_storage_path: PathBuf::from("/mnt/archive/clip.mp4"),
        cold_location_id: Some(cold.id),
        file_size: 2048,
        operation_mode: OperationMode::Move,
        criteria_matched: vec![Uuid::new_v4()],
        timestamp: Utc::now(),
    };
    tx.insert_record(&record).await?;
    let by_cold = tx
        .find_record_by_cold_path(Path::new("/mnt/archive/clip.mp4"))
        .await?;
    assert_eq!(by_cold.as_ref(), Some(&record));

    tx.pin(path.id, &file).await?;
    tx.pin(path.id, &file).await?;
    assert_eq!(tx.list_pins(path.id).await?.len(), 1);
    assert!(tx.unpin(path.id, &file).await?);
    assert!(!tx.is_pinned(path.id, &file).await?);

    tx.record_failure(&OperationFailure {
        id: Uuid::new_v4(),
        location_id: cold.id,
        path_id: Some(path.id),
        file_path: file.clone(),
        occurred_at: Utc::now(),
        message: "disk full".to_string(),
    })
    .await?;
    let since = Utc::now() - Duration::minutes(15);
    assert_eq!(tx.count_failures_since(cold.id, since).await?, 1);
    tx.commit().await?;

    let mut tx = store.begin().await?;
    assert!(tx.delete_path(path.id).await?);
    assert!(tx.list_records(path.id).await?.is_empty());
    tx.rollback().await?;

    let mut tx = store.begin().await?;
    assert_eq!(tx.list_records(path.id).await?.len(), 1);
    Ok(())
}
