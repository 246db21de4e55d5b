//! Scheduler ticks drive scans of due paths through fully wired services.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tempfile::TempDir;
use tierkeep_app::{Scheduler, build_services};
use tierkeep_config::EngineConfig;
use tierkeep_data::{
    ColdStorageLocation, Criterion, CriterionType, MonitoredPath, OperationMode, ScanOutcome, Store,
};
use tierkeep_test_support::fixtures::{TierFixture, age_file};

#[tokio::test]
async fn tick_scans_due_paths_once_per_interval() -> Result<()> {
    let keys = TempDir::new()?;
    let mut config = EngineConfig::default();
    config.encryption.key_file = keys.path().join("tierkeep.key");
    let services = build_services(&config).await?;

    let fixture = TierFixture::new(1)?;
    let location = ColdStorageLocation::new("archive", fixture.cold(0));
    let mut path = MonitoredPath::new("projects", fixture.hot(), OperationMode::Move);
    path.cold_location_ids = vec![location.id];
    let stale = fixture.write_hot("2019/notes.md", b"old notes")?;
    age_file(&stale, 120)?;
    let current = fixture.write_hot("2024/notes.md", b"new notes")?;

    let mut tx = services.store.begin().await?;
    tx.upsert_location(&location).await?;
    tx.upsert_path(&path).await?;
    tx.upsert_criterion(&Criterion::new(path.id, CriterionType::Mtime, "<", "60"))
        .await?;
    tx.commit().await?;

    let scheduler = Scheduler::new(
        Arc::clone(&services.store),
        services.workflow.clone(),
        Duration::from_secs(60),
    );
    assert_eq!(scheduler.due_paths(Utc::now()).await?, vec![path.id]);

    let mut scans = scheduler.tick_once().await?;
    assert_eq!(scans.len(), 1);
    while let Some(joined) = scans.join_next().await {
        joined?;
    }
    assert!(!stale.exists());
    assert!(current.exists());
    assert_eq!(fs::read(fixture.cold(0).join("2019/notes.md"))?, b"old notes");

    let mut tx = services.store.begin().await?;
    let stored = tx.get_path(path.id).await?.context("path vanished")?;
    tx.commit().await?;
    assert_eq!(stored.last_scan_outcome, Some(ScanOutcome::Completed));
    assert!(stored.last_scan_at.is_some());

    assert!(scheduler.tick_once().await?.is_empty());
    let snapshot = services.metrics.snapshot();
    assert_eq!(snapshot.active_scans, 0);
    Ok(())
}

#[tokio::test]
async fn dropping_the_scan_set_aborts_scheduled_scans() -> Result<()> {
    let keys = TempDir::new()?;
    let mut config = EngineConfig::default();
    config.encryption.key_file = keys.path().join("tierkeep.key");
    let services = build_services(&config).await?;

    let fixture = TierFixture::new(1)?;
    let mut tx = services.store.begin().await?;
    for index in 0..3 {
        let root = fixture.hot().join(format!("share-{index}"));
        fs::create_dir_all(&root)?;
        tx.upsert_path(&MonitoredPath::new(format!("share-{index}"), root, OperationMode::Move))
            .await?;
    }
    tx.commit().await?;

    let scheduler = Scheduler::new(
        Arc::clone(&services.store),
        services.workflow.clone(),
        Duration::from_secs(60),
    );
    let mut scans = tokio::task::JoinSet::new();
    assert_eq!(scheduler.schedule(&mut scans).await?, 3);
    assert_eq!(scans.len(), 3);

    scans.abort_all();
    let mut finished = 0;
    while let Some(joined) = scans.join_next().await {
        match joined {
            Ok(()) => finished += 1,
            Err(err) => assert!(err.is_cancelled()),
        }
    }
    assert!(finished <= 3);
    assert!(scans.is_empty());
    Ok(())
}
