//! Freeze, thaw, pin and reversal of individual files.
//!
//! # Design
//! - Each file is its own unit of work: read state, commit, transfer on the blocking
//!   pool, then write the outcome in a fresh transaction.
//! - Transfer failures against a cold location are recorded so routing can penalise it.
//! - A vanished source surfaces as [`tierkeep_fsops::FsOpsError::SourceMissing`] and
//!   maps to a skip, not an error, inside scans.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tierkeep_data::{
    ColdStorageLocation, FileInventoryEntry, FileRecord, FileStatus, MonitoredPath,
    OperationFailure, OperationMode, PinnedFile, StorageTier,
};
use tierkeep_fsops::{
    FileMover, FileSnapshot, FsOpsError, Payload, create_symlink, mark_unindexed, remove_symlink,
    sha256_file,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::progress::{FileOperationKind, ScanProgressManager};
use crate::workflow::{FileWorkflow, describe, inventory_entry};

/// Outcome of reversing every frozen file of a path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReversalResult {
    /// Files restored to hot storage.
    pub thawed: u64,
    /// Per-file failures.
    pub errors: Vec<String>,
}

struct FreezeTransfer {
    bytes: u64,
    checksum: Option<String>,
}

impl FileWorkflow {
    /// Freeze one hot inventory entry into the best cold location.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown entry,
    /// [`EngineError::InvalidInput`] for an entry that is not hot,
    /// [`EngineError::NoCapacity`] when no location can take it, and transfer errors.
    pub async fn freeze_file(&self, inventory_id: Uuid) -> EngineResult<FileRecord> {
        let mut tx = self.inner.store.begin().await?;
        let entry = tx
            .get_inventory(inventory_id)
            .await?
            .ok_or_else(|| EngineError::not_found("inventory", inventory_id))?;
        tx.commit().await?;
        if entry.storage_tier != StorageTier::Hot {
            return Err(EngineError::invalid("inventory", "not_hot", inventory_id));
        }
        let ctx = self.load_context(entry.path_id).await?;
        let criteria_ids = ctx.enabled_criteria_ids();
        self.freeze_entry(&ctx.path, entry, criteria_ids).await
    }

    /// Thaw the file described by a history record back to its original hot path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown record or path,
    /// [`EngineError::DestinationExists`] when the hot path is occupied, and transfer
    /// or integrity errors.
    pub async fn thaw_file(&self, record_id: Uuid) -> EngineResult<FileInventoryEntry> {
        let mut tx = self.inner.store.begin().await?;
        let record = tx
            .get_record(record_id)
            .await?
            .ok_or_else(|| EngineError::not_found("file_record", record_id))?;
        let path = tx
            .get_path(record.path_id)
            .await?
            .ok_or_else(|| EngineError::not_found("monitored_path", record.path_id))?;
        tx.commit().await?;
        self.thaw_record(&path, record).await
    }

    /// Exclude a file from automatic classification.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown path.
    pub async fn pin_file(&self, path_id: Uuid, file_path: &Path) -> EngineResult<PinnedFile> {
        let mut tx = self.inner.store.begin().await?;
        if tx.get_path(path_id).await?.is_none() {
            return Err(EngineError::not_found("monitored_path", path_id));
        }
        let pin = tx.pin(path_id, file_path).await?;
        tx.commit().await?;
        info!(path_id = %path_id, file = %file_path.display(), "file pinned");
        Ok(pin)
    }

    /// Return a file to automatic classification; `false` when it was not pinned.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn unpin_file(&self, path_id: Uuid, file_path: &Path) -> EngineResult<bool> {
        let mut tx = self.inner.store.begin().await?;
        let removed = tx.unpin(path_id, file_path).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Thaw every frozen file of a path, collecting per-file failures.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown path; per-file failures are
    /// reported in [`ReversalResult::errors`].
    pub async fn reverse_path_operations(&self, path_id: Uuid) -> EngineResult<ReversalResult> {
        let mut tx = self.inner.store.begin().await?;
        let path = tx
            .get_path(path_id)
            .await?
            .ok_or_else(|| EngineError::not_found("monitored_path", path_id))?;
        let records = tx.list_records(path_id).await?;
        tx.commit().await?;

        let mut result = ReversalResult::default();
        for record in records {
            let original = record.original_path.clone();
            match self.thaw_record(&path, record).await {
                Ok(_) => result.thawed += 1,
                Err(err) => {
                    warn!(
                        path_id = %path_id,
                        file = %original.display(),
                        error = %err,
                        "reversal failed for file"
                    );
                    result
                        .errors
                        .push(format!("{}: {}", original.display(), describe(&err)));
                }
            }
        }
        info!(
            path_id = %path_id,
            thawed = result.thawed,
            errors = result.errors.len(),
            "path operations reversed"
        );
        Ok(result)
    }

    pub(crate) async fn freeze_entry(
        &self,
        path: &MonitoredPath,
        entry: FileInventoryEntry,
        criteria_ids: Vec<Uuid>,
    ) -> EngineResult<FileRecord> {
        let source = entry.file_path.clone();
        let metadata = match fs::symlink_metadata(&source) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(FsOpsError::SourceMissing { path: source }.into());
            }
            Err(err) => {
                return Err(EngineError::from(FsOpsError::Io {
                    operation: "freeze.stat",
                    path: source,
                    source: err,
                }));
            }
        };
        if !metadata.file_type().is_file() {
            return Err(EngineError::invalid(
                "file_path",
                "not_regular_file",
                source.display(),
            ));
        }

        let size = metadata.len();
        let location = self
            .inner
            .router
            .select_location(path, size)
            .await?
            .ok_or_else(|| EngineError::NoCapacity {
                file_path: source.clone(),
                size,
            })?;
        let relative = source
            .strip_prefix(&path.source_path)
            .map_err(|_| EngineError::invalid("file_path", "outside_source", source.display()))?;
        let destination = location.path.join(relative);
        if fs::symlink_metadata(&destination).is_ok() {
            return Err(EngineError::DestinationExists { path: destination });
        }

        let payload = if location.is_encrypted {
            Payload::Encrypt
        } else {
            Payload::Plain
        };
        let unindexed = path.prevent_indexing.then_some(location.path.as_path());
        let transfer = self
            .blocking_freeze(path, &source, &destination, payload, size, unindexed)
            .await;
        let transfer = match transfer {
            Ok(transfer) => transfer,
            Err(err) => {
                self.note_failure("freeze", &location, path.id, &source, &err).await;
                return Err(err);
            }
        };

        let now = Utc::now();
        let record = FileRecord {
            id: Uuid::new_v4(),
            path_id: path.id,
            original_path: source.clone(),
            cold_storage_path: destination.clone(),
            cold_location_id: Some(location.id),
            file_size: transfer.bytes,
            operation_mode: path.operation_mode,
            criteria_matched: criteria_ids,
            timestamp: now,
        };
        let cold_entry = FileInventoryEntry {
            file_path: destination.clone(),
            storage_tier: StorageTier::Cold,
            file_size: transfer.bytes,
            checksum: transfer.checksum.or(entry.checksum.clone()),
            status: FileStatus::Active,
            cold_location_id: Some(location.id),
            last_seen: now,
            ..entry.clone()
        };

        let stored: EngineResult<()> = async {
            let mut tx = self.inner.store.begin().await?;
            tx.insert_record(&record).await?;
            tx.delete_inventory(entry.id).await?;
            tx.upsert_inventory(&cold_entry).await?;
            if self.inner.settings.pin_after_freeze {
                tx.pin(path.id, &source).await?;
            }
            tx.commit().await?;
            Ok(())
        }
        .await;
        if let Err(err) = stored {
            self.undo_freeze(path.id, record, location.is_encrypted).await;
            return Err(err);
        }

        self.inner.metrics.inc_file_operation("freeze", "completed");
        self.inner.metrics.add_bytes("freeze", transfer.bytes);
        info!(
            path_id = %path.id,
            file = %source.display(),
            destination = %destination.display(),
            location = %location.name,
            mode = %path.operation_mode,
            "file frozen"
        );
        Ok(record)
    }

    pub(crate) async fn thaw_record(
        &self,
        path: &MonitoredPath,
        record: FileRecord,
    ) -> EngineResult<FileInventoryEntry> {
        let mut tx = self.inner.store.begin().await?;
        let location = match record.cold_location_id {
            Some(id) => tx.get_location(id).await?,
            None => None,
        };
        let cold_entry = tx
            .find_inventory(path.id, &record.cold_storage_path)
            .await?;
        tx.commit().await?;

        if cold_entry
            .as_ref()
            .is_some_and(|entry| entry.status == FileStatus::Migrating)
        {
            return Err(EngineError::RelocationConflict {
                inventory_id: cold_entry.map_or_else(Uuid::nil, |entry| entry.id),
            });
        }

        let payload = if location.as_ref().is_some_and(|location| location.is_encrypted) {
            Payload::Decrypt
        } else {
            Payload::Plain
        };
        let snapshot = match self.blocking_thaw(path.id, &record, payload).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                if let Some(location) = &location {
                    self.note_failure("thaw", location, path.id, &record.original_path, &err)
                        .await;
                }
                return Err(err);
            }
        };

        let now = Utc::now();
        let mut hot_entry = inventory_entry(path.id, &snapshot, None, now, StorageTier::Hot, None);
        if let Some(entry) = &cold_entry {
            hot_entry.id = entry.id;
            hot_entry.checksum.clone_from(&entry.checksum);
        }

        let mut tx = self.inner.store.begin().await?;
        tx.delete_record(record.id).await?;
        if let Some(entry) = &cold_entry {
            tx.delete_inventory(entry.id).await?;
        }
        let stored = tx.upsert_inventory(&hot_entry).await?;
        if self.inner.settings.pin_after_thaw {
            tx.pin(path.id, &record.original_path).await?;
        }
        tx.commit().await?;

        self.inner.metrics.inc_file_operation("thaw", "completed");
        self.inner.metrics.add_bytes("thaw", record.file_size);
        info!(
            path_id = %path.id,
            file = %record.original_path.display(),
            mode = %record.operation_mode,
            "file thawed"
        );
        Ok(stored)
    }

    async fn blocking_freeze(
        &self,
        path: &MonitoredPath,
        source: &Path,
        destination: &Path,
        payload: Payload,
        size: u64,
        unindexed: Option<&Path>,
    ) -> EngineResult<FreezeTransfer> {
        let mover = self.inner.mover.clone();
        let progress = self.inner.progress.clone();
        let checksums = self.inner.settings.compute_checksums;
        let (path_id, mode) = (path.id, path.operation_mode);
        let (source, destination) = (source.to_path_buf(), destination.to_path_buf());
        let unindexed = unindexed.map(Path::to_path_buf);
        tokio::task::spawn_blocking(move || -> EngineResult<FreezeTransfer> {
            let checksum = checksums.then(|| sha256_file(&source)).transpose()?;
            let bytes = tracked_transfer(
                &mover,
                &progress,
                path_id,
                FileOperationKind::Freeze,
                size,
                (&source, &destination),
                mode,
                payload,
            )?;
            if let Some(root) = &unindexed {
                suppress_indexing(root, &destination);
            }
            Ok(FreezeTransfer { bytes, checksum })
        })
        .await
        .map_err(|err| EngineError::join("freeze.transfer", err))?
    }

    /// Put a frozen file back after its bookkeeping failed to commit.
    async fn undo_freeze(&self, path_id: Uuid, record: FileRecord, encrypted: bool) {
        let mover = self.inner.mover.clone();
        let progress = self.inner.progress.clone();
        let file = record.original_path.clone();
        let payload = Payload::between(encrypted, false);
        let undone = tokio::task::spawn_blocking(move || {
            restore(&mover, &progress, path_id, &record, payload)
        })
        .await;
        match undone {
            Ok(Ok(())) => warn!(file = %file.display(), "freeze rolled back after store failure"),
            Ok(Err(err)) => error!(
                file = %file.display(),
                error = %err,
                "freeze rollback failed; cold copy left in place"
            ),
            Err(err) => error!(file = %file.display(), error = %err, "freeze rollback task failed"),
        }
    }

    async fn blocking_thaw(
        &self,
        path_id: Uuid,
        record: &FileRecord,
        payload: Payload,
    ) -> EngineResult<FileSnapshot> {
        let mover = self.inner.mover.clone();
        let progress = self.inner.progress.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> EngineResult<FileSnapshot> {
            restore(&mover, &progress, path_id, &record, payload)?;
            Ok(FileSnapshot::stat(&record.original_path)?)
        })
        .await
        .map_err(|err| EngineError::join("thaw.transfer", err))?
    }

    async fn note_failure(
        &self,
        operation: &'static str,
        location: &ColdStorageLocation,
        path_id: Uuid,
        file_path: &Path,
        err: &EngineError,
    ) {
        if err.is_source_missing() {
            return;
        }
        self.inner.metrics.inc_file_operation(operation, "failed");
        let failure = OperationFailure {
            id: Uuid::new_v4(),
            location_id: location.id,
            path_id: Some(path_id),
            file_path: file_path.to_path_buf(),
            occurred_at: Utc::now(),
            message: describe(err),
        };
        let write = async {
            let mut tx = self.inner.store.begin().await?;
            tx.record_failure(&failure).await?;
            tx.commit().await
        };
        if let Err(store_err) = write.await {
            warn!(location = %location.name, error = %store_err, "failed to record operation failure");
        }
    }
}

/// Write indexer opt-out markers into the location root and the file's directory.
pub(crate) fn suppress_indexing(root: &Path, destination: &Path) {
    let mut dirs = vec![root];
    if let Some(parent) = destination.parent()
        && parent != root
    {
        dirs.push(parent);
    }
    for dir in dirs {
        if let Err(err) = mark_unindexed(dir) {
            warn!(dir = %dir.display(), error = %err, "failed to write indexer opt-out markers");
        }
    }
}

/// Move the cold payload back to its original path according to the record's mode.
fn restore(
    mover: &FileMover,
    progress: &ScanProgressManager,
    path_id: Uuid,
    record: &FileRecord,
    payload: Payload,
) -> EngineResult<()> {
    let original = &record.original_path;
    let cold = &record.cold_storage_path;
    let move_back = || {
        tracked_transfer(
            mover,
            progress,
            path_id,
            FileOperationKind::Thaw,
            record.file_size,
            (cold.as_path(), original.as_path()),
            OperationMode::Move,
            payload,
        )
    };
    match record.operation_mode {
        OperationMode::Move => {
            if fs::symlink_metadata(original).is_ok() {
                return Err(EngineError::DestinationExists {
                    path: original.clone(),
                });
            }
            move_back()?;
        }
        OperationMode::Copy => {
            if fs::symlink_metadata(original).is_ok() {
                fs::remove_file(cold).map_err(|err| FsOpsError::Io {
                    operation: "thaw.remove_cold_copy",
                    path: cold.clone(),
                    source: err,
                })?;
            } else {
                move_back()?;
            }
        }
        OperationMode::Symlink => {
            if fs::symlink_metadata(cold).is_err() {
                return Err(FsOpsError::SourceMissing { path: cold.clone() }.into());
            }
            let removed = remove_symlink(original)?;
            if let Err(err) = move_back() {
                if removed && let Err(link_err) = create_symlink(cold, original) {
                    warn!(
                        file = %original.display(),
                        error = %link_err,
                        "failed to restore symlink after thaw failure"
                    );
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn tracked_transfer(
    mover: &FileMover,
    progress: &ScanProgressManager,
    path_id: Uuid,
    kind: FileOperationKind,
    size: u64,
    (source, destination): (&Path, &Path),
    mode: OperationMode,
    payload: Payload,
) -> EngineResult<u64> {
    let tracked: PathBuf = match kind {
        FileOperationKind::Freeze => source.to_path_buf(),
        FileOperationKind::Thaw => destination.to_path_buf(),
    };
    progress.begin_operation(path_id, &tracked, kind, size);
    let mut report = |bytes: u64| progress.update_operation(path_id, &tracked, bytes);
    let outcome = mover.transfer(source, destination, mode, payload, &mut report);
    progress.end_operation(path_id, &tracked);
    Ok(outcome?.bytes)
}
