//! Physical file transfer between hot and cold trees.
//!
//! # Design
//! - Same-filesystem moves are a single `rename`; cross-device moves copy into a
//!   sibling temp file, rename it into place, then remove the source.
//! - Every written payload lands under a `.part` name first so a crash never leaves a
//!   destination that looks complete.
//! - Encryption and decryption happen while writing the temp file, before the final rename.
//! - Modification/access times and permission bits follow the payload.

use std::fs::{self, File, FileTimes, Metadata};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tierkeep_data::OperationMode;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto::{CHUNK_SIZE, EncryptionService};
use crate::error::{FsOpsError, FsOpsResult};

/// Transformation applied to the bytes on their way to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Bytes are written unchanged.
    Plain,
    /// Plaintext source, encrypted destination.
    Encrypt,
    /// Encrypted source, plaintext destination.
    Decrypt,
}

impl Payload {
    /// Payload for a transfer between two locations with the given encryption flags.
    #[must_use]
    pub const fn between(source_encrypted: bool, destination_encrypted: bool) -> Self {
        match (source_encrypted, destination_encrypted) {
            (false, true) => Self::Encrypt,
            (true, false) => Self::Decrypt,
            _ => Self::Plain,
        }
    }
}

/// Result of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Final location of the payload.
    pub destination: PathBuf,
    /// Plaintext bytes carried.
    pub bytes: u64,
    /// Whether the transfer was a plain rename.
    pub renamed: bool,
}

/// Performs move/copy/symlink transfers of single files.
#[derive(Debug, Clone, Default)]
pub struct FileMover {
    encryption: Option<Arc<EncryptionService>>,
}

impl FileMover {
    /// Create a mover; `encryption` is required for non-plain payloads.
    #[must_use]
    pub const fn new(encryption: Option<Arc<EncryptionService>>) -> Self {
        Self { encryption }
    }

    /// Transfer `source` to `destination` according to `mode`.
    ///
    /// - `Move`: the source is removed.
    /// - `Copy`: the source stays in place.
    /// - `Symlink`: the source is moved and replaced by a symlink to the destination.
    ///
    /// `progress` receives cumulative plaintext bytes when data is streamed.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::SourceMissing`] or [`FsOpsError::DestinationExists`] for
    /// precondition failures, and IO or crypto errors otherwise. The destination is
    /// never left partially written.
    pub fn transfer(
        &self,
        source: &Path,
        destination: &Path,
        mode: OperationMode,
        payload: Payload,
        progress: &mut dyn FnMut(u64),
    ) -> FsOpsResult<TransferOutcome> {
        let metadata = match fs::metadata(source) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(FsOpsError::SourceMissing {
                    path: source.to_path_buf(),
                });
            }
            Err(err) => return Err(FsOpsError::io("transfer.stat_source", source, err)),
        };
        if fs::symlink_metadata(destination).is_ok() {
            return Err(FsOpsError::DestinationExists {
                path: destination.to_path_buf(),
            });
        }
        if payload != Payload::Plain && self.encryption.is_none() {
            return Err(FsOpsError::EncryptionUnavailable);
        }
        ensure_parent(destination)?;

        let outcome = match mode {
            OperationMode::Move => self.relocate(source, destination, &metadata, payload, progress)?,
            OperationMode::Copy => {
                let bytes = self.write_payload(source, destination, &metadata, payload, progress)?;
                TransferOutcome {
                    destination: destination.to_path_buf(),
                    bytes,
                    renamed: false,
                }
            }
            OperationMode::Symlink => {
                let outcome = self.relocate(source, destination, &metadata, payload, progress)?;
                create_symlink(destination, source)?;
                outcome
            }
        };
        debug!(
            source = %source.display(),
            destination = %destination.display(),
            mode = %mode,
            bytes = outcome.bytes,
            "file transferred"
        );
        Ok(outcome)
    }

    fn relocate(
        &self,
        source: &Path,
        destination: &Path,
        metadata: &Metadata,
        payload: Payload,
        progress: &mut dyn FnMut(u64),
    ) -> FsOpsResult<TransferOutcome> {
        if payload == Payload::Plain {
            match fs::rename(source, destination) {
                Ok(()) => {
                    progress(metadata.len());
                    return Ok(TransferOutcome {
                        destination: destination.to_path_buf(),
                        bytes: metadata.len(),
                        renamed: true,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                    debug!(source = %source.display(), "rename crosses devices; copying");
                }
                Err(err) => return Err(FsOpsError::io("transfer.rename", source, err)),
            }
        }
        let bytes = self.write_payload(source, destination, metadata, payload, progress)?;
        fs::remove_file(source).map_err(|err| FsOpsError::io("transfer.remove_source", source, err))?;
        Ok(TransferOutcome {
            destination: destination.to_path_buf(),
            bytes,
            renamed: false,
        })
    }

    fn write_payload(
        &self,
        source: &Path,
        destination: &Path,
        metadata: &Metadata,
        payload: Payload,
        progress: &mut dyn FnMut(u64),
    ) -> FsOpsResult<u64> {
        let temp = temp_path(destination);
        let written = match (payload, self.encryption.as_deref()) {
            (Payload::Plain, _) => copy_with_progress(source, &temp, progress),
            (Payload::Encrypt, Some(service)) => service.encrypt_file(source, &temp, progress),
            (Payload::Decrypt, Some(service)) => service.decrypt_file(source, &temp, progress),
            (_, None) => Err(FsOpsError::EncryptionUnavailable),
        };
        let finished = written.and_then(|bytes| {
            preserve_metadata(&temp, metadata)?;
            fs::rename(&temp, destination)
                .map_err(|err| FsOpsError::io("transfer.rename_temp", destination, err))?;
            Ok(bytes)
        });
        if finished.is_err() {
            remove_if_present(&temp);
        }
        finished
    }
}

/// Create `link` pointing at `target`.
///
/// # Errors
///
/// Returns [`FsOpsError::DestinationExists`] if something already occupies `link`.
pub fn create_symlink(target: &Path, link: &Path) -> FsOpsResult<()> {
    if fs::symlink_metadata(link).is_ok() {
        return Err(FsOpsError::DestinationExists {
            path: link.to_path_buf(),
        });
    }
    ensure_parent(link)?;
    symlink(target, link).map_err(|err| FsOpsError::io("transfer.symlink", link, err))
}

/// Files that ask desktop indexers (Spotlight, Tracker) to skip a directory.
pub const NO_INDEX_MARKERS: [&str; 2] = [".metadata_never_index", ".trackerignore"];

/// Create the indexer opt-out markers in `dir`; returns how many were new.
///
/// # Errors
///
/// Returns an error if a marker cannot be created.
pub fn mark_unindexed(dir: &Path) -> FsOpsResult<usize> {
    let mut created = 0;
    for name in NO_INDEX_MARKERS {
        let marker = dir.join(name);
        match File::options().write(true).create_new(true).open(&marker) {
            Ok(_) => created += 1,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(FsOpsError::io("index_marker.create", &marker, err)),
        }
    }
    if created > 0 {
        debug!(dir = %dir.display(), created, "indexer opt-out markers written");
    }
    Ok(created)
}

/// Remove `path` only when it is a symlink; returns whether anything was removed.
///
/// # Errors
///
/// Returns an error if a regular file occupies `path` or removal fails.
pub fn remove_symlink(path: &Path) -> FsOpsResult<bool> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            fs::remove_file(path).map_err(|err| FsOpsError::io("transfer.remove_symlink", path, err))?;
            Ok(true)
        }
        Ok(_) => Err(FsOpsError::DestinationExists {
            path: path.to_path_buf(),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(FsOpsError::io("transfer.stat_symlink", path, err)),
    }
}

/// Hex-encoded SHA-256 of a file's contents.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn sha256_file(path: &Path) -> FsOpsResult<String> {
    let file = File::open(path).map_err(|err| FsOpsError::io("checksum.open", path, err))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; CHUNK_SIZE];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| FsOpsError::io("checksum.read", path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

fn copy_with_progress(
    source: &Path,
    destination: &Path,
    progress: &mut dyn FnMut(u64),
) -> FsOpsResult<u64> {
    let input = File::open(source).map_err(|err| FsOpsError::io("transfer.open_source", source, err))?;
    let output = File::options()
        .write(true)
        .create_new(true)
        .open(destination)
        .map_err(|err| FsOpsError::io("transfer.create_temp", destination, err))?;
    let mut reader = BufReader::new(input);
    let mut writer = BufWriter::new(output);
    let mut buffer = vec![0_u8; CHUNK_SIZE];
    let mut total = 0_u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FsOpsError::io("transfer.read", source, err)),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(|err| FsOpsError::io("transfer.write", destination, err))?;
        total += read as u64;
        progress(total);
    }
    writer
        .flush()
        .map_err(|err| FsOpsError::io("transfer.flush", destination, err))?;
    Ok(total)
}

fn preserve_metadata(path: &Path, metadata: &Metadata) -> FsOpsResult<()> {
    let mut times = FileTimes::new();
    if let Ok(modified) = metadata.modified() {
        times = times.set_modified(modified);
    }
    if let Ok(accessed) = metadata.accessed() {
        times = times.set_accessed(accessed);
    }
    let file = File::options()
        .write(true)
        .open(path)
        .map_err(|err| FsOpsError::io("transfer.open_temp", path, err))?;
    file.set_times(times)
        .map_err(|err| FsOpsError::io("transfer.set_times", path, err))?;
    fs::set_permissions(path, metadata.permissions())
        .map_err(|err| FsOpsError::io("transfer.set_permissions", path, err))
}

fn ensure_parent(path: &Path) -> FsOpsResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| FsOpsError::io("transfer.create_parent", parent, err))?;
    }
    Ok(())
}

fn temp_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{name}.tierkeep-{}.part", Uuid::new_v4().simple()))
}

fn remove_if_present(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(error = %err, path = %path.display(), "failed to remove temp file");
        }
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tierkeep_test_support::fixtures::{TierFixture, age_file};

    type TestResult<T> = anyhow::Result<T>;

    fn encrypted_mover() -> TestResult<FileMover> {
        let service = EncryptionService::from_secret(vec![3_u8; 32])?;
        Ok(FileMover::new(Some(Arc::new(service))))
    }

    fn close_to(left: SystemTime, right: SystemTime) -> bool {
        let drift = left
            .duration_since(right)
            .unwrap_or_else(|err| err.duration());
        drift < Duration::from_secs(1)
    }

    #[test]
    fn move_renames_and_preserves_mtime() -> TestResult<()> {
        let fixture = TierFixture::new(1)?;
        let source = fixture.write_hot("a/b.txt", b"hello")?;
        let stamp = age_file(&source, 600)?;
        let destination = fixture.cold(0).join("a/b.txt");

        let mut seen = 0;
        let outcome = FileMover::default().transfer(
            &source,
            &destination,
            OperationMode::Move,
            Payload::Plain,
            &mut |bytes| seen = bytes,
        )?;
        assert!(outcome.renamed);
        assert_eq!(seen, 5);
        assert!(!source.exists());
        assert_eq!(fs::read(&destination)?, b"hello");
        assert!(close_to(fs::metadata(&destination)?.modified()?, stamp));
        Ok(())
    }

    #[test]
    fn copy_keeps_source_and_preserves_mtime() -> TestResult<()> {
        let fixture = TierFixture::new(1)?;
        let source = fixture.write_hot("c.txt", b"copy me")?;
        let stamp = age_file(&source, 90)?;
        let destination = fixture.cold(0).join("c.txt");

        let outcome = FileMover::default().transfer(
            &source,
            &destination,
            OperationMode::Copy,
            Payload::Plain,
            &mut |_| {},
        )?;
        assert_eq!(outcome.bytes, 7);
        assert_eq!(fs::read(&source)?, b"copy me");
        assert_eq!(fs::read(&destination)?, b"copy me");
        assert!(close_to(fs::metadata(&destination)?.modified()?, stamp));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlink_mode_leaves_pointer_behind() -> TestResult<()> {
        let fixture = TierFixture::new(1)?;
        let source = fixture.write_hot("media/clip.mp4", b"frames")?;
        let destination = fixture.cold(0).join("media/clip.mp4");

        FileMover::default().transfer(
            &source,
            &destination,
            OperationMode::Symlink,
            Payload::Plain,
            &mut |_| {},
        )?;
        assert!(fs::symlink_metadata(&source)?.file_type().is_symlink());
        assert_eq!(fs::read_link(&source)?, destination);
        assert_eq!(fs::read(&source)?, b"frames");

        assert!(remove_symlink(&source)?);
        assert!(!remove_symlink(&source)?);
        assert!(matches!(
            remove_symlink(&destination),
            Err(FsOpsError::DestinationExists { .. })
        ));
        Ok(())
    }

    #[test]
    fn occupied_destination_is_rejected() -> TestResult<()> {
        let fixture = TierFixture::new(1)?;
        let source = fixture.write_hot("d.txt", b"new")?;
        let destination = fixture.cold(0).join("d.txt");
        fs::write(&destination, b"old")?;

        let err = FileMover::default().transfer(
            &source,
            &destination,
            OperationMode::Move,
            Payload::Plain,
            &mut |_| {},
        );
        assert!(matches!(err, Err(FsOpsError::DestinationExists { .. })));
        assert_eq!(fs::read(&destination)?, b"old");
        assert!(source.exists());
        Ok(())
    }

    #[test]
    fn missing_source_is_reported() -> TestResult<()> {
        let fixture = TierFixture::new(1)?;
        let err = FileMover::default().transfer(
            &fixture.hot().join("gone.txt"),
            &fixture.cold(0).join("gone.txt"),
            OperationMode::Move,
            Payload::Plain,
            &mut |_| {},
        );
        assert!(matches!(err, Err(FsOpsError::SourceMissing { .. })));
        Ok(())
    }

    #[test]
    fn encrypted_round_trip_restores_bytes_and_mtime() -> TestResult<()> {
        let fixture = TierFixture::new(1)?;
        let mover = encrypted_mover()?;
        let original = fixture.write_hot("secret.txt", b"classified contents")?;
        let stamp = age_file(&original, 300)?;
        let cold = fixture.cold(0).join("secret.txt");

        mover.transfer(&original, &cold, OperationMode::Move, Payload::Encrypt, &mut |_| {})?;
        assert!(!original.exists());
        assert_ne!(fs::read(&cold)?, b"classified contents");

        mover.transfer(&cold, &original, OperationMode::Move, Payload::Decrypt, &mut |_| {})?;
        assert!(!cold.exists());
        assert_eq!(fs::read(&original)?, b"classified contents");
        assert!(close_to(fs::metadata(&original)?.modified()?, stamp));
        Ok(())
    }

    #[test]
    fn failed_decrypt_leaves_no_destination_or_temp() -> TestResult<()> {
        let fixture = TierFixture::new(1)?;
        let mover = encrypted_mover()?;
        let cold = fixture.cold(0).join("broken.bin");
        fs::write(&cold, [9_u8; 80])?;
        let restored = fixture.hot().join("broken.bin");

        let err = mover.transfer(&cold, &restored, OperationMode::Move, Payload::Decrypt, &mut |_| {});
        assert!(matches!(err, Err(FsOpsError::Integrity { .. })));
        assert!(cold.exists());
        assert_eq!(fs::read_dir(fixture.hot())?.count(), 0);
        Ok(())
    }

    #[test]
    fn encryption_requires_a_service() -> TestResult<()> {
        let fixture = TierFixture::new(1)?;
        let source = fixture.write_hot("e.txt", b"x")?;
        let err = FileMover::default().transfer(
            &source,
            &fixture.cold(0).join("e.txt"),
            OperationMode::Copy,
            Payload::Encrypt,
            &mut |_| {},
        );
        assert!(matches!(err, Err(FsOpsError::EncryptionUnavailable)));
        assert_eq!(Payload::between(false, true), Payload::Encrypt);
        assert_eq!(Payload::between(true, true), Payload::Plain);
        Ok(())
    }

    #[test]
    fn checksum_is_lowercase_hex_sha256() -> TestResult<()> {
        let fixture = TierFixture::new(0)?;
        let file = fixture.write_hot("abc.txt", b"abc")?;
        assert_eq!(
            sha256_file(&file)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }

    #[test]
    fn index_markers_are_written_once() -> TestResult<()> {
        let fixture = TierFixture::new(1)?;
        assert_eq!(mark_unindexed(fixture.cold(0))?, NO_INDEX_MARKERS.len());
        assert_eq!(mark_unindexed(fixture.cold(0))?, 0);
        for name in NO_INDEX_MARKERS {
            assert!(fixture.cold(0).join(name).is_file());
        }
        Ok(())
    }
}
