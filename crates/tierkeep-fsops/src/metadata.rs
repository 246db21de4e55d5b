//! Point-in-time file metadata used by criteria evaluation and inventory sync.

use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::{FsOpsError, FsOpsResult};

/// Kind of directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link (only when not followed).
    Symlink,
    /// Sockets, fifos, devices.
    Other,
}

impl EntryKind {
    /// Criterion spelling of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
            Self::Other => "other",
        }
    }
}

/// Metadata captured for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    /// Path the snapshot was taken from.
    pub path: PathBuf,
    /// Entry kind.
    pub kind: EntryKind,
    /// Size in bytes.
    pub size: u64,
    /// Last modification.
    pub modified: DateTime<Utc>,
    /// Last access.
    pub accessed: DateTime<Utc>,
    /// Last status change; falls back to `modified` where unavailable.
    pub changed: DateTime<Utc>,
    /// Permission bits (`0o7777` mask).
    pub mode: u32,
    /// Owning uid.
    pub uid: u32,
    /// Owning gid.
    pub gid: u32,
}

impl FileSnapshot {
    /// Stat `path` without following a trailing symlink.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be stat'ed.
    pub fn stat(path: &Path) -> FsOpsResult<Self> {
        let metadata =
            fs::symlink_metadata(path).map_err(|err| FsOpsError::io("metadata.lstat", path, err))?;
        Ok(Self::from_metadata(path, &metadata))
    }

    /// Stat `path`, following symlinks to the real file.
    ///
    /// # Errors
    ///
    /// Returns an error if the path or its target cannot be stat'ed.
    pub fn follow(path: &Path) -> FsOpsResult<Self> {
        let metadata = fs::metadata(path).map_err(|err| FsOpsError::io("metadata.stat", path, err))?;
        Ok(Self::from_metadata(path, &metadata))
    }

    /// Build a snapshot from already-fetched metadata.
    #[must_use]
    pub fn from_metadata(path: &Path, metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        let modified = timestamp(metadata.modified());
        let accessed = timestamp(metadata.accessed());
        let (changed, mode, uid, gid) = unix_fields(metadata, modified);
        Self {
            path: path.to_path_buf(),
            kind,
            size: metadata.len(),
            modified,
            accessed,
            changed,
            mode,
            uid,
            gid,
        }
    }

    /// File name component as UTF-8 (lossy).
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn timestamp(value: std::io::Result<SystemTime>) -> DateTime<Utc> {
    value.map_or(DateTime::<Utc>::UNIX_EPOCH, DateTime::<Utc>::from)
}

#[cfg(unix)]
fn unix_fields(metadata: &Metadata, _modified: DateTime<Utc>) -> (DateTime<Utc>, u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;

    let changed = u32::try_from(metadata.ctime_nsec())
        .ok()
        .and_then(|nanos| DateTime::from_timestamp(metadata.ctime(), nanos))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    (changed, metadata.mode() & 0o7777, metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn unix_fields(metadata: &Metadata, modified: DateTime<Utc>) -> (DateTime<Utc>, u32, u32, u32) {
    let mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
    (modified, mode, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierkeep_test_support::fixtures::{TierFixture, age_file};

    type TestResult<T> = anyhow::Result<T>;

    #[test]
    fn snapshot_reports_size_kind_and_age() -> TestResult<()> {
        let fixture = TierFixture::new(0)?;
        let file = fixture.write_hot("docs/report.pdf", b"0123456789")?;
        age_file(&file, 120)?;

        let snapshot = FileSnapshot::stat(&file)?;
        assert_eq!(snapshot.kind, EntryKind::File);
        assert_eq!(snapshot.size, 10);
        assert_eq!(snapshot.file_name(), "report.pdf");
        let age = Utc::now() - snapshot.modified;
        assert!(age.num_minutes() >= 119 && age.num_minutes() <= 121);

        let dir = FileSnapshot::stat(fixture.hot())?;
        assert_eq!(dir.kind.as_str(), "directory");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn stat_does_not_follow_symlinks() -> TestResult<()> {
        let fixture = TierFixture::new(1)?;
        let target = fixture.cold(0).join("payload.bin");
        std::fs::write(&target, [0_u8; 64])?;
        let link = fixture.hot().join("payload.bin");
        std::os::unix::fs::symlink(&target, &link)?;

        assert_eq!(FileSnapshot::stat(&link)?.kind, EntryKind::Symlink);
        let followed = FileSnapshot::follow(&link)?;
        assert_eq!(followed.kind, EntryKind::File);
        assert_eq!(followed.size, 64);
        Ok(())
    }

    #[test]
    fn missing_path_is_source_missing() {
        let err = FileSnapshot::stat(Path::new("/definitely/not/here.txt"));
        assert!(err.is_err_and(|err| err.is_source_missing()));
    }
}
