//! Hot/cold directory fixtures for filesystem-level tests.

use std::fs::{self, File, FileTimes};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tempfile::TempDir;

/// A temporary hot tree plus a number of cold roots under one directory.
pub struct TierFixture {
    _root: TempDir,
    hot: PathBuf,
    cold: Vec<PathBuf>,
}

impl TierFixture {
    /// Create a hot tree and `cold_roots` empty cold directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn new(cold_roots: usize) -> Result<Self> {
        let root = TempDir::new().context("failed to create fixture root")?;
        let hot = root.path().join("hot");
        fs::create_dir_all(&hot).context("failed to create hot tree")?;
        let cold = (0..cold_roots)
            .map(|index| {
                let dir = root.path().join(format!("cold-{index}"));
                fs::create_dir_all(&dir).map(|()| dir)
            })
            .collect::<std::io::Result<Vec<_>>>()
            .context("failed to create cold roots")?;
        Ok(Self {
            _root: root,
            hot,
            cold,
        })
    }

    /// Root of the hot tree.
    #[must_use]
    pub fn hot(&self) -> &Path {
        &self.hot
    }

    /// Cold root by index.
    ///
    /// # Panics
    ///
    /// Panics when `index` is outside the number of roots requested at construction.
    #[must_use]
    pub fn cold(&self, index: usize) -> &Path {
        &self.cold[index]
    }

    /// Write `contents` to `relative` under the hot tree, creating parents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_hot(&self, relative: &str, contents: &[u8]) -> Result<PathBuf> {
        write_file(&self.hot.join(relative), contents)
    }

    /// Write a zero-filled file of `size` bytes under the hot tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_hot_sized(&self, relative: &str, size: u64) -> Result<PathBuf> {
        let path = self.hot.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        file.set_len(size)?;
        Ok(path)
    }
}

/// Write `contents` to `path`, creating parents.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_file(path: &Path, contents: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path.to_path_buf())
}

/// Set both modification and access time to `minutes` ago.
///
/// # Errors
///
/// Returns an error if the timestamps cannot be updated.
pub fn age_file(path: &Path, minutes: u64) -> Result<SystemTime> {
    let stamp = SystemTime::now()
        .checked_sub(Duration::from_secs(minutes * 60))
        .context("timestamp underflow")?;
    let file = File::options()
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.set_times(FileTimes::new().set_modified(stamp).set_accessed(stamp))
        .with_context(|| format!("failed to set times on {}", path.display()))?;
    Ok(stamp)
}
