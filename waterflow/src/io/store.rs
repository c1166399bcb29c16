//! Key-presence storage for controller markers.
//!
//! Each marker is addressed independently so that presence, absence, and
//! modification time answer their question without parsing a shared blob.
//! [`FsMarkerStore`] keeps one file per key in the state directory; tests use
//! the in-memory store from `test_support`.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Durable keyed marker storage.
pub trait MarkerStore {
    fn exists(&self, key: &str) -> Result<bool>;

    /// Read a marker's contents, or `None` if it is absent.
    fn read(&self, key: &str) -> Result<Option<String>>;

    /// Create or replace a marker. Always refreshes its modification time.
    fn write(&self, key: &str, contents: &str) -> Result<()>;

    /// Create an empty marker only if it does not exist yet.
    ///
    /// Returns false when the marker was already present.
    fn create(&self, key: &str) -> Result<bool>;

    /// Remove a marker. Returns false when it was already absent.
    fn remove(&self, key: &str) -> Result<bool>;

    /// Last modification time, or `None` if the marker is absent.
    fn modified_at(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Current time on the clock that stamps modification times.
    fn now(&self) -> DateTime<Utc>;
}

/// Marker store backed by files in a single directory.
#[derive(Debug, Clone)]
pub struct FsMarkerStore {
    dir: PathBuf,
}

impl FsMarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create state directory {}", self.dir.display()))
    }
}

impl MarkerStore for FsMarkerStore {
    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path(key);
        path.try_exists()
            .with_context(|| format!("check marker {}", path.display()))
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read marker {}", path.display())),
        }
    }

    /// Atomically write the marker (temp file + rename).
    fn write(&self, key: &str, contents: &str) -> Result<()> {
        self.ensure_dir()?;
        let path = self.path(key);
        let tmp_path = self.path(&format!(".{key}.tmp"));
        debug!(path = %path.display(), "writing marker");
        fs::write(&tmp_path, contents)
            .with_context(|| format!("write temp marker {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("replace marker {}", path.display()))?;
        Ok(())
    }

    fn create(&self, key: &str) -> Result<bool> {
        self.ensure_dir()?;
        let path = self.path(key);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err).with_context(|| format!("create marker {}", path.display())),
        }
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove marker {}", path.display())),
        }
    }

    fn modified_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.path(key);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("stat marker {}", path.display()));
            }
        };
        let modified = metadata
            .modified()
            .with_context(|| format!("read mtime of {}", path.display()))?;
        Ok(Some(DateTime::<Utc>::from(modified)))
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
