//! Latest known content of every tracked file.
//!
//! A snapshot is the full text a file had when its last `added` or
//! `modified` event was recorded. The [`handler`](crate::handler) diffs new
//! disk content against it, so it must always match what replaying the file's
//! history produces.
//!
//! Two stores are provided:
//!
//! - [`MemorySnapshotStore`]: a plain map, used in tests and by tools that
//!   rebuild state from the log.
//! - [`FileSnapshotStore`]: one JSON file per tracked path under a directory.
//!   File names are UUIDv5 hashes of the path, and every write goes through a
//!   temporary file followed by a rename so a crash never leaves a half
//!   written snapshot behind.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Namespace for snapshot file names.
const SNAPSHOT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x2f, 0x8c, 0x41, 0x6a, 0x93, 0x1d, 0x4e, 0x07, 0xb5, 0x62, 0x0e, 0x7a, 0xc9, 0x13, 0x58, 0xd4,
]);

/// Errors that can occur when reading or writing snapshots.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Filesystem error while accessing the store.
    #[error("snapshot I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A stored snapshot could not be decoded.
    #[error("corrupt snapshot {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A snapshot file names a different path than the one requested.
    ///
    /// Only possible with a UUIDv5 collision or a hand-edited store.
    #[error("snapshot {file} belongs to {stored}, not {requested}")]
    PathMismatch {
        file: PathBuf,
        stored: PathBuf,
        requested: PathBuf,
    },
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Storage for the latest content of each tracked file.
///
/// Only the event handler writes snapshots, so the store is accessed through
/// `&mut self` and needs no internal locking.
pub trait SnapshotStore {
    /// Returns the stored content for `path`, or `None` if there is none.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotError`] if the store cannot be read.
    fn get(&self, path: &Path) -> Result<Option<String>>;

    /// Stores `content` as the latest content of `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotError`] if the store cannot be written.
    fn put(&mut self, path: &Path, content: &str) -> Result<()>;

    /// Removes the snapshot for `path`. Missing snapshots are not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotError`] if the store cannot be written.
    fn delete(&mut self, path: &Path) -> Result<()>;
}

/// In-memory snapshot store.
#[derive(Debug, Default, Clone)]
pub struct MemorySnapshotStore {
    snapshots: HashMap<PathBuf, String>,
}

impl MemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.snapshots.get(path).cloned())
    }

    fn put(&mut self, path: &Path, content: &str) -> Result<()> {
        self.snapshots
            .insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn delete(&mut self, path: &Path) -> Result<()> {
        self.snapshots.remove(path);
        Ok(())
    }
}

/// On-disk form of one snapshot.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRecord {
    file_path: PathBuf,
    content: String,
}

/// Directory-backed snapshot store.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SnapshotError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Returns the directory this store writes to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file holding the snapshot for `path`.
    #[must_use]
    pub fn file_for(&self, path: &Path) -> PathBuf {
        let id = Uuid::new_v5(&SNAPSHOT_NAMESPACE, path.as_os_str().as_encoded_bytes());
        self.dir.join(format!("{id}.json"))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn get(&self, path: &Path) -> Result<Option<String>> {
        let file = self.file_for(path);
        let bytes = match fs::read(&file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SnapshotError::Io { path: file, source }),
        };

        let record: SnapshotRecord =
            serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Corrupt {
                path: file.clone(),
                source,
            })?;

        if record.file_path != path {
            return Err(SnapshotError::PathMismatch {
                file,
                stored: record.file_path,
                requested: path.to_path_buf(),
            });
        }

        Ok(Some(record.content))
    }

    fn put(&mut self, path: &Path, content: &str) -> Result<()> {
        let file = self.file_for(path);
        let record = SnapshotRecord {
            file_path: path.to_path_buf(),
            content: content.to_string(),
        };
        let json = serde_json::to_vec(&record).map_err(|source| SnapshotError::Corrupt {
            path: file.clone(),
            source,
        })?;

        let tmp = file.with_extension("json.tmp");
        write_synced(&tmp, &json).map_err(|source| SnapshotError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &file).map_err(|source| SnapshotError::Io { path: file, source })
    }

    fn delete(&mut self, path: &Path) -> Result<()> {
        let file = self.file_for(path);
        match fs::remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SnapshotError::Io { path: file, source }),
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
