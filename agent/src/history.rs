//! Append-only edit history log.
//!
//! The log stores every [`EditEvent`] the handler records plus the mapping
//! from watched directories to assignments. Events are never modified once
//! written; ids grow monotonically within one log.
//!
//! # Implementations
//!
//! - [`MemoryEditLog`]: keeps everything in memory. Used by tests and tools.
//! - [`JsonlEditLog`]: a `history.jsonl` file with one tagged JSON record per
//!   line. Each append is flushed and fsynced before it is acknowledged. On
//!   open the file is replayed into an in-memory index; a torn final line
//!   (from a crash mid-write) is dropped with a warning.
//!
//! ```text
//! {"record":"assignment","path":"/home/u/essay","assignmentId":1}
//! {"record":"event","id":1,"assignmentId":1,"filePath":"/home/u/essay/a.txt","eventType":"added","patch":"@@ -0,0 +1,1 @@\n+Hello\n","timestamp":"2024-01-15T14:30:00Z"}
//! ```
//!
//! # Thread Safety
//!
//! Both implementations are `Send + Sync` and take `&self`, so one log can be
//! shared through an `Arc` by the handler, the control plane and readers.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{AssignmentId, EditEvent, EventType};

/// File name of the durable log inside the data directory.
pub const HISTORY_FILE_NAME: &str = "history.jsonl";

/// Errors that can occur when reading or writing the history log.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// The log file could not be read or written.
    #[error("history log I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A record could not be serialized.
    #[error("failed to encode history record: {0}")]
    Encode(#[from] serde_json::Error),

    /// A complete line of the log could not be decoded.
    #[error("corrupt history record at {path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Durable store of edit events and assignment routing.
pub trait EditHistoryLog: Send + Sync {
    /// Appends a new event and returns it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns a [`HistoryError`] if the event cannot be persisted. The
    /// event is not visible to readers in that case.
    fn append(
        &self,
        assignment_id: AssignmentId,
        file_path: &Path,
        event_type: EventType,
        patch: &str,
    ) -> Result<EditEvent>;

    /// Returns every event of an assignment, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`HistoryError`] if the log cannot be read.
    fn events_for(&self, assignment_id: AssignmentId) -> Result<Vec<EditEvent>>;

    /// Routes files under `path` to `assignment_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`HistoryError`] if the mapping cannot be persisted.
    fn map_path_to_assignment(&self, path: &Path, assignment_id: AssignmentId) -> Result<()>;

    /// Returns the assignment owning `file_path`. The longest mapped prefix
    /// wins.
    fn assignment_for(&self, file_path: &Path) -> Option<AssignmentId>;

    /// Returns the assignment mapped to exactly `path`, allocating and
    /// mapping a new one if there is none.
    ///
    /// # Errors
    ///
    /// Returns a [`HistoryError`] if a new mapping cannot be persisted.
    fn register_assignment(&self, path: &Path) -> Result<AssignmentId>;

    /// Returns every mapped directory with its assignment.
    fn assignment_paths(&self) -> Vec<(PathBuf, AssignmentId)>;
}

/// One line of the JSONL log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum LogRecord {
    Event(EditEvent),
    Assignment(AssignmentRecord),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentRecord {
    path: PathBuf,
    assignment_id: AssignmentId,
}

/// In-memory state shared by both implementations.
#[derive(Debug, Default)]
struct LogIndex {
    events: Vec<EditEvent>,
    assignments: BTreeMap<PathBuf, AssignmentId>,
    next_event_id: u64,
}

impl LogIndex {
    fn new() -> Self {
        Self {
            next_event_id: 1,
            ..Self::default()
        }
    }

    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Event(event) => {
                self.next_event_id = self.next_event_id.max(event.id + 1);
                self.events.push(event);
            }
            LogRecord::Assignment(AssignmentRecord {
                path,
                assignment_id,
            }) => {
                self.assignments.insert(path, assignment_id);
            }
        }
    }

    fn next_event(
        &self,
        assignment_id: AssignmentId,
        file_path: &Path,
        event_type: EventType,
        patch: &str,
    ) -> EditEvent {
        EditEvent {
            id: self.next_event_id,
            assignment_id,
            file_path: file_path.to_path_buf(),
            event_type,
            patch: patch.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn next_assignment_id(&self) -> AssignmentId {
        let max = self.assignments.values().map(|id| id.0).max().unwrap_or(0);
        AssignmentId(max + 1)
    }

    fn events_for(&self, assignment_id: AssignmentId) -> Vec<EditEvent> {
        self.events
            .iter()
            .filter(|e| e.assignment_id == assignment_id)
            .cloned()
            .collect()
    }

    fn assignment_for(&self, file_path: &Path) -> Option<AssignmentId> {
        self.assignments
            .iter()
            .filter(|(dir, _)| file_path.starts_with(dir))
            .max_by_key(|(dir, _)| dir.components().count())
            .map(|(_, id)| *id)
    }

    fn assignment_paths(&self) -> Vec<(PathBuf, AssignmentId)> {
        self.assignments
            .iter()
            .map(|(path, id)| (path.clone(), *id))
            .collect()
    }
}

// =============================================================================
// In-memory log
// =============================================================================

/// History log held entirely in memory.
#[derive(Debug)]
pub struct MemoryEditLog {
    index: RwLock<LogIndex>,
}

impl MemoryEditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: RwLock::new(LogIndex::new()),
        }
    }

    /// Returns every event in append order, across all assignments.
    #[must_use]
    pub fn all_events(&self) -> Vec<EditEvent> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .clone()
    }
}

impl Default for MemoryEditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EditHistoryLog for MemoryEditLog {
    fn append(
        &self,
        assignment_id: AssignmentId,
        file_path: &Path,
        event_type: EventType,
        patch: &str,
    ) -> Result<EditEvent> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let event = index.next_event(assignment_id, file_path, event_type, patch);
        index.apply(LogRecord::Event(event.clone()));
        Ok(event)
    }

    fn events_for(&self, assignment_id: AssignmentId) -> Result<Vec<EditEvent>> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.events_for(assignment_id))
    }

    fn map_path_to_assignment(&self, path: &Path, assignment_id: AssignmentId) -> Result<()> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        index.assignments.insert(path.to_path_buf(), assignment_id);
        Ok(())
    }

    fn assignment_for(&self, file_path: &Path) -> Option<AssignmentId> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.assignment_for(file_path)
    }

    fn register_assignment(&self, path: &Path) -> Result<AssignmentId> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = index.assignments.get(path) {
            return Ok(*id);
        }
        let id = index.next_assignment_id();
        index.assignments.insert(path.to_path_buf(), id);
        Ok(id)
    }

    fn assignment_paths(&self) -> Vec<(PathBuf, AssignmentId)> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.assignment_paths()
    }
}

// =============================================================================
// JSON-lines log
// =============================================================================

/// History log persisted as a JSON-lines file.
///
/// The writer lock is held across id allocation, the write and the index
/// update, so ids in the file are strictly increasing.
#[derive(Debug)]
pub struct JsonlEditLog {
    path: PathBuf,
    writer: Mutex<File>,
    index: RwLock<LogIndex>,
}

impl JsonlEditLog {
    /// Opens the log at `path`, creating it if needed, and loads its records.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Io`] if the file cannot be opened and
    /// [`HistoryError::Corrupt`] if a complete line cannot be decoded.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let io_err = |source| HistoryError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        let (index, valid_len) = load(&path, &file)?;
        if valid_len < file.metadata().map_err(io_err)?.len() {
            warn!(
                path = %path.display(),
                offset = valid_len,
                "Dropping torn record at end of history log"
            );
            file.set_len(valid_len).map_err(io_err)?;
        }

        info!(
            path = %path.display(),
            events = index.events.len(),
            assignments = index.assignments.len(),
            "Opened history log"
        );

        Ok(Self {
            path,
            writer: Mutex::new(file),
            index: RwLock::new(index),
        })
    }

    /// Opens `history.jsonl` inside `data_dir`.
    ///
    /// # Errors
    ///
    /// See [`JsonlEditLog::open`].
    pub fn open_in(data_dir: &Path) -> Result<Self> {
        Self::open(data_dir.join(HISTORY_FILE_NAME))
    }

    /// Returns the path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the log at `path` into a [`MemoryEditLog`] without opening it
    /// for writing.
    ///
    /// A torn final line is skipped but left in place, so this is safe while
    /// a running daemon appends to the same file.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Io`] if the file cannot be read and
    /// [`HistoryError::Corrupt`] if a complete line cannot be decoded.
    pub fn read_only(path: &Path) -> Result<MemoryEditLog> {
        let file = File::open(path).map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let (index, _) = load(path, &file)?;
        Ok(MemoryEditLog {
            index: RwLock::new(index),
        })
    }

    /// Writes one record and fsyncs it.
    fn write_record(&self, file: &mut File, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let io_err = |source| HistoryError::Io {
            path: self.path.clone(),
            source,
        };
        file.write_all(&line).map_err(io_err)?;
        file.sync_data().map_err(io_err)
    }

    fn persist_assignment(&self, path: &Path, assignment_id: AssignmentId) -> Result<()> {
        let mut file = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let record = LogRecord::Assignment(AssignmentRecord {
            path: path.to_path_buf(),
            assignment_id,
        });
        self.write_record(&mut file, &record)?;

        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        index.apply(record);
        Ok(())
    }
}

/// Reads every complete record. Returns the index and the byte length of the
/// valid prefix of the file.
fn load(path: &Path, file: &File) -> Result<(LogIndex, u64)> {
    let mut index = LogIndex::new();
    let mut reader = BufReader::new(file);
    let mut valid_len = 0u64;
    let mut line_no = 0usize;
    let mut buf = String::new();

    loop {
        buf.clear();
        let read = reader
            .read_line(&mut buf)
            .map_err(|source| HistoryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let complete = buf.ends_with('\n');
        let text = buf.trim();
        if text.is_empty() {
            if complete {
                valid_len += read as u64;
            }
            continue;
        }

        match serde_json::from_str::<LogRecord>(text) {
            Ok(record) if complete => {
                index.apply(record);
                valid_len += read as u64;
            }
            // A final line without its newline was cut short by a crash.
            Ok(_) => break,
            Err(_) if !complete => break,
            Err(source) => {
                return Err(HistoryError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    source,
                })
            }
        }
    }

    Ok((index, valid_len))
}

impl EditHistoryLog for JsonlEditLog {
    fn append(
        &self,
        assignment_id: AssignmentId,
        file_path: &Path,
        event_type: EventType,
        patch: &str,
    ) -> Result<EditEvent> {
        let mut file = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let event = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .next_event(assignment_id, file_path, event_type, patch);

        let record = LogRecord::Event(event.clone());
        self.write_record(&mut file, &record)?;

        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(record);

        debug!(
            id = event.id,
            assignment = %assignment_id,
            path = %file_path.display(),
            event_type = %event_type,
            "Appended edit event"
        );
        Ok(event)
    }

    fn events_for(&self, assignment_id: AssignmentId) -> Result<Vec<EditEvent>> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.events_for(assignment_id))
    }

    fn map_path_to_assignment(&self, path: &Path, assignment_id: AssignmentId) -> Result<()> {
        self.persist_assignment(path, assignment_id)
    }

    fn assignment_for(&self, file_path: &Path) -> Option<AssignmentId> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.assignment_for(file_path)
    }

    fn register_assignment(&self, path: &Path) -> Result<AssignmentId> {
        // Held across lookup and write so two registrations of new paths
        // cannot allocate the same id.
        let mut file = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let id = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(id) = index.assignments.get(path) {
                return Ok(*id);
            }
            index.next_assignment_id()
        };

        let record = LogRecord::Assignment(AssignmentRecord {
            path: path.to_path_buf(),
            assignment_id: id,
        });
        self.write_record(&mut file, &record)?;
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(record);

        info!(path = %path.display(), assignment = %id, "Registered assignment");
        Ok(id)
    }

    fn assignment_paths(&self) -> Vec<(PathBuf, AssignmentId)> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.assignment_paths()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(log: &dyn EditHistoryLog) {
        let essay = AssignmentId(1);
        let other = AssignmentId(2);
        log.map_path_to_assignment(Path::new("/work/essay"), essay)
            .unwrap();
        log.map_path_to_assignment(Path::new("/work/other"), other)
            .unwrap();

        let first = log
            .append(essay, Path::new("/work/essay/a.txt"), EventType::Added, "p1")
            .unwrap();
        let second = log
            .append(other, Path::new("/work/other/b.txt"), EventType::Added, "")
            .unwrap();
        let third = log
            .append(essay, Path::new("/work/essay/a.txt"), EventType::Modified, "p2")
            .unwrap();

        assert!(first.id < second.id && second.id < third.id);

        let events = log.events_for(essay).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].patch, "p1");
        assert_eq!(events[1].event_type, EventType::Modified);

        // Reading again gives the same answer.
        assert_eq!(log.events_for(essay).unwrap(), events);
        assert!(log.events_for(AssignmentId(99)).unwrap().is_empty());
    }

    #[test]
    fn memory_log_appends_and_filters() {
        let log = MemoryEditLog::new();
        exercise(&log);
        assert_eq!(log.all_events().len(), 3);
    }

    #[test]
    fn jsonl_log_appends_and_filters() {
        let dir = TempDir::new().unwrap();
        let log = JsonlEditLog::open_in(dir.path()).unwrap();
        exercise(&log);
    }

    #[test]
    fn assignment_for_prefers_longest_prefix() {
        let log = MemoryEditLog::new();
        log.map_path_to_assignment(Path::new("/work"), AssignmentId(1))
            .unwrap();
        log.map_path_to_assignment(Path::new("/work/nested"), AssignmentId(2))
            .unwrap();

        assert_eq!(
            log.assignment_for(Path::new("/work/a.txt")),
            Some(AssignmentId(1))
        );
        assert_eq!(
            log.assignment_for(Path::new("/work/nested/b.txt")),
            Some(AssignmentId(2))
        );
        assert_eq!(log.assignment_for(Path::new("/elsewhere/c.txt")), None);
        // Component-wise: "/workshop" is not under "/work".
        assert_eq!(log.assignment_for(Path::new("/workshop/d.txt")), None);
    }

    #[test]
    fn register_assignment_is_idempotent() {
        let log = MemoryEditLog::new();
        let a = log.register_assignment(Path::new("/work/a")).unwrap();
        let b = log.register_assignment(Path::new("/work/b")).unwrap();

        assert_ne!(a, b);
        assert_eq!(log.register_assignment(Path::new("/work/a")).unwrap(), a);
        assert_eq!(log.assignment_paths().len(), 2);
    }

    #[test]
    fn jsonl_log_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(HISTORY_FILE_NAME);

        let (assignment, last_id) = {
            let log = JsonlEditLog::open(&path).unwrap();
            let assignment = log.register_assignment(Path::new("/work")).unwrap();
            log.append(assignment, Path::new("/work/a"), EventType::Added, "x")
                .unwrap();
            let last = log
                .append(assignment, Path::new("/work/a"), EventType::Deleted, "")
                .unwrap();
            (assignment, last.id)
        };

        let log = JsonlEditLog::open(&path).unwrap();
        assert_eq!(log.events_for(assignment).unwrap().len(), 2);
        assert_eq!(
            log.assignment_paths(),
            vec![(PathBuf::from("/work"), assignment)]
        );
        assert_eq!(log.register_assignment(Path::new("/work")).unwrap(), assignment);

        let next = log
            .append(assignment, Path::new("/work/a"), EventType::Added, "")
            .unwrap();
        assert_eq!(next.id, last_id + 1);
    }

    #[test]
    fn jsonl_log_drops_torn_final_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(HISTORY_FILE_NAME);

        {
            let log = JsonlEditLog::open(&path).unwrap();
            log.append(AssignmentId(1), Path::new("/w/a"), EventType::Added, "")
                .unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"record":"event","id":2,"assign"#).unwrap();
        drop(file);

        let log = JsonlEditLog::open(&path).unwrap();
        assert_eq!(log.events_for(AssignmentId(1)).unwrap().len(), 1);

        // The torn bytes are gone, so the next append starts a clean line.
        let event = log
            .append(AssignmentId(1), Path::new("/w/a"), EventType::Modified, "")
            .unwrap();
        assert_eq!(event.id, 2);
        drop(log);

        let log = JsonlEditLog::open(&path).unwrap();
        assert_eq!(log.events_for(AssignmentId(1)).unwrap().len(), 2);
    }

    #[test]
    fn read_only_leaves_torn_line_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(HISTORY_FILE_NAME);
        {
            let log = JsonlEditLog::open(&path).unwrap();
            log.map_path_to_assignment(Path::new("/w"), AssignmentId(1))
                .unwrap();
            log.append(AssignmentId(1), Path::new("/w/a"), EventType::Added, "")
                .unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"record":"ev"#).unwrap();
        drop(file);
        let len = fs::metadata(&path).unwrap().len();

        let copy = JsonlEditLog::read_only(&path).unwrap();
        assert_eq!(copy.all_events().len(), 1);
        assert_eq!(copy.assignment_for(Path::new("/w/a")), Some(AssignmentId(1)));
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn read_only_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = JsonlEditLog::read_only(&dir.path().join(HISTORY_FILE_NAME)).unwrap_err();
        assert!(matches!(err, HistoryError::Io { .. }));
    }

    #[test]
    fn jsonl_log_rejects_corrupt_complete_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(HISTORY_FILE_NAME);
        fs::write(&path, "not json\n").unwrap();

        let err = JsonlEditLog::open(&path).unwrap_err();
        assert!(matches!(err, HistoryError::Corrupt { line: 1, .. }));
    }

    #[test]
    fn jsonl_records_are_tagged() {
        let dir = TempDir::new().unwrap();
        let log = JsonlEditLog::open_in(dir.path()).unwrap();
        log.map_path_to_assignment(Path::new("/w"), AssignmentId(4))
            .unwrap();
        log.append(AssignmentId(4), Path::new("/w/a"), EventType::Renamed, "")
            .unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines[0]["record"], "assignment");
        assert_eq!(lines[0]["assignmentId"], 4);
        assert_eq!(lines[1]["record"], "event");
        assert_eq!(lines[1]["eventType"], "renamed");
        assert_eq!(lines[1]["filePath"], "/w/a");
    }
}
