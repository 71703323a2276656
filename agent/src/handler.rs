//! Turns filesystem events into recorded edit history.
//!
//! The [`DiffingEventHandler`] is the single writer of snapshots and edit
//! events. For each [`FsEvent`] it:
//!
//! | Event      | Action                                                            |
//! |------------|-------------------------------------------------------------------|
//! | `added`    | read file, record baseline patch `diff("", content)`, store snapshot |
//! | `modified` | diff snapshot against disk, record patch, store new snapshot      |
//! | `deleted`  | record event with empty patch                                     |
//! | `renamed`  | record event with empty patch, keyed to the old path              |
//!
//! No failure stops event processing: unreadable files, non-text content and
//! storage errors are logged and the handler moves on to the next event.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::diff::{read_text, DiffError, Differ};
use crate::history::EditHistoryLog;
use crate::snapshot::SnapshotStore;
use crate::types::{AssignmentId, EventType, FsEvent};

/// Consumer of classified filesystem events.
///
/// The watcher calls [`handle`](Self::handle) synchronously for each event,
/// one at a time.
pub trait FsEventHandler {
    /// Processes one event.
    fn handle(&mut self, event: FsEvent);
}

/// What the handler did with an event. Returned for tests and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// An edit event was appended with this id.
    Recorded(u64),
    /// The event was dropped without writing anything.
    Dropped,
}

/// Records edit history by diffing each file against its last snapshot.
pub struct DiffingEventHandler<S, L: ?Sized> {
    snapshots: S,
    log: Arc<L>,
    differ: Differ,
}

impl<S, L> DiffingEventHandler<S, L>
where
    S: SnapshotStore,
    L: EditHistoryLog + ?Sized,
{
    /// Creates a handler writing to the given stores.
    pub fn new(snapshots: S, log: Arc<L>, differ: Differ) -> Self {
        Self {
            snapshots,
            log,
            differ,
        }
    }

    /// Returns the snapshot store.
    pub fn snapshots(&self) -> &S {
        &self.snapshots
    }

    /// Returns the history log.
    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    /// Processes one event and reports what happened.
    pub fn process(&mut self, event: FsEvent) -> Outcome {
        let Some(assignment) = self.log.assignment_for(&event.path) else {
            warn!(
                path = %event.path.display(),
                event_type = %event.kind,
                "Event for path outside every assignment, dropping"
            );
            return Outcome::Dropped;
        };

        match event.kind {
            EventType::Added => self.on_added(assignment, &event.path),
            EventType::Modified => self.on_modified(assignment, &event.path),
            EventType::Deleted => self.record(assignment, &event.path, EventType::Deleted, ""),
            EventType::Renamed => {
                let old_path = event.old_path.as_deref().unwrap_or(&event.path);
                self.record(assignment, old_path, EventType::Renamed, "")
            }
        }
    }

    fn on_added(&mut self, assignment: AssignmentId, path: &Path) -> Outcome {
        let content = match read_text(path) {
            Ok(content) => content,
            Err(e @ DiffError::Read { .. }) => {
                // Usually a file that vanished again before we got to it.
                debug!(path = %path.display(), error = %e, "Cannot read added file, dropping");
                return Outcome::Dropped;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Added file is not text, recording without patch");
                let outcome = self.record(assignment, path, EventType::Added, "");
                self.store_snapshot(path, "");
                return outcome;
            }
        };

        let baseline = self.differ.diff("", &content).to_string();
        let outcome = self.record(assignment, path, EventType::Added, &baseline);
        if matches!(outcome, Outcome::Recorded(_)) {
            self.store_snapshot(path, &content);
        }
        outcome
    }

    fn on_modified(&mut self, assignment: AssignmentId, path: &Path) -> Outcome {
        let old = match self.snapshots.get(path) {
            Ok(Some(old)) => old,
            Ok(None) => {
                warn!(path = %path.display(), "Modified file has no snapshot, dropping");
                return Outcome::Dropped;
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read snapshot, dropping");
                return Outcome::Dropped;
            }
        };

        match self.differ.diff_file(&old, path) {
            Ok((patch, new)) => {
                if patch.is_empty() {
                    debug!(path = %path.display(), "Content unchanged");
                }
                let outcome = self.record(assignment, path, EventType::Modified, &patch.to_string());
                if matches!(outcome, Outcome::Recorded(_)) {
                    let stats = patch.stats();
                    debug!(
                        path = %path.display(),
                        lines_added = stats.lines_added,
                        lines_removed = stats.lines_removed,
                        chars_added = stats.chars_added,
                        "Recorded change"
                    );
                    self.store_snapshot(path, &new);
                }
                outcome
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Diff failed, recording without patch");
                self.record(assignment, path, EventType::Modified, "")
            }
        }
    }

    fn record(
        &self,
        assignment: AssignmentId,
        path: &Path,
        event_type: EventType,
        patch: &str,
    ) -> Outcome {
        match self.log.append(assignment, path, event_type, patch) {
            Ok(event) => {
                info!(
                    id = event.id,
                    assignment = %assignment,
                    path = %path.display(),
                    event_type = %event_type,
                    "Recorded edit event"
                );
                Outcome::Recorded(event.id)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to append edit event");
                Outcome::Dropped
            }
        }
    }

    fn store_snapshot(&mut self, path: &Path, content: &str) {
        if let Err(e) = self.snapshots.put(path, content) {
            error!(path = %path.display(), error = %e, "Failed to store snapshot");
        }
    }
}

impl<S, L> FsEventHandler for DiffingEventHandler<S, L>
where
    S: SnapshotStore,
    L: EditHistoryLog + ?Sized,
{
    fn handle(&mut self, event: FsEvent) {
        self.process(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryEditLog;
    use crate::patch::apply;
    use crate::snapshot::MemorySnapshotStore;
    use std::fs;
    use tempfile::TempDir;

    type Handler = DiffingEventHandler<MemorySnapshotStore, MemoryEditLog>;

    fn setup() -> (TempDir, Handler) {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(MemoryEditLog::new());
        log.map_path_to_assignment(dir.path(), AssignmentId(1))
            .unwrap();
        let handler = DiffingEventHandler::new(MemorySnapshotStore::new(), log, Differ::default());
        (dir, handler)
    }

    #[test]
    fn added_records_baseline_and_snapshot() {
        let (dir, mut handler) = setup();
        let path = dir.path().join("a.txt");
        fs::write(&path, "Hello World").unwrap();

        let outcome = handler.process(FsEvent::added(&path));
        assert!(matches!(outcome, Outcome::Recorded(_)));

        let events = handler.log().all_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Added);
        assert_eq!(apply(&events[0].patch, "").unwrap(), "Hello World");
        assert_eq!(
            handler.snapshots().get(&path).unwrap().as_deref(),
            Some("Hello World")
        );
    }

    #[test]
    fn modified_records_patch_against_snapshot() {
        let (dir, mut handler) = setup();
        let path = dir.path().join("a.txt");
        fs::write(&path, "Hello World").unwrap();
        handler.process(FsEvent::added(&path));

        fs::write(&path, "Hello Go").unwrap();
        handler.process(FsEvent::modified(&path));

        let events = handler.log().all_events();
        assert_eq!(events[1].event_type, EventType::Modified);
        assert!(events[1].patch.contains("-Hello World"));
        assert!(events[1].patch.contains("+Hello Go"));
        assert_eq!(
            handler.snapshots().get(&path).unwrap().as_deref(),
            Some("Hello Go")
        );
    }

    #[test]
    fn modified_without_snapshot_is_dropped() {
        let (dir, mut handler) = setup();
        let path = dir.path().join("a.txt");
        fs::write(&path, "x").unwrap();

        assert_eq!(handler.process(FsEvent::modified(&path)), Outcome::Dropped);
        assert!(handler.log().all_events().is_empty());
    }

    #[test]
    fn non_text_modification_keeps_snapshot() {
        let (dir, mut handler) = setup();
        let path = dir.path().join("a.txt");
        fs::write(&path, "text\n").unwrap();
        handler.process(FsEvent::added(&path));

        fs::write(&path, b"\xff\xfe\x00").unwrap();
        handler.process(FsEvent::modified(&path));

        let events = handler.log().all_events();
        assert_eq!(events[1].event_type, EventType::Modified);
        assert_eq!(events[1].patch, "");
        assert_eq!(
            handler.snapshots().get(&path).unwrap().as_deref(),
            Some("text\n")
        );
    }

    #[test]
    fn non_text_added_records_empty_patch() {
        let (dir, mut handler) = setup();
        let path = dir.path().join("image.bin");
        fs::write(&path, b"\x89P\x00G").unwrap();

        handler.process(FsEvent::added(&path));

        let events = handler.log().all_events();
        assert_eq!(events[0].event_type, EventType::Added);
        assert_eq!(events[0].patch, "");
        assert_eq!(handler.snapshots().get(&path).unwrap().as_deref(), Some(""));
    }

    #[test]
    fn unreadable_added_file_is_dropped() {
        let (dir, mut handler) = setup();
        let path = dir.path().join("vanished.txt");

        assert_eq!(handler.process(FsEvent::added(&path)), Outcome::Dropped);
    }

    #[test]
    fn deleted_and_renamed_have_empty_patches() {
        let (dir, mut handler) = setup();
        let old = dir.path().join("old.txt");

        handler.process(FsEvent::renamed(&old));
        handler.process(FsEvent::deleted(dir.path().join("gone.txt")));

        let events = handler.log().all_events();
        assert_eq!(events[0].event_type, EventType::Renamed);
        assert_eq!(events[0].file_path, old);
        assert_eq!(events[1].event_type, EventType::Deleted);
        assert!(events.iter().all(|e| e.patch.is_empty()));
    }

    #[test]
    fn unmapped_paths_are_dropped() {
        let (_dir, mut handler) = setup();
        let other = TempDir::new().unwrap();
        let path = other.path().join("a.txt");
        fs::write(&path, "x").unwrap();

        assert_eq!(handler.process(FsEvent::added(&path)), Outcome::Dropped);
        assert!(handler.log().all_events().is_empty());
    }
}
