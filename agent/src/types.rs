//! Event types for edit history capture.
//!
//! This module defines the two event shapes the agent works with:
//!
//! - [`FsEvent`]: an ephemeral, classified filesystem notification produced by
//!   the [`watcher`](crate::watcher) and consumed immediately by the
//!   [`handler`](crate::handler).
//! - [`EditEvent`]: the durable unit stored in the
//!   [`history`](crate::history) log. All durable types serialize to camelCase
//!   JSON.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of the logical assignment a watched directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssignmentId(pub u64);

impl fmt::Display for AssignmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of a change to a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl EventType {
    /// Returns the lowercase wire name of this event type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified filesystem notification.
///
/// For [`EventType::Renamed`] the `path` is the path that disappeared and
/// `old_path` repeats it; the destination of a rename arrives as its own
/// [`EventType::Added`] event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    /// What happened to the path.
    pub kind: EventType,
    /// The affected path.
    pub path: PathBuf,
    /// Set only for renames.
    pub old_path: Option<PathBuf>,
}

impl FsEvent {
    #[must_use]
    pub fn added(path: impl Into<PathBuf>) -> Self {
        Self::new(EventType::Added, path.into())
    }

    #[must_use]
    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(EventType::Modified, path.into())
    }

    #[must_use]
    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(EventType::Deleted, path.into())
    }

    #[must_use]
    pub fn renamed(old_path: impl Into<PathBuf>) -> Self {
        let old_path = old_path.into();
        Self {
            kind: EventType::Renamed,
            path: old_path.clone(),
            old_path: Some(old_path),
        }
    }

    fn new(kind: EventType, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            old_path: None,
        }
    }
}

/// A single immutable entry of the edit history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditEvent {
    /// Monotonically increasing identifier, unique within one log.
    pub id: u64,

    /// Assignment the file belongs to.
    pub assignment_id: AssignmentId,

    /// Absolute path of the file the event is about.
    pub file_path: PathBuf,

    /// What happened to the file.
    pub event_type: EventType,

    /// Line-level patch text. Baseline patch for `added`, change patch for
    /// `modified`, empty otherwise or when diffing failed.
    #[serde(default)]
    pub patch: String,

    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
}

impl EditEvent {
    /// Returns true if this event is about `path`.
    #[must_use]
    pub fn is_for(&self, path: &Path) -> bool {
        self.file_path == path
    }
}
