//! Reconstruct file content from recorded patches.
//!
//! Replay folds [`patch::apply`](crate::patch::apply) over an ordered
//! sequence of patches. Because patches are strict about their base text, a
//! missing or reordered patch surfaces as a [`ReplayError`] naming the patch
//! and the hunk that failed, never as silently wrong output.
//!
//! # Example
//!
//! ```
//! use tracewrite_agent::diff::diff;
//! use tracewrite_agent::replay::{reconstruct, reconstruct_at};
//!
//! let v1 = "Hello World\n";
//! let v2 = "Hello Go\n";
//! let patches = vec![diff("", v1).to_string(), diff(v1, v2).to_string()];
//!
//! assert_eq!(reconstruct("", &patches).unwrap(), v2);
//! assert_eq!(reconstruct_at("", &patches, 1).unwrap(), v1);
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::patch::{self, PatchApplyError};
use crate::types::{EditEvent, EventType};

/// A patch in a replay sequence could not be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("patch {index} failed to apply: {source}")]
pub struct ReplayError {
    /// 0-based position of the failing patch in the sequence.
    pub index: usize,

    /// Event id of the failing patch, when replaying events.
    pub event_id: Option<u64>,

    /// The underlying apply failure, which names the hunk.
    #[source]
    pub source: PatchApplyError,
}

impl ReplayError {
    /// Returns the index of the hunk that failed, if known.
    #[must_use]
    pub fn hunk(&self) -> Option<usize> {
        self.source.hunk()
    }
}

/// Result type for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Applies every patch in order, starting from `start`.
///
/// # Errors
///
/// Returns a [`ReplayError`] for the first patch that does not apply.
pub fn reconstruct<P: AsRef<str>>(start: &str, patches: &[P]) -> Result<String> {
    reconstruct_at(start, patches, patches.len())
}

/// Applies the first `count` patches, giving the content as of that point.
///
/// `count` larger than the number of patches replays all of them.
///
/// # Errors
///
/// Returns a [`ReplayError`] for the first patch that does not apply.
pub fn reconstruct_at<P: AsRef<str>>(start: &str, patches: &[P], count: usize) -> Result<String> {
    let mut text = start.to_string();
    for (index, patch) in patches.iter().take(count).enumerate() {
        text = patch::apply(patch.as_ref(), &text).map_err(|source| ReplayError {
            index,
            event_id: None,
            source,
        })?;
    }
    Ok(text)
}

/// Replays the events of one file up to and including event id `up_to`.
///
/// `added` restarts from empty text and applies its baseline patch,
/// `modified` applies its patch, `deleted` and `renamed` mark the file absent.
/// Events for other paths are ignored. Returns `None` if the file does not
/// exist at that point.
///
/// # Errors
///
/// Returns a [`ReplayError`] if a patch does not apply, or if a `modified`
/// event arrives while the file is absent.
pub fn replay_file(events: &[EditEvent], path: &Path, up_to: Option<u64>) -> Result<Option<String>> {
    let mut content: Option<String> = None;

    let relevant = events
        .iter()
        .filter(|e| e.is_for(path))
        .take_while(|e| up_to.map_or(true, |limit| e.id <= limit));

    for (index, event) in relevant.enumerate() {
        let fail = |source| ReplayError {
            index,
            event_id: Some(event.id),
            source,
        };

        match event.event_type {
            EventType::Added => {
                content = Some(patch::apply(&event.patch, "").map_err(fail)?);
            }
            EventType::Modified => {
                let Some(current) = content.as_deref() else {
                    return Err(fail(PatchApplyError::Mismatch { hunk: 0, line: 1 }));
                };
                content = Some(patch::apply(&event.patch, current).map_err(fail)?);
            }
            EventType::Deleted | EventType::Renamed => content = None,
        }
    }

    Ok(content)
}

/// Outcome of replaying one file of an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileState {
    /// The file exists with this content.
    Present(String),
    /// The file was deleted or renamed away.
    Absent,
    /// The history of this file cannot be replayed.
    Unavailable(ReplayError),
}

/// Replays every file touched by an assignment's events.
///
/// A failure for one file is reported for that file only.
#[must_use]
pub fn rebuild_assignment(events: &[EditEvent]) -> BTreeMap<PathBuf, FileState> {
    let mut paths: Vec<&Path> = events.iter().map(|e| e.file_path.as_path()).collect();
    paths.sort();
    paths.dedup();

    paths
        .into_iter()
        .map(|path| {
            let state = match replay_file(events, path, None) {
                Ok(Some(content)) => FileState::Present(content),
                Ok(None) => FileState::Absent,
                Err(e) => FileState::Unavailable(e),
            };
            (path.to_path_buf(), state)
        })
        .collect()
}
