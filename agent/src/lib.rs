//! Tracewrite Agent - edit history capture and replay.
//!
//! This crate watches assignment directories, records every change to a
//! tracked file as a line-oriented patch in an append-only history log, and
//! reconstructs any historical version of a file by replaying those patches.
//!
//! # Overview
//!
//! ```text
//! notify ──► DirectoryWatcher ──► DiffingEventHandler ──► EditHistoryLog
//!                                        │
//!                                        └──► SnapshotStore
//! ```
//!
//! Each file's history starts with a baseline patch from empty text, so
//! replaying all of its patches from `""` gives its current content.
//!
//! # Modules
//!
//! - [`types`]: Event types shared by all modules
//! - [`watcher`]: Recursive directory watcher with ignore list
//! - [`diff`]: Line diff with semantic and efficiency cleanup
//! - [`patch`]: Unified-hunk patch text format and strict application
//! - [`snapshot`]: Last known content per tracked file
//! - [`history`]: Append-only edit history log and assignment mapping
//! - [`replay`]: Reconstruct file content from recorded patches
//! - [`handler`]: Turns filesystem events into recorded edits
//! - [`control`]: TCP control plane for watch requests
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for agent operations

pub mod config;
pub mod control;
pub mod diff;
pub mod error;
pub mod handler;
pub mod history;
pub mod patch;
pub mod replay;
pub mod snapshot;
pub mod types;
pub mod watcher;

pub use config::Config;
pub use control::{Command, Controller, Status};
pub use diff::{diff, DiffError, DiffOptions, Differ};
pub use error::{AgentError, Result};
pub use handler::{DiffingEventHandler, FsEventHandler, Outcome};
pub use history::{EditHistoryLog, HistoryError, JsonlEditLog, MemoryEditLog};
pub use patch::{apply, Patch, PatchApplyError};
pub use replay::{rebuild_assignment, reconstruct, reconstruct_at, replay_file, FileState, ReplayError};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotError, SnapshotStore};
pub use types::{AssignmentId, EditEvent, EventType, FsEvent};
pub use watcher::{DirectoryWatcher, Notifications, WatcherError};
