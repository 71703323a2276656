//! Error types for the Tracewrite agent.
//!
//! Each module owns its own error enum. [`AgentError`] wraps all of them for
//! callers that drive several modules at once, such as the daemon startup.

use thiserror::Error;

use crate::config::ConfigError;
use crate::control::ControlError;
use crate::diff::DiffError;
use crate::history::HistoryError;
use crate::patch::PatchApplyError;
use crate::replay::ReplayError;
use crate::snapshot::SnapshotError;
use crate::watcher::WatcherError;

/// Errors that can occur during agent operations.
///
/// # Examples
///
/// ```
/// use tracewrite_agent::error::{AgentError, Result};
/// use tracewrite_agent::patch;
///
/// fn apply_one(patch: &str, base: &str) -> Result<String> {
///     Ok(patch::apply(patch, base)?)
/// }
///
/// let err = apply_one("not a patch", "").unwrap_err();
/// assert!(matches!(err, AgentError::Patch(_)));
/// ```
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Watch setup or subscription error.
    #[error("watch error: {0}")]
    Watch(#[from] WatcherError),

    /// Diff computation error.
    #[error("diff error: {0}")]
    Diff(#[from] DiffError),

    /// A single patch could not be applied.
    #[error("patch error: {0}")]
    Patch(#[from] PatchApplyError),

    /// A patch sequence could not be replayed.
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Edit history log error.
    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// Snapshot store error.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Control plane error.
    #[error("control error: {0}")]
    Control(#[from] ControlError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
