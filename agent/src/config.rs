//! Configuration module for the Tracewrite agent.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TRACEWRITE_DATA_DIR` | No | `~/.tracewrite` | History log, snapshots and port file |
//! | `TRACEWRITE_CONTROL_ADDR` | No | `127.0.0.1:0` | Control plane bind address |
//! | `TRACEWRITE_IGNORE` | No | (none) | Comma-separated paths to ignore |
//! | `TRACEWRITE_CONTEXT_LINES` | No | 3 | Context lines around each change in a patch |
//! | `TRACEWRITE_EDIT_COST` | No | 4 | Equal lines worth merging two nearby changes (>= 1) |
//!
//! # Example
//!
//! ```no_run
//! use tracewrite_agent::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Data directory: {}", config.data_dir.display());
//! ```

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use directories::BaseDirs;
use thiserror::Error;

use crate::diff::{DiffOptions, DEFAULT_CONTEXT_LINES, DEFAULT_EDIT_COST};

/// Default data directory name relative to home.
const DEFAULT_DATA_DIR: &str = ".tracewrite";

/// Default control plane address. Port 0 lets the OS pick a free port.
const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:0";

/// Subdirectory of the data directory holding snapshots.
const SNAPSHOT_DIR: &str = "snapshots";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Configuration for the Tracewrite agent.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `history.jsonl`, snapshots and `daemon.port`.
    pub data_dir: PathBuf,

    /// Address the control plane binds to.
    pub control_addr: SocketAddr,

    /// Extra paths whose events are always dropped.
    pub ignore: Vec<PathBuf>,

    /// Patch generation settings.
    pub diff: DiffOptions,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `TRACEWRITE_CONTROL_ADDR` is not a socket address
    /// - `TRACEWRITE_CONTEXT_LINES` is not a non-negative integer
    /// - `TRACEWRITE_EDIT_COST` is not a positive integer
    /// - `TRACEWRITE_DATA_DIR` is unset and the home directory cannot be
    ///   determined
    pub fn from_env() -> Result<Self, ConfigError> {
        // Optional: TRACEWRITE_DATA_DIR (default: ~/.tracewrite)
        let data_dir = match env::var("TRACEWRITE_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs.home_dir().join(DEFAULT_DATA_DIR)
            }
        };

        // Optional: TRACEWRITE_CONTROL_ADDR (default: 127.0.0.1:0)
        let control_addr = env::var("TRACEWRITE_CONTROL_ADDR")
            .unwrap_or_else(|_| DEFAULT_CONTROL_ADDR.to_string());
        let control_addr =
            control_addr
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "TRACEWRITE_CONTROL_ADDR".to_string(),
                    message: format!("expected socket address, got '{control_addr}'"),
                })?;

        // Optional: TRACEWRITE_IGNORE (default: none)
        let ignore = env::var("TRACEWRITE_IGNORE")
            .map(|val| {
                val.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        // Optional: TRACEWRITE_CONTEXT_LINES (default: 3)
        let context_lines = match env::var("TRACEWRITE_CONTEXT_LINES") {
            Ok(val) => val
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "TRACEWRITE_CONTEXT_LINES".to_string(),
                    message: format!("expected non-negative integer, got '{val}'"),
                })?,
            Err(_) => DEFAULT_CONTEXT_LINES,
        };

        // Optional: TRACEWRITE_EDIT_COST (default: 4, must be > 0)
        let edit_cost = match env::var("TRACEWRITE_EDIT_COST") {
            Ok(val) => {
                let cost = val.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                    key: "TRACEWRITE_EDIT_COST".to_string(),
                    message: format!("expected positive integer, got '{val}'"),
                })?;
                if cost == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "TRACEWRITE_EDIT_COST".to_string(),
                        message: "edit cost must be at least 1".to_string(),
                    });
                }
                cost
            }
            Err(_) => DEFAULT_EDIT_COST,
        };

        Ok(Self {
            data_dir,
            control_addr,
            ignore,
            diff: DiffOptions {
                context_lines,
                edit_cost,
            },
        })
    }

    /// Returns the directory holding file snapshots.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_DIR)
    }
}
