//! Tracewrite Agent - edit history capture daemon and tools.
//!
//! This binary runs the watch daemon and talks to it, and reads back the
//! recorded history.
//!
//! # Commands
//!
//! - `tracewrite-agent run`: Start the watch daemon
//! - `tracewrite-agent watch <dir>`: Ask the daemon to watch a directory
//! - `tracewrite-agent unwatch <dir>`: Ask the daemon to stop watching
//! - `tracewrite-agent list`: List registered assignments
//! - `tracewrite-agent history <assignment>`: List recorded events
//! - `tracewrite-agent replay <assignment> <file>`: Print a file as of an event
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tracewrite_agent::config::Config;
use tracewrite_agent::control::{self, Command as ControlCommand, Controller, Status};
use tracewrite_agent::diff::Differ;
use tracewrite_agent::handler::DiffingEventHandler;
use tracewrite_agent::history::{EditHistoryLog, JsonlEditLog, MemoryEditLog, HISTORY_FILE_NAME};
use tracewrite_agent::patch::Patch;
use tracewrite_agent::replay::replay_file;
use tracewrite_agent::snapshot::FileSnapshotStore;
use tracewrite_agent::types::AssignmentId;
use tracewrite_agent::watcher::DirectoryWatcher;

/// Tracewrite Agent - edit history capture and replay.
///
/// Records every change to files in watched directories as a line patch so
/// any earlier version can be reconstructed.
#[derive(Parser, Debug)]
#[command(name = "tracewrite-agent")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    TRACEWRITE_DATA_DIR        Log, snapshots and port file (default: ~/.tracewrite)
    TRACEWRITE_CONTROL_ADDR    Control plane address (default: 127.0.0.1:0)
    TRACEWRITE_IGNORE          Comma-separated paths to ignore
    TRACEWRITE_CONTEXT_LINES   Context lines per hunk (default: 3)
    TRACEWRITE_EDIT_COST       Equal lines worth merging changes (default: 4)
    RUST_LOG                   Log filter (default: info)

EXAMPLES:
    # Start the daemon
    tracewrite-agent run

    # Track an assignment directory
    tracewrite-agent watch ~/essays/week3

    # Find its assignment id, list its history and print a file as of event 12
    tracewrite-agent list
    tracewrite-agent history 1
    tracewrite-agent replay 1 ~/essays/week3/draft.md --up-to 12
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the watch daemon.
    ///
    /// Re-watches every directory registered in the history log and accepts
    /// watch requests on the control address.
    Run,

    /// Ask the running daemon to watch a directory.
    Watch {
        /// Directory to watch.
        path: PathBuf,
    },

    /// Ask the running daemon to stop watching a directory.
    Unwatch {
        /// Directory to stop watching.
        path: PathBuf,
    },

    /// List registered assignments and their directories.
    List,

    /// List the recorded events of an assignment.
    History {
        /// Assignment id.
        assignment: u64,

        /// Only list events for this file.
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Print a file's content reconstructed from its history.
    Replay {
        /// Assignment id.
        assignment: u64,

        /// File to reconstruct.
        file: PathBuf,

        /// Replay up to and including this event id.
        #[arg(long)]
        up_to: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run => runtime()?.block_on(run_daemon()),
        Command::Watch { path } => runtime()?.block_on(run_control(true, &path)),
        Command::Unwatch { path } => runtime()?.block_on(run_control(false, &path)),
        Command::List => run_list(),
        Command::History { assignment, file } => {
            run_history(AssignmentId(assignment), file.as_deref())
        }
        Command::Replay {
            assignment,
            file,
            up_to,
        } => run_replay(AssignmentId(assignment), &file, up_to),
    }
}

/// Builds the async runtime for the commands that need one.
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}

/// Runs the watch daemon until Ctrl+C or SIGTERM.
async fn run_daemon() -> Result<()> {
    init_logging();

    info!("Starting Tracewrite Agent");

    let config = Config::from_env().context("Failed to load configuration")?;

    info!(
        data_dir = %config.data_dir.display(),
        control_addr = %config.control_addr,
        context_lines = config.diff.context_lines,
        edit_cost = config.diff.edit_cost,
        "Configuration loaded"
    );

    let log: Arc<JsonlEditLog> =
        Arc::new(JsonlEditLog::open_in(&config.data_dir).context("Failed to open history log")?);
    let snapshots =
        FileSnapshotStore::open(config.snapshot_dir()).context("Failed to open snapshot store")?;

    info!(
        log = %log.path().display(),
        snapshots = %snapshots.dir().display(),
        "History stores opened"
    );

    let (watcher, notifications) =
        DirectoryWatcher::new().context("Failed to initialize file watcher")?;

    // The agent's own files live in the data directory and must never be tracked.
    watcher.ignore(&config.data_dir);
    for path in &config.ignore {
        watcher.ignore(path);
    }

    for (path, assignment) in log.assignment_paths() {
        match watcher.add_directory(&path) {
            Ok(()) => info!(path = %path.display(), assignment = %assignment, "Resumed watching"),
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot resume watching"),
        }
    }

    let listener = TcpListener::bind(config.control_addr)
        .await
        .with_context(|| format!("Failed to bind control address {}", config.control_addr))?;
    let local_addr = listener.local_addr()?;
    let port_file = control::write_port_file(&config.data_dir, local_addr.port())
        .context("Failed to write port file")?;

    info!(
        addr = %local_addr,
        port_file = %port_file.display(),
        "Control plane listening"
    );

    let controller = Arc::new(Controller::new(
        watcher.clone(),
        Arc::clone(&log) as Arc<dyn EditHistoryLog>,
    ));
    let server = tokio::spawn(control::serve(listener, controller));

    let mut handler = DiffingEventHandler::new(snapshots, log, Differ::new(config.diff));

    info!("Agent running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received");
        }
        () = watcher.run(notifications, &mut handler) => {
            warn!("Watcher loop ended unexpectedly");
        }
    }

    info!("Shutting down...");
    server.abort();
    watcher.close();

    if let Err(e) = std::fs::remove_file(&port_file) {
        warn!(path = %port_file.display(), error = %e, "Failed to remove port file");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Sends a watch or unwatch request to the running daemon.
async fn run_control(watch: bool, path: &Path) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    // An unwatched directory may already be gone, so fall back to joining.
    let path = path
        .canonicalize()
        .or_else(|_| std::env::current_dir().map(|cwd| cwd.join(path)))
        .with_context(|| format!("Cannot resolve {}", path.display()))?;
    let command = if watch {
        ControlCommand::Watch(path.clone())
    } else {
        ControlCommand::Unwatch(path.clone())
    };

    let port = control::read_port_file(&config.data_dir)
        .context("Daemon does not appear to be running")?;
    let addr = SocketAddr::new(config.control_addr.ip(), port);

    match control::send_command(addr, &command)
        .await
        .with_context(|| format!("Failed to reach daemon at {addr}"))?
    {
        Status::Accepted => {
            println!("{}: {}", if watch { "watching" } else { "stopped watching" }, path.display());
            Ok(())
        }
        Status::Rejected => bail!("daemon rejected request for {}", path.display()),
    }
}

/// Lists every registered assignment with its directory.
fn run_list() -> Result<()> {
    let log = open_log_read_only()?;

    let mut stdout = io::stdout().lock();
    for (path, assignment) in log.assignment_paths() {
        writeln!(stdout, "{:>6}  {}", assignment.0, path.display())?;
    }

    Ok(())
}

/// Lists the events of one assignment.
fn run_history(assignment: AssignmentId, file: Option<&Path>) -> Result<()> {
    let log = open_log_read_only()?;
    let events = log
        .events_for(assignment)
        .context("Failed to read history")?;

    let mut stdout = io::stdout().lock();
    for event in events.iter().filter(|e| file.map_or(true, |f| e.is_for(f))) {
        let stats = event
            .patch
            .parse::<Patch>()
            .map(|p| p.stats())
            .unwrap_or_default();
        writeln!(
            stdout,
            "{:>6}  {}  {:<8}  +{:<4} -{:<4}  {}",
            event.id,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            stats.lines_added,
            stats.lines_removed,
            event.file_path.display()
        )?;
    }

    Ok(())
}

/// Prints a file reconstructed from its history.
fn run_replay(assignment: AssignmentId, file: &Path, up_to: Option<u64>) -> Result<()> {
    let log = open_log_read_only()?;
    let events = log
        .events_for(assignment)
        .context("Failed to read history")?;

    match replay_file(&events, file, up_to) {
        Ok(Some(content)) => {
            io::stdout().lock().write_all(content.as_bytes())?;
            Ok(())
        }
        Ok(None) => bail!("{} does not exist at that point", file.display()),
        Err(e) => bail!("history unavailable for {}: {e}", file.display()),
    }
}

fn open_log_read_only() -> Result<MemoryEditLog> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let path = config.data_dir.join(HISTORY_FILE_NAME);
    JsonlEditLog::read_only(&path)
        .with_context(|| format!("Failed to read history log {}", path.display()))
}

/// Initializes the logging subsystem.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
