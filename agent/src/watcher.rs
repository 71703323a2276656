//! Recursive directory watcher.
//!
//! This module subscribes to filesystem notifications for assignment
//! directories and turns them into classified [`FsEvent`]s for the
//! [`handler`](crate::handler).
//!
//! # Architecture
//!
//! Every directory of a watched tree is subscribed individually with the
//! [`notify`] crate. The notify callback is kept lightweight: it only forwards
//! raw events and errors into two unbounded channels. A single loop,
//! [`DirectoryWatcher::run`], drains both channels and dispatches each event to
//! the handler before taking the next one, so file state is only ever touched
//! by one event at a time.
//!
//! The event channel is unbounded on purpose: the callback must never block
//! the OS notification thread and must never drop a `modified` event, since
//! every later patch of that file is computed against the content it would
//! have recorded.
//!
//! Directories are handled by the watcher itself and never reach the
//! handler:
//!
//! - a new directory inside a watched tree is subscribed, and every file
//!   already inside it is dispatched as `added`;
//! - a watched directory that is deleted or renamed away is unsubscribed.
//!
//! [`DirectoryWatcher::add_directory`] also enqueues an `added` event for every
//! file already in the tree, so each tracked file's history starts from a
//! baseline.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use tracewrite_agent::handler::FsEventHandler;
//! use tracewrite_agent::types::FsEvent;
//! use tracewrite_agent::watcher::DirectoryWatcher;
//!
//! struct Print;
//!
//! impl FsEventHandler for Print {
//!     fn handle(&mut self, event: FsEvent) {
//!         println!("{} {}", event.kind, event.path.display());
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (watcher, notifications) = DirectoryWatcher::new()?;
//!     watcher.add_directory(Path::new("/home/user/essay"))?;
//!     watcher.run(notifications, &mut Print).await;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use notify::{
    event::{CreateKind, ModifyKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::handler::FsEventHandler;
use crate::types::{EventType, FsEvent};

/// Errors that can occur during file watching operations.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to initialize the file system watcher.
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    /// The directory to watch does not exist.
    #[error("watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    /// The path to watch is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Subscribing a directory failed.
    #[error("failed to watch {path}: {source}")]
    Subscribe {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// A directory could not be listed.
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The watcher has been closed.
    #[error("watcher is closed")]
    Closed,
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Receiving side of the watcher's channels, consumed by
/// [`DirectoryWatcher::run`].
#[derive(Debug)]
pub struct Notifications {
    events: mpsc::UnboundedReceiver<Event>,
    errors: mpsc::UnboundedReceiver<notify::Error>,
}

#[derive(Debug, Default)]
struct WatchState {
    watched: BTreeSet<PathBuf>,
    ignored: BTreeSet<PathBuf>,
}

#[derive(Debug)]
struct Inner {
    /// `None` once closed.
    watcher: Mutex<Option<RecommendedWatcher>>,

    /// Sender for synthetic events from the initial import. Dropped on close
    /// together with the notify callback so the event channel closes.
    synthetic: Mutex<Option<mpsc::UnboundedSender<Event>>>,

    state: RwLock<WatchState>,
}

/// Watches directory trees and classifies their notifications.
///
/// Cloning is cheap and every clone controls the same subscriptions, so the
/// control plane can add and remove directories while [`run`](Self::run) is
/// draining events.
#[derive(Debug, Clone)]
pub struct DirectoryWatcher {
    inner: Arc<Inner>,
}

impl DirectoryWatcher {
    /// Creates a watcher with no subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::WatcherInit`] if the OS watcher cannot be
    /// created.
    pub fn new() -> Result<(Self, Notifications)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let callback_tx = event_tx.clone();
        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    // Only fails once the receiver is gone, i.e. on shutdown.
                    let _ = callback_tx.send(event);
                }
                Err(e) => {
                    let _ = error_tx.send(e);
                }
            },
            Config::default(),
        )?;

        let watcher = Self {
            inner: Arc::new(Inner {
                watcher: Mutex::new(Some(watcher)),
                synthetic: Mutex::new(Some(event_tx)),
                state: RwLock::new(WatchState::default()),
            }),
        };
        let notifications = Notifications {
            events: event_rx,
            errors: error_rx,
        };

        Ok((watcher, notifications))
    }

    /// Starts watching `path` and every directory below it.
    ///
    /// Every regular file already in the tree is queued as an `added` event.
    /// Directories that are already watched are left alone, so adding the
    /// same tree twice does not re-import its files.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::DirectoryNotFound`] or
    /// [`WatcherError::NotADirectory`] for a bad `path`, and
    /// [`WatcherError::Subscribe`] if the OS refuses the watch.
    pub fn add_directory(&self, path: &Path) -> Result<()> {
        let metadata = fs::metadata(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                WatcherError::DirectoryNotFound(path.to_path_buf())
            } else {
                WatcherError::ReadDir {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        if !metadata.is_dir() {
            return Err(WatcherError::NotADirectory(path.to_path_buf()));
        }

        let mut pending = vec![path.to_path_buf()];
        let mut subscribed = 0usize;
        let mut imported = 0usize;

        while let Some(dir) = pending.pop() {
            if !self.subscribe(&dir)? {
                continue;
            }
            subscribed += 1;

            // Listed after subscribing so nothing created in between is lost.
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(source) if dir == path => {
                    return Err(WatcherError::ReadDir { path: dir, source });
                }
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Failed to list subdirectory");
                    continue;
                }
            };

            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                let entry_path = entry.path();
                if self.is_ignored(&entry_path) {
                    continue;
                }
                if file_type.is_dir() {
                    pending.push(entry_path);
                } else if file_type.is_file() {
                    self.enqueue_added(entry_path)?;
                    imported += 1;
                }
            }
        }

        info!(
            path = %path.display(),
            directories = subscribed,
            files = imported,
            "Watching directory"
        );
        Ok(())
    }

    /// Stops watching `path` and every watched directory below it.
    ///
    /// Directories that are not watched are skipped.
    pub fn remove_directory(&self, path: &Path) {
        let removed: Vec<PathBuf> = {
            let mut state = self.write_state();
            let removed: Vec<PathBuf> = state
                .watched
                .iter()
                .filter(|dir| dir.starts_with(path))
                .cloned()
                .collect();
            for dir in &removed {
                state.watched.remove(dir);
            }
            removed
        };

        let mut guard = self.inner.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(watcher) = guard.as_mut() {
            for dir in &removed {
                // The OS drops watches on deleted directories by itself.
                if let Err(e) = watcher.unwatch(dir) {
                    debug!(path = %dir.display(), error = %e, "Unwatch failed");
                }
            }
        }

        info!(
            path = %path.display(),
            directories = removed.len(),
            "Stopped watching directory"
        );
    }

    /// Drops every future event for `path` and everything below it.
    pub fn ignore(&self, path: &Path) {
        self.write_state().ignored.insert(path.to_path_buf());
        debug!(path = %path.display(), "Ignoring path");
    }

    /// Returns true if `path` itself is a subscribed directory.
    #[must_use]
    pub fn is_watched(&self, path: &Path) -> bool {
        self.read_state().watched.contains(path)
    }

    /// Returns true if `path` is ignored or lies below an ignored path.
    #[must_use]
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.read_state()
            .ignored
            .iter()
            .any(|ignored| path.starts_with(ignored))
    }

    /// Returns every subscribed directory.
    #[must_use]
    pub fn watched_directories(&self) -> Vec<PathBuf> {
        self.read_state().watched.iter().cloned().collect()
    }

    /// Releases every OS watch and closes the event channels.
    ///
    /// [`run`](Self::run) returns once the events already queued have been
    /// handled. Closing twice is a no-op.
    pub fn close(&self) {
        let watcher = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let synthetic = self
            .inner
            .synthetic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if watcher.is_some() || synthetic.is_some() {
            info!("Closing directory watcher");
        }
        self.write_state().watched.clear();
    }

    /// Drains notifications and dispatches them to `handler` until the
    /// watcher is closed.
    ///
    /// Watcher errors are logged and never stop the loop.
    pub async fn run<H: FsEventHandler + ?Sized>(
        &self,
        notifications: Notifications,
        handler: &mut H,
    ) {
        let Notifications {
            mut events,
            mut errors,
        } = notifications;
        let mut errors_open = true;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(&event, handler),
                    None => break,
                },
                error = errors.recv(), if errors_open => match error {
                    Some(e) => error!(error = %e, "File watcher error"),
                    None => errors_open = false,
                },
            }
        }

        debug!("Watcher loop shutting down");
    }

    /// Classifies one raw notification and dispatches the resulting events.
    pub(crate) fn dispatch<H: FsEventHandler + ?Sized>(&self, event: &Event, handler: &mut H) {
        trace!(kind = ?event.kind, paths = ?event.paths, "Received notify event");

        for fs_event in classify(event, |p| p.exists()) {
            if self.is_ignored(&fs_event.path) {
                trace!(path = %fs_event.path.display(), "Ignored path");
                continue;
            }

            match fs_event.kind {
                EventType::Added if fs_event.path.is_dir() => {
                    if let Err(e) = self.add_directory(&fs_event.path) {
                        warn!(path = %fs_event.path.display(), error = %e, "Failed to watch new directory");
                    }
                }
                EventType::Deleted | EventType::Renamed if self.is_watched(&fs_event.path) => {
                    self.remove_directory(&fs_event.path);
                }
                _ => handler.handle(fs_event),
            }
        }
    }

    /// Subscribes one directory. Returns false if it was already watched.
    ///
    /// The check and the insert happen under the state lock, taken after the
    /// watcher mutex, so concurrent adds of one tree subscribe it once.
    fn subscribe(&self, dir: &Path) -> Result<bool> {
        let mut guard = self.inner.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        let watcher = guard.as_mut().ok_or(WatcherError::Closed)?;

        let mut state = self.write_state();
        if state.watched.contains(dir) {
            return Ok(false);
        }

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatcherError::Subscribe {
                path: dir.to_path_buf(),
                source,
            })?;
        state.watched.insert(dir.to_path_buf());

        debug!(path = %dir.display(), "Subscribed directory");
        Ok(true)
    }

    fn enqueue_added(&self, path: PathBuf) -> Result<()> {
        let guard = self.inner.synthetic.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(WatcherError::Closed)?;
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(path);
        sender.send(event).map_err(|_| WatcherError::Closed)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, WatchState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, WatchState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Classifies a raw notify event into zero or more [`FsEvent`]s.
///
/// `exists` resolves platforms that report a rename without saying which
/// side of it a path is on.
pub fn classify(event: &Event, exists: impl Fn(&Path) -> bool) -> Vec<FsEvent> {
    let each = |make: fn(PathBuf) -> FsEvent| -> Vec<FsEvent> {
        event.paths.iter().cloned().map(make).collect()
    };

    match &event.kind {
        EventKind::Create(_) => each(FsEvent::added),
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
            each(FsEvent::modified)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(FsEvent::renamed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(FsEvent::added),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => vec![
            FsEvent::renamed(event.paths[0].clone()),
            FsEvent::added(event.paths[1].clone()),
        ],
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                if exists(p) {
                    FsEvent::added(p.clone())
                } else {
                    FsEvent::renamed(p.clone())
                }
            })
            .collect(),
        EventKind::Remove(_) => each(FsEvent::deleted),
        // Access, metadata-only changes and unknown kinds.
        _ => Vec::new(),
    }
}
