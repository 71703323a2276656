//! End-to-end tests of the running agent: OS notifications flowing through
//! the watcher and handler into the log, driven over the control plane.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use tracewrite_agent::control::{self, Command, Controller, Status};
use tracewrite_agent::diff::Differ;
use tracewrite_agent::handler::DiffingEventHandler;
use tracewrite_agent::history::{EditHistoryLog, MemoryEditLog};
use tracewrite_agent::replay::replay_file;
use tracewrite_agent::snapshot::MemorySnapshotStore;
use tracewrite_agent::types::{AssignmentId, EventType};
use tracewrite_agent::watcher::DirectoryWatcher;

// ============================================================================
// Helper Functions
// ============================================================================

const WAIT: Duration = Duration::from_secs(10);

struct Agent {
    watcher: DirectoryWatcher,
    log: Arc<MemoryEditLog>,
    data: TempDir,
    run: JoinHandle<()>,
    server: JoinHandle<()>,
}

impl Agent {
    async fn start() -> Self {
        let data = TempDir::new().expect("Failed to create data dir");
        let log = Arc::new(MemoryEditLog::new());
        let (watcher, notifications) = DirectoryWatcher::new().expect("Failed to create watcher");
        watcher.ignore(data.path());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        control::write_port_file(data.path(), listener.local_addr().unwrap().port()).unwrap();
        let controller = Arc::new(Controller::new(
            watcher.clone(),
            Arc::clone(&log) as Arc<dyn EditHistoryLog>,
        ));
        let server = tokio::spawn(control::serve(listener, controller));

        let run = {
            let watcher = watcher.clone();
            let mut handler =
                DiffingEventHandler::new(MemorySnapshotStore::new(), Arc::clone(&log), Differ::default());
            tokio::spawn(async move { watcher.run(notifications, &mut handler).await })
        };

        Self {
            watcher,
            log,
            data,
            run,
            server,
        }
    }

    async fn send(&self, command: Command) -> Status {
        let port = control::read_port_file(self.data.path()).unwrap();
        control::send_command(([127, 0, 0, 1], port).into(), &command)
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.server.abort();
        self.watcher.close();
        timeout(WAIT, self.run)
            .await
            .expect("watcher loop should stop after close")
            .unwrap();
    }

    fn content(&self, assignment: AssignmentId, path: &Path) -> Option<String> {
        let events = self.log.events_for(assignment).ok()?;
        replay_file(&events, path, None).ok().flatten()
    }
}

/// Creates a work directory with its canonical path, which is what
/// notifications report.
fn work_dir() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create work dir");
    let root = dir.path().canonicalize().unwrap();
    (dir, root)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    condition()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn watch_request_imports_existing_files() {
    let agent = Agent::start().await;
    let (_dir, root) = work_dir();
    let existing = root.join("draft.md");
    fs::write(&existing, "# Draft\n").unwrap();

    assert_eq!(agent.send(Command::Watch(root.clone())).await, Status::Accepted);
    let assignment = agent.log.assignment_for(&existing).expect("assignment mapped");

    assert!(wait_until(|| agent.content(assignment, &existing).as_deref() == Some("# Draft\n")).await);
    let events = agent.log.events_for(assignment).unwrap();
    assert_eq!(events[0].event_type, EventType::Added);

    agent.stop().await;
}

#[tokio::test]
async fn edits_are_recorded_and_replayable() {
    let agent = Agent::start().await;
    let (_dir, root) = work_dir();
    assert_eq!(agent.send(Command::Watch(root.clone())).await, Status::Accepted);
    let assignment = agent.log.assignment_for(&root.join("x")).unwrap();

    let path = root.join("a.txt");
    fs::write(&path, "Hello World\n").unwrap();
    assert!(wait_until(|| agent.content(assignment, &path).as_deref() == Some("Hello World\n")).await);

    fs::write(&path, "Hello Go\n").unwrap();
    assert!(wait_until(|| agent.content(assignment, &path).as_deref() == Some("Hello Go\n")).await);

    let events = agent.log.events_for(assignment).unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::Modified && e.patch.contains("+Hello Go")));

    fs::remove_file(&path).unwrap();
    assert!(
        wait_until(|| agent
            .log
            .events_for(assignment)
            .unwrap()
            .iter()
            .any(|e| e.is_for(&path) && e.event_type == EventType::Deleted))
        .await
    );
    assert_eq!(agent.content(assignment, &path), None);

    agent.stop().await;
}

#[tokio::test]
async fn ignored_paths_produce_no_events() {
    let agent = Agent::start().await;
    let (_dir, root) = work_dir();
    let build = root.join("build");
    fs::create_dir(&build).unwrap();
    agent.watcher.ignore(&build);

    assert_eq!(agent.send(Command::Watch(root.clone())).await, Status::Accepted);
    let assignment = agent.log.assignment_for(&root.join("x")).unwrap();

    fs::write(build.join("out.o"), "ignored").unwrap();
    let marker = root.join("marker.txt");
    fs::write(&marker, "seen\n").unwrap();
    assert!(wait_until(|| agent.content(assignment, &marker).is_some()).await);

    let events = agent.log.events_for(assignment).unwrap();
    assert!(events.iter().all(|e| !e.file_path.starts_with(&build)));

    agent.stop().await;
}

#[tokio::test]
async fn unwatch_stops_recording() {
    let agent = Agent::start().await;
    let (_dir, root) = work_dir();
    let (_other_dir, other) = work_dir();
    assert_eq!(agent.send(Command::Watch(root.clone())).await, Status::Accepted);
    assert_eq!(agent.send(Command::Watch(other.clone())).await, Status::Accepted);
    let assignment = agent.log.assignment_for(&root.join("x")).unwrap();
    let other_assignment = agent.log.assignment_for(&other.join("x")).unwrap();

    let before = root.join("before.txt");
    fs::write(&before, "watched\n").unwrap();
    assert!(wait_until(|| agent.content(assignment, &before).is_some()).await);

    assert_eq!(agent.send(Command::Unwatch(root.clone())).await, Status::Accepted);
    assert!(!agent.watcher.is_watched(&root));

    let after = root.join("after.txt");
    fs::write(&after, "unwatched\n").unwrap();

    // Notifications are delivered in order, so once the other directory's
    // write is recorded any event for the unwatched root would be too.
    let marker = other.join("marker.txt");
    fs::write(&marker, "seen\n").unwrap();
    assert!(wait_until(|| agent.content(other_assignment, &marker).is_some()).await);

    // The mapping survives unwatch, so a leaked event would land here.
    assert_eq!(agent.log.assignment_for(&after), Some(assignment));
    let events = agent.log.events_for(assignment).unwrap();
    assert!(events.iter().all(|e| !e.is_for(&after)));

    agent.stop().await;
}

#[tokio::test]
async fn watch_of_missing_directory_is_rejected() {
    let agent = Agent::start().await;
    let (dir, root) = work_dir();
    drop(dir);

    assert_eq!(agent.send(Command::Watch(root)).await, Status::Rejected);
    assert!(agent.log.assignment_paths().is_empty());

    agent.stop().await;
}
