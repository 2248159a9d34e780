//! The plugin process pool.
//!
//! The pool task owns the path-to-entry map and reacts to directory events;
//! each entry task owns its process and walks the lifecycle
//! running -> exited -> waiting-retry -> running. Entries never talk to each
//! other; losing one plugin cannot stall another.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use tsp_wire::Point;

use crate::process::{restart_delay, ExitCause, Process};
use crate::watch::{self, DirectoryEvent, EventKind};

/// Max plugin processes per pool.
pub const MAX_POOL_SIZE: usize = 128;
/// Max points buffered between the pool and its consumer.
pub const MAX_POOL_BUF: usize = 10_000;

/// A pool of plugin processes mirroring the executables in a directory.
pub struct Pool {
    points: Option<mpsc::Receiver<Point>>,
    quit: Option<oneshot::Sender<()>>,
    done: JoinHandle<()>,
}

impl Pool {
    /// Start a pool over the given directory. Processes are started and
    /// retired automatically as the directory changes.
    pub fn new(path: impl Into<PathBuf>) -> Pool {
        let (points_tx, points_rx) = mpsc::channel(MAX_POOL_BUF);
        let queue_tx = points_tx.clone();
        tsp_metrics::register_gauge("collect.Queue", "", move || {
            (queue_tx.max_capacity() - queue_tx.capacity()) as i64
        });
        let (quit_tx, quit_rx) = oneshot::channel();
        let events = watch::watch(path.into());
        let done = tokio::spawn(pool_loop(events, points_tx, quit_rx));
        Pool {
            points: Some(points_rx),
            quit: Some(quit_tx),
            done,
        }
    }

    /// The pool's point stream. May be taken once.
    pub fn take_points(&mut self) -> mpsc::Receiver<Point> {
        self.points.take().expect("point stream already taken")
    }

    /// Terminate the pool. Returns after the last child is reaped.
    pub async fn kill(mut self) {
        if let Some(quit) = self.quit.take() {
            let _ = quit.send(());
        }
        let _ = self.done.await;
    }
}

enum EntryEvent {
    Modify,
    Remove,
    /// Owner shutdown: like Remove, but without the file-deleted log line.
    Kill,
}

struct EntryHandle {
    tx: mpsc::Sender<EntryEvent>,
    task: JoinHandle<()>,
}

impl EntryHandle {
    async fn kill(self) {
        let _ = self.tx.send(EntryEvent::Kill).await;
        let _ = self.task.await;
    }
}

async fn pool_loop(
    mut events: mpsc::Receiver<DirectoryEvent>,
    points: mpsc::Sender<Point>,
    mut quit: oneshot::Receiver<()>,
) {
    let mut by_path: HashMap<PathBuf, EntryHandle> = HashMap::new();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { return };
                tracing::debug!(?event, "pool: directory update");
                handle_event(&mut by_path, event, &points).await;
            }
            _ = &mut quit => {
                tracing::debug!("pool: got quit request");
                for (_, entry) in by_path.drain() {
                    entry.kill().await;
                }
                return;
            }
        }
    }
}

async fn handle_event(
    by_path: &mut HashMap<PathBuf, EntryHandle>,
    event: DirectoryEvent,
    points: &mpsc::Sender<Point>,
) {
    match by_path.get(&event.path) {
        None => {
            if event.kind != EventKind::Create {
                return;
            }
            if by_path.len() == MAX_POOL_SIZE {
                tracing::warn!(
                    path = %event.path.display(),
                    "pool: process limit reached ({MAX_POOL_SIZE}), ignoring"
                );
                return;
            }
            let (tx, rx) = mpsc::channel(1);
            let task = tokio::spawn(entry_loop(event.path.clone(), rx, points.clone()));
            by_path.insert(event.path, EntryHandle { tx, task });
        }
        Some(entry) => {
            let forwarded = match event.kind {
                EventKind::Modify => EntryEvent::Modify,
                EventKind::Remove => EntryEvent::Remove,
                EventKind::Create => return,
            };
            let _ = entry.tx.send(forwarded).await;
            if event.kind == EventKind::Remove {
                by_path.remove(&event.path);
            }
        }
    }
}

enum Run {
    Event(Option<EntryEvent>),
    Exited(ExitCause),
}

/// The per-entry state machine.
async fn entry_loop(path: PathBuf, mut events: mpsc::Receiver<EntryEvent>, points: mpsc::Sender<Point>) {
    let mut process = Process::start(&path, points.clone());
    loop {
        // Running.
        let run = tokio::select! {
            event = events.recv() => Run::Event(event),
            cause = process.wait_exit() => Run::Exited(cause),
        };
        let cause = match run {
            Run::Event(None) | Run::Event(Some(EntryEvent::Kill)) => {
                process.kill();
                process.wait_exit().await;
                return;
            }
            Run::Event(Some(EntryEvent::Remove)) => {
                tracing::info!(plugin = %process.label(), "kill (file deleted)");
                process.kill();
                process.wait_exit().await;
                return;
            }
            Run::Event(Some(EntryEvent::Modify)) => {
                tracing::info!(plugin = %process.label(), "kill (file updated)");
                process.kill();
                process.wait_exit().await;
                process = Process::start(&path, points.clone());
                continue;
            }
            Run::Exited(cause) => cause,
        };

        // WaitingRetry.
        let delay = restart_delay(&process, &cause);
        let retry = tokio::time::sleep(delay);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    // No live child here; removal and shutdown just retire
                    // the entry, and a modify cancels the pending retry.
                    None | Some(EntryEvent::Remove) | Some(EntryEvent::Kill) => return,
                    Some(EntryEvent::Modify) => break,
                },
                _ = &mut retry => break,
            }
        }
        process = Process::start(&path, points.clone());
    }
}
