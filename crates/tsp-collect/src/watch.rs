//! Polling directory watcher.
//!
//! Scans the watch directory once a second (non-recursive, dotfiles
//! ignored) and diffs against the previous scan on file type, permission
//! bits, and mtime. Event delivery is throttled so a mass update of plugins
//! cannot flood the pool.

use std::collections::HashMap;
use std::fs::FileType;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

const WATCH_INTERVAL: Duration = Duration::from_secs(1);
/// Max events delivered per second.
const EVENT_RATE: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Modify,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEvent {
    pub path: PathBuf,
    pub kind: EventKind,
}

/// What a scan remembers about one file: type, permission bits, and mtime.
/// A change to any of them (a rewrite, a chmod, a replacement by something
/// of another kind) reads as a modification.
#[derive(PartialEq, Eq)]
struct FileStamp {
    file_type: FileType,
    mode: u32,
    modified: Option<SystemTime>,
}

/// Watch the given directory. The watcher stops when the returned receiver
/// is dropped.
pub fn watch(path: impl Into<PathBuf>) -> mpsc::Receiver<DirectoryEvent> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(watch_loop(path.into(), tx));
    rx
}

async fn watch_loop(path: PathBuf, tx: mpsc::Sender<DirectoryEvent>) {
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rate = tokio::time::interval(Duration::from_millis(1000 / EVENT_RATE));
    rate.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: HashMap<PathBuf, FileStamp> = HashMap::new();
    loop {
        ticker.tick().await;
        let have = scan(&path).await;
        for (file, stamp) in &have {
            let kind = match last.get(file) {
                None => EventKind::Create,
                Some(old) if old != stamp => EventKind::Modify,
                Some(_) => continue,
            };
            if !emit(&tx, &mut rate, file, kind).await {
                return;
            }
        }
        for file in last.keys() {
            if !have.contains_key(file) && !emit(&tx, &mut rate, file, EventKind::Remove).await {
                return;
            }
        }
        last = have;
    }
}

async fn emit(
    tx: &mpsc::Sender<DirectoryEvent>,
    rate: &mut tokio::time::Interval,
    path: &Path,
    kind: EventKind,
) -> bool {
    rate.tick().await;
    tx.send(DirectoryEvent {
        path: path.to_path_buf(),
        kind,
    })
    .await
    .is_ok()
}

async fn scan(path: &Path) -> HashMap<PathBuf, FileStamp> {
    let mut have = HashMap::new();
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "directory scan error");
            return have;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "directory scan error");
                break;
            }
        };
        if is_dotfile(&entry.path()) {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(path = %entry.path().display(), %err, "stat error");
                continue;
            }
        };
        if meta.is_dir() {
            continue;
        }
        have.insert(
            entry.path(),
            FileStamp {
                file_type: meta.file_type(),
                mode: meta.permissions().mode(),
                modified: meta.modified().ok(),
            },
        );
    }
    have
}

fn is_dotfile(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}
