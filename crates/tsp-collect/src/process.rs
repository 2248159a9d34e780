//! One running collection plugin.
//!
//! A plugin's stdout is an ordered point stream; stderr is relayed to the
//! log with a per-plugin prefix. The kill protocol is: signal the child,
//! abort the pipe readers (closing the read ends, so any writer that
//! inherited the descriptors takes a broken pipe), then wait for the reap,
//! complaining once a second while it drags.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};

use tsp_wire::{Point, StreamDecoder};

pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(5);
pub(crate) const REPAIR_DELAY: Duration = Duration::from_secs(5);
pub(crate) const RESCHEDULE_DELAY: Duration = Duration::from_secs(60 * 60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const EXIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit code by which a plugin asks to be run again in an hour.
const RESCHEDULE_EXIT_CODE: i32 = 13;

/// Environment variables stripped from plugin processes: they tune this
/// host's runtime and confuse inherited children.
const ENV_BLOCKLIST: &[&str] = &[
    "RUST_LOG",
    "RUST_BACKTRACE",
    "RUST_MIN_STACK",
    "TOKIO_WORKER_THREADS",
];

#[derive(Debug)]
pub(crate) enum ExitCause {
    Clean,
    Reschedule,
    Crash(String),
    StartFailed(String),
}

pub(crate) struct Process {
    label: String,
    started: Instant,
    kill_tx: mpsc::Sender<()>,
    exit_rx: oneshot::Receiver<ExitCause>,
}

impl Process {
    /// Start the plugin at `path`, wiring its stdout into `points`.
    pub(crate) fn start(path: &Path, points: mpsc::Sender<Point>) -> Process {
        let label = label_for(path);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = oneshot::channel();
        let process = Process {
            label: label.clone(),
            started: Instant::now(),
            kill_tx,
            exit_rx,
        };

        let mut command = Command::new(path);
        command
            .env_clear()
            .envs(safe_environ())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tsp_metrics::counter("collect.Errors", "type=Start").incr();
                let _ = exit_tx.send(ExitCause::StartFailed(err.to_string()));
                return process;
            }
        };
        tsp_metrics::counter("collect.ProcessCount", "").incr();

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");
        let decode = tokio::spawn(decode_loop(
            label.clone(),
            stdout,
            points,
            process.kill_tx.clone(),
        ));
        let stderr_log = tokio::spawn(stderr_loop(label.clone(), stderr));
        tokio::spawn(reap_loop(label, child, kill_rx, exit_tx, [decode, stderr_log]));
        process
    }

    /// Mark the process for killing. Idempotent.
    pub(crate) fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }

    /// Wait for the child to be reaped. Must not be called again after it
    /// has yielded.
    pub(crate) async fn wait_exit(&mut self) -> ExitCause {
        (&mut self.exit_rx)
            .await
            .unwrap_or_else(|_| ExitCause::Crash("reaper task lost".to_string()))
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Decode stdout until the stream ends or goes idle. An idle stream means a
/// wedged plugin: it is killed rather than waited on forever.
async fn decode_loop(
    label: String,
    stdout: ChildStdout,
    points: mpsc::Sender<Point>,
    kill: mpsc::Sender<()>,
) {
    let mut decoder = StreamDecoder::new(BufReader::new(stdout));
    let stat_points = tsp_metrics::counter("collect.Points", "");
    let stat_enqueue = tsp_metrics::counter("collect.Errors", "type=Enqueue");
    loop {
        let point = match timeout(IDLE_TIMEOUT, decoder.decode()).await {
            Err(_) => {
                tracing::warn!(
                    plugin = %label,
                    "kill (idle timeout: inactive for {}s)",
                    IDLE_TIMEOUT.as_secs()
                );
                let _ = kill.try_send(());
                return;
            }
            Ok(Err(err)) if err.is_recoverable() => {
                tracing::warn!(plugin = %label, %err, "decode error");
                continue;
            }
            Ok(Err(_)) => return,
            Ok(Ok(point)) => point,
        };
        stat_points.incr();
        match points.try_send(point) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(point)) => {
                // The pool buffer is full: block the plugin stream rather
                // than lose the point, and account for the stall.
                stat_enqueue.incr();
                if points.send(point).await.is_err() {
                    return;
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

async fn stderr_loop(label: String, stderr: ChildStderr) {
    let stat_stderr = tsp_metrics::counter("collect.Errors", "type=Stderr");
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        stat_stderr.incr();
        tracing::warn!(plugin = %label, "stderr: {line}");
    }
}

/// Own the child until it is reaped, by natural death or by kill request.
async fn reap_loop(
    label: String,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: oneshot::Sender<ExitCause>,
    readers: [tokio::task::JoinHandle<()>; 2],
) {
    let cause = tokio::select! {
        status = child.wait() => exit_cause(status),
        _ = kill_rx.recv() => {
            if let Err(err) = child.start_kill() {
                tracing::warn!(plugin = %label, %err, "kill error");
            }
            // Drop the pipe read ends so writers that inherited the
            // descriptors get a broken pipe.
            for reader in &readers {
                reader.abort();
            }
            loop {
                match timeout(EXIT_TIMEOUT, child.wait()).await {
                    Ok(status) => break exit_cause(status),
                    Err(_) => tracing::warn!(plugin = %label, "slow exit, still waiting..."),
                }
            }
        }
    };
    tsp_metrics::counter("collect.ProcessCount", "").add(-1);
    let _ = exit_tx.send(cause);
}

fn exit_cause(status: std::io::Result<std::process::ExitStatus>) -> ExitCause {
    match status {
        Err(err) => ExitCause::Crash(format!("wait error: {err}")),
        Ok(status) => match status.code() {
            Some(0) => ExitCause::Clean,
            Some(RESCHEDULE_EXIT_CODE) => ExitCause::Reschedule,
            _ => ExitCause::Crash(status.to_string()),
        },
    }
}

/// Map an exit cause to the delay before the next start, logging the
/// decision with the plugin's uptime.
pub(crate) fn restart_delay(process: &Process, cause: &ExitCause) -> Duration {
    let label = process.label();
    match cause {
        ExitCause::Reschedule => {
            tracing::info!(
                plugin = %label,
                "exit status {RESCHEDULE_EXIT_CODE}, restart in {}s",
                RESCHEDULE_DELAY.as_secs()
            );
            RESCHEDULE_DELAY
        }
        ExitCause::Clean => {
            tracing::info!(
                plugin = %label,
                "exit status 0 (after running for {}s)",
                process.uptime_secs()
            );
            RETRY_DELAY
        }
        ExitCause::Crash(status) => {
            tsp_metrics::counter("collect.Errors", "type=Crash").incr();
            tracing::warn!(
                plugin = %label,
                "{status} (after running for {}s)",
                process.uptime_secs()
            );
            REPAIR_DELAY
        }
        ExitCause::StartFailed(err) => {
            tracing::warn!(plugin = %label, "start error: {err}");
            RETRY_DELAY
        }
    }
}

/// The process environment minus the blocklisted runtime knobs.
fn safe_environ() -> Vec<(std::ffi::OsString, std::ffi::OsString)> {
    std::env::vars_os()
        .filter(|(key, _)| {
            !ENV_BLOCKLIST
                .iter()
                .any(|blocked| key == OsStr::new(blocked))
        })
        .collect()
}

/// Short plugin identifier for the log: parent directory plus file name.
fn label_for(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|f| f.to_string_lossy().into_owned());
    match dir {
        Some(dir) => format!("{dir}/{file}"),
        None => file,
    }
}
