//! Process lifecycle: signals and graceful re-exec.
//!
//! The engine restarts rather than reconfigures: on SIGHUP or a config
//! change the caller tears its pipeline down (killing collector children)
//! and then replaces the process image with a fresh one, same argv, same
//! environment. In-memory pipeline state is all reconstructible, so the
//! restart costs at most a few seconds of data.

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;

/// Resolves when SIGHUP arrives.
pub async fn reload_signal() {
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .expect("failed to register SIGHUP handler");
    sighup.recv().await;
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
}

/// Replace the process image with a fresh copy of itself, preserving argv
/// and environment. Retries forever: a transiently missing binary (e.g.
/// mid-upgrade) resolves on a later attempt.
pub fn restart() -> ! {
    let (program, args) = current_command();
    loop {
        let err = Command::new(&program).args(&args).exec();
        tracing::error!(program = %program.to_string_lossy(), %err, "restart error");
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn current_command() -> (std::ffi::OsString, Vec<std::ffi::OsString>) {
    let mut args = std::env::args_os();
    let program = args.next().unwrap_or_else(|| "tsp".into());
    (program, args.collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_command_shape() {
        let (program, args) = current_command();
        assert!(!program.is_empty());
        // args excludes argv[0]
        assert!(args.iter().all(|a| *a != program));
    }
}
