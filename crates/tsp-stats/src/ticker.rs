//! A clock-aligned ticker.
//!
//! Tick instants are truncated to whole seconds, the maximum precision the
//! pipeline carries. The first tick is phase-aligned to the middle of a
//! second, giving early and late deviations equal room before they cross a
//! second boundary; this keeps behaviour consistent across restarts. Ticks
//! the consumer cannot take immediately are dropped, as is any tick whose
//! truncated second does not move forward: delivering it would make the
//! consumer produce a conflicting point.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Deliver aligned ticks every `interval`, which must be at least one
/// second. The ticker stops when the receiver is dropped.
///
/// # Panics
///
/// Panics if `interval` is shorter than one second.
pub fn tick(interval: Duration) -> mpsc::Receiver<SystemTime> {
    assert!(
        interval >= Duration::from_secs(1),
        "tick interval too short: {interval:?}"
    );
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(tick_loop(interval, tx));
    rx
}

async fn tick_loop(interval: Duration, tx: mpsc::Sender<SystemTime>) {
    let stat_slow = tsp_metrics::counter("ticker.Errors", "type=SlowConsumer");
    let stat_order = tsp_metrics::counter("ticker.Errors", "type=Order");

    tokio::time::sleep(until_mid_second()).await;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_passed = UNIX_EPOCH;
    loop {
        ticker.tick().await;
        let now = truncate_to_second(SystemTime::now());
        if now <= last_passed {
            // Observed under CPU starvation: the OS delivered two ticks
            // within the same second. Passing the second one on would make
            // the consumer emit a duplicate timestamp.
            stat_order.incr();
            continue;
        }
        match tx.try_send(now) {
            Ok(()) => last_passed = now,
            Err(mpsc::error::TrySendError::Full(_)) => stat_slow.incr(),
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

/// Time until the next `.5s` boundary.
fn until_mid_second() -> Duration {
    let subsec = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_millis())
        .unwrap_or(0) as u64;
    if subsec < 500 {
        Duration::from_millis(500 - subsec)
    } else {
        Duration::from_millis(1500 - subsec)
    }
}

fn truncate_to_second(t: SystemTime) -> SystemTime {
    match t.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH + Duration::from_secs(since.as_secs()),
        Err(_) => UNIX_EPOCH,
    }
}
