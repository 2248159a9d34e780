//! Counter sink to point stream conversion.

use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

use tsp_wire::{Point, Value};

use crate::ticker;

/// Default self-metrics cadence.
pub const INTERVAL: Duration = Duration::from_secs(10);

/// A point stream carrying periodic snapshots of the process-wide counter
/// sink. Metric names gain the given role prefix, e.g. `tsp.forwarder.`.
pub fn self_series(prefix: &str) -> mpsc::Receiver<Point> {
    self_series_every(prefix, INTERVAL)
}

/// [`self_series`] with an explicit cadence.
pub fn self_series_every(prefix: &str, interval: Duration) -> mpsc::Receiver<Point> {
    let (tx, rx) = mpsc::channel(1);
    let prefix = prefix.to_string();
    tokio::spawn(async move {
        let mut ticks = ticker::tick(interval);
        while let Some(now) = ticks.recv().await {
            for point in snapshot(&prefix, now) {
                if tx.send(point).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

/// Render the sink's current contents as points at the given instant.
fn snapshot(prefix: &str, now: SystemTime) -> Vec<Point> {
    let mut points = Vec::new();
    tsp_metrics::global().for_each(|name, tags, value| {
        let metric = format!("{prefix}{name}");
        let pairs: Vec<(&str, &str)> = tags
            .split_whitespace()
            .filter_map(|pair| pair.split_once('='))
            .collect();
        match Point::new(now, Value::Int(value), &metric, &pairs) {
            Ok(point) => points.push(point),
            Err(err) => {
                tracing::error!(metric = %metric, tags = %tags, %err, "cannot export counter");
            }
        }
    });
    points
}
