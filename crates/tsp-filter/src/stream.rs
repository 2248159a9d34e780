//! Filtering as a stream stage.

use tokio::sync::mpsc;

use tsp_wire::Point;

use crate::engine::Filter;

/// Return a filtered version of the given point stream. Blocked points are
/// silently dropped; a rewrite error drops the point, logs, and counts.
pub fn filtered(filter: Filter, mut input: mpsc::Receiver<Point>) -> mpsc::Receiver<Point> {
    let (tx, rx) = mpsc::channel(1);
    let stat_errors = tsp_metrics::counter("filter.Errors", "type=Eval");
    tokio::spawn(async move {
        while let Some(mut point) = input.recv().await {
            match filter.eval(&mut point) {
                Ok(true) => {
                    if tx.send(point).await.is_err() {
                        return;
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    stat_errors.incr();
                    tracing::warn!(%err, "filter error");
                }
            }
        }
    });
    rx
}
