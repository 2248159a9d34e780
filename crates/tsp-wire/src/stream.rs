//! Point stream plumbing.

use tokio::sync::mpsc;

use crate::point::Point;

/// Merge two point streams into one. Relative order across the inputs is
/// arbitrary; per-input order is preserved. The output closes when both
/// inputs have closed.
pub fn join(mut a: mpsc::Receiver<Point>, mut b: mpsc::Receiver<Point>) -> mpsc::Receiver<Point> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let (mut a_open, mut b_open) = (true, true);
        while a_open || b_open {
            let point = tokio::select! {
                point = a.recv(), if a_open => match point {
                    Some(point) => point,
                    None => {
                        a_open = false;
                        continue;
                    }
                },
                point = b.recv(), if b_open => match point {
                    Some(point) => point,
                    None => {
                        b_open = false;
                        continue;
                    }
                },
            };
            if tx.send(point).await.is_err() {
                return;
            }
        }
    });
    rx
}
