//! Per-series repeat suppression.
//!
//! Runs of identical values are compressed to their endpoints: the first
//! point of the run passes, one more repeat passes to anchor the line
//! segment, later repeats are dropped, and when the value finally changes a
//! synthetic *held* point is emitted at the last suppressed time so the
//! flat segment ends where it really ended. A heartbeat passes one repeat
//! through every ten minutes so a stuck-but-alive series keeps producing
//! data.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tsp_wire::{Point, Value};

use crate::cmd;

const HEARTBEAT_NANOS: i64 = 10 * 60 * 1_000_000_000;
const MAX_AGE: Duration = Duration::from_secs(12 * 60);
const CLEANUP_EVERY_N: usize = 100_000;

const NANOS_PER_SEC: i64 = 1_000_000_000;

struct Status {
    time: i64,
    value: Value,
    n: u8,
    time_prev: i64,
}

/// Repeat detector. One instance per relay; single-owner, no locking.
pub struct RepeatTester {
    by_series: HashMap<Vec<u8>, Status>,
    cleanup_countdown: usize,
    series_buf: Vec<u8>,
}

impl RepeatTester {
    pub fn new() -> Self {
        Self {
            by_series: HashMap::new(),
            cleanup_countdown: CLEANUP_EVERY_N,
            series_buf: Vec::with_capacity(256),
        }
    }

    /// Classify the point. Returns `(is_repeat, held)`: when `is_repeat` the
    /// point must be suppressed, and when `held` is present that command
    /// must be sent *before* the point to close the flat segment.
    pub fn test(&mut self, point: &Point) -> (bool, Option<Vec<u8>>) {
        self.cleanup();
        self.series_buf.clear();
        point.append_series(&mut self.series_buf);
        let time = point.time_nanos();
        let value = point.value();

        let status = match self.by_series.get_mut(self.series_buf.as_slice()) {
            Some(status) => status,
            None => {
                self.by_series.insert(
                    self.series_buf.clone(),
                    Status {
                        time,
                        value,
                        n: 2,
                        time_prev: 0,
                    },
                );
                return (false, None);
            }
        };

        let is_repeat = time > status.time && value == status.value;
        let need_heartbeat = is_repeat && time - status.time >= HEARTBEAT_NANOS;

        if need_heartbeat {
            *status = Status {
                time,
                value,
                n: 1,
                time_prev: 0,
            };
            return (false, None);
        }
        if is_repeat {
            // The first repeat after a reset passes to anchor the segment.
            let pass = status.n == 2;
            status.time_prev = time;
            if status.n > 0 {
                status.n -= 1;
            }
            return (!pass, None);
        }
        // Not a repeat: the value changed, or time did not move forward.
        let held = if status.n == 0 {
            Some(cmd::put_cmd_parts(
                point.metric(),
                point.tags_raw(),
                status.time_prev / NANOS_PER_SEC,
                status.value,
            ))
        } else {
            None
        };
        *status = Status {
            time,
            value,
            n: 2,
            time_prev: 0,
        };
        (false, held)
    }

    fn cleanup(&mut self) {
        self.cleanup_countdown -= 1;
        if self.cleanup_countdown > 0 {
            return;
        }
        self.cleanup_countdown = CLEANUP_EVERY_N;
        let deadline = (SystemTime::now() - MAX_AGE)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        self.by_series.retain(|_, status| status.time > deadline);
    }

    #[cfg(test)]
    fn force_cleanup_next(&mut self) {
        self.cleanup_countdown = 1;
    }

    #[cfg(test)]
    fn series_count(&self) -> usize {
        self.by_series.len()
    }
}

impl Default for RepeatTester {
    fn default() -> Self {
        Self::new()
    }
}
