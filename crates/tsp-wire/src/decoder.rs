//! Ordered point decoding.
//!
//! [`Decoder`] parses lines and enforces, per series, that time moves
//! strictly forward and never jumps more than a day ahead. [`StreamDecoder`]
//! drives a `Decoder` from any async byte stream. A syntax or order error
//! consumes only the offending line; decoding resumes at the next one.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use tsp_metrics::Counter;

use crate::codec::{self, ParseError};
use crate::point::{Point, NANOS_PER_SEC};

const MAX_SERIES: usize = 1_000_000;
const MAX_AGE: Duration = Duration::from_secs(15 * 60);
const MAX_STEP_SECS: i64 = 24 * 60 * 60;
const CLEANUP_EVERY_N: usize = 100_000;

/// Decode failure. [`DecodeError::is_recoverable`] distinguishes per-line
/// failures, which the decoder survives, from end-of-stream conditions.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Syntax(#[from] ParseError),
    #[error("order error: collision at time {time}, in series {series:?}")]
    Collision { time: i64, series: String },
    #[error("order error: got time {got}, want at least {want}, in series {series:?}")]
    Regression { got: i64, want: i64, series: String },
    #[error(
        "order error: stepped too far into the future ({step}s>{max}s), in series {series:?}"
    )]
    FutureStep { step: i64, max: i64, series: String },
    #[error("too many time series (>{0})")]
    TooManySeries(usize),
    #[error("end of stream")]
    Eof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// True when the decoder remains usable after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DecodeError::Eof | DecodeError::Io(_))
    }
}

/// Line decoder with per-series ordering state.
pub struct Decoder {
    by_series: HashMap<Vec<u8>, i64>,
    cleanup_countdown: usize,
    check_order: bool,
    series_buf: Vec<u8>,
    stat_bytes: Counter,
    stat_err_syntax: Counter,
    stat_err_order: Counter,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            by_series: HashMap::new(),
            cleanup_countdown: CLEANUP_EVERY_N,
            check_order: true,
            series_buf: Vec::with_capacity(codec::MAX_LINE_LENGTH),
            stat_bytes: tsp_metrics::counter("decoder.Bytes", ""),
            stat_err_syntax: tsp_metrics::counter("decoder.Errors", "type=Syntax"),
            stat_err_order: tsp_metrics::counter("decoder.Errors", "type=Order"),
        }
    }

    /// Accept out-of-order input. Used on aggregation ingress, where points
    /// joined from many hosts interleave arbitrarily.
    pub fn disable_order_check(&mut self) {
        self.check_order = false;
    }

    /// Decode one line (without its newline). An order violation leaves the
    /// per-series state untouched, so a late point cannot mask later good
    /// ones.
    pub fn decode_line(&mut self, line: &[u8]) -> Result<Point, DecodeError> {
        self.stat_bytes.add(line.len() as i64 + 1);
        let point = match codec::parse(line) {
            Ok(point) => point,
            Err(err) => {
                self.stat_err_syntax.incr();
                return Err(err.into());
            }
        };
        if self.check_order {
            if let Err(err) = self.valid_order(&point) {
                self.stat_err_order.incr();
                return Err(err);
            }
        }
        Ok(point)
    }

    fn valid_order(&mut self, point: &Point) -> Result<(), DecodeError> {
        self.cleanup();
        self.series_buf.clear();
        point.append_series(&mut self.series_buf);
        let prev = match self.by_series.get_mut(self.series_buf.as_slice()) {
            Some(prev) => prev,
            None => {
                if self.by_series.len() == MAX_SERIES {
                    return Err(DecodeError::TooManySeries(MAX_SERIES));
                }
                self.by_series
                    .insert(self.series_buf.clone(), point.time_nanos());
                return Ok(());
            }
        };
        let series = || String::from_utf8_lossy(&self.series_buf).into_owned();
        let step = point.time_nanos() - *prev;
        if step < 0 {
            return Err(DecodeError::Regression {
                got: point.unix_secs(),
                want: *prev / NANOS_PER_SEC + 1,
                series: series(),
            });
        }
        if step == 0 {
            return Err(DecodeError::Collision {
                time: point.unix_secs(),
                series: series(),
            });
        }
        if step > MAX_STEP_SECS * NANOS_PER_SEC {
            return Err(DecodeError::FutureStep {
                step: step / NANOS_PER_SEC,
                max: MAX_STEP_SECS,
                series: series(),
            });
        }
        *prev = point.time_nanos();
        Ok(())
    }

    /// Drop state for series that stopped updating. Runs once every
    /// `CLEANUP_EVERY_N` order checks to keep the map bounded without a
    /// timer task.
    fn cleanup(&mut self) {
        self.cleanup_countdown -= 1;
        if self.cleanup_countdown > 0 {
            return;
        }
        self.cleanup_countdown = CLEANUP_EVERY_N;
        let deadline = SystemTime::now() - MAX_AGE;
        let deadline = deadline
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        self.by_series.retain(|_, &mut time| time > deadline);
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

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Decoder`] fed from an async byte stream, one line per decode.
pub struct StreamDecoder<R> {
    reader: R,
    decoder: Decoder,
    line: Vec<u8>,
    stat_err_read: Counter,
}

impl<R: AsyncBufRead + Unpin> StreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: Decoder::new(),
            line: Vec::with_capacity(codec::MAX_LINE_LENGTH + 1),
            stat_err_read: tsp_metrics::counter("decoder.Errors", "type=Read"),
        }
    }

    pub fn disable_order_check(&mut self) {
        self.decoder.disable_order_check();
    }

    /// Decode the next point. A final line without a newline is discarded,
    /// like any other truncated write from a dying producer.
    pub async fn decode(&mut self) -> Result<Point, DecodeError> {
        self.line.clear();
        let n = match self.reader.read_until(b'\n', &mut self.line).await {
            Ok(n) => n,
            Err(err) => {
                self.stat_err_read.incr();
                return Err(err.into());
            }
        };
        if n == 0 || self.line.last() != Some(&b'\n') {
            return Err(DecodeError::Eof);
        }
        self.line.pop();
        self.decoder.decode_line(&self.line)
    }
}
