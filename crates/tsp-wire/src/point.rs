//! The data point type and its invariants.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::codec;
use crate::text;

/// Upper bound on tags carried by one point.
pub const MAX_TAGS_PER_POINT: usize = 8;

pub(crate) const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A point value: a signed 64-bit integer or a 32-bit float.
///
/// When parsed from text, the presence of a `.` selects the float variant.
/// The two variants never compare equal, even for the same numeric quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f32),
}

impl Value {
    /// Build a float value, rejecting NaN and infinities.
    pub fn float(n: f32) -> Result<Value, PointError> {
        if !n.is_finite() {
            return Err(PointError::NonFiniteValue);
        }
        Ok(Value::Float(n))
    }

    /// Parse a value from its text form. `.` selects the float path.
    pub fn parse(b: &[u8]) -> Result<Value, PointError> {
        if b.contains(&b'.') {
            Self::parse_float(b)
        } else {
            Self::parse_int(b)
        }
    }

    fn parse_int(b: &[u8]) -> Result<Value, PointError> {
        let bad = || PointError::InvalidNumber(String::from_utf8_lossy(b).into_owned());
        // A sign with no digits reads as zero.
        let (neg, digits) = match b.split_first() {
            None => return Err(bad()),
            Some((&b'-', rest)) => (true, rest),
            Some(_) => (false, b),
        };
        let mut n: i64 = 0;
        for &c in digits {
            if !c.is_ascii_digit() {
                return Err(bad());
            }
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add((c - b'0') as i64))
                .ok_or_else(bad)?;
        }
        Ok(Value::Int(if neg { -n } else { n }))
    }

    fn parse_float(b: &[u8]) -> Result<Value, PointError> {
        let bad = || PointError::InvalidNumber(String::from_utf8_lossy(b).into_owned());
        let s = std::str::from_utf8(b).map_err(|_| bad())?;
        let n: f64 = s.parse().map_err(|_| bad())?;
        Value::float(n as f32)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Int(n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Vec::with_capacity(32);
        match *self {
            Value::Int(n) => codec::append_int(&mut buf, n),
            Value::Float(n) => codec::append_float(&mut buf, n),
        }
        f.write_str(std::str::from_utf8(&buf).expect("numeric text is ascii"))
    }
}

/// Errors arising from point construction or mutation.
#[derive(Debug, Error)]
pub enum PointError {
    #[error("time before unix epoch")]
    TimeBeforeEpoch,
    #[error("non-finite value")]
    NonFiniteValue,
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("empty string")]
    EmptyText,
    #[error("text not valid utf-8")]
    InvalidUtf8,
    #[error("invalid character {ch:?} in {text:?}")]
    InvalidChar { ch: char, text: String },
    #[error("truncated tags list")]
    TruncatedTags,
    #[error("duplicate tag key {0:?}")]
    DuplicateTagKey(String),
    #[error("too many tags ({0}>{MAX_TAGS_PER_POINT})")]
    TooManyTags(usize),
}

/// One timestamped observation.
///
/// Time is kept in nanoseconds since the Unix epoch but truncated to whole
/// seconds on construction: one second is the maximum precision the
/// downstream store accepts. Tags are held pre-canonicalised as
/// ` k1=v1 k2=v2` bytes (leading space, insertion order preserved), which is
/// both the wire form and the series identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    time: i64,
    value: Value,
    metric: Vec<u8>,
    tags: Vec<u8>,
}

impl Point {
    /// Build a point, validating every field.
    pub fn new(
        time: SystemTime,
        value: Value,
        metric: &str,
        tags: &[(&str, &str)],
    ) -> Result<Point, PointError> {
        let nanos = time_to_nanos(time)?;
        if let Value::Float(n) = value {
            if !n.is_finite() {
                return Err(PointError::NonFiniteValue);
            }
        }
        text::valid(metric.as_bytes())?;
        let mut point = Point {
            time: nanos,
            value,
            metric: metric.as_bytes().to_vec(),
            tags: Vec::new(),
        };
        if !tags.is_empty() {
            let pairs: Vec<(&[u8], &[u8])> = tags
                .iter()
                .map(|&(k, v)| (k.as_bytes(), v.as_bytes()))
                .collect();
            point.set_tags(&pairs)?;
        }
        Ok(point)
    }

    /// Assemble a point from already-validated parts. `time` is truncated to
    /// whole seconds; `tags` must be canonical bytes.
    pub(crate) fn from_parts(time: i64, value: Value, metric: Vec<u8>, tags: Vec<u8>) -> Point {
        Point {
            time: time - time % NANOS_PER_SEC,
            value,
            metric,
            tags,
        }
    }

    /// Nanoseconds since the Unix epoch, always a whole second.
    pub fn time_nanos(&self) -> i64 {
        self.time
    }

    /// Seconds since the Unix epoch.
    pub fn unix_secs(&self) -> i64 {
        self.time / NANOS_PER_SEC
    }

    pub fn value(&self) -> Value {
        self.value
    }

    pub fn metric(&self) -> &[u8] {
        &self.metric
    }

    /// The canonical tag bytes: empty, or ` k1=v1 k2=v2`.
    pub fn tags_raw(&self) -> &[u8] {
        &self.tags
    }

    /// Look up the value of the tag with the given key.
    pub fn tag(&self, key: &[u8]) -> Option<&[u8]> {
        if key.contains(&b' ') {
            return None;
        }
        self.tags().find(|&(k, _)| k == key).map(|(_, v)| v)
    }

    /// Iterate over `(key, value)` tag pairs in insertion order.
    pub fn tags(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        TagIter { rest: &self.tags }
    }

    /// Replace the metric name.
    pub fn set_metric(&mut self, metric: &[u8]) -> Result<(), PointError> {
        text::valid(metric)?;
        self.metric.clear();
        self.metric.extend_from_slice(metric);
        Ok(())
    }

    /// Set the value of each tag named in `pairs`. Named tags are written
    /// first in the given order; tags not named keep their value and follow
    /// in their old order. Applying the same pairs twice yields identical
    /// bytes.
    pub fn set_tags(&mut self, pairs: &[(&[u8], &[u8])]) -> Result<(), PointError> {
        let mut tags = Vec::with_capacity(self.tags.len() + pairs.len() * 16);
        let mut count = 0;
        for &(k, v) in pairs {
            text::valid(k)?;
            text::valid(v)?;
            if pairs[..count].iter().any(|&(seen, _)| seen == k) {
                return Err(PointError::DuplicateTagKey(
                    String::from_utf8_lossy(k).into_owned(),
                ));
            }
            tags.push(b' ');
            tags.extend_from_slice(k);
            tags.push(b'=');
            tags.extend_from_slice(v);
            count += 1;
        }
        for (k, v) in self.tags() {
            if pairs.iter().any(|&(new, _)| new == k) {
                continue;
            }
            tags.push(b' ');
            tags.extend_from_slice(k);
            tags.push(b'=');
            tags.extend_from_slice(v);
            count += 1;
        }
        if count > MAX_TAGS_PER_POINT {
            return Err(PointError::TooManyTags(count));
        }
        self.tags = tags;
        Ok(())
    }

    /// Append the canonical line form (no trailing newline). Time is emitted
    /// at seconds precision.
    pub fn append_line(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.metric);
        buf.push(b' ');
        codec::append_int(buf, self.unix_secs());
        buf.push(b' ');
        match self.value {
            Value::Int(n) => codec::append_int(buf, n),
            Value::Float(n) => codec::append_float(buf, n),
        }
        buf.extend_from_slice(&self.tags);
    }

    /// Append the series identity: metric bytes followed by canonical tag
    /// bytes. Two points belong to the same series iff these bytes match.
    pub fn append_series(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.metric);
        buf.extend_from_slice(&self.tags);
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Vec::with_capacity(64);
        self.append_line(&mut buf);
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

fn time_to_nanos(time: SystemTime) -> Result<i64, PointError> {
    let since_epoch = time
        .duration_since(UNIX_EPOCH)
        .map_err(|_| PointError::TimeBeforeEpoch)?;
    Ok(since_epoch.as_secs() as i64 * NANOS_PER_SEC)
}

struct TagIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for TagIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        // Canonical form: each pair is preceded by exactly one space.
        let rest = self.rest.strip_prefix(b" ".as_slice())?;
        let (pair, rest) = match rest.iter().position(|&c| c == b' ') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, &rest[rest.len()..]),
        };
        self.rest = rest;
        let eq = pair.iter().position(|&c| c == b'=')?;
        Some((&pair[..eq], &pair[eq + 1..]))
    }
}
