//! Text codec for the line wire format.
//!
//! Line grammar: `<metric> <time> <value> [k1=v1 [k2=v2 ...]]`, fields
//! separated by one or more space/tab bytes. Time is seconds (1-10 digits)
//! or milliseconds (exactly 13 digits). Encoding always produces seconds and
//! single-space separators, so millisecond input precision is lost on the
//! way out.

use std::io::Write;

use thiserror::Error;

use tsp_metrics::Counter;

use crate::point::{Point, PointError, Value, MAX_TAGS_PER_POINT, NANOS_PER_SEC};
use crate::text;

/// Longest accepted line, matching the limit enforced by the downstream
/// ingest servers.
pub const MAX_LINE_LENGTH: usize = 1023;

/// A syntax error in one input line. The line itself is quoted in the
/// message so plugin authors can find the offending output.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty line")]
    EmptyLine,
    #[error("line too long ({0}>{MAX_LINE_LENGTH})")]
    LineTooLong(usize),
    #[error("invalid metric: {source}, in {line:?}")]
    Metric { source: PointError, line: String },
    #[error("invalid time: {text:?}, in {line:?}")]
    Time { text: String, line: String },
    #[error("invalid value: {source}, in {line:?}")]
    Value { source: PointError, line: String },
    #[error("invalid tags: {source}, in {line:?}")]
    Tags { source: PointError, line: String },
}

/// Parse one line (without its trailing newline) into a [`Point`].
pub fn parse(buf: &[u8]) -> Result<Point, ParseError> {
    if buf.is_empty() {
        return Err(ParseError::EmptyLine);
    }
    if buf.len() > MAX_LINE_LENGTH {
        return Err(ParseError::LineTooLong(buf.len()));
    }
    let quote = || String::from_utf8_lossy(buf).into_owned();

    let (metric, rest) = skip_non_space(buf);
    text::valid(metric).map_err(|source| ParseError::Metric {
        source,
        line: quote(),
    })?;

    let rest = skip_space(rest);
    let (time_text, rest) = skip_non_space(rest);
    let time = parse_time(time_text).ok_or_else(|| ParseError::Time {
        text: String::from_utf8_lossy(time_text).into_owned(),
        line: quote(),
    })?;

    let rest = skip_space(rest);
    let (value_text, rest) = skip_non_space(rest);
    let value = Value::parse(value_text).map_err(|source| ParseError::Value {
        source,
        line: quote(),
    })?;

    let tags = parse_tags(rest).map_err(|source| ParseError::Tags {
        source,
        line: quote(),
    })?;

    Ok(Point::from_parts(time, value, metric.to_vec(), tags))
}

/// Parse a timestamp field into nanoseconds since the epoch. 1-10 digits are
/// seconds, exactly 13 digits are milliseconds; anything else is invalid.
fn parse_time(b: &[u8]) -> Option<i64> {
    if b.is_empty() || !(b.len() <= 10 || b.len() == 13) {
        return None;
    }
    let mut n: i64 = 0;
    for &c in b {
        if !c.is_ascii_digit() {
            return None;
        }
        n = n * 10 + (c - b'0') as i64;
    }
    if b.len() == 13 {
        n.checked_mul(1_000_000)
    } else {
        n.checked_mul(NANOS_PER_SEC)
    }
}

/// Parse the tag tail of a line into canonical ` k=v` bytes.
fn parse_tags(buf: &[u8]) -> Result<Vec<u8>, PointError> {
    let mut tags = Vec::new();
    let mut seen: Vec<&[u8]> = Vec::new();
    let mut rest = skip_space(buf);
    while !rest.is_empty() {
        let (pair, next) = skip_non_space(rest);
        rest = skip_space(next);
        let eq = pair
            .iter()
            .position(|&c| c == b'=')
            .ok_or(PointError::TruncatedTags)?;
        let (k, v) = (&pair[..eq], &pair[eq + 1..]);
        text::valid(k)?;
        text::valid(v)?;
        if seen.contains(&k) {
            return Err(PointError::DuplicateTagKey(
                String::from_utf8_lossy(k).into_owned(),
            ));
        }
        seen.push(k);
        tags.push(b' ');
        tags.extend_from_slice(k);
        tags.push(b'=');
        tags.extend_from_slice(v);
    }
    if seen.len() > MAX_TAGS_PER_POINT {
        return Err(PointError::TooManyTags(seen.len()));
    }
    Ok(tags)
}

/// Append the decimal form of `n`.
pub fn append_int(buf: &mut Vec<u8>, n: i64) {
    let mut tmp = [0u8; 20];
    let mut i = tmp.len();
    let mut m = n.unsigned_abs();
    loop {
        i -= 1;
        tmp[i] = b'0' + (m % 10) as u8;
        m /= 10;
        if m == 0 {
            break;
        }
    }
    if n < 0 {
        buf.push(b'-');
    }
    buf.extend_from_slice(&tmp[i..]);
}

/// Append the shortest round-tripping form of `n`, always with a fraction so
/// the float-ness survives a decode.
pub fn append_float(buf: &mut Vec<u8>, n: f32) {
    let s = format!("{n}");
    buf.extend_from_slice(s.as_bytes());
    if !s.contains('.') {
        buf.extend_from_slice(b".0");
    }
}

fn is_space(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

fn skip_space(b: &[u8]) -> &[u8] {
    let n = b.iter().take_while(|&&c| is_space(c)).count();
    &b[n..]
}

fn skip_non_space(b: &[u8]) -> (&[u8], &[u8]) {
    match b.iter().position(|&c| is_space(c)) {
        Some(i) => (&b[..i], &b[i..]),
        None => (b, &b[b.len()..]),
    }
}

/// Streaming point encoder over any byte sink.
pub struct Encoder<W> {
    w: W,
    buf: Vec<u8>,
    stat_bytes: Counter,
    stat_errors: Counter,
}

impl<W: Write> Encoder<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            buf: Vec::with_capacity(MAX_LINE_LENGTH + 1),
            stat_bytes: tsp_metrics::counter("encoder.Bytes", ""),
            stat_errors: tsp_metrics::counter("encoder.Errors", "type=Write"),
        }
    }

    /// Write the canonical line for `point`, newline-terminated.
    pub fn encode(&mut self, point: &Point) -> std::io::Result<()> {
        self.buf.clear();
        point.append_line(&mut self.buf);
        self.buf.push(b'\n');
        if let Err(err) = self.w.write_all(&self.buf) {
            self.stat_errors.incr();
            return Err(err);
        }
        self.stat_bytes.add(self.buf.len() as i64);
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(p: &Point) -> String {
        let mut buf = Vec::new();
        p.append_line(&mut buf);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_marshal() {
        let cases: Vec<(&[u8], &str)> = vec![
            (b"x 1234567890 1", "x 1234567890 1"),
            (b"x 1234567890 1.0", "x 1234567890 1.0"),
            (b"x 1234567890 -1", "x 1234567890 -1"),
            (b"x 1234567890 -1.0", "x 1234567890 -1.0"),
            (b"x 1234567890 1 y=y z=z", "x 1234567890 1 y=y z=z"),
        ];
        for (input, want) in cases {
            let p = parse(input).unwrap();
            assert_eq!(encode(&p), want);
        }
    }

    #[test]
    fn test_unmarshal_errors() {
        let bad: &[&[u8]] = &[
            b"",
            b"x",
            b"x x",
            b"x badt 0",
            b"x 1234567890 badv",
            b"x 1234567890 0 k=",
            b"x 1234567890 0 =v",
            b"x 1234567890 0 =",
            b"x -123456789 1",
            b" x 1234567890 1 y=y",
            b"x 12345678901 1",   // 11 digits: neither seconds nor millis
            b"x 123456789012 1",  // 12 digits
            b"x 1234567890 0 kv", // tag without '='
        ];
        for input in bad {
            assert!(
                parse(input).is_err(),
                "accepted {:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn test_unmarshal() {
        let p = parse(b"x 1234567890 1 y=y").unwrap();
        assert_eq!(p.metric(), b"x");
        assert_eq!(p.unix_secs(), 1234567890);
        assert_eq!(p.value(), Value::Int(1));
        assert_eq!(p.tags_raw(), b" y=y");
    }

    #[test]
    fn test_unmarshal_mixed_whitespace() {
        let p = parse(b"x \t 1234567890\t1  a=1\tb=2").unwrap();
        assert_eq!(encode(&p), "x 1234567890 1 a=1 b=2");
    }

    #[test]
    fn test_millis_accepted_seconds_emitted() {
        let p = parse(b"x 1234567890123 1").unwrap();
        assert_eq!(p.unix_secs(), 1234567890);
        assert_eq!(encode(&p), "x 1234567890 1");
    }

    #[test]
    fn test_line_too_long() {
        let mut line = b"x 1234567890 1 y=".to_vec();
        line.extend(std::iter::repeat(b'v').take(MAX_LINE_LENGTH));
        assert!(matches!(parse(&line), Err(ParseError::LineTooLong(_))));
    }

    #[test]
    fn test_too_many_tags_on_decode() {
        let line = b"x 1234567890 1 a=1 b=1 c=1 d=1 e=1 f=1 g=1 h=1 i=1";
        assert!(matches!(
            parse(line),
            Err(ParseError::Tags {
                source: PointError::TooManyTags(9),
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_tag_key_on_decode() {
        assert!(parse(b"x 1234567890 1 a=1 a=2").is_err());
    }

    #[test]
    fn test_value_forms() {
        assert_eq!(parse(b"x 1 0").unwrap().value(), Value::Int(0));
        assert_eq!(
            parse(b"x 1 9223372036854775807").unwrap().value(),
            Value::Int(i64::MAX)
        );
        assert_eq!(parse(b"x 1 0.5").unwrap().value(), Value::Float(0.5));
        assert!(parse(b"x 1 nan").is_err());
        assert!(parse(b"x 1 Inf").is_err());
        assert!(parse(b"x 1 -Inf").is_err());
    }

    #[test]
    fn test_float_round_trip() {
        for text in ["0.5", "1.25", "-3.75", "123.0", "0.1"] {
            let line = format!("x 1 {text}");
            let p = parse(line.as_bytes()).unwrap();
            let out = encode(&p);
            let p2 = parse(out.as_bytes()).unwrap();
            assert_eq!(p.value(), p2.value(), "round trip changed {text}");
        }
    }

    #[test]
    fn test_append_int() {
        let mut buf = Vec::new();
        append_int(&mut buf, 0);
        buf.push(b' ');
        append_int(&mut buf, -42);
        buf.push(b' ');
        append_int(&mut buf, i64::MIN);
        assert_eq!(buf, b"0 -42 -9223372036854775808");
    }

    #[test]
    fn test_append_float_always_has_fraction() {
        let mut buf = Vec::new();
        append_float(&mut buf, 1.0);
        assert_eq!(buf, b"1.0");
        buf.clear();
        append_float(&mut buf, -0.5);
        assert_eq!(buf, b"-0.5");
    }

    #[test]
    fn test_encoder() {
        let mut enc = Encoder::new(Vec::new());
        enc.encode(&parse(b"x 1234567890 1 y=y").unwrap()).unwrap();
        enc.encode(&parse(b"z 1234567891 2.5").unwrap()).unwrap();
        let out = enc.into_inner();
        assert_eq!(out, b"x 1234567890 1 y=y\nz 1234567891 2.5\n");
    }
}
