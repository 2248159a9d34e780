//! Put commands and series routing.
//!
//! A command is the full wire bytes of one `put` request:
//! `put <metric> <time> <value>[ tags]\n`. The series hash routes a command
//! to a connection; it covers the metric and tag bytes only, so every point
//! of a series follows the same connection and stays ordered end-to-end.

use tsp_wire::{codec, Point, Value};

pub(crate) const PUT_PREFIX: &[u8] = b"put ";

/// Render the put command for a point.
pub(crate) fn put_cmd(point: &Point) -> Vec<u8> {
    let mut cmd = Vec::with_capacity(PUT_PREFIX.len() + 64);
    cmd.extend_from_slice(PUT_PREFIX);
    point.append_line(&mut cmd);
    cmd.push(b'\n');
    cmd
}

/// Render a put command from series parts, used for held points whose time
/// and value come from suppressor state rather than a live point.
pub(crate) fn put_cmd_parts(metric: &[u8], tags: &[u8], secs: i64, value: Value) -> Vec<u8> {
    let mut cmd = Vec::with_capacity(PUT_PREFIX.len() + 64);
    cmd.extend_from_slice(PUT_PREFIX);
    cmd.extend_from_slice(metric);
    cmd.push(b' ');
    codec::append_int(&mut cmd, secs);
    cmd.push(b' ');
    match value {
        Value::Int(n) => codec::append_int(&mut cmd, n),
        Value::Float(n) => codec::append_float(&mut cmd, n),
    }
    cmd.extend_from_slice(tags);
    cmd.push(b'\n');
    cmd
}

/// The newline-terminated point line inside a command, without the `put `
/// prefix. This is the form handed to drop hooks and pending buffers.
pub(crate) fn cmd_line(cmd: &[u8]) -> &[u8] {
    &cmd[PUT_PREFIX.len()..]
}

/// Hash the series identity of a command into 16-bit range.
pub(crate) fn series_hash(cmd: &[u8]) -> usize {
    let body = cmd_line(cmd);
    let body = &body[..body.len().saturating_sub(1)];
    let mut hash = Fnv32::new();
    // Metric, up to the first space.
    let Some(i) = body.iter().position(|&c| c == b' ') else {
        return 0;
    };
    hash.write(&body[..i]);
    let rest = &body[i + 1..];
    // Skip the time field.
    let Some(j) = rest.iter().position(|&c| c == b' ') else {
        return 0;
    };
    let rest = &rest[j + 1..];
    // Skip the value field; the remainder (with its leading space) is the
    // canonical tag string. A tagless point hashes on metric alone.
    if let Some(k) = rest.iter().position(|&c| c == b' ') {
        hash.write(&rest[k..]);
    }
    hash.sum16() as usize
}

/// 32-bit FNV-1, truncated to 16 bits for routing.
struct Fnv32 {
    state: u32,
}

impl Fnv32 {
    const OFFSET: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;

    fn new() -> Self {
        Self {
            state: Self::OFFSET,
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state = self.state.wrapping_mul(Self::PRIME) ^ b as u32;
        }
    }

    fn sum16(&self) -> u16 {
        self.state as u16
    }
}
