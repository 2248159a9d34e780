//! Relaying of data points to downstream ingest hosts.
//!
//! A [`Relay`] owns a [`Client`]: a bounded submit queue, an optional
//! per-series repeat suppressor, and a pool of TCP connections to a
//! comma-separated host list. Lines are routed to connections by a
//! consistent hash of the series identity, acknowledged in batches via the
//! `version` handshake, and dropped (never replayed) when a connection
//! fails. [`RelayPool::broadcast`] fans the final point stream out to every
//! configured relay.

pub mod client;
pub mod cmd;
pub mod conn;
pub mod pool;
pub mod relay;
pub mod repeat;

pub use client::{Client, ClientConfig, DropFn};
pub use pool::RelayPool;
pub use relay::{OnQueueFull, Relay, RelayConfig, RelayError};
pub use repeat::RepeatTester;
