//! Self-metrics: the process watches itself.
//!
//! On a fixed cadence, every counter and gauge in the process-wide sink is
//! snapshotted into points and merged into the pipeline next to the
//! externally collected data. The [`ticker`] is quantized to whole seconds
//! and phase-aligned to mid-second so self-metrics are unlikely to collide
//! with points produced for the same series elsewhere.

pub mod export;
pub mod ticker;

pub use export::{self_series, self_series_every, INTERVAL};
pub use ticker::tick;
