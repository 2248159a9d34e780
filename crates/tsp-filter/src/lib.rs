//! Rewrite/block filtering of data points.
//!
//! A filter is an ordered list of [`Rule`]s. Each rule can match on the
//! metric name and tag values (by regex), rewrite the metric and tags (with
//! `${N}` submatch expansion), and finally accept or drop the point. The
//! first rule that carries a block decision ends evaluation; a point that
//! matches no blocking rule passes.

pub mod engine;
pub mod rule;
pub mod stream;

pub use engine::{Filter, FilterError};
pub use rule::{Rule, RuleError, MAX_RULES};
pub use stream::filtered;
