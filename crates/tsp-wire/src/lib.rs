//! Data point model and line-oriented wire codec.
//!
//! A [`Point`] is one timestamped observation: metric name, integer or float
//! value, and up to eight `key=value` tags. Points travel between processes
//! as text lines (`<metric> <time> <value> [k=v ...]`); [`codec`] implements
//! the parse/encode pair and [`Decoder`] layers per-series time-ordering
//! checks on top.
//!
//! Stage-to-stage, points are moved through bounded channels; [`join`]
//! merges two point streams into one.

pub mod codec;
pub mod decoder;
pub mod point;
pub mod stream;
pub mod text;

pub use codec::{Encoder, ParseError, MAX_LINE_LENGTH};
pub use decoder::{DecodeError, Decoder, StreamDecoder};
pub use point::{Point, PointError, Value, MAX_TAGS_PER_POINT};
pub use stream::join;
pub use text::clean;
