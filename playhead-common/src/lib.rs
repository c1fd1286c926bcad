//! # Playhead shared types (playhead-common)
//!
//! Leaf crate shared by the playhead workspace: audio format descriptors,
//! microsecond/frame time conversions, and the tuning-parameter set used by
//! the sink's timing state machines.
//!
//! Nothing in this crate talks to hardware; it is pure data and arithmetic.

pub mod error;
pub mod params;
pub mod time;
pub mod types;

pub use error::{Error, Result};
pub use params::SinkTuning;
pub use types::{AudioFormat, Codec, Encoding, PlaybackParams, SampleFormat};
