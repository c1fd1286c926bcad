//! # Playhead audio sink (playhead-sink)
//!
//! Buffered, backpressure-aware audio output with an accurate "how much has
//! actually been heard" clock.
//!
//! **Purpose:** Feed a continuous stream of PCM (or device-decoded encoded)
//! audio into a hardware output device with non-blocking writes, while
//! fusing the device's coarse wrapping frame counter with its intermittent
//! high-precision timestamps into a monotonic, smoothly extrapolated
//! position suitable for per-frame UI queries and cross-stream sync.
//!
//! **Architecture:** Single-threaded cooperative state machines. One owner
//! drives [`sink::AudioSink`]; the sink owns a [`clock::PositionTracker`]
//! (which owns a [`clock::TimestampPoller`]) and a processing
//! [`pipeline::Pipeline`]. Hardware access goes through the narrow
//! [`device::OutputDevice`] trait so everything is testable against fakes;
//! a cpal-backed implementation is provided. Device teardown is the one
//! operation offloaded to a background worker ([`sink::ReleasePool`]).

pub mod clock;
pub mod device;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod sink;

pub use error::{Result, SinkError};
pub use events::{SinkEvent, SinkListener};
pub use sink::AudioSink;
