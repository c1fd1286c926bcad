//! Position clock: timestamp polling and counter fusion
//!
//! Two independent estimators of "frames heard so far" exist behind the
//! [`PositionSource`] interface:
//!
//! - a **timestamp source** ([`poller::TimestampPositionSource`]): precise
//!   (position, system-time) pairs from the device driver, validated by the
//!   [`poller::TimestampPoller`] state machine and extrapolated with elapsed
//!   real time;
//! - a **smoothed counter source** ([`SmoothedCounterSource`]): the coarse
//!   wrapping frame counter sampled frequently, with the offset between the
//!   scaled playout position and the system clock averaged over a small ring
//!   to suppress the counter's ~20 ms granularity.
//!
//! The [`tracker::PositionTracker`] owns both, prefers the timestamp source
//! whenever it is ready (the timestamp is proven to be advancing), and
//! linearly ramps between the two estimates across a mode switch so the
//! reported position never jumps.

pub mod poller;
pub mod tracker;

pub use poller::{PollerState, TimestampPoller};
pub use tracker::{PositionEvent, PositionTracker, SmoothedCounterSource};

use crate::events::SinkEvent;

/// Convert a tracker observation into the sink's public event form.
pub(crate) fn tracker_event_to_sink_event(
    event: PositionEvent,
    elapsed_since_last_feed_ms: i64,
) -> SinkEvent {
    match event {
        PositionEvent::PositionAdvancing { playout_start_ms } => {
            SinkEvent::PositionAdvancing { playout_start_ms }
        }
        PositionEvent::Underrun {
            buffer_size,
            buffer_duration_ms,
        } => SinkEvent::Underrun {
            buffer_size,
            buffer_duration_ms,
            elapsed_since_last_feed_ms,
        },
        PositionEvent::InvalidLatency { latency_us } => SinkEvent::InvalidLatency { latency_us },
        PositionEvent::SpuriousTimestamp {
            kind,
            timestamp_position_frames,
            timestamp_system_time_us,
            system_time_us,
            playback_position_us,
        } => SinkEvent::SpuriousTimestamp {
            kind,
            timestamp_position_frames,
            timestamp_system_time_us,
            system_time_us,
            playback_position_us,
        },
    }
}

/// One strategy for estimating the current playout position.
///
/// Selected by a priority rule: the timestamp source wins while it is ready,
/// the counter source is the fallback.
pub trait PositionSource {
    /// Whether this source can currently produce an estimate
    fn is_ready(&self) -> bool;

    /// Position estimate in microseconds of media time at `now_us`, given
    /// the device playback speed
    fn position_us(&self, now_us: i64, speed: f32) -> i64;
}

/// Accumulates a wrapping 32-bit frame counter into a 64-bit logical
/// position.
///
/// A numerically decreasing sample normally means the counter wrapped and
/// increments the wrap count. When the caller has armed [`expect_reset`]
/// (the device handle is being reused across a seamless stream transition,
/// which restarts the counter), the first decreasing sample instead carries
/// the previous total forward additively. The two causes are deliberately
/// distinguished only by that flag; see DESIGN.md.
///
/// [`expect_reset`]: RawPositionAccumulator::expect_reset
#[derive(Debug, Default)]
pub(crate) struct RawPositionAccumulator {
    last_raw: u64,
    wrap_count: u64,
    accumulated: u64,
    expect_reset: bool,
}

impl RawPositionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a new raw counter sample into the logical position and return
    /// the updated total.
    pub fn update(&mut self, raw: u32) -> u64 {
        self.update_u64(raw as u64)
    }

    /// As [`update`](Self::update), for callers that pre-adjust the raw
    /// value (passthrough pause offsets) beyond 32 bits.
    pub fn update_u64(&mut self, raw: u64) -> u64 {
        if self.last_raw > raw {
            if self.expect_reset {
                self.accumulated += self.last_raw;
                self.expect_reset = false;
            } else {
                // The value must have wrapped around.
                self.wrap_count += 1;
            }
        }
        self.last_raw = raw;
        self.position()
    }

    /// Current logical position without taking a new sample
    pub fn position(&self) -> u64 {
        self.last_raw + self.accumulated + (self.wrap_count << 32)
    }

    /// The most recent raw sample folded in (offset-adjusted, without the
    /// wrap and carry components)
    pub fn last_raw(&self) -> u64 {
        self.last_raw
    }

    /// Arm the accumulator to treat the next decreasing sample as an
    /// intentional counter restart rather than a wrap
    pub fn expect_reset(&mut self) {
        self.expect_reset = true;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
