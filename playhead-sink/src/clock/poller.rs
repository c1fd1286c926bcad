//! Hardware timestamp polling state machine
//!
//! Decides whether a trustworthy "this many frames had been output as of
//! this system time" fact is currently available, given a stream of
//! possibly-absent timestamp queries.
//!
//! A fresh timestamp is not trusted immediately: the device may report a
//! stale position for a while after starting. Only once a later sample shows
//! a strictly greater position than the first one captured is the timestamp
//! considered advancing and safe to extrapolate from. A query that should
//! have produced a timestamp but didn't is treated as a route change and
//! resets the machine.

use crate::clock::{PositionSource, RawPositionAccumulator};
use crate::device::OutputDevice;
use playhead_common::time;
use playhead_common::SinkTuning;
use tracing::debug;

/// State of the timestamp poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Polling fast, no usable timestamp yet
    Initializing,
    /// Holding a timestamp, not yet known to be advancing
    HasTimestamp,
    /// Holding a timestamp that is proven to advance
    HasAdvancingTimestamp,
    /// The route does not provide timestamps; polling infrequently in case
    /// that changes
    NoTimestamp,
    /// The last timestamp was rejected as spurious; polling at a backoff
    /// cadence until one is accepted again
    Error,
}

/// Polls and validates hardware timestamps.
///
/// Contract: after [`poll`] returns `true`, [`position_frames`] and
/// [`sample_time_us`] are valid for that sample, and the caller must call
/// exactly one of [`accept`] / [`reject`] after consuming it.
///
/// [`poll`]: TimestampPoller::poll
/// [`position_frames`]: TimestampPoller::position_frames
/// [`sample_time_us`]: TimestampPoller::sample_time_us
/// [`accept`]: TimestampPoller::accept
/// [`reject`]: TimestampPoller::reject
pub struct TimestampPoller {
    tuning: SinkTuning,
    state: PollerState,
    sample_interval_us: i64,
    /// None forces the next poll attempt to query the device immediately
    last_sample_time_us: Option<i64>,
    initialize_system_time_us: i64,
    initial_position_frames: Option<u64>,
    accumulator: RawPositionAccumulator,
    position_frames: u64,
    sample_time_us: i64,
}

impl TimestampPoller {
    pub fn new(tuning: SinkTuning, now_us: i64) -> Self {
        let mut poller = Self {
            tuning,
            state: PollerState::Initializing,
            sample_interval_us: 0,
            last_sample_time_us: None,
            initialize_system_time_us: 0,
            initial_position_frames: None,
            accumulator: RawPositionAccumulator::new(),
            position_frames: 0,
            sample_time_us: 0,
        };
        poller.enter_state(PollerState::Initializing, now_us);
        poller
    }

    /// Polls the device timestamp if the cadence allows, and returns whether
    /// a new sample is available.
    pub fn poll(&mut self, device: &mut dyn OutputDevice, now_us: i64) -> bool {
        if let Some(last) = self.last_sample_time_us {
            if now_us - last < self.sample_interval_us {
                return false;
            }
        }
        self.last_sample_time_us = Some(now_us);

        let mut updated = self.fetch_timestamp(device);
        match self.state {
            PollerState::Initializing => {
                if updated {
                    if self.sample_time_us >= self.initialize_system_time_us {
                        // We have an initial timestamp, but don't know if it's advancing yet.
                        self.initial_position_frames = Some(self.position_frames);
                        self.enter_state(PollerState::HasTimestamp, now_us);
                    } else {
                        // Drop the timestamp, as it was sampled before the last reset.
                        updated = false;
                    }
                } else if now_us - self.initialize_system_time_us
                    > self.tuning.initializing_duration_us
                {
                    // No timestamps for the whole grace window: they probably
                    // aren't available on this route. Poll infrequently in
                    // case the route changes later.
                    self.enter_state(PollerState::NoTimestamp, now_us);
                }
            }
            PollerState::HasTimestamp => {
                if updated {
                    let initial = self.initial_position_frames.unwrap_or(u64::MAX);
                    if self.position_frames > initial {
                        self.enter_state(PollerState::HasAdvancingTimestamp, now_us);
                    }
                } else {
                    // The audio route may have changed, so reset polling.
                    self.reset(now_us);
                }
            }
            PollerState::HasAdvancingTimestamp => {
                if !updated {
                    self.reset(now_us);
                }
            }
            PollerState::NoTimestamp => {
                if updated {
                    self.reset(now_us);
                }
            }
            PollerState::Error => {}
        }
        updated
    }

    /// Rejects the sample last returned by [`poll`](Self::poll); enters the
    /// error state and polls at the backoff cadence until [`accept`]
    /// (re-)validates a later sample.
    ///
    /// [`accept`]: Self::accept
    pub fn reject(&mut self, now_us: i64) {
        debug!(state = ?self.state, "timestamp rejected, entering error backoff");
        self.enter_state(PollerState::Error, now_us);
    }

    /// Accepts the sample last returned by [`poll`](Self::poll). Leaves the
    /// error state, if active, and resumes fast polling.
    pub fn accept(&mut self, now_us: i64) {
        if self.state == PollerState::Error {
            self.reset(now_us);
        }
    }

    /// Resets polling. Called whenever the device is paused, resumed, or
    /// the route may have changed.
    pub fn reset(&mut self, now_us: i64) {
        self.enter_state(PollerState::Initializing, now_us);
    }

    /// Whether a (not necessarily advancing) timestamp is held
    pub fn has_timestamp(&self) -> bool {
        matches!(
            self.state,
            PollerState::HasTimestamp | PollerState::HasAdvancingTimestamp
        )
    }

    /// Whether the held timestamp is proven to be advancing, making it safe
    /// to extrapolate a current position from it
    pub fn has_advancing_timestamp(&self) -> bool {
        self.state == PollerState::HasAdvancingTimestamp
    }

    /// Logical (wrap-accumulated) frame position of the latest sample
    pub fn position_frames(&self) -> u64 {
        self.position_frames
    }

    /// System time at which the latest sample was captured
    pub fn sample_time_us(&self) -> i64 {
        self.sample_time_us
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Arm for an intentional frame-position restart due to an impending
    /// stream transition on a reused device handle.
    pub fn expect_position_reset(&mut self) {
        self.accumulator.expect_reset();
    }

    fn fetch_timestamp(&mut self, device: &mut dyn OutputDevice) -> bool {
        match device.timestamp() {
            Some(ts) => {
                self.position_frames = self.accumulator.update(ts.position_frames);
                self.sample_time_us = ts.system_time_us;
                true
            }
            None => false,
        }
    }

    fn enter_state(&mut self, state: PollerState, now_us: i64) {
        self.state = state;
        match state {
            PollerState::Initializing => {
                // Force polling a timestamp immediately, and poll quickly.
                self.last_sample_time_us = None;
                self.initial_position_frames = None;
                self.initialize_system_time_us = now_us;
                self.sample_interval_us = self.tuning.fast_poll_interval_us;
            }
            PollerState::HasTimestamp => {
                self.sample_interval_us = self.tuning.fast_poll_interval_us;
            }
            PollerState::HasAdvancingTimestamp | PollerState::NoTimestamp => {
                self.sample_interval_us = self.tuning.slow_poll_interval_us;
            }
            PollerState::Error => {
                self.sample_interval_us = self.tuning.error_poll_interval_us;
            }
        }
    }
}

/// The timestamp-backed [`PositionSource`]: the validated timestamp position
/// extrapolated with the elapsed real time since it was sampled, scaled by
/// the device playback speed.
pub struct TimestampPositionSource<'a> {
    poller: &'a TimestampPoller,
    sample_rate: u32,
}

impl<'a> TimestampPositionSource<'a> {
    pub fn new(poller: &'a TimestampPoller, sample_rate: u32) -> Self {
        Self {
            poller,
            sample_rate,
        }
    }
}

impl PositionSource for TimestampPositionSource<'_> {
    fn is_ready(&self) -> bool {
        self.poller.has_advancing_timestamp()
    }

    fn position_us(&self, now_us: i64, speed: f32) -> i64 {
        let timestamp_position_us =
            time::frames_to_duration_us(self.poller.position_frames(), self.sample_rate);
        let elapsed_since_timestamp_us = now_us - self.poller.sample_time_us();
        timestamp_position_us + time::media_duration_for_playout(elapsed_since_timestamp_us, speed)
    }
}
