//! Audio device position tracking
//!
//! Single source of truth for "current audible position", device latency and
//! underrun detection. Fuses the validated hardware timestamp (preferred,
//! when proven advancing) with a smoothed raw-counter estimate, ramps
//! between the two across mode switches, simulates the playhead after
//! end-of-stream, and carries the device-specific workarounds (passthrough
//! pause behavior, counter stuck at zero while playing).
//!
//! The tracker holds no device reference: every query borrows the device
//! for the duration of the call. Observations that the owner must report
//! (underrun, spurious timestamps, invalid latency, first position advance)
//! are queued internally and drained with [`PositionTracker::take_events`].

use crate::clock::poller::{TimestampPoller, TimestampPositionSource};
use crate::clock::{PositionSource, RawPositionAccumulator};
use crate::device::{OutputDevice, PlayState, SinkClock};
use crate::events::SpuriousTimestampKind;
use playhead_common::time::{self, TIME_UNSET};
use playhead_common::{Encoding, SinkTuning};
use std::sync::Arc;

/// Events observed by the tracker, drained by the owning sink.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    /// The reported position increased for the first time since the last
    /// start or reset
    PositionAdvancing { playout_start_ms: i64 },

    /// The device consumed all written data while playing
    Underrun {
        buffer_size: usize,
        buffer_duration_ms: Option<i64>,
    },

    /// The device reported an impossibly large latency
    InvalidLatency { latency_us: i64 },

    /// A hardware timestamp failed a sanity check and was rejected
    SpuriousTimestamp {
        kind: SpuriousTimestampKind,
        timestamp_position_frames: u64,
        timestamp_system_time_us: i64,
        system_time_us: i64,
        playback_position_us: i64,
    },
}

/// The counter-backed [`PositionSource`]: the offset between the scaled
/// playout position and the system clock, averaged over the last few
/// samples to hide the counter's coarse update granularity.
pub struct SmoothedCounterSource {
    offsets: Vec<i64>,
    next_index: usize,
    count: usize,
    smoothed_offset_us: i64,
}

impl SmoothedCounterSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            offsets: vec![0; capacity.max(1)],
            next_index: 0,
            count: 0,
            smoothed_offset_us: 0,
        }
    }

    /// Record a new `(scaled playout position − system time)` offset sample
    /// and refresh the running average.
    pub fn add_sample(&mut self, offset_us: i64) {
        self.offsets[self.next_index] = offset_us;
        self.next_index = (self.next_index + 1) % self.offsets.len();
        if self.count < self.offsets.len() {
            self.count += 1;
        }
        let sum: i64 = self.offsets[..self.count].iter().sum();
        self.smoothed_offset_us = sum / self.count as i64;
    }

    pub fn reset(&mut self) {
        self.next_index = 0;
        self.count = 0;
        self.smoothed_offset_us = 0;
    }
}

impl PositionSource for SmoothedCounterSource {
    fn is_ready(&self) -> bool {
        self.count > 0
    }

    fn position_us(&self, now_us: i64, speed: f32) -> i64 {
        time::media_duration_for_playout(now_us + self.smoothed_offset_us, speed)
    }
}

/// Tracks the playback position of an open output device.
pub struct PositionTracker {
    tuning: SinkTuning,
    clock: Arc<dyn SinkClock>,
    events: Vec<PositionEvent>,

    poller: TimestampPoller,
    counter_source: SmoothedCounterSource,

    // Bound device parameters
    output_sample_rate: u32,
    output_frame_bytes: usize,
    buffer_size_bytes: usize,
    buffer_size_us: Option<i64>,
    is_output_pcm: bool,
    needs_passthrough_workarounds: bool,
    device_speed: f32,

    // Raw counter accumulation
    raw_accumulator: RawPositionAccumulator,
    last_raw_sample_time_ms: Option<i64>,
    passthrough_pause_offset: u64,
    force_reset_time_ms: Option<i64>,

    // Latency estimation
    latency_us: i64,
    last_latency_sample_time_us: Option<i64>,
    latency_unsupported: bool,

    // Underrun detection
    has_data: bool,

    // End-of-stream simulated playhead
    stop_timestamp_us: Option<i64>,
    stop_position_frames: u64,
    end_position_frames: u64,

    // Counter-offset sampling cadence
    last_playhead_sample_time_us: Option<i64>,

    // Results of the previous position query, for mode-switch smoothing and
    // the first-advance notification
    last_position_us: i64,
    last_system_time_us: i64,
    last_used_timestamp_mode: bool,
    previous_mode_position_us: i64,
    previous_mode_system_time_us: i64,
    notified_position_advancing: bool,
}

impl PositionTracker {
    pub fn new(tuning: SinkTuning, clock: Arc<dyn SinkClock>) -> Self {
        let now_us = clock.now_us();
        let offset_count = tuning.playhead_offset_count;
        Self {
            poller: TimestampPoller::new(tuning.clone(), now_us),
            counter_source: SmoothedCounterSource::new(offset_count),
            tuning,
            clock,
            events: Vec::new(),
            output_sample_rate: 0,
            output_frame_bytes: 0,
            buffer_size_bytes: 0,
            buffer_size_us: None,
            is_output_pcm: true,
            needs_passthrough_workarounds: false,
            device_speed: 1.0,
            raw_accumulator: RawPositionAccumulator::new(),
            last_raw_sample_time_ms: None,
            passthrough_pause_offset: 0,
            force_reset_time_ms: None,
            latency_us: 0,
            last_latency_sample_time_us: None,
            latency_unsupported: false,
            has_data: false,
            stop_timestamp_us: None,
            stop_position_frames: 0,
            end_position_frames: 0,
            last_playhead_sample_time_us: None,
            last_position_us: 0,
            last_system_time_us: TIME_UNSET,
            last_used_timestamp_mode: false,
            previous_mode_position_us: 0,
            previous_mode_system_time_us: TIME_UNSET,
            notified_position_advancing: false,
        }
    }

    /// (Re)bind to a newly opened device. Resets all smoothing and
    /// accumulation state; subsequent calls relate to this device until the
    /// next [`reset`](Self::reset).
    pub fn set_device(
        &mut self,
        device: &mut dyn OutputDevice,
        is_passthrough: bool,
        encoding: Encoding,
        bytes_per_frame: usize,
        buffer_size_bytes: usize,
    ) {
        self.output_sample_rate = device.sample_rate();
        self.is_output_pcm = encoding.is_pcm();
        self.needs_passthrough_workarounds = is_passthrough;
        self.output_frame_bytes = bytes_per_frame;
        self.buffer_size_bytes = buffer_size_bytes;
        self.buffer_size_us = if self.is_output_pcm && self.output_frame_bytes > 0 {
            Some(time::frames_to_duration_us(
                (self.buffer_size_bytes / self.output_frame_bytes) as u64,
                self.output_sample_rate,
            ))
        } else {
            None
        };
        self.poller = TimestampPoller::new(self.tuning.clone(), self.clock.now_us());
        self.raw_accumulator.reset();
        self.last_raw_sample_time_ms = None;
        self.passthrough_pause_offset = 0;
        self.force_reset_time_ms = None;
        self.latency_us = 0;
        self.last_latency_sample_time_us = None;
        self.latency_unsupported = false;
        self.has_data = false;
        self.stop_timestamp_us = None;
        self.stop_position_frames = 0;
        self.end_position_frames = 0;
        self.last_position_us = 0;
        self.device_speed = 1.0;
        self.reset_sync_params();
    }

    /// Unbind from the device. Called when the device handed to
    /// [`set_device`](Self::set_device) is no longer in use.
    pub fn reset(&mut self) {
        self.reset_sync_params();
        self.poller.reset(self.clock.now_us());
    }

    /// Starts position tracking. Must be called immediately before the
    /// device starts playing.
    pub fn start(&mut self) {
        if self.stop_timestamp_us.is_some() {
            self.stop_timestamp_us = Some(time::ms_to_us(self.clock.now_ms()));
        }
        self.poller.reset(self.clock.now_us());
    }

    /// Set the speed the device itself plays at. Extrapolation from the
    /// last timestamp relies on a constant rate, so timestamp tracking is
    /// reset and waits for a fresh sample.
    pub fn set_device_playback_speed(&mut self, speed: f32) {
        self.device_speed = speed;
        self.poller.reset(self.clock.now_us());
        self.reset_sync_params();
    }

    /// Arm for an intentional raw-counter restart due to reusing the device
    /// handle across a seamless stream transition.
    pub fn expect_raw_position_reset(&mut self) {
        self.raw_accumulator.expect_reset();
        self.poller.expect_position_reset();
    }

    /// Drain queued observations.
    pub fn take_events(&mut self) -> Vec<PositionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Current audible position in microseconds of device playout time.
    pub fn current_position_us(
        &mut self,
        device: &mut dyn OutputDevice,
        source_ended: bool,
    ) -> i64 {
        if device.play_state() == PlayState::Playing {
            self.maybe_sample_sync_params(device);
        }

        // Prefer the validated hardware timestamp; otherwise derive a
        // smoothed position from the sampled frame counter.
        let system_time_us = self.clock.now_us();
        let use_timestamp_mode = self.poller.has_advancing_timestamp();
        let mut position_us = if use_timestamp_mode {
            TimestampPositionSource::new(&self.poller, self.output_sample_rate)
                .position_us(system_time_us, self.device_speed)
        } else {
            let mut position_us = if !self.counter_source.is_ready() {
                // The device has started, but there are no offset samples to
                // smooth with yet.
                self.playback_head_position_us(device)
            } else {
                self.counter_source
                    .position_us(system_time_us, self.device_speed)
            };
            if !source_ended {
                position_us = (position_us - self.latency_us).max(0);
            }
            position_us
        };

        if self.last_used_timestamp_mode != use_timestamp_mode {
            // We've switched sampling mode.
            self.previous_mode_system_time_us = self.last_system_time_us;
            self.previous_mode_position_us = self.last_position_us;
        }
        if self.previous_mode_system_time_us != TIME_UNSET {
            let elapsed_since_previous_mode_us =
                system_time_us - self.previous_mode_system_time_us;
            if elapsed_since_previous_mode_us < self.tuning.mode_switch_smoothing_duration_us {
                // Ramp linearly between the old mode's projected position and
                // the new mode's position so the two disagreeing won't show
                // as a jump. 1000 ramp points across the smoothing window.
                let previous_mode_projected_position_us = self.previous_mode_position_us
                    + time::media_duration_for_playout(
                        elapsed_since_previous_mode_us,
                        self.device_speed,
                    );
                let ramp_point = (elapsed_since_previous_mode_us * 1000)
                    / self.tuning.mode_switch_smoothing_duration_us;
                position_us = (position_us * ramp_point
                    + (1000 - ramp_point) * previous_mode_projected_position_us)
                    / 1000;
            }
        }

        if !self.notified_position_advancing && position_us > self.last_position_us {
            self.notified_position_advancing = true;
            let media_duration_since_last_us = position_us - self.last_position_us;
            let playout_duration_since_last_us = time::playout_duration_for_media(
                media_duration_since_last_us,
                self.device_speed,
            );
            let playout_start_ms =
                self.clock.wall_time_ms() - time::us_to_ms(playout_duration_since_last_us);
            self.events.push(PositionEvent::PositionAdvancing {
                playout_start_ms,
            });
        }

        self.last_system_time_us = system_time_us;
        self.last_position_us = position_us;
        self.last_used_timestamp_mode = use_timestamp_mode;

        position_us
    }

    /// Checks the device state and returns whether the caller can write
    /// data. Queues an underrun event when the device went from having data
    /// to empty while not stopped.
    pub fn may_handle_buffer(
        &mut self,
        device: &mut dyn OutputDevice,
        written_frames: u64,
    ) -> bool {
        let play_state = device.play_state();
        if self.needs_passthrough_workarounds {
            // A passthrough device keeps playing data written while paused.
            // Stop writing so its buffer empties; the forced underrun is not
            // reported.
            if play_state == PlayState::Paused {
                self.has_data = false;
                return false;
            }
            // A freshly recreated passthrough device can report the previous
            // handle's advancing position for a short time after release.
            // Hold off until the counter actually returns to zero.
            if play_state == PlayState::Stopped && self.playback_head_position(device) != 0 {
                return false;
            }
        }

        let had_data = self.has_data;
        self.has_data = self.has_pending_data(device, written_frames);
        if had_data && !self.has_data && play_state != PlayState::Stopped {
            self.events.push(PositionEvent::Underrun {
                buffer_size: self.buffer_size_bytes,
                buffer_duration_ms: self.buffer_size_us.map(time::us_to_ms),
            });
        }

        true
    }

    /// Whether the device still holds data to play out at its current
    /// position.
    pub fn has_pending_data(
        &mut self,
        device: &mut dyn OutputDevice,
        written_frames: u64,
    ) -> bool {
        let position_us = self.current_position_us(device, false).max(0);
        written_frames > time::duration_us_to_frames(position_us, self.output_sample_rate)
            || self.force_has_pending_data(device)
    }

    /// Records the writing position at which the stream ended, so the
    /// reported position can keep incrementing while remaining data plays
    /// out.
    pub fn handle_end_of_stream(&mut self, device: &mut dyn OutputDevice, written_frames: u64) {
        self.stop_position_frames = self.playback_head_position(device);
        self.stop_timestamp_us = Some(time::ms_to_us(self.clock.now_ms()));
        self.end_position_frames = written_frames;
    }

    /// Pauses tracking, returning whether the device itself must be paused.
    /// Once end-of-stream has been handled playback stops by itself and no
    /// device pause is needed.
    pub fn pause(&mut self, device: &mut dyn OutputDevice) -> bool {
        self.reset_sync_params();
        if self.stop_timestamp_us.is_none() {
            // The device is about to pause; make sure the poller doesn't
            // keep supplying an advancing position.
            self.poller.reset(self.clock.now_us());
            return true;
        }
        self.stop_position_frames = self.playback_head_position(device);
        false
    }

    /// Whether the device is in the stuck-counter state and must be
    /// discarded and recreated: the counter has sat at zero while playing,
    /// with data written, past the workaround timeout.
    pub fn is_stalled(&self, written_frames: u64) -> bool {
        match self.force_reset_time_ms {
            Some(since_ms) => {
                written_frames > 0
                    && self.clock.now_ms() - since_ms >= self.tuning.stall_timeout_ms
            }
            None => false,
        }
    }

    // Internal methods.

    fn reset_sync_params(&mut self) {
        self.counter_source.reset();
        self.last_playhead_sample_time_us = None;
        self.last_system_time_us = TIME_UNSET;
        self.previous_mode_system_time_us = TIME_UNSET;
        self.notified_position_advancing = false;
    }

    fn maybe_sample_sync_params(&mut self, device: &mut dyn OutputDevice) {
        let system_time_us = self.clock.now_us();
        let due = self
            .last_playhead_sample_time_us
            .map_or(true, |last| {
                system_time_us - last >= self.tuning.playhead_offset_sample_interval_us
            });
        if due {
            let playback_position_us = self.playback_head_position_us(device);
            if playback_position_us == 0 {
                // The device hasn't output anything yet.
                return;
            }
            let offset_us =
                time::playout_duration_for_media(playback_position_us, self.device_speed)
                    - system_time_us;
            self.counter_source.add_sample(offset_us);
            self.last_playhead_sample_time_us = Some(system_time_us);
        }

        if self.needs_passthrough_workarounds {
            // Passthrough routes return garbage timestamps and latencies.
            return;
        }

        self.maybe_poll_and_check_timestamp(device, system_time_us);
        self.maybe_update_latency(device, system_time_us);
    }

    fn maybe_poll_and_check_timestamp(
        &mut self,
        device: &mut dyn OutputDevice,
        system_time_us: i64,
    ) {
        if !self.poller.poll(device, system_time_us) {
            return;
        }

        // Sanity-check the new sample before trusting it.
        let timestamp_system_time_us = self.poller.sample_time_us();
        let timestamp_position_frames = self.poller.position_frames();
        let playback_position_us = self.playback_head_position_us(device);
        if (timestamp_system_time_us - system_time_us).abs() > self.tuning.max_timestamp_offset_us
        {
            self.events.push(PositionEvent::SpuriousTimestamp {
                kind: SpuriousTimestampKind::SystemTimeMismatch,
                timestamp_position_frames,
                timestamp_system_time_us,
                system_time_us,
                playback_position_us,
            });
            self.poller.reject(system_time_us);
        } else if (time::frames_to_duration_us(timestamp_position_frames, self.output_sample_rate)
            - playback_position_us)
            .abs()
            > self.tuning.max_timestamp_offset_us
        {
            self.events.push(PositionEvent::SpuriousTimestamp {
                kind: SpuriousTimestampKind::PositionMismatch,
                timestamp_position_frames,
                timestamp_system_time_us,
                system_time_us,
                playback_position_us,
            });
            self.poller.reject(system_time_us);
        } else {
            self.poller.accept(system_time_us);
        }
    }

    fn maybe_update_latency(&mut self, device: &mut dyn OutputDevice, system_time_us: i64) {
        if !self.is_output_pcm || self.latency_unsupported {
            return;
        }
        let due = self
            .last_latency_sample_time_us
            .map_or(true, |last| {
                system_time_us - last >= self.tuning.latency_sample_interval_us
            });
        if !due {
            return;
        }
        match device.latency_us() {
            Some(reported_us) => {
                // Exclude the latency due to the device buffer itself,
                // leaving mixer and driver latency.
                let mut latency_us = reported_us - self.buffer_size_us.unwrap_or(0);
                latency_us = latency_us.max(0);
                if latency_us > self.tuning.max_latency_us {
                    self.events
                        .push(PositionEvent::InvalidLatency { latency_us });
                    latency_us = 0;
                }
                self.latency_us = latency_us;
            }
            None => {
                // The device cannot report latency. Don't ask again.
                self.latency_unsupported = true;
            }
        }
        self.last_latency_sample_time_us = Some(system_time_us);
    }

    fn force_has_pending_data(&mut self, device: &mut dyn OutputDevice) -> bool {
        // A paused passthrough device is held in a forced underrun; keep
        // behaving as if data is pending or writing would never resume.
        self.needs_passthrough_workarounds
            && device.play_state() == PlayState::Paused
            && self.playback_head_position(device) == 0
    }

    fn playback_head_position_us(&mut self, device: &mut dyn OutputDevice) -> i64 {
        time::frames_to_duration_us(self.playback_head_position(device), self.output_sample_rate)
    }

    /// The playback head position as a 64-bit frame count that survives the
    /// 32-bit counter wrapping. After end-of-stream the position is
    /// simulated up to the total number of frames written.
    fn playback_head_position(&mut self, device: &mut dyn OutputDevice) -> u64 {
        let current_time_ms = self.clock.now_ms();
        if let Some(stop_timestamp_us) = self.stop_timestamp_us {
            if device.play_state() == PlayState::Paused {
                // Paused while stopping: report the cached position.
                return self.stop_position_frames;
            }
            let elapsed_since_stop_us = time::ms_to_us(current_time_ms) - stop_timestamp_us;
            let media_since_stop_us =
                time::media_duration_for_playout(elapsed_since_stop_us, self.device_speed);
            let frames_since_stop =
                time::duration_us_to_frames(media_since_stop_us.max(0), self.output_sample_rate);
            return self
                .end_position_frames
                .min(self.stop_position_frames + frames_since_stop);
        }

        let due = self.last_raw_sample_time_ms.map_or(true, |last| {
            current_time_ms - last >= self.tuning.raw_position_update_interval_ms
        });
        if due {
            self.update_raw_position(device, current_time_ms);
            self.last_raw_sample_time_ms = Some(current_time_ms);
        }
        self.raw_accumulator.position()
    }

    fn update_raw_position(&mut self, device: &mut dyn OutputDevice, current_time_ms: i64) {
        let state = device.play_state();
        if state == PlayState::Stopped {
            // The device hasn't been started. Keep the initial zero position.
            return;
        }

        let raw = device.raw_position();
        let mut effective_raw = raw as u64;
        if self.needs_passthrough_workarounds {
            // Paused passthrough devices report a counter stuck at zero;
            // hold the last observed position until playout resumes.
            if state == PlayState::Paused && raw == 0 {
                self.passthrough_pause_offset = self.raw_accumulator.last_raw();
            }
            effective_raw += self.passthrough_pause_offset;
        }

        if raw == 0 && self.raw_accumulator.last_raw() > 0 && state == PlayState::Playing {
            // The device claims to be playing but its counter snapped back
            // to zero (seen when a route change fails mid-stream). Keep the
            // old position and start the stall clock; is_stalled() fires if
            // this persists past the workaround timeout.
            if self.force_reset_time_ms.is_none() {
                self.force_reset_time_ms = Some(current_time_ms);
            }
            return;
        }
        self.force_reset_time_ms = None;

        self.raw_accumulator.update_u64(effective_raw);
    }
}
