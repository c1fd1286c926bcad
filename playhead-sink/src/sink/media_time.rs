//! Device-position to media-time mapping
//!
//! Speed and pitch changes take effect at a known device position; each one
//! is recorded as a checkpoint pairing the media time with the device
//! position at which the new parameters apply. Checkpoints are consumed in
//! FIFO order as the tracked position passes them, so querying always uses
//! the parameters that were in effect when the queried audio was produced.
//!
//! Silence skipping removes audio from the device stream entirely; the
//! elided duration is added back to the device-derived position here, and
//! the running total of newly skipped audio is reported to the listener in
//! batches after a short debounce.

use playhead_common::{time, PlaybackParams};
use std::collections::VecDeque;

/// A recorded mapping between device position and media time, valid from
/// `device_position_us` onwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaPositionCheckpoint {
    /// The playback parameters in effect from this checkpoint
    pub params: PlaybackParams,
    /// The media time from which the parameters apply
    pub media_time_us: i64,
    /// The device position from which the parameters apply
    pub device_position_us: i64,
}

/// FIFO queue of pending checkpoints plus the one currently in effect.
///
/// Invariant: checkpoints are pushed in non-decreasing `device_position_us`
/// order and are only ever consumed from the front.
#[derive(Debug)]
pub struct CheckpointQueue {
    current: MediaPositionCheckpoint,
    pending: VecDeque<MediaPositionCheckpoint>,
}

impl CheckpointQueue {
    pub fn new() -> Self {
        Self {
            current: MediaPositionCheckpoint {
                params: PlaybackParams::default(),
                media_time_us: 0,
                device_position_us: 0,
            },
            pending: VecDeque::new(),
        }
    }

    /// Drop all pending checkpoints and restart the mapping at zero with
    /// the given parameters.
    pub fn reset(&mut self, params: PlaybackParams) {
        self.current = MediaPositionCheckpoint {
            params,
            media_time_us: 0,
            device_position_us: 0,
        };
        self.pending.clear();
    }

    /// Record that `params` take effect at the given media time and device
    /// position.
    pub fn push(&mut self, checkpoint: MediaPositionCheckpoint) {
        debug_assert!(self
            .pending
            .back()
            .map_or(true, |last| checkpoint.device_position_us >= last.device_position_us));
        self.pending.push_back(checkpoint);
    }

    /// The parameters in effect at the most recently queried position
    pub fn current_params(&self) -> PlaybackParams {
        self.current.params
    }

    /// Map a device position to media time, consuming checkpoints the
    /// position has passed.
    ///
    /// `chain_media_duration` maps a playout duration to the media duration
    /// the processing chain consumed for it, and is only consulted when no
    /// further checkpoint is pending (the chain reflects the newest
    /// parameters, which mustn't be applied to audio produced under older
    /// ones).
    pub fn media_time_for_position(
        &mut self,
        position_us: i64,
        chain_media_duration: impl Fn(i64) -> i64,
    ) -> i64 {
        while self
            .pending
            .front()
            .map_or(false, |front| position_us >= front.device_position_us)
        {
            // We are playing (or about to play) audio produced under the
            // newer parameters, so adopt them.
            if let Some(front) = self.pending.pop_front() {
                self.current = front;
            }
        }

        let playout_since_checkpoint_us = position_us - self.current.device_position_us;
        match self.pending.front() {
            None => {
                self.current.media_time_us + chain_media_duration(playout_since_checkpoint_us)
            }
            Some(next) => {
                // Audio between here and the next checkpoint was produced
                // under the current (older) parameters, while the chain has
                // already been reconfigured with the newer ones. Scale the
                // short stretch up to the next checkpoint by the older
                // parameters' target speed instead; the error this can
                // introduce is bounded by that stretch.
                let playout_until_next_us = next.device_position_us - position_us;
                let media_until_next_us = time::media_duration_for_playout(
                    playout_until_next_us,
                    self.current.params.speed,
                );
                next.media_time_us - media_until_next_us
            }
        }
    }
}

/// Accumulates silence elided by the pipeline and batches its reporting.
#[derive(Debug, Default)]
pub struct SkippedSilenceTracker {
    skipped_frames_at_last_position: u64,
    accumulated_us: i64,
    report_deadline_ms: Option<i64>,
}

impl SkippedSilenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note the pipeline's current total of skipped frames. Returns the
    /// duration (at the output rate) to add to the device-derived position.
    pub fn observe(
        &mut self,
        skipped_frames: u64,
        frames_to_duration_us: impl Fn(u64) -> i64,
        now_ms: i64,
        debounce_ms: i64,
    ) -> i64 {
        if skipped_frames > self.skipped_frames_at_last_position {
            let newly_skipped =
                skipped_frames - self.skipped_frames_at_last_position;
            self.accumulated_us += frames_to_duration_us(newly_skipped);
            self.skipped_frames_at_last_position = skipped_frames;
            // Restart the debounce window so adjacent skips merge into one
            // report.
            self.report_deadline_ms = Some(now_ms + debounce_ms);
        }
        frames_to_duration_us(skipped_frames)
    }

    /// If the debounce window has elapsed and enough silence accumulated,
    /// take the batched duration to report.
    pub fn take_report(&mut self, now_ms: i64, min_reported_us: i64) -> Option<i64> {
        let deadline = self.report_deadline_ms?;
        if now_ms < deadline {
            return None;
        }
        self.report_deadline_ms = None;
        if self.accumulated_us >= min_reported_us {
            let duration = self.accumulated_us;
            self.accumulated_us = 0;
            Some(duration)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
