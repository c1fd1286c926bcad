//! Playback speed stage
//!
//! Applies the software playback speed by rate-converting the stream with
//! linear interpolation: at speed `s`, every `s` input frames produce one
//! output frame. Only the position contract matters to the sink — a playout
//! duration produced by this stage corresponds to `duration × speed` of
//! media — so the stage reports that scale for media-time mapping.
//!
//! Pitch is carried but not independently applied: the resampling shifts
//! pitch together with tempo. Active only when speed differs from 1.0.

use crate::error::Result;
use crate::pipeline::{AudioProcessor, FrameBuffer};
use playhead_common::{AudioFormat, PlaybackParams};

#[derive(Default)]
pub struct TempoProcessor {
    pending_params: PlaybackParams,
    params: PlaybackParams,

    staged_channels: usize,
    channels: usize,
    /// Buffered input frames awaiting interpolation
    input: Vec<f32>,
    /// Fractional read position, in frames, into `input`
    position: f64,

    out: FrameBuffer,
    input_ended: bool,
}

impl TempoProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The speed/pitch currently requested (before activation)
    pub fn pending_params(&self) -> PlaybackParams {
        self.pending_params
    }

    fn emit_ready_frames(&mut self, drain: bool) {
        let frames = self.input.len() / self.channels.max(1);
        let rate = self.params.speed as f64;
        let mut produced: Vec<f32> = Vec::new();
        loop {
            let base = self.position.floor();
            let index = base as usize;
            // Interpolation needs the following frame too, except when
            // draining, where the final frame is clamped.
            let have_next = index + 1 < frames;
            if !(have_next || (drain && index < frames)) {
                break;
            }
            let frac = (self.position - base) as f32;
            let a = &self.input[index * self.channels..(index + 1) * self.channels];
            let b = if have_next {
                &self.input[(index + 1) * self.channels..(index + 2) * self.channels]
            } else {
                a
            };
            for ch in 0..self.channels {
                produced.push(a[ch] + (b[ch] - a[ch]) * frac);
            }
            self.position += rate;
        }
        self.out.push(&produced);

        // Drop whole consumed frames, keeping the one `position` points into
        let consumed = (self.position.floor() as usize).min(frames);
        self.input.drain(..consumed * self.channels);
        self.position -= consumed as f64;
        if drain {
            self.input.clear();
            self.position = 0.0;
        }
    }
}

impl AudioProcessor for TempoProcessor {
    fn configure(&mut self, input: &AudioFormat) -> Result<Option<AudioFormat>> {
        self.staged_channels = input.channels as usize;
        if self.pending_params.speed != 1.0 {
            Ok(Some(*input))
        } else {
            Ok(None)
        }
    }

    fn queue_input(&mut self, samples: &[f32]) {
        self.input.extend_from_slice(samples);
        self.emit_ready_frames(false);
    }

    fn queue_end_of_stream(&mut self) {
        self.input_ended = true;
        self.emit_ready_frames(true);
    }

    fn input_ended(&self) -> bool {
        self.input_ended
    }

    fn output(&mut self) -> &mut FrameBuffer {
        &mut self.out
    }

    fn is_ended(&self) -> bool {
        self.input_ended && !self.out.has_remaining()
    }

    fn flush(&mut self) {
        self.out.clear();
        self.input.clear();
        self.position = 0.0;
        self.input_ended = false;
        self.params = self.pending_params;
        self.channels = self.staged_channels;
    }

    fn reset(&mut self) {
        self.flush();
        self.pending_params = PlaybackParams::default();
        self.params = PlaybackParams::default();
    }

    fn set_playback_params(&mut self, params: PlaybackParams) {
        self.pending_params = params;
    }

    fn is_active(&self) -> bool {
        self.params.speed != 1.0
    }

    fn media_duration_scale(&self) -> Option<f64> {
        if self.params.speed != 1.0 {
            Some(self.params.speed as f64)
        } else {
            None
        }
    }
}
