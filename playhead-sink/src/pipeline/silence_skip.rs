//! Silence-skipping stage
//!
//! Elides runs of near-silent audio longer than a minimum duration, keeping
//! a short padding at both edges of each run so transitions stay soft. The
//! total number of elided frames is reported so the sink can map device
//! positions back to media time across the elisions.
//!
//! Short silent runs are passed through untouched, which requires buffering
//! a run until it either ends (emit everything) or exceeds the minimum
//! duration (emit the leading padding, drop the middle, keep a trailing
//! padding).

use crate::error::Result;
use crate::pipeline::{AudioProcessor, FrameBuffer};
use playhead_common::AudioFormat;

/// Runs of silence at least this long are skipped
const MINIMUM_SILENCE_DURATION_US: i64 = 150_000;
/// Silence retained at each edge of a skipped run
const PADDING_SILENCE_US: i64 = 20_000;
/// Absolute sample amplitude below which audio counts as silent
const SILENCE_THRESHOLD: f32 = 1024.0 / 32768.0;

#[derive(Default)]
pub struct SilenceSkipProcessor {
    pending_enabled: bool,
    enabled: bool,

    staged_channels: usize,
    staged_min_silence_frames: usize,
    staged_padding_frames: usize,
    channels: usize,
    min_silence_frames: usize,
    padding_frames: usize,

    /// Buffered samples of the current silent run (bounded: once a run is
    /// known to be skippable only the trailing padding is kept)
    run_buffer: Vec<f32>,
    run_frames: usize,
    leading_padding_emitted: bool,

    skipped_frames: u64,
    out: FrameBuffer,
    input_ended: bool,
}

impl SilenceSkipProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether skipping is currently requested (before activation)
    pub fn is_enabled(&self) -> bool {
        self.pending_enabled
    }
}

impl AudioProcessor for SilenceSkipProcessor {
    fn configure(&mut self, input: &AudioFormat) -> Result<Option<AudioFormat>> {
        self.staged_channels = input.channels as usize;
        self.staged_min_silence_frames = (input.sample_rate as i64 * MINIMUM_SILENCE_DURATION_US
            / 1_000_000) as usize;
        self.staged_padding_frames =
            (input.sample_rate as i64 * PADDING_SILENCE_US / 1_000_000) as usize;
        if self.pending_enabled {
            Ok(Some(*input))
        } else {
            Ok(None)
        }
    }

    fn queue_input(&mut self, samples: &[f32]) {
        for frame in samples.chunks_exact(self.channels) {
            let silent = frame.iter().all(|s| s.abs() < SILENCE_THRESHOLD);
            if silent {
                self.push_silent_frame(frame);
            } else {
                self.end_silent_run();
                self.out.push(frame);
            }
        }
    }

    fn queue_end_of_stream(&mut self) {
        self.end_silent_run();
        self.input_ended = true;
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
        self.run_buffer.clear();
        self.run_frames = 0;
        self.leading_padding_emitted = false;
        self.input_ended = false;
        self.enabled = self.pending_enabled;
        self.channels = self.staged_channels;
        self.min_silence_frames = self.staged_min_silence_frames;
        self.padding_frames = self.staged_padding_frames;
    }

    fn reset(&mut self) {
        self.flush();
        self.skipped_frames = 0;
        self.pending_enabled = false;
        self.enabled = false;
    }

    fn set_skip_silence(&mut self, enabled: bool) {
        self.pending_enabled = enabled;
    }

    fn is_active(&self) -> bool {
        self.enabled
    }

    fn skipped_output_frames(&self) -> u64 {
        self.skipped_frames
    }

    fn reset_stream_counters(&mut self) {
        self.skipped_frames = 0;
    }
}

impl SilenceSkipProcessor {
    fn push_silent_frame(&mut self, frame: &[f32]) {
        self.run_frames += 1;
        self.run_buffer.extend_from_slice(frame);

        if self.run_frames > self.min_silence_frames {
            // The run is long enough to skip. Emit the leading padding once,
            // then keep only the trailing padding buffered.
            if !self.leading_padding_emitted {
                let lead = self.padding_frames * self.channels;
                let lead = lead.min(self.run_buffer.len());
                self.out.push(&self.run_buffer[..lead]);
                self.run_buffer.drain(..lead);
                self.leading_padding_emitted = true;
            }
            let keep = self.padding_frames * self.channels;
            if self.run_buffer.len() > keep {
                let drop = self.run_buffer.len() - keep;
                self.run_buffer.drain(..drop);
                self.skipped_frames += (drop / self.channels) as u64;
            }
        }
    }

    fn end_silent_run(&mut self) {
        if self.run_frames == 0 {
            return;
        }
        // Short runs are emitted in full; long runs emit their trailing
        // padding (the middle was already dropped as it streamed past).
        self.out.push(&self.run_buffer);
        self.run_buffer.clear();
        self.run_frames = 0;
        self.leading_padding_emitted = false;
    }
}
