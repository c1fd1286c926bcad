//! Start/end trimming stage
//!
//! Trims encoder delay frames from the start of a stream and encoder padding
//! frames from its end. The end trim works by holding back a buffer of the
//! most recent frames: if the stream ends while a reconfiguration is pending
//! (a gapless transition), the held-back frames are the padding and are
//! dropped; if the stage is drained mid-stream, the held-back frames are
//! real audio and are emitted.
//!
//! The number of frames trimmed so far is reported so the sink can compute
//! expected presentation times net of trimming.

use crate::error::Result;
use crate::pipeline::{AudioProcessor, FrameBuffer};
use playhead_common::AudioFormat;

#[derive(Default)]
pub struct TrimProcessor {
    trim_start_frames: u32,
    trim_end_frames: u32,
    reconfiguration_pending: bool,

    staged_channels: usize,
    channels: usize,
    pending_trim_start_samples: usize,
    end_buffer: Vec<f32>,
    end_buffer_len: usize,
    trimmed_frames: u64,

    out: FrameBuffer,
    input_ended: bool,
}

impl TrimProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames trimmed since the counters were last reset
    pub fn trimmed_frames(&self) -> u64 {
        self.trimmed_frames
    }
}

impl AudioProcessor for TrimProcessor {
    fn configure(&mut self, input: &AudioFormat) -> Result<Option<AudioFormat>> {
        self.staged_channels = input.channels as usize;
        self.reconfiguration_pending = true;
        if self.trim_start_frames != 0 || self.trim_end_frames != 0 {
            Ok(Some(*input))
        } else {
            Ok(None)
        }
    }

    fn queue_input(&mut self, samples: &[f32]) {
        let mut input = samples;
        if input.is_empty() {
            return;
        }

        // Trim any pending start samples from the input.
        let trim = self.pending_trim_start_samples.min(input.len());
        self.trimmed_frames += (trim / self.channels) as u64;
        self.pending_trim_start_samples -= trim;
        input = &input[trim..];
        if self.pending_trim_start_samples > 0 {
            // Nothing to output yet.
            return;
        }

        // The end buffer must stay as full as possible so that the right
        // amount is dropped if no more input arrives. Output any surplus:
        // first from the end buffer, then from the new input.
        let capacity = self.end_buffer.len();
        let mut surplus = (self.end_buffer_len + input.len()).saturating_sub(capacity);

        let from_end = surplus.min(self.end_buffer_len);
        self.out.push(&self.end_buffer[..from_end]);
        surplus -= from_end;

        let from_input = surplus.min(input.len());
        self.out.push(&input[..from_input]);

        // Compact the end buffer, then refill it from the new input.
        self.end_buffer.copy_within(from_end..self.end_buffer_len, 0);
        self.end_buffer_len -= from_end;
        let tail = &input[from_input..];
        self.end_buffer[self.end_buffer_len..self.end_buffer_len + tail.len()]
            .copy_from_slice(tail);
        self.end_buffer_len += tail.len();
    }

    fn queue_end_of_stream(&mut self) {
        self.input_ended = true;
        if self.reconfiguration_pending {
            // Gapless transition: the held-back frames are the padding.
            self.trimmed_frames += (self.end_buffer_len / self.channels.max(1)) as u64;
            self.end_buffer_len = 0;
        }
    }

    fn input_ended(&self) -> bool {
        self.input_ended
    }

    fn output(&mut self) -> &mut FrameBuffer {
        if self.input_ended && !self.out.has_remaining() && self.end_buffer_len > 0 {
            // Drained mid-stream: the held-back frames are real audio.
            let len = self.end_buffer_len;
            let held = std::mem::take(&mut self.end_buffer);
            self.out.push(&held[..len]);
            self.end_buffer = held;
            self.end_buffer_len = 0;
        }
        &mut self.out
    }

    fn is_ended(&self) -> bool {
        self.input_ended && !self.out.has_remaining() && self.end_buffer_len == 0
    }

    fn flush(&mut self) {
        if self.reconfiguration_pending {
            // Flushing activates the new configuration: prepare to trim from
            // the start and hold back the end padding.
            self.reconfiguration_pending = false;
            self.channels = self.staged_channels;
            self.end_buffer = vec![0.0; self.trim_end_frames as usize * self.channels];
            self.pending_trim_start_samples =
                self.trim_start_frames as usize * self.channels;
        }
        // Held-back data belongs to the flushed position; discard it.
        self.end_buffer_len = 0;
        self.out.clear();
        self.input_ended = false;
    }

    fn reset(&mut self) {
        self.flush();
        self.end_buffer = Vec::new();
        self.trim_start_frames = 0;
        self.trim_end_frames = 0;
        self.trimmed_frames = 0;
    }

    fn reset_stream_counters(&mut self) {
        self.trimmed_frames = 0;
    }

    fn trimmed_input_frames(&self) -> u64 {
        self.trimmed_frames
    }

    fn is_active(&self) -> bool {
        self.trim_start_frames != 0 || self.trim_end_frames != 0
    }

    fn set_trim_frames(&mut self, start: u32, end: u32) {
        self.trim_start_frames = start;
        self.trim_end_frames = end;
    }
}
