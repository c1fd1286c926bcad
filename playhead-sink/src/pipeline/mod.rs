//! Audio processing pipeline
//!
//! An ordered list of transform stages applied to PCM audio between the
//! producer and the device. All stages operate on interleaved f32 samples,
//! the sink's normal interchange format; byte-level sample conversion
//! happens once at the pipeline entrance (see [`convert`]).
//!
//! Each stage implements [`AudioProcessor`]: it is configured with an input
//! format and either declares itself inactive (audio passes it untouched) or
//! reports its output format; active stages then consume input and produce
//! output incrementally. The [`Pipeline`] cascades data through the active
//! stages and exposes the last stage's output for the sink's non-blocking
//! write loop, which may consume it only partially.

pub mod channel_map;
pub mod convert;
pub mod resample;
pub mod silence_skip;
pub mod tempo;
pub mod trim;

use crate::error::{Result, SinkError};
use playhead_common::{AudioFormat, PlaybackParams};

/// Growable buffer of interleaved f32 samples with a read cursor, so a
/// consumer under backpressure can take part of the data and return for the
/// rest later.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    data: Vec<f32>,
    read: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconsumed samples
    pub fn remaining(&self) -> &[f32] {
        &self.data[self.read..]
    }

    pub fn has_remaining(&self) -> bool {
        self.read < self.data.len()
    }

    /// Mark `count` samples as consumed
    pub fn consume(&mut self, count: usize) {
        self.read = (self.read + count).min(self.data.len());
        if self.read == self.data.len() {
            self.data.clear();
            self.read = 0;
        }
    }

    /// Append samples for the consumer
    pub fn push(&mut self, samples: &[f32]) {
        // Compact consumed space before growing
        if self.read > 0 && self.read == self.data.len() {
            self.data.clear();
            self.read = 0;
        }
        self.data.extend_from_slice(samples);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.read = 0;
    }
}

/// One stage of the processing pipeline.
///
/// Lifecycle: `configure` → (`queue_input` / `output`)* →
/// `queue_end_of_stream` → drain until `is_ended` → `flush` (reusable) or
/// `reset` (back to unconfigured).
pub trait AudioProcessor: Send {
    /// Configure for a new input format. Returns the stage's output format
    /// when it is active for this input, `None` when the stage would leave
    /// audio untouched and should be skipped, or an error when the input
    /// format is unsupported. Takes effect at the next `flush`.
    fn configure(&mut self, input: &AudioFormat) -> Result<Option<AudioFormat>>;

    /// Queue interleaved input samples. Only called on active stages.
    fn queue_input(&mut self, samples: &[f32]);

    /// Signal that no further input will be queued
    fn queue_end_of_stream(&mut self);

    /// Whether end-of-stream has been queued
    fn input_ended(&self) -> bool;

    /// The stage's pending output
    fn output(&mut self) -> &mut FrameBuffer;

    /// Whether the stage has received end-of-stream and will produce no
    /// further output
    fn is_ended(&self) -> bool;

    /// Drop buffered data and activate any pending configuration
    fn flush(&mut self);

    /// Return to the unconfigured state
    fn reset(&mut self);

    /// Whether the stage transforms audio under its activated configuration.
    /// Valid after a flush; used to rebuild the active chain when parameter
    /// changes flip a stage on or off without a reconfigure.
    fn is_active(&self) -> bool;

    /// Set the output-to-input channel index map, for stages that remap
    /// channels. Takes effect at the next configure/flush cycle.
    fn set_channel_map(&mut self, _map: Option<Vec<usize>>) {}

    /// Set start/end trim frame counts, for stages that trim. Takes effect
    /// at the next configure/flush cycle.
    fn set_trim_frames(&mut self, _start: u32, _end: u32) {}

    /// Set the device output rate, for stages that resample to it. Takes
    /// effect at the next configure/flush cycle.
    fn set_output_rate(&mut self, _rate: u32) {}

    /// Update speed/pitch, for stages that apply them. Takes effect at the
    /// next configure/flush cycle.
    fn set_playback_params(&mut self, _params: PlaybackParams) {}

    /// Enable or disable silence skipping, for stages that do it. Takes
    /// effect at the next configure/flush cycle.
    fn set_skip_silence(&mut self, _enabled: bool) {}

    /// Multiplier mapping a playout duration produced by this stage back to
    /// the media duration consumed, when the stage changes duration
    fn media_duration_scale(&self) -> Option<f64> {
        None
    }

    /// Total input frames this stage has elided from the output
    fn skipped_output_frames(&self) -> u64 {
        0
    }

    /// Total input frames this stage has trimmed from the stream edges
    fn trimmed_input_frames(&self) -> u64 {
        0
    }

    /// Zero the per-stream counters (trimmed/skipped frames). Called when
    /// the sink's stream state is fully reset, not on ordinary flushes.
    fn reset_stream_counters(&mut self) {}
}

/// Ordered chain of processing stages.
pub struct Pipeline {
    stages: Vec<Box<dyn AudioProcessor>>,
    active: Vec<usize>,
    input_format: Option<AudioFormat>,
    output_format: Option<AudioFormat>,
    /// Empty buffer handed out when no stage is active
    empty: FrameBuffer,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn AudioProcessor>>) -> Self {
        Self {
            stages,
            active: Vec::new(),
            input_format: None,
            output_format: None,
            empty: FrameBuffer::new(),
        }
    }

    /// Configure every stage for the given input format. Returns the format
    /// audio will have after the chain. The new chain takes effect at the
    /// next [`flush`](Self::flush); until then data keeps flowing through
    /// the previously active stages (so a pending reconfiguration can drain
    /// the old stream first).
    pub fn configure(&mut self, input: &AudioFormat) -> Result<AudioFormat> {
        if !input.encoding.is_pcm() {
            return Err(SinkError::UnhandledFormat(*input));
        }
        let mut format = *input;
        for stage in self.stages.iter_mut() {
            if let Some(output) = stage.configure(&format)? {
                format = output;
            }
        }
        self.input_format = Some(*input);
        self.output_format = Some(format);
        Ok(format)
    }

    /// Whether any stage is active. When not operational, input passes to
    /// the device untouched.
    pub fn is_operational(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn output_format(&self) -> Option<AudioFormat> {
        self.output_format
    }

    /// Queue input into the first active stage and cascade through the
    /// chain. Must not be called when not operational.
    pub fn queue_input(&mut self, samples: &[f32]) {
        if let Some(&first) = self.active.first() {
            self.stages[first].queue_input(samples);
            self.work();
        }
    }

    /// Signal end of stream into the chain
    pub fn queue_end_of_stream(&mut self) {
        if let Some(&first) = self.active.first() {
            if !self.stages[first].input_ended() {
                self.stages[first].queue_end_of_stream();
            }
            self.work();
        }
    }

    /// Output of the last active stage. The caller consumes from the
    /// returned buffer; leftover data survives to the next call.
    pub fn output(&mut self) -> &mut FrameBuffer {
        self.work();
        match self.active.last() {
            Some(&last) => self.stages[last].output(),
            None => &mut self.empty,
        }
    }

    /// Whether every active stage has finished producing output after
    /// end-of-stream
    pub fn is_ended(&self) -> bool {
        self.active.iter().all(|&i| self.stages[i].is_ended())
    }

    /// Drop all buffered audio, activate pending stage configurations, and
    /// rebuild the active chain (stage activity can change when playback
    /// parameters change without a reconfigure).
    pub fn flush(&mut self) {
        for stage in &mut self.stages {
            stage.flush();
        }
        if self.input_format.is_some() {
            self.active = self
                .stages
                .iter()
                .enumerate()
                .filter(|(_, stage)| stage.is_active())
                .map(|(i, _)| i)
                .collect();
        }
    }

    /// Return every stage to the unconfigured state
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
        self.active.clear();
        self.input_format = None;
        self.output_format = None;
    }

    /// Forward new playback parameters to the stages that apply them
    pub fn set_playback_params(&mut self, params: PlaybackParams) {
        for stage in &mut self.stages {
            stage.set_playback_params(params);
        }
    }

    /// Forward the silence-skipping flag to the stages that apply it
    pub fn set_skip_silence(&mut self, enabled: bool) {
        for stage in &mut self.stages {
            stage.set_skip_silence(enabled);
        }
    }

    /// Map a playout duration produced by the chain back to the media
    /// duration consumed (identity unless a duration-changing stage is
    /// active)
    pub fn media_duration_for_output(&self, playout_duration_us: i64) -> i64 {
        let mut duration = playout_duration_us as f64;
        for &i in &self.active {
            if let Some(scale) = self.stages[i].media_duration_scale() {
                duration *= scale;
            }
        }
        duration.round() as i64
    }

    /// Total frames elided by silence-skipping stages. Aggregated over all
    /// stages, not just active ones: a stage deactivated by a parameter
    /// change keeps its historical count, which position mapping still needs.
    pub fn skipped_output_frames(&self) -> u64 {
        self.stages.iter().map(|s| s.skipped_output_frames()).sum()
    }

    /// Total frames trimmed from the stream edges, aggregated as above
    pub fn trimmed_input_frames(&self) -> u64 {
        self.stages.iter().map(|s| s.trimmed_input_frames()).sum()
    }

    /// Zero per-stream counters on a full sink reset
    pub fn reset_stream_counters(&mut self) {
        for stage in &mut self.stages {
            stage.reset_stream_counters();
        }
    }

    /// Forward the channel map to the stages that remap channels
    pub fn set_channel_map(&mut self, map: Option<Vec<usize>>) {
        for stage in &mut self.stages {
            stage.set_channel_map(map.clone());
        }
    }

    /// Forward trim frame counts to the stages that trim
    pub fn set_trim_frames(&mut self, start: u32, end: u32) {
        for stage in &mut self.stages {
            stage.set_trim_frames(start, end);
        }
    }

    /// Forward the device output rate to the stages that resample to it
    pub fn set_output_rate(&mut self, rate: u32) {
        for stage in &mut self.stages {
            stage.set_output_rate(rate);
        }
    }

    /// Move data (and end-of-stream) down the chain: intermediate stage
    /// outputs are always consumed in full, only the last stage's output is
    /// subject to the caller's backpressure.
    fn work(&mut self) {
        for w in 0..self.active.len().saturating_sub(1) {
            let src_idx = self.active[w];
            let dst_idx = self.active[w + 1];
            let (left, right) = self.stages.split_at_mut(dst_idx);
            let src = &mut left[src_idx];
            let dst = &mut right[0];

            let out = src.output();
            if out.has_remaining() {
                let count = out.remaining().len();
                dst.queue_input(out.remaining());
                out.consume(count);
            }
            if src.is_ended() && !dst.input_ended() {
                dst.queue_end_of_stream();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_buffer_partial_consume() {
        let mut buf = FrameBuffer::new();
        buf.push(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buf.remaining(), &[1.0, 2.0, 3.0, 4.0]);

        buf.consume(2);
        assert_eq!(buf.remaining(), &[3.0, 4.0]);

        buf.push(&[5.0]);
        assert_eq!(buf.remaining(), &[3.0, 4.0, 5.0]);

        buf.consume(3);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_frame_buffer_compacts_when_drained() {
        let mut buf = FrameBuffer::new();
        buf.push(&[1.0, 2.0]);
        buf.consume(2);
        // Internal storage is reclaimed once fully consumed
        buf.push(&[3.0]);
        assert_eq!(buf.remaining(), &[3.0]);
    }
}
