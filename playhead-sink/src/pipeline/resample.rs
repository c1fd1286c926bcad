//! Sample-rate conversion stage
//!
//! Converts the stream to the device's output rate using rubato. Inactive
//! when the input already matches the target rate. Input is buffered into
//! fixed-size chunks for the resampler; the partial tail is flushed at end
//! of stream.

use crate::error::{Result, SinkError};
use crate::pipeline::{AudioProcessor, FrameBuffer};
use playhead_common::AudioFormat;
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Frames handed to rubato per processing call
const CHUNK_FRAMES: usize = 1024;

pub struct ResampleProcessor {
    target_rate: u32,
    staged_input_rate: u32,
    staged_channels: usize,
    input_rate: u32,
    channels: usize,
    resampler: Option<FastFixedIn<f32>>,
    /// Buffered planar input awaiting a full chunk
    pending: Vec<Vec<f32>>,
    out: FrameBuffer,
    input_ended: bool,
}

impl ResampleProcessor {
    /// Create a resampling stage targeting the given output rate
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            staged_input_rate: 0,
            staged_channels: 0,
            input_rate: 0,
            channels: 0,
            resampler: None,
            pending: Vec::new(),
            out: FrameBuffer::new(),
            input_ended: false,
        }
    }

    fn create_resampler(
        target_rate: u32,
        input_rate: u32,
        channels: usize,
    ) -> std::result::Result<FastFixedIn<f32>, rubato::ResamplerConstructionError> {
        FastFixedIn::<f32>::new(
            target_rate as f64 / input_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            CHUNK_FRAMES,
            channels,
        )
    }

    fn process_full_chunks(&mut self) {
        while self.pending.first().map_or(false, |ch| ch.len() >= CHUNK_FRAMES) {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..CHUNK_FRAMES).collect())
                .collect();
            if let Some(resampler) = self.resampler.as_mut() {
                match resampler.process(&chunk, None) {
                    Ok(planar) => self.out.push(&interleave(&planar)),
                    Err(e) => debug!("resampler process failed: {e}"),
                }
            }
        }
    }

    fn drain_tail(&mut self) {
        let tail_len = self.pending.first().map_or(0, |ch| ch.len());
        if tail_len == 0 {
            return;
        }
        let chunk: Vec<Vec<f32>> = self.pending.iter_mut().map(std::mem::take).collect();
        if let Some(resampler) = self.resampler.as_mut() {
            match resampler.process_partial(Some(&chunk), None) {
                Ok(planar) => self.out.push(&interleave(&planar)),
                Err(e) => debug!("resampler tail flush failed: {e}"),
            }
        }
    }
}

impl AudioProcessor for ResampleProcessor {
    fn configure(&mut self, input: &AudioFormat) -> Result<Option<AudioFormat>> {
        self.staged_input_rate = input.sample_rate;
        self.staged_channels = input.channels as usize;
        if input.sample_rate == self.target_rate {
            return Ok(None);
        }
        // Validate the ratio up front; the working instance is built on flush
        Self::create_resampler(self.target_rate, input.sample_rate, input.channels as usize)
            .map_err(|e| SinkError::Configuration {
                format: *input,
                reason: format!(
                    "cannot resample {} -> {} Hz: {}",
                    input.sample_rate, self.target_rate, e
                ),
            })?;
        debug!(
            from = input.sample_rate,
            to = self.target_rate,
            "resampling active"
        );
        Ok(Some(AudioFormat {
            sample_rate: self.target_rate,
            ..*input
        }))
    }

    fn queue_input(&mut self, samples: &[f32]) {
        if self.pending.len() != self.channels {
            self.pending = vec![Vec::new(); self.channels];
        }
        for frame in samples.chunks_exact(self.channels) {
            for (ch, &sample) in frame.iter().enumerate() {
                self.pending[ch].push(sample);
            }
        }
        self.process_full_chunks();
    }

    fn queue_end_of_stream(&mut self) {
        self.input_ended = true;
        self.process_full_chunks();
        self.drain_tail();
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
        self.pending.clear();
        self.input_ended = false;
        self.input_rate = self.staged_input_rate;
        self.channels = self.staged_channels;
        // Fresh instance: resampler history must not leak across a flush
        self.resampler = if self.input_rate != 0 && self.input_rate != self.target_rate {
            Self::create_resampler(self.target_rate, self.input_rate, self.channels).ok()
        } else {
            None
        };
    }

    fn reset(&mut self) {
        self.flush();
        self.resampler = None;
        self.input_rate = 0;
        self.staged_input_rate = 0;
    }

    fn is_active(&self) -> bool {
        self.input_rate != 0 && self.input_rate != self.target_rate
    }

    fn set_output_rate(&mut self, rate: u32) {
        self.target_rate = rate;
    }
}

/// Convert planar samples to interleaved format
fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    if planar.is_empty() {
        return Vec::new();
    }
    let channels = planar.len();
    let frames = planar[0].len();
    let mut interleaved = Vec::with_capacity(frames * channels);
    for frame in 0..frames {
        for ch in planar {
            interleaved.push(ch[frame]);
        }
    }
    interleaved
}

#[cfg(test)]
mod tests {
    use super::*;
    use playhead_common::AudioFormat;

    #[test]
    fn test_same_rate_is_inactive() {
        let mut p = ResampleProcessor::new(44100);
        let out = p.configure(&AudioFormat::pcm_f32(44100, 2)).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_output_format_carries_target_rate() {
        let mut p = ResampleProcessor::new(44100);
        let out = p.configure(&AudioFormat::pcm_f32(48000, 2)).unwrap().unwrap();
        assert_eq!(out.sample_rate, 44100);
        assert_eq!(out.channels, 2);
    }

    #[test]
    fn test_downsample_frame_count() {
        let mut p = ResampleProcessor::new(44100);
        p.configure(&AudioFormat::pcm_f32(48000, 2)).unwrap();
        p.flush();

        // 48000 input frames of a 440Hz tone, stereo
        let mut input = Vec::with_capacity(48000 * 2);
        for i in 0..48000 {
            let t = i as f32 / 48000.0;
            let s = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5;
            input.push(s);
            input.push(s);
        }
        p.queue_input(&input);
        p.queue_end_of_stream();

        let produced_frames = p.output().remaining().len() / 2;
        // One second in, close to one second out at the new rate
        let expected = 44100i64;
        assert!((produced_frames as i64 - expected).abs() < 256);
    }

    #[test]
    fn test_interleave_round() {
        let planar = vec![vec![1.0, 3.0], vec![2.0, 4.0]];
        assert_eq!(interleave(&planar), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
