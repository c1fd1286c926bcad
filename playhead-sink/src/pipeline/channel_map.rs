//! Channel remapping stage
//!
//! Reorders, duplicates or drops channels according to an index map from
//! output channel to input channel. Inactive when the map is absent or the
//! identity.

use crate::error::{Result, SinkError};
use crate::pipeline::{AudioProcessor, FrameBuffer};
use playhead_common::AudioFormat;

#[derive(Default)]
pub struct ChannelMapProcessor {
    pending_map: Option<Vec<usize>>,
    map: Option<Vec<usize>>,
    staged_active: bool,
    active: bool,
    staged_input_channels: usize,
    input_channels: usize,
    out: FrameBuffer,
    input_ended: bool,
}

impl ChannelMapProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioProcessor for ChannelMapProcessor {
    fn configure(&mut self, input: &AudioFormat) -> Result<Option<AudioFormat>> {
        self.staged_active = false;
        let map = match &self.pending_map {
            Some(map) => map,
            None => return Ok(None),
        };

        let mut active = input.channels as usize != map.len();
        for (out_index, &in_index) in map.iter().enumerate() {
            if in_index >= input.channels as usize {
                return Err(SinkError::UnhandledFormat(*input));
            }
            active |= in_index != out_index;
        }
        if !active {
            return Ok(None);
        }
        self.staged_active = true;
        self.staged_input_channels = input.channels as usize;
        Ok(Some(AudioFormat {
            channels: map.len() as u16,
            ..*input
        }))
    }

    fn queue_input(&mut self, samples: &[f32]) {
        let map = match &self.map {
            Some(map) => map,
            None => return,
        };
        let mut mapped = Vec::with_capacity(samples.len() / self.input_channels * map.len());
        for frame in samples.chunks_exact(self.input_channels) {
            for &in_index in map {
                mapped.push(frame[in_index]);
            }
        }
        self.out.push(&mapped);
    }

    fn queue_end_of_stream(&mut self) {
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
        self.input_ended = false;
        self.map = self.pending_map.clone();
        self.active = self.staged_active;
        self.input_channels = self.staged_input_channels;
    }

    fn reset(&mut self) {
        self.flush();
        self.map = None;
        self.pending_map = None;
        self.active = false;
        self.staged_active = false;
        self.input_channels = 0;
        self.staged_input_channels = 0;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_channel_map(&mut self, map: Option<Vec<usize>>) {
        self.pending_map = map;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playhead_common::AudioFormat;

    fn configured(map: Vec<usize>, channels: u16) -> ChannelMapProcessor {
        let mut p = ChannelMapProcessor::new();
        p.set_channel_map(Some(map));
        p.configure(&AudioFormat::pcm_f32(44100, channels))
            .unwrap()
            .unwrap();
        p.flush();
        assert!(p.is_active());
        p
    }

    #[test]
    fn test_identity_map_is_inactive() {
        let mut p = ChannelMapProcessor::new();
        p.set_channel_map(Some(vec![0, 1]));
        let out = p.configure(&AudioFormat::pcm_f32(44100, 2)).unwrap();
        assert!(out.is_none());
        p.flush();
        assert!(!p.is_active());
    }

    #[test]
    fn test_swap_channels() {
        let mut p = configured(vec![1, 0], 2);
        p.queue_input(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(p.output().remaining(), &[2.0, 1.0, 4.0, 3.0]);
    }

    #[test]
    fn test_stereo_downmix_to_mono_left() {
        let mut p = configured(vec![0], 2);
        p.queue_input(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(p.output().remaining(), &[1.0, 3.0]);
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mut p = ChannelMapProcessor::new();
        p.set_channel_map(Some(vec![0, 2]));
        assert!(p.configure(&AudioFormat::pcm_f32(44100, 2)).is_err());
    }
}
