//! Core audio format types
//!
//! Defines the format descriptors used throughout the sink: PCM sample
//! layouts, compressed encodings the device may accept directly, and the
//! combined stream format passed between pipeline stages and the device.

/// PCM sample layout of interleaved audio data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian integer
    I16,
    /// Signed 24-bit little-endian integer, packed (3 bytes per sample)
    I24,
    /// Signed 32-bit little-endian integer
    I32,
    /// 32-bit IEEE float in [-1.0, 1.0]
    F32,
}

impl SampleFormat {
    /// Size of one sample in bytes
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::I16 => 2,
            SampleFormat::I24 => 3,
            SampleFormat::I32 => 4,
            SampleFormat::F32 => 4,
        }
    }
}

/// Compressed encodings that a device may accept in passthrough or offload
/// mode. The sink never decodes these; it forwards whole access units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Ac3,
    Eac3,
    Dts,
    AacLc,
    Mp3,
    Opus,
}

impl Codec {
    /// Number of PCM frames represented by one access unit of this codec.
    ///
    /// Producers hand the sink whole access units, so the fixed per-codec
    /// frame count is sufficient for position accounting.
    pub fn frames_per_unit(&self) -> u32 {
        match self {
            Codec::Ac3 => 1536,
            Codec::Eac3 => 1536,
            Codec::Dts => 512,
            Codec::AacLc => 1024,
            Codec::Mp3 => 1152,
            Codec::Opus => 960,
        }
    }
}

/// Encoding of an audio stream: raw PCM in some sample layout, or a
/// compressed bitstream the device handles itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Pcm(SampleFormat),
    Compressed(Codec),
}

impl Encoding {
    /// Whether this encoding is linear PCM
    pub fn is_pcm(&self) -> bool {
        matches!(self, Encoding::Pcm(_))
    }

    /// Whether this is a high-resolution PCM encoding (24-bit or wider)
    pub fn is_high_resolution_pcm(&self) -> bool {
        matches!(
            self,
            Encoding::Pcm(SampleFormat::I24)
                | Encoding::Pcm(SampleFormat::I32)
                | Encoding::Pcm(SampleFormat::F32)
        )
    }
}

/// Format of an audio stream at one point in the pipeline.
///
/// Mirrors the shape handed from stage to stage: sample rate, channel count
/// and encoding. For PCM encodings `bytes_per_frame` is well defined; for
/// compressed encodings frame size is not meaningful and `None` is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Sample encoding
    pub encoding: Encoding,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, encoding: Encoding) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
        }
    }

    /// Shorthand for an interleaved f32 PCM format
    pub fn pcm_f32(sample_rate: u32, channels: u16) -> Self {
        Self::new(sample_rate, channels, Encoding::Pcm(SampleFormat::F32))
    }

    /// Size of one frame (one sample per channel) in bytes, for PCM formats
    pub fn bytes_per_frame(&self) -> Option<usize> {
        match self.encoding {
            Encoding::Pcm(fmt) => Some(fmt.bytes_per_sample() * self.channels as usize),
            Encoding::Compressed(_) => None,
        }
    }
}

/// Playback speed and pitch factors.
///
/// Values are clamped into [0.1, 8.0] on construction; out-of-range requests
/// are silently constrained rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackParams {
    pub speed: f32,
    pub pitch: f32,
}

/// The minimum allowed playback speed / pitch factor
pub const MIN_SPEED: f32 = 0.1;
/// The maximum allowed playback speed / pitch factor
pub const MAX_SPEED: f32 = 8.0;

impl PlaybackParams {
    pub fn new(speed: f32, pitch: f32) -> Self {
        Self {
            speed: speed.clamp(MIN_SPEED, MAX_SPEED),
            pitch: pitch.clamp(MIN_SPEED, MAX_SPEED),
        }
    }

    /// Whether these parameters leave audio untouched
    pub fn is_unity(&self) -> bool {
        self.speed == 1.0 && self.pitch == 1.0
    }
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_frame_pcm() {
        let fmt = AudioFormat::new(48000, 2, Encoding::Pcm(SampleFormat::I16));
        assert_eq!(fmt.bytes_per_frame(), Some(4));

        let fmt = AudioFormat::pcm_f32(44100, 2);
        assert_eq!(fmt.bytes_per_frame(), Some(8));

        let fmt = AudioFormat::new(44100, 6, Encoding::Pcm(SampleFormat::I24));
        assert_eq!(fmt.bytes_per_frame(), Some(18));
    }

    #[test]
    fn test_bytes_per_frame_compressed_is_none() {
        let fmt = AudioFormat::new(48000, 6, Encoding::Compressed(Codec::Eac3));
        assert_eq!(fmt.bytes_per_frame(), None);
    }

    #[test]
    fn test_playback_params_clamping() {
        let params = PlaybackParams::new(0.01, 100.0);
        assert_eq!(params.speed, MIN_SPEED);
        assert_eq!(params.pitch, MAX_SPEED);

        let params = PlaybackParams::new(1.5, 0.8);
        assert_eq!(params.speed, 1.5);
        assert_eq!(params.pitch, 0.8);
    }

    #[test]
    fn test_unity_params() {
        assert!(PlaybackParams::default().is_unity());
        assert!(!PlaybackParams::new(1.25, 1.0).is_unity());
    }

    #[test]
    fn test_high_resolution_pcm() {
        assert!(!Encoding::Pcm(SampleFormat::I16).is_high_resolution_pcm());
        assert!(Encoding::Pcm(SampleFormat::I24).is_high_resolution_pcm());
        assert!(Encoding::Pcm(SampleFormat::F32).is_high_resolution_pcm());
        assert!(!Encoding::Compressed(Codec::Ac3).is_high_resolution_pcm());
    }
}
