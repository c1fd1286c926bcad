//! Output configuration
//!
//! A [`Configuration`] is the immutable descriptor of one open device: how
//! audio enters the sink, how it leaves to the hardware, and which output
//! mode is in use. A new configuration may be compatible with the currently
//! open device, in which case the device handle is adopted in place;
//! otherwise the sink must stop, flush and reopen.
//!
//! Which mode a given format can play in is decided by the external
//! capability collaborator behind [`CapabilityProber`].

use playhead_common::{time, AudioFormat, Codec, Encoding, SampleFormat};

/// Output mode of the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// The sink decodes/processes and feeds PCM; the device just plays it
    Pcm,
    /// The device decodes the compressed stream itself and paces playback
    Offload,
    /// The compressed stream is forwarded bit-exact to an external receiver
    Passthrough,
}

/// Format of the stream handed to [`configure`], together with the encoder
/// delay/padding trim metadata carried by gapless streams.
///
/// [`configure`]: crate::sink::AudioSink::configure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub audio: AudioFormat,
    /// Frames to trim from the start of the stream
    pub encoder_delay: u32,
    /// Frames to trim from the end of the stream
    pub encoder_padding: u32,
}

impl StreamFormat {
    pub fn new(audio: AudioFormat) -> Self {
        Self {
            audio,
            encoder_delay: 0,
            encoder_padding: 0,
        }
    }
}

/// How the device stack can play a format, as reported by the capability
/// collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSupport {
    /// Not playable at all
    Unsupported,
    /// Playable as PCM fed by the sink; the device may prefer a specific
    /// output rate (the pipeline resamples to it)
    Pcm { preferred_sample_rate: Option<u32> },
    /// Playable by forwarding the compressed stream to the device
    Passthrough { channels: u16 },
    /// Playable by offloading decode to the device
    Offload { gapless: bool },
}

/// External capability query: decides PCM/offload/passthrough for a format.
/// Device enumeration and capability discovery live outside the sink.
pub trait CapabilityProber: Send {
    fn probe(&self, format: &StreamFormat, offload_requested: bool) -> ModeSupport;
}

/// Default prober: everything PCM-capable plays as PCM at its own rate,
/// nothing is offloaded or passed through.
pub struct PcmOnlyProber;

impl CapabilityProber for PcmOnlyProber {
    fn probe(&self, format: &StreamFormat, _offload_requested: bool) -> ModeSupport {
        if format.audio.encoding.is_pcm() {
            ModeSupport::Pcm {
                preferred_sample_rate: None,
            }
        } else {
            ModeSupport::Unsupported
        }
    }
}

/// Device buffer length used when the caller does not specify one
const DEFAULT_BUFFER_DURATION_US: i64 = 250_000;

/// Immutable descriptor of one open device configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// The stream as it enters the sink
    pub input_format: StreamFormat,
    /// How audio is played
    pub output_mode: OutputMode,
    /// The format the device is opened with (post-pipeline for PCM)
    pub output_format: AudioFormat,
    /// Device buffer size in bytes
    pub buffer_size_bytes: usize,
    /// Frames represented by one encoded access unit (encoded modes only)
    pub frames_per_encoded_unit: u32,
    /// Whether the device applies speed/pitch itself
    pub enable_platform_speed: bool,
    /// Whether AV-sync tunneling is in use
    pub tunneling: bool,
}

impl Configuration {
    /// Whether the device opened for `self` can be adopted for `new`
    /// without recreation.
    pub fn can_reuse_device(&self, new: &Configuration) -> bool {
        new.output_mode == self.output_mode
            && new.output_format == self.output_format
            && new.enable_platform_speed == self.enable_platform_speed
            && new.tunneling == self.tunneling
    }

    /// Size of one output frame in bytes (PCM modes)
    pub fn output_frame_bytes(&self) -> usize {
        self.output_format.bytes_per_frame().unwrap_or(1)
    }

    /// Size of one input frame in bytes (PCM modes)
    pub fn input_frame_bytes(&self) -> usize {
        self.input_format.audio.bytes_per_frame().unwrap_or(1)
    }

    /// Convert an output frame count to a duration at the output rate
    pub fn frames_to_duration_us(&self, frames: u64) -> i64 {
        time::frames_to_duration_us(frames, self.output_format.sample_rate)
    }

    /// Convert an input frame count to a duration at the input rate
    pub fn input_frames_to_duration_us(&self, frames: u64) -> i64 {
        time::frames_to_duration_us(frames, self.input_format.audio.sample_rate)
    }

    /// Default device buffer size for a PCM output format
    pub fn default_pcm_buffer_size_bytes(output_format: &AudioFormat) -> usize {
        let frames = time::duration_us_to_frames(
            DEFAULT_BUFFER_DURATION_US,
            output_format.sample_rate,
        );
        frames as usize * output_format.bytes_per_frame().unwrap_or(4)
    }

    /// The per-unit frame count for a compressed codec, or zero for PCM
    pub fn encoded_unit_frames(encoding: &Encoding) -> u32 {
        match encoding {
            Encoding::Compressed(codec) => codec.frames_per_unit(),
            Encoding::Pcm(_) => 0,
        }
    }
}

/// Build the output [`AudioFormat`] for a passthrough/offload configuration:
/// the compressed encoding travels unchanged, channels may be overridden by
/// the receiver.
pub fn compressed_output_format(input: &AudioFormat, channels: Option<u16>) -> AudioFormat {
    AudioFormat {
        channels: channels.unwrap_or(input.channels),
        ..*input
    }
}

/// The sink's PCM interchange format at a given rate and channel count
pub fn pcm_output_format(sample_rate: u32, channels: u16) -> AudioFormat {
    AudioFormat::new(sample_rate, channels, Encoding::Pcm(SampleFormat::F32))
}

/// Convenience: whether a codec can be carried at all
pub fn is_known_codec(encoding: &Encoding) -> bool {
    matches!(
        encoding,
        Encoding::Pcm(_)
            | Encoding::Compressed(
                Codec::Ac3 | Codec::Eac3 | Codec::Dts | Codec::AacLc | Codec::Mp3 | Codec::Opus
            )
    )
}
