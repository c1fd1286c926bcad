//! Output device abstraction
//!
//! The sink reaches hardware exclusively through [`OutputDevice`], a narrow
//! procedural interface mirroring what real audio stacks expose: transport
//! control, a cheap wrapping frame counter, an intermittent high-precision
//! timestamp, an occasional latency estimate, and a non-blocking write.
//! Everything above this trait is hardware-independent and is tested against
//! scripted fakes; [`cpal_output`] provides the real PCM backend.
//!
//! All methods must return in microseconds-scale time. In particular
//! [`OutputDevice::write`] must never block: it accepts what fits in the
//! device buffer and returns how much it took. The one blocking operation,
//! [`OutputDevice::release`], is only ever invoked from the release pool
//! worker thread.

pub mod cpal_output;

use crate::error::SinkError;
use crate::sink::Configuration;
use std::time::Instant;
use thiserror::Error;

/// Transport state of an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    /// Created or stopped; the counter does not advance
    Stopped,
    /// Paused; buffered data is retained
    Paused,
    /// Playing; buffered data drains into the hardware
    Playing,
}

/// A raw hardware timestamp: the device's wrapping frame counter captured
/// together with the system time of the capture.
///
/// Transient: read once per poll and immediately folded into the poller's
/// accumulated position.
#[derive(Debug, Clone, Copy)]
pub struct DeviceTimestamp {
    /// Raw frame position; wraps at 2^32
    pub position_frames: u32,
    /// Monotonic system time at which the position was captured, in
    /// microseconds
    pub system_time_us: i64,
}

/// Data handed to a device write: PCM samples for devices the sink feeds
/// decoded audio, or whole encoded access units for passthrough/offload.
#[derive(Debug, Clone, Copy)]
pub enum WriteData<'a> {
    /// Interleaved f32 samples; write returns the number of samples consumed
    Pcm(&'a [f32]),
    /// Encoded bitstream bytes; write returns the number of bytes consumed
    Encoded(&'a [u8]),
}

impl WriteData<'_> {
    /// Remaining length in the unit the device write accounts in
    /// (samples for PCM, bytes for encoded)
    pub fn len(&self) -> usize {
        match self {
            WriteData::Pcm(s) => s.len(),
            WriteData::Encoded(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors surfaced by device operations.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The underlying device handle died (route loss, hardware removal).
    /// The stream cannot continue on this handle.
    #[error("device handle is dead")]
    Disconnected,

    /// The device does not support the requested operation (for example
    /// encoded writes on a PCM-only backend)
    #[error("operation not supported by device")]
    Unsupported,

    /// Any other device failure
    #[error("device failure: {0}")]
    Failed(String),
}

/// Narrow procedural interface to an open output device.
pub trait OutputDevice: Send {
    /// Start or resume playout.
    fn play(&mut self);

    /// Pause playout, retaining buffered data.
    fn pause(&mut self);

    /// Latch end-of-stream: already-buffered data keeps playing out, no
    /// further writes are expected.
    fn stop(&mut self);

    /// Discard buffered data.
    fn flush(&mut self);

    /// Current transport state.
    fn play_state(&self) -> PlayState;

    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// The device's frame counter: coarse, cheap to read, wraps at 2^32.
    fn raw_position(&self) -> u32;

    /// Attempt to read a high-precision timestamp. Returns None when the
    /// device (or current route) cannot provide one.
    fn timestamp(&mut self) -> Option<DeviceTimestamp>;

    /// Total output latency estimate in microseconds, including audio
    /// sitting in the device buffer, if available. The position tracker
    /// subtracts the buffer duration itself.
    fn latency_us(&mut self) -> Option<i64>;

    /// Non-blocking write. Returns the number of units consumed (samples
    /// for PCM, bytes for encoded); less than `data.len()` is backpressure.
    /// `pts_us` is the presentation time of the first frame in `data`, used
    /// by tunneling devices for AV sync and ignored by others.
    fn write(&mut self, data: WriteData<'_>, pts_us: i64) -> Result<usize, DeviceError>;

    /// Set output gain in [0.0, 1.0].
    fn set_volume(&mut self, _volume: f32) {}

    /// Ask the device to apply speed/pitch itself. Returns whether the
    /// device accepted; a refusal means the sink must adjust audio in
    /// software.
    fn set_playback_rate(&mut self, _speed: f32, _pitch: f32) -> bool {
        false
    }

    /// Notify the device that the stream it is playing transitions to a new
    /// stream on the same handle (seamless offload track change). The raw
    /// frame counter may restart from zero afterwards.
    fn notify_stream_transition(&mut self) {}

    /// Blocking teardown. Only called from the release pool worker.
    fn release(&mut self) {}
}

/// Creates output devices for a configuration. This is the device
/// (re)creation seam: the sink calls it lazily on first write after a
/// configuration and again after an incompatible reconfiguration.
pub trait DeviceProvider: Send {
    fn open(&mut self, config: &Configuration) -> Result<Box<dyn OutputDevice>, SinkError>;
}

/// Injectable time source for the position machinery.
///
/// `now_us` must be monotonic and is the basis of every interval in the
/// sink; `wall_time_ms` is only used to report the wall-clock playout start
/// time to listeners.
pub trait SinkClock: Send + Sync {
    /// Monotonic time in microseconds
    fn now_us(&self) -> i64;

    /// Wall-clock time in milliseconds since the Unix epoch
    fn wall_time_ms(&self) -> i64;

    /// Monotonic time in milliseconds
    fn now_ms(&self) -> i64 {
        self.now_us() / 1000
    }
}

/// Default clock backed by [`std::time::Instant`].
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkClock for MonotonicClock {
    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    fn wall_time_ms(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}
