//! Shared test fakes: a controllable clock, a scripted output device, a
//! device provider handing out scripted devices, and an event-collecting
//! listener.

#![allow(dead_code)]

use playhead_sink::device::{
    DeviceError, DeviceProvider, DeviceTimestamp, OutputDevice, PlayState, SinkClock, WriteData,
};
use playhead_sink::error::SinkError;
use playhead_sink::events::{SinkEvent, SinkListener};
use playhead_sink::sink::Configuration;
use std::sync::{Arc, Mutex};

/// Manually advanced clock. Starts well away from zero so interval
/// arithmetic behaves like a long-running system.
#[derive(Clone)]
pub struct FakeClock {
    now_us: Arc<Mutex<i64>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now_us: Arc::new(Mutex::new(10_000_000)),
        }
    }

    pub fn advance_us(&self, delta: i64) {
        *self.now_us.lock().unwrap() += delta;
    }

    pub fn advance_ms(&self, delta: i64) {
        self.advance_us(delta * 1000);
    }
}

impl SinkClock for FakeClock {
    fn now_us(&self) -> i64 {
        *self.now_us.lock().unwrap()
    }

    fn wall_time_ms(&self) -> i64 {
        // Wall clock rides along with the monotonic clock in tests
        self.now_us() / 1000 + 1_700_000_000_000
    }
}

/// Scripted state behind a [`FakeDevice`]. Tests keep a [`FakeDeviceHandle`]
/// clone to poke the device while the sink owns it.
pub struct FakeDeviceState {
    pub play_state: PlayState,
    pub sample_rate: u32,
    pub channels: u16,
    /// The wrapping frame counter reads this value
    pub raw_position: u32,
    /// Returned by timestamp queries; None = unavailable
    pub timestamp: Option<DeviceTimestamp>,
    /// Returned by latency queries; None = unsupported
    pub latency_us: Option<i64>,
    /// Per-call cap on accepted samples/bytes (backpressure)
    pub max_write: usize,
    /// Fail the next write with this error
    pub next_write_error: Option<DeviceError>,
    /// Accepted PCM samples
    pub pcm_written: Vec<f32>,
    /// Accepted encoded bytes
    pub encoded_written: Vec<u8>,
    pub play_calls: usize,
    pub pause_calls: usize,
    pub stop_calls: usize,
    pub flush_calls: usize,
    pub released: bool,
    pub stream_transitions: usize,
    pub accepts_playback_rate: bool,
    pub volume: f32,
}

impl FakeDeviceState {
    fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            play_state: PlayState::Stopped,
            sample_rate,
            channels,
            raw_position: 0,
            timestamp: None,
            latency_us: None,
            max_write: usize::MAX,
            next_write_error: None,
            pcm_written: Vec::new(),
            encoded_written: Vec::new(),
            play_calls: 0,
            pause_calls: 0,
            stop_calls: 0,
            flush_calls: 0,
            released: false,
            stream_transitions: 0,
            accepts_playback_rate: false,
            volume: 1.0,
        }
    }

    /// Frames of PCM the device has accepted
    pub fn written_frames(&self) -> u64 {
        (self.pcm_written.len() / self.channels as usize) as u64
    }
}

#[derive(Clone)]
pub struct FakeDeviceHandle(pub Arc<Mutex<FakeDeviceState>>);

impl FakeDeviceHandle {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self(Arc::new(Mutex::new(FakeDeviceState::new(
            sample_rate,
            channels,
        ))))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeDeviceState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn set_raw_position(&self, frames: u32) {
        self.with(|d| d.raw_position = frames);
    }

    pub fn set_timestamp(&self, position_frames: u32, system_time_us: i64) {
        self.with(|d| {
            d.timestamp = Some(DeviceTimestamp {
                position_frames,
                system_time_us,
            })
        });
    }

    pub fn clear_timestamp(&self) {
        self.with(|d| d.timestamp = None);
    }

    pub fn device(&self) -> FakeDevice {
        FakeDevice {
            handle: self.clone(),
        }
    }
}

pub struct FakeDevice {
    handle: FakeDeviceHandle,
}

impl OutputDevice for FakeDevice {
    fn play(&mut self) {
        self.handle.with(|d| {
            d.play_state = PlayState::Playing;
            d.play_calls += 1;
        });
    }

    fn pause(&mut self) {
        self.handle.with(|d| {
            d.play_state = PlayState::Paused;
            d.pause_calls += 1;
        });
    }

    fn stop(&mut self) {
        self.handle.with(|d| {
            d.play_state = PlayState::Stopped;
            d.stop_calls += 1;
        });
    }

    fn flush(&mut self) {
        self.handle.with(|d| d.flush_calls += 1);
    }

    fn play_state(&self) -> PlayState {
        self.handle.with(|d| d.play_state)
    }

    fn sample_rate(&self) -> u32 {
        self.handle.with(|d| d.sample_rate)
    }

    fn raw_position(&self) -> u32 {
        self.handle.with(|d| d.raw_position)
    }

    fn timestamp(&mut self) -> Option<DeviceTimestamp> {
        self.handle.with(|d| d.timestamp)
    }

    fn latency_us(&mut self) -> Option<i64> {
        self.handle.with(|d| d.latency_us)
    }

    fn write(&mut self, data: WriteData<'_>, _pts_us: i64) -> Result<usize, DeviceError> {
        self.handle.with(|d| {
            if let Some(error) = d.next_write_error.take() {
                return Err(error);
            }
            let take = data.len().min(d.max_write);
            match data {
                WriteData::Pcm(samples) => d.pcm_written.extend_from_slice(&samples[..take]),
                WriteData::Encoded(bytes) => d.encoded_written.extend_from_slice(&bytes[..take]),
            }
            Ok(take)
        })
    }

    fn set_volume(&mut self, volume: f32) {
        self.handle.with(|d| d.volume = volume);
    }

    fn set_playback_rate(&mut self, _speed: f32, _pitch: f32) -> bool {
        self.handle.with(|d| d.accepts_playback_rate)
    }

    fn notify_stream_transition(&mut self) {
        self.handle.with(|d| {
            d.stream_transitions += 1;
            d.raw_position = 0;
        });
    }

    fn release(&mut self) {
        self.handle.with(|d| d.released = true);
    }
}

/// Provider handing out fake devices and remembering their handles.
pub struct FakeProvider {
    pub opened: Arc<Mutex<Vec<FakeDeviceHandle>>>,
    pub fail_opens: Arc<Mutex<usize>>,
}

impl FakeProvider {
    pub fn new() -> (Self, Arc<Mutex<Vec<FakeDeviceHandle>>>) {
        let opened = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                opened: Arc::clone(&opened),
                fail_opens: Arc::new(Mutex::new(0)),
            },
            opened,
        )
    }
}

impl DeviceProvider for FakeProvider {
    fn open(&mut self, config: &Configuration) -> Result<Box<dyn OutputDevice>, SinkError> {
        {
            let mut fail = self.fail_opens.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(SinkError::Initialization {
                    reason: "scripted open failure".into(),
                    recoverable: false,
                });
            }
        }
        let handle = FakeDeviceHandle::new(
            config.output_format.sample_rate,
            config.output_format.channels,
        );
        let device = handle.device();
        self.opened.lock().unwrap().push(handle);
        Ok(Box::new(device))
    }
}

/// Listener that records every event.
#[derive(Clone)]
pub struct CollectingListener {
    pub events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn take(&self) -> Vec<SinkEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    pub fn count_of(&self, pred: impl Fn(&SinkEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl SinkListener for CollectingListener {
    fn on_event(&mut self, event: &SinkEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Encode interleaved f32 samples as little-endian bytes for handle_buffer
pub fn f32_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}
