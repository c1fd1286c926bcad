//! cpal-backed output device
//!
//! Real PCM playback through the system's audio stack. The sink's
//! non-blocking writes land in a lock-free ring buffer; the cpal stream
//! callback drains it. The callback must never block or allocate, so all
//! coordination is atomics plus one `try_lock` on the consumer handle
//! (a missed lock plays one callback of silence).
//!
//! cpal streams are not `Send`, but devices must be releasable from the
//! background worker; the stream therefore lives on its own thread, owned
//! for the lifetime of the device and commanded over a channel.
//!
//! The device exposes the counters the position machinery expects: a
//! wrapping frame counter advanced only by frames actually played, and a
//! (position, system-time) timestamp latched in the callback using the same
//! clock the tracker compares against.

use crate::device::{
    DeviceError, DeviceProvider, DeviceTimestamp, OutputDevice, PlayState, SinkClock, WriteData,
};
use crate::error::SinkError;
use crate::sink::{Configuration, OutputMode};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// State shared between the control side and the stream callback.
struct Shared {
    /// Wrapping count of frames actually played out
    frames_consumed: AtomicU32,
    /// Whether the callback should drain the ring (vs. play silence)
    playing: AtomicBool,
    /// Latched (position, time) pair; written by the callback
    timestamp: Mutex<Option<(u32, i64)>>,
    /// Output gain, stored as f32 bits
    volume_bits: AtomicU32,
    /// Callback error flag; any stream error surfaces on the next write
    failed: AtomicBool,
}

enum StreamCommand {
    Shutdown,
}

pub struct CpalOutputDevice {
    shared: Arc<Shared>,
    producer: HeapProd<f32>,
    consumer: Arc<Mutex<HeapCons<f32>>>,
    commands: Sender<StreamCommand>,
    stream_thread: Option<JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
    state: PlayState,
}

impl CpalOutputDevice {
    /// Open the default (or named) output device for f32 PCM at the given
    /// format. The ring buffer is sized from the configuration's buffer
    /// size.
    pub fn open(
        device_name: Option<String>,
        sample_rate: u32,
        channels: u16,
        buffer_size_bytes: usize,
        clock: Arc<dyn SinkClock>,
    ) -> Result<Self, SinkError> {
        let capacity_samples = (buffer_size_bytes / std::mem::size_of::<f32>()).max(1024);
        let ring = HeapRb::<f32>::new(capacity_samples);
        let (producer, consumer) = ring.split();
        let consumer = Arc::new(Mutex::new(consumer));

        let shared = Arc::new(Shared {
            frames_consumed: AtomicU32::new(0),
            playing: AtomicBool::new(false),
            timestamp: Mutex::new(None),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            failed: AtomicBool::new(false),
        });

        let (commands, command_rx) = channel::<StreamCommand>();
        let (ready_tx, ready_rx) = channel::<Result<(), String>>();

        let thread_shared = Arc::clone(&shared);
        let thread_consumer = Arc::clone(&consumer);
        let stream_thread = std::thread::Builder::new()
            .name("playhead-cpal".into())
            .spawn(move || {
                run_stream_thread(
                    device_name,
                    sample_rate,
                    channels,
                    thread_shared,
                    thread_consumer,
                    clock,
                    command_rx,
                    ready_tx,
                )
            })
            .map_err(|e| SinkError::Initialization {
                reason: format!("failed to spawn stream thread: {e}"),
                recoverable: false,
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return Err(SinkError::Initialization {
                    reason,
                    recoverable: false,
                })
            }
            Err(_) => {
                return Err(SinkError::Initialization {
                    reason: "stream thread died during initialization".into(),
                    recoverable: false,
                })
            }
        }

        info!(sample_rate, channels, capacity_samples, "cpal output open");
        Ok(Self {
            shared,
            producer,
            consumer,
            commands,
            stream_thread: Some(stream_thread),
            sample_rate,
            channels,
            state: PlayState::Stopped,
        })
    }
}

impl OutputDevice for CpalOutputDevice {
    fn play(&mut self) {
        self.state = PlayState::Playing;
        self.shared.playing.store(true, Ordering::Release);
    }

    fn pause(&mut self) {
        self.state = PlayState::Paused;
        self.shared.playing.store(false, Ordering::Release);
    }

    fn stop(&mut self) {
        // End of stream: buffered audio keeps draining, no more writes.
        self.state = PlayState::Stopped;
    }

    fn flush(&mut self) {
        if let Ok(mut consumer) = self.consumer.lock() {
            consumer.clear();
        }
    }

    fn play_state(&self) -> PlayState {
        self.state
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn raw_position(&self) -> u32 {
        self.shared.frames_consumed.load(Ordering::Acquire)
    }

    fn timestamp(&mut self) -> Option<DeviceTimestamp> {
        let latched = self.shared.timestamp.lock().ok()?;
        latched.map(|(position_frames, system_time_us)| DeviceTimestamp {
            position_frames,
            system_time_us,
        })
    }

    fn latency_us(&mut self) -> Option<i64> {
        // Occupancy of the ring is the buffered (not yet audible) duration.
        let occupied = self.producer.occupied_len() as u64;
        let frames = occupied / self.channels.max(1) as u64;
        Some(playhead_common::time::frames_to_duration_us(
            frames,
            self.sample_rate,
        ))
    }

    fn write(&mut self, data: WriteData<'_>, _pts_us: i64) -> Result<usize, DeviceError> {
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(DeviceError::Disconnected);
        }
        match data {
            WriteData::Pcm(samples) => Ok(self.producer.push_slice(samples)),
            WriteData::Encoded(_) => Err(DeviceError::Unsupported),
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared
            .volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    fn release(&mut self) {
        let _ = self.commands.send(StreamCommand::Shutdown);
        if let Some(handle) = self.stream_thread.take() {
            if handle.join().is_err() {
                warn!("cpal stream thread panicked during release");
            }
        }
    }
}

impl Drop for CpalOutputDevice {
    fn drop(&mut self) {
        if self.stream_thread.is_some() {
            self.release();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_stream_thread(
    device_name: Option<String>,
    sample_rate: u32,
    channels: u16,
    shared: Arc<Shared>,
    consumer: Arc<Mutex<HeapCons<f32>>>,
    clock: Arc<dyn SinkClock>,
    commands: Receiver<StreamCommand>,
    ready: Sender<Result<(), String>>,
) {
    let host = cpal::default_host();

    // Requested device, with fallback to the default output device.
    let device = match &device_name {
        Some(name) => {
            let found = host
                .output_devices()
                .ok()
                .and_then(|mut devices| devices.find(|d| d.name().ok().as_deref() == Some(name)));
            match found {
                Some(device) => device,
                None => {
                    warn!("output device '{name}' not found, falling back to default");
                    match host.default_output_device() {
                        Some(device) => device,
                        None => {
                            let _ = ready.send(Err("no default output device".into()));
                            return;
                        }
                    }
                }
            }
        }
        None => match host.default_output_device() {
            Some(device) => device,
            None => {
                let _ = ready.send(Err("no default output device".into()));
                return;
            }
        },
    };
    let device_label = device.name().unwrap_or_else(|_| "unknown".into());
    debug!(device = device_label.as_str(), "using output device");

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let cb_shared = Arc::clone(&shared);
    let cb_clock = Arc::clone(&clock);
    let err_shared = Arc::clone(&shared);
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            // Audio thread: no blocking, no allocation.
            if !cb_shared.playing.load(Ordering::Acquire) {
                data.fill(0.0);
                return;
            }
            let popped = match consumer.try_lock() {
                Ok(mut consumer) => consumer.pop_slice(data),
                Err(_) => 0,
            };
            data[popped..].fill(0.0);

            let volume = f32::from_bits(cb_shared.volume_bits.load(Ordering::Acquire));
            if volume != 1.0 {
                for sample in &mut data[..popped] {
                    *sample *= volume;
                }
            }

            // Only frames actually played advance the counter; underrun
            // silence does not.
            let frames = (popped / channels as usize) as u32;
            let position = cb_shared
                .frames_consumed
                .load(Ordering::Acquire)
                .wrapping_add(frames);
            cb_shared.frames_consumed.store(position, Ordering::Release);

            if let Ok(mut latched) = cb_shared.timestamp.try_lock() {
                *latched = Some((position, cb_clock.now_us()));
            }
        },
        move |e| {
            error!("cpal stream error: {e}");
            err_shared.failed.store(true, Ordering::Release);
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(format!("failed to build output stream: {e}")));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(format!("failed to start output stream: {e}")));
        return;
    }
    let _ = ready.send(Ok(()));

    // Park until told to shut down; the stream lives as long as this thread.
    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Shutdown => break,
        }
    }
    drop(stream);
}

/// Opens [`CpalOutputDevice`]s for PCM configurations.
pub struct CpalDeviceProvider {
    clock: Arc<dyn SinkClock>,
    device_name: Option<String>,
}

impl CpalDeviceProvider {
    pub fn new(clock: Arc<dyn SinkClock>) -> Self {
        Self {
            clock,
            device_name: None,
        }
    }

    /// Target a specific output device by name instead of the default
    pub fn with_device_name(mut self, name: Option<String>) -> Self {
        self.device_name = name;
        self
    }

    /// The default output device's native sample rate, if a device exists
    pub fn default_output_rate() -> Option<u32> {
        let host = cpal::default_host();
        let device = host.default_output_device()?;
        let config = device.default_output_config().ok()?;
        Some(config.sample_rate().0)
    }
}

impl DeviceProvider for CpalDeviceProvider {
    fn open(&mut self, config: &Configuration) -> Result<Box<dyn OutputDevice>, SinkError> {
        if config.output_mode != OutputMode::Pcm {
            return Err(SinkError::Initialization {
                reason: format!("cpal backend cannot open {:?} devices", config.output_mode),
                recoverable: false,
            });
        }
        let device = CpalOutputDevice::open(
            self.device_name.clone(),
            config.output_format.sample_rate,
            config.output_format.channels,
            config.buffer_size_bytes,
            Arc::clone(&self.clock),
        )?;
        Ok(Box::new(device))
    }
}
