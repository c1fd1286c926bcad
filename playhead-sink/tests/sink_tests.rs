//! Device writer integration tests
//!
//! Exercises the sink against scripted devices: the steady PCM feed
//! scenario, backpressure retries, discontinuity resynchronization,
//! reconfiguration with and without device reuse, speed-change checkpoints,
//! flush idempotence, stalled-device recovery, passthrough writes and the
//! error taxonomy.

mod helpers;

use helpers::{f32_bytes, CollectingListener, FakeClock, FakeDeviceHandle, FakeProvider};
use playhead_common::{time, AudioFormat, Codec, Encoding, PlaybackParams, SinkTuning};
use playhead_sink::events::SinkEvent;
use playhead_sink::sink::{CapabilityProber, ModeSupport, StreamFormat};
use playhead_sink::{AudioSink, SinkError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RATE: u32 = 44100;
const CHANNELS: u16 = 2;
const CHUNK_FRAMES: usize = 4096;

struct Fixture {
    sink: AudioSink,
    clock: FakeClock,
    opened: Arc<Mutex<Vec<FakeDeviceHandle>>>,
    listener: CollectingListener,
}

fn fixture() -> Fixture {
    let clock = FakeClock::new();
    let (provider, opened) = FakeProvider::new();
    let mut sink = AudioSink::builder(Box::new(provider))
        .clock(Arc::new(clock.clone()))
        .tuning(SinkTuning::default())
        .build();
    let listener = CollectingListener::new();
    sink.set_listener(Box::new(listener.clone()));
    Fixture {
        sink,
        clock,
        opened,
        listener,
    }
}

fn pcm_format() -> StreamFormat {
    StreamFormat::new(AudioFormat::pcm_f32(RATE, CHANNELS))
}

fn chunk_bytes(frames: usize) -> Vec<u8> {
    let samples: Vec<f32> = (0..frames * CHANNELS as usize)
        .map(|i| ((i % 100) as f32 / 100.0) * 0.5)
        .collect();
    f32_bytes(&samples)
}

fn device(f: &Fixture, index: usize) -> FakeDeviceHandle {
    f.opened.lock().unwrap()[index].clone()
}

/// Wait for the asynchronous release worker to finish a device teardown
fn wait_released(handle: &FakeDeviceHandle) {
    for _ in 0..200 {
        if handle.with(|d| d.released) {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("device was never released");
}

#[test]
fn test_steady_feed_position_converges() {
    let mut f = fixture();
    f.sink.configure(pcm_format(), None, None).unwrap();
    f.sink.play();

    let chunk = chunk_bytes(CHUNK_FRAMES);
    let mut last_position = 0i64;
    for k in 0..10u64 {
        let pts = time::frames_to_duration_us(CHUNK_FRAMES as u64 * k, RATE);
        assert!(f.sink.handle_buffer(&chunk, pts, 0).unwrap());

        let handle = device(&f, 0);
        // Simulate real-time playout, keeping the device half a chunk behind
        let played = handle.with(|d| d.written_frames()).saturating_sub(2048);
        handle.set_raw_position(played as u32);
        f.clock
            .advance_us(time::frames_to_duration_us(CHUNK_FRAMES as u64, RATE));

        let position = f.sink.current_position_us(false).unwrap();
        assert!(
            position >= last_position,
            "position regressed: {position} < {last_position}"
        );
        last_position = position;
    }

    // Let the device catch up completely
    let handle = device(&f, 0);
    let total = handle.with(|d| d.written_frames());
    assert_eq!(total, CHUNK_FRAMES as u64 * 10);
    handle.set_raw_position(total as u32);
    f.clock.advance_ms(10);

    let final_position = f.sink.current_position_us(false).unwrap();
    let expected = time::frames_to_duration_us(total, RATE);
    assert!(
        (final_position - expected).abs() < 50_000,
        "final position {final_position} not near {expected}"
    );
}

#[test]
fn test_backpressure_retries_same_chunk() {
    let mut f = fixture();
    f.sink.configure(pcm_format(), None, None).unwrap();
    f.sink.play();

    let chunk = chunk_bytes(CHUNK_FRAMES);
    assert!(f.sink.handle_buffer(&chunk, 0, 0).unwrap());
    let handle = device(&f, 0);

    handle.with(|d| d.max_write = 1000);
    let pts = time::frames_to_duration_us(CHUNK_FRAMES as u64, RATE);
    let mut attempts = 0;
    while !f.sink.handle_buffer(&chunk, pts, 0).unwrap() {
        attempts += 1;
        assert!(attempts < 20, "backpressure never resolved");
    }
    assert!(attempts >= 5, "expected several partial writes");

    // Every sample of both chunks arrived, in order
    let written = handle.with(|d| d.pcm_written.len());
    assert_eq!(written, CHUNK_FRAMES * CHANNELS as usize * 2);
}

#[test]
fn test_presentation_time_jump_resynchronizes() {
    let mut f = fixture();
    f.sink.configure(pcm_format(), None, None).unwrap();
    f.sink.play();

    let chunk = chunk_bytes(CHUNK_FRAMES);
    assert!(f.sink.handle_buffer(&chunk, 0, 0).unwrap());

    // Next chunk arrives half a second later than expected
    let expected = time::frames_to_duration_us(CHUNK_FRAMES as u64, RATE);
    let jumped = expected + 500_000;
    assert!(f.sink.handle_buffer(&chunk, jumped, 0).unwrap());

    assert!(f
        .listener
        .count_of(|e| matches!(e, SinkEvent::PositionDiscontinuity))
        == 1);

    // Subsequent chunks continuing from the new timeline are not flagged
    let next = jumped + time::frames_to_duration_us(CHUNK_FRAMES as u64, RATE);
    assert!(f.sink.handle_buffer(&chunk, next, 0).unwrap());
    assert!(f
        .listener
        .count_of(|e| matches!(e, SinkEvent::PositionDiscontinuity))
        == 1);
}

#[test]
fn test_incompatible_reconfigure_recreates_device() {
    let mut f = fixture();
    f.sink.configure(pcm_format(), None, None).unwrap();
    f.sink.play();

    let chunk = chunk_bytes(CHUNK_FRAMES);
    assert!(f.sink.handle_buffer(&chunk, 0, 0).unwrap());
    let first = device(&f, 0);

    // Everything written has played out
    first.set_raw_position(CHUNK_FRAMES as u32);
    f.clock
        .advance_us(time::frames_to_duration_us(CHUNK_FRAMES as u64, RATE));

    // New stream at a different rate: the device cannot be reused
    f.sink
        .configure(
            StreamFormat::new(AudioFormat::pcm_f32(48000, CHANNELS)),
            None,
            None,
        )
        .unwrap();

    let chunk48 = chunk_bytes(CHUNK_FRAMES);
    let mut accepted = false;
    for _ in 0..200 {
        if f.sink.handle_buffer(&chunk48, 0, 0).unwrap() {
            accepted = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(accepted, "buffer never accepted after reconfiguration");

    let opened = f.opened.lock().unwrap().len();
    assert_eq!(opened, 2, "expected a second device to be opened");
    assert!(first.with(|d| d.released));
    assert_eq!(device(&f, 1).with(|d| d.sample_rate), 48000);
    assert!(f.listener.count_of(|e| matches!(e, SinkEvent::DeviceReleased)) >= 1);
}

#[test]
fn test_compatible_reconfigure_reuses_device() {
    let mut f = fixture();
    f.sink.configure(pcm_format(), None, None).unwrap();
    f.sink.play();

    let chunk = chunk_bytes(CHUNK_FRAMES);
    assert!(f.sink.handle_buffer(&chunk, 0, 0).unwrap());

    // Same output format again: adopt in place
    f.sink.configure(pcm_format(), None, None).unwrap();
    let pts = time::frames_to_duration_us(CHUNK_FRAMES as u64, RATE);
    assert!(f.sink.handle_buffer(&chunk, pts, 0).unwrap());

    assert_eq!(f.opened.lock().unwrap().len(), 1);
    let handle = device(&f, 0);
    assert_eq!(handle.with(|d| d.stop_calls), 0);
    assert!(!handle.with(|d| d.released));
}

#[test]
fn test_speed_change_checkpoint_maps_media_time() {
    let mut f = fixture();
    f.sink.configure(pcm_format(), None, None).unwrap();
    f.sink.play();

    let frames_100ms = (RATE / 10) as usize; // 4410
    let chunk = chunk_bytes(frames_100ms);

    // One second at normal speed
    for k in 0..10u64 {
        let pts = time::frames_to_duration_us(frames_100ms as u64 * k, RATE);
        assert!(f.sink.handle_buffer(&chunk, pts, 0).unwrap());
        let handle = device(&f, 0);
        let played = handle.with(|d| d.written_frames()).saturating_sub(2205);
        handle.set_raw_position(played as u32);
        f.clock.advance_ms(100);
        let _ = f.sink.current_position_us(false);
    }

    // Double speed from media time 1s
    f.sink.set_playback_parameters(PlaybackParams::new(2.0, 1.0));

    // One more second of media, playing out in half a second
    for k in 10..20u64 {
        let pts = time::frames_to_duration_us(frames_100ms as u64 * k, RATE);
        let mut attempts = 0;
        while !f.sink.handle_buffer(&chunk, pts, 0).unwrap() {
            attempts += 1;
            assert!(attempts < 10);
        }
        let handle = device(&f, 0);
        let played = handle.with(|d| d.written_frames()).saturating_sub(1000);
        handle.set_raw_position(played as u32);
        f.clock.advance_ms(50);
        let _ = f.sink.current_position_us(false);
    }

    f.sink.play_to_end_of_stream().unwrap();

    // Let the simulated playhead reach the end of the written audio
    for _ in 0..10 {
        f.clock.advance_ms(100);
        let _ = f.sink.current_position_us(true);
    }
    let position = f.sink.current_position_us(true).unwrap();

    // Two seconds of media were submitted; the mapping past the checkpoint
    // must use the 2.0 speed, not 1.0 (which would report ~1.5s)
    assert!(
        position > 1_700_000 && position < 2_300_000,
        "media position {position} does not reflect the speed checkpoint"
    );
}

#[test]
fn test_flush_is_idempotent() {
    let mut f = fixture();
    f.sink.configure(pcm_format(), None, None).unwrap();
    f.sink.play();

    let chunk = chunk_bytes(CHUNK_FRAMES);
    assert!(f.sink.handle_buffer(&chunk, 0, 0).unwrap());
    let handle = device(&f, 0);

    f.sink.flush();
    wait_released(&handle);
    assert!(f.sink.current_position_us(false).is_none());

    // A second flush with no intervening writes changes nothing
    f.sink.flush();
    assert!(f.sink.current_position_us(false).is_none());
    assert_eq!(f.opened.lock().unwrap().len(), 1);

    // Pump event dispatch until the single release notification arrives
    for _ in 0..100 {
        f.sink.pause();
        if f
            .listener
            .count_of(|e| matches!(e, SinkEvent::DeviceReleased))
            == 1
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(
        f.listener
            .count_of(|e| matches!(e, SinkEvent::DeviceReleased)),
        1
    );

    // The sink accepts a new stream afterwards
    f.sink.play();
    let mut accepted = false;
    for _ in 0..200 {
        if f.sink.handle_buffer(&chunk, 0, 0).unwrap() {
            accepted = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(accepted);
    assert_eq!(f.opened.lock().unwrap().len(), 2);
}

#[test]
fn test_stalled_device_forces_lossy_flush() {
    let mut f = fixture();
    f.sink.configure(pcm_format(), None, None).unwrap();
    f.sink.play();

    let chunk = chunk_bytes(CHUNK_FRAMES);
    assert!(f.sink.handle_buffer(&chunk, 0, 0).unwrap());
    let handle = device(&f, 0);

    // Establish a nonzero playback position
    handle.set_raw_position(CHUNK_FRAMES as u32);
    f.clock.advance_ms(100);
    let _ = f.sink.current_position_us(false);

    // Counter snaps to zero while playing; the device also stops taking data
    handle.with(|d| {
        d.max_write = 0;
        d.raw_position = 0;
    });

    let pts = time::frames_to_duration_us(CHUNK_FRAMES as u64, RATE);
    assert!(!f.sink.handle_buffer(&chunk, pts, 0).unwrap());

    // Past the stall timeout the sink recovers by flushing; the buffer is
    // reported accepted (lossy recovery)
    f.clock.advance_ms(250);
    assert!(f.sink.handle_buffer(&chunk, pts, 0).unwrap());
    wait_released(&handle);

    // The next buffer opens a fresh device
    let mut accepted = false;
    for _ in 0..200 {
        if f.sink.handle_buffer(&chunk, 0, 0).unwrap() {
            accepted = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(accepted);
    assert_eq!(f.opened.lock().unwrap().len(), 2);
}

/// Prober that plays compressed audio by forwarding it to the device
struct PassthroughProber;

impl CapabilityProber for PassthroughProber {
    fn probe(&self, format: &StreamFormat, _offload_requested: bool) -> ModeSupport {
        if format.audio.encoding.is_pcm() {
            ModeSupport::Pcm {
                preferred_sample_rate: None,
            }
        } else {
            ModeSupport::Passthrough { channels: 2 }
        }
    }
}

fn passthrough_fixture() -> Fixture {
    let clock = FakeClock::new();
    let (provider, opened) = FakeProvider::new();
    let mut sink = AudioSink::builder(Box::new(provider))
        .clock(Arc::new(clock.clone()))
        .prober(Box::new(PassthroughProber))
        .build();
    let listener = CollectingListener::new();
    sink.set_listener(Box::new(listener.clone()));
    Fixture {
        sink,
        clock,
        opened,
        listener,
    }
}

#[test]
fn test_passthrough_forwards_encoded_units() {
    let mut f = passthrough_fixture();
    let format = StreamFormat::new(AudioFormat::new(
        48000,
        6,
        Encoding::Compressed(Codec::Eac3),
    ));
    f.sink.configure(format, None, None).unwrap();
    f.sink.play();

    let unit = vec![0xA5u8; 512];
    assert!(f.sink.handle_buffer(&unit, 0, 1).unwrap());

    let handle = device(&f, 0);
    assert_eq!(handle.with(|d| d.encoded_written.len()), 512);
    // One E-AC-3 access unit of data is now pending
    assert!(f.sink.has_pending_data());
}

#[test]
fn test_dead_device_write_is_recoverable_after_success() {
    let mut f = passthrough_fixture();
    let format = StreamFormat::new(AudioFormat::new(
        48000,
        6,
        Encoding::Compressed(Codec::Eac3),
    ));
    f.sink.configure(format, None, None).unwrap();
    f.sink.play();

    let unit = vec![0xA5u8; 512];
    assert!(f.sink.handle_buffer(&unit, 0, 1).unwrap());

    let handle = device(&f, 0);
    handle.with(|d| {
        d.next_write_error = Some(playhead_sink::device::DeviceError::Disconnected)
    });

    let pts = time::frames_to_duration_us(1536, 48000);
    let result = f.sink.handle_buffer(&unit, pts, 1);
    match result {
        Err(error @ SinkError::Write { .. }) => assert!(error.is_recoverable()),
        other => panic!("expected recoverable write error, got {other:?}"),
    }
    assert!(f
        .listener
        .count_of(|e| matches!(e, SinkEvent::RecoverableError { .. }))
        >= 1);
}

#[test]
fn test_initialization_failures_surface_after_deadline() {
    let clock = FakeClock::new();
    let (provider, _opened) = FakeProvider::new();
    let fails = Arc::clone(&provider.fail_opens);
    *fails.lock().unwrap() = 100;
    let mut sink = AudioSink::builder(Box::new(provider))
        .clock(Arc::new(clock.clone()))
        .build();
    sink.configure(pcm_format(), None, None).unwrap();
    sink.play();

    let chunk = chunk_bytes(CHUNK_FRAMES);
    // First failure starts the retry clock and is swallowed
    assert!(!sink.handle_buffer(&chunk, 0, 0).unwrap());

    // Still failing past the retry deadline: the error surfaces
    clock.advance_ms(150);
    match sink.handle_buffer(&chunk, 0, 0) {
        Err(SinkError::Initialization { .. }) => {}
        other => panic!("expected initialization error, got {other:?}"),
    }
}

#[test]
fn test_underrun_event_reaches_listener() {
    let mut f = fixture();
    f.sink.configure(pcm_format(), None, None).unwrap();
    f.sink.play();

    let chunk = chunk_bytes(CHUNK_FRAMES);
    assert!(f.sink.handle_buffer(&chunk, 0, 0).unwrap());
    // The second feed observes data pending (arming the underrun edge)
    let pts1 = time::frames_to_duration_us(CHUNK_FRAMES as u64, RATE);
    assert!(f.sink.handle_buffer(&chunk, pts1, 0).unwrap());
    let handle = device(&f, 0);

    // Everything written plays out; the next feed notices the empty buffer
    handle.set_raw_position(2 * CHUNK_FRAMES as u32);
    f.clock
        .advance_us(2 * time::frames_to_duration_us(CHUNK_FRAMES as u64, RATE) + 10_000);

    let pts2 = 2 * pts1;
    f.sink.handle_buffer(&chunk, pts2, 0).unwrap();

    assert!(f.listener.count_of(|e| matches!(e, SinkEvent::Underrun { .. })) >= 1);
}
