//! Position tracker tests
//!
//! Drives the tracker with a scripted device and clock: counter-mode
//! smoothing, timestamp-mode extrapolation and sanity checks, latency
//! clamping, underrun edges, end-of-stream simulation, pause semantics and
//! the stuck-counter workaround.

mod helpers;

use helpers::{FakeClock, FakeDevice, FakeDeviceHandle};
use playhead_common::{time, Encoding, SampleFormat, SinkTuning};
use playhead_sink::clock::{PositionEvent, PositionTracker};
use playhead_sink::device::{PlayState, SinkClock};
use playhead_sink::events::SpuriousTimestampKind;
use std::sync::Arc;

const RATE: u32 = 44100;
/// 1024 frames of f32 stereo
const BUFFER_BYTES: usize = 8192;

fn setup() -> (PositionTracker, FakeClock, FakeDeviceHandle, FakeDevice) {
    let clock = FakeClock::new();
    let mut tracker = PositionTracker::new(SinkTuning::default(), Arc::new(clock.clone()));
    let handle = FakeDeviceHandle::new(RATE, 2);
    let mut device = handle.device();
    tracker.set_device(
        &mut device,
        false,
        Encoding::Pcm(SampleFormat::F32),
        8,
        BUFFER_BYTES,
    );
    handle.with(|d| d.play_state = PlayState::Playing);
    (tracker, clock, handle, device)
}

#[test]
fn test_counter_mode_tracks_raw_position() {
    let (mut tracker, clock, handle, mut device) = setup();

    handle.set_raw_position(4410); // 100ms played
    let position = tracker.current_position_us(&mut device, false);
    assert_eq!(position, 100_000);

    // Steady playback: counter and clock advance together
    let mut last = position;
    for step in 2..=10 {
        clock.advance_ms(100);
        handle.set_raw_position(4410 * step);
        let position = tracker.current_position_us(&mut device, false);
        assert!(position >= last, "position went backwards: {position} < {last}");
        last = position;
    }
    assert!((last - 1_000_000).abs() < 30_000, "position {last} far from 1s");
}

#[test]
fn test_position_advancing_fires_once() {
    let (mut tracker, clock, handle, mut device) = setup();

    handle.set_raw_position(4410);
    tracker.current_position_us(&mut device, false);
    let advancing: Vec<_> = tracker
        .take_events()
        .into_iter()
        .filter(|e| matches!(e, PositionEvent::PositionAdvancing { .. }))
        .collect();
    assert_eq!(advancing.len(), 1);

    clock.advance_ms(100);
    handle.set_raw_position(8820);
    tracker.current_position_us(&mut device, false);
    assert!(tracker
        .take_events()
        .iter()
        .all(|e| !matches!(e, PositionEvent::PositionAdvancing { .. })));
}

#[test]
fn test_raw_counter_wrap_is_monotonic() {
    let (mut tracker, clock, handle, mut device) = setup();

    handle.set_raw_position(u32::MAX - 4410);
    let before = tracker.current_position_us(&mut device, false);

    clock.advance_ms(200);
    handle.set_raw_position(4410); // wrapped
    let after = tracker.current_position_us(&mut device, false);

    assert!(after > before);
}

#[test]
fn test_latency_subtracted_in_counter_mode() {
    let (mut tracker, clock, handle, mut device) = setup();

    handle.with(|d| d.latency_us = Some(100_000));
    handle.set_raw_position(44100); // 1s played
    clock.advance_ms(1000);

    let buffer_us = time::frames_to_duration_us((BUFFER_BYTES / 8) as u64, RATE);
    let expected_latency = 100_000 - buffer_us;
    let position = tracker.current_position_us(&mut device, false);
    assert_eq!(position, 1_000_000 - expected_latency);

    // With the source ended the latency is not subtracted
    let position_ended = tracker.current_position_us(&mut device, true);
    assert!(position_ended >= position);
}

#[test]
fn test_impossible_latency_reported_and_zeroed() {
    let (mut tracker, _clock, handle, mut device) = setup();

    handle.with(|d| d.latency_us = Some(10_000_000));
    handle.set_raw_position(44100);
    let position = tracker.current_position_us(&mut device, false);

    let events = tracker.take_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, PositionEvent::InvalidLatency { latency_us } if *latency_us > 5_000_000)));
    // Treated as zero: the position is not reduced
    assert_eq!(position, 1_000_000);
}

#[test]
fn test_spurious_timestamp_system_time_mismatch() {
    let (mut tracker, clock, handle, mut device) = setup();

    handle.set_raw_position(44100);
    // Timestamp claims to have been sampled 10s in the future
    handle.set_timestamp(44100, clock.now_us() + 10_000_000);
    tracker.current_position_us(&mut device, false);

    let events = tracker.take_events();
    assert!(events.iter().any(|e| matches!(
        e,
        PositionEvent::SpuriousTimestamp {
            kind: SpuriousTimestampKind::SystemTimeMismatch,
            ..
        }
    )));
}

#[test]
fn test_spurious_timestamp_position_mismatch() {
    let (mut tracker, clock, handle, mut device) = setup();

    handle.set_raw_position(44100);
    // Position claims ~8s while the counter says 1s
    handle.set_timestamp(44100 * 8, clock.now_us());
    tracker.current_position_us(&mut device, false);

    let events = tracker.take_events();
    assert!(events.iter().any(|e| matches!(
        e,
        PositionEvent::SpuriousTimestamp {
            kind: SpuriousTimestampKind::PositionMismatch,
            ..
        }
    )));
}

#[test]
fn test_mode_switch_ramps_without_jump() {
    let (mut tracker, clock, handle, mut device) = setup();

    // Establish counter mode with steady samples
    for step in 1..=5 {
        handle.set_raw_position(4410 * step);
        tracker.current_position_us(&mut device, false);
        clock.advance_ms(100);
    }
    handle.set_raw_position(4410 * 6);
    let counter_position = tracker.current_position_us(&mut device, false);

    // Timestamps claim a position 500ms ahead of the counter
    let delta_frames = 22050u32;
    handle.set_timestamp(4410 * 6 + delta_frames, clock.now_us());
    clock.advance_ms(20);
    tracker.current_position_us(&mut device, false); // poll 1: has timestamp
    clock.advance_ms(20);
    handle.set_timestamp(4410 * 6 + delta_frames + 882, clock.now_us());
    tracker.current_position_us(&mut device, false); // poll 2: advancing

    // First query in timestamp mode: the 500ms disagreement must not appear
    // as a jump
    clock.advance_ms(20);
    let at_switch = tracker.current_position_us(&mut device, false);
    assert!(
        (at_switch - counter_position).abs() < 200_000,
        "position jumped at mode switch: {counter_position} -> {at_switch}"
    );

    // After the smoothing window the timestamp mode value wins
    let mut last = at_switch;
    for _ in 0..12 {
        clock.advance_ms(100);
        let position = tracker.current_position_us(&mut device, false);
        assert!(position >= last);
        last = position;
    }
    let timestamp_position = time::frames_to_duration_us((4410 * 6 + delta_frames + 882) as u64, RATE);
    let elapsed_extrapolation = last - timestamp_position;
    // Position is now the timestamp position plus elapsed time, no residue
    // of the old counter estimate
    assert!(
        (elapsed_extrapolation - 1_240_000).abs() < 50_000,
        "expected pure timestamp extrapolation, got residual {elapsed_extrapolation}"
    );
}

#[test]
fn test_underrun_fires_on_data_exhaustion() {
    let (mut tracker, clock, handle, mut device) = setup();

    let written = 8820u64; // 200ms written
    assert!(tracker.may_handle_buffer(&mut device, written));
    assert!(tracker.take_events().is_empty());

    // Everything written has played out while still playing
    handle.set_raw_position(8820);
    clock.advance_ms(200);
    assert!(tracker.may_handle_buffer(&mut device, written));

    let events = tracker.take_events();
    let underruns: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, PositionEvent::Underrun { .. }))
        .collect();
    assert_eq!(underruns.len(), 1);
    if let PositionEvent::Underrun {
        buffer_size,
        buffer_duration_ms,
    } = underruns[0]
    {
        assert_eq!(*buffer_size, BUFFER_BYTES);
        assert_eq!(*buffer_duration_ms, Some(23));
    }
}

#[test]
fn test_end_of_stream_simulates_playhead_up_to_written() {
    let (mut tracker, clock, handle, mut device) = setup();

    let written = 44100u64;
    handle.set_raw_position(22050);
    clock.advance_ms(500);
    tracker.current_position_us(&mut device, false);

    tracker.handle_end_of_stream(&mut device, written);

    // Two seconds later the simulated playhead has hit the end: no data is
    // pending, and the raw estimate is at least the full written duration
    // (the sink clamps the reported position to the written total).
    clock.advance_ms(2000);
    let position = tracker.current_position_us(&mut device, true);
    assert!(position >= 1_000_000);
    assert!(!tracker.has_pending_data(&mut device, written));
}

#[test]
fn test_pause_before_and_after_end_of_stream() {
    let (mut tracker, _clock, handle, mut device) = setup();

    // Mid-stream: the device must actually pause
    assert!(tracker.pause(&mut device));

    handle.with(|d| d.play_state = PlayState::Playing);
    tracker.handle_end_of_stream(&mut device, 44100);
    // After end of stream playback stops on its own
    assert!(!tracker.pause(&mut device));
}

#[test]
fn test_stalled_counter_detected_after_timeout() {
    let (mut tracker, clock, handle, mut device) = setup();

    handle.set_raw_position(4410);
    tracker.current_position_us(&mut device, false);
    assert!(!tracker.is_stalled(4410));

    // Counter snaps to zero while the device claims to be playing
    clock.advance_ms(10);
    handle.set_raw_position(0);
    let held = tracker.current_position_us(&mut device, false);
    // The old position is held while the stall clock runs
    assert!(held >= 0);
    assert!(!tracker.is_stalled(4410));

    clock.advance_ms(250);
    tracker.current_position_us(&mut device, false);
    assert!(tracker.is_stalled(4410));

    // Without written data the workaround never fires
    assert!(!tracker.is_stalled(0));
}

#[test]
fn test_expect_reset_keeps_position_continuous() {
    let (mut tracker, clock, handle, mut device) = setup();

    handle.set_raw_position(44100);
    let before = tracker.current_position_us(&mut device, false);
    assert_eq!(before, 1_000_000);

    // Device handle reused for the next stream: counter restarts
    tracker.expect_raw_position_reset();
    clock.advance_ms(100);
    handle.set_raw_position(4410);
    let after = tracker.current_position_us(&mut device, false);

    // 44100 carried forward + 4410 new
    assert!(after >= 1_000_000);
    assert!((after - 1_100_000).abs() < 30_000);
}
