//! Time and frame-count conversions
//!
//! All positions in the sink are carried as i64 microseconds or u64 output
//! frames. These helpers convert between the two domains and apply playback
//! speed scaling ("playout duration" is wall-clock time at the device,
//! "media duration" is stream time).

/// Microseconds per second
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Sentinel for an unset time value
pub const TIME_UNSET: i64 = i64::MIN;

/// Convert a frame count at the given sample rate to a duration in microseconds
pub fn frames_to_duration_us(frames: u64, sample_rate: u32) -> i64 {
    ((frames as i128 * MICROS_PER_SECOND as i128) / sample_rate as i128) as i64
}

/// Convert a duration in microseconds to a frame count at the given sample
/// rate, rounding up. The ceiling matters: frame→duration conversion rounds
/// down, and the pair must not lose a frame when composed ("written frames >
/// frames implied by position" is the pending-data predicate).
pub fn duration_us_to_frames(duration_us: i64, sample_rate: u32) -> u64 {
    let numerator = duration_us as i128 * sample_rate as i128;
    let micros = MICROS_PER_SECOND as i128;
    ((numerator + micros - 1) / micros) as u64
}

/// Media duration elapsing while `playout_duration_us` passes at the device,
/// for the given playback speed
pub fn media_duration_for_playout(playout_duration_us: i64, speed: f32) -> i64 {
    if speed == 1.0 {
        return playout_duration_us;
    }
    (playout_duration_us as f64 * speed as f64).round() as i64
}

/// Playout duration needed for `media_duration_us` of stream time to elapse,
/// for the given playback speed
pub fn playout_duration_for_media(media_duration_us: i64, speed: f32) -> i64 {
    if speed == 1.0 {
        return media_duration_us;
    }
    (media_duration_us as f64 / speed as f64).round() as i64
}

/// Convert microseconds to milliseconds (round toward zero)
pub fn us_to_ms(time_us: i64) -> i64 {
    time_us / 1000
}

/// Convert milliseconds to microseconds
pub fn ms_to_us(time_ms: i64) -> i64 {
    time_ms * 1000
}
