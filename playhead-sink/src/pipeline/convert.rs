//! PCM sample conversion to f32
//!
//! The pipeline entrance: producers hand the sink bytes in whatever PCM
//! layout the decoder produced, and everything downstream works on
//! interleaved f32. Integer samples are scaled into [-1.0, 1.0].

use playhead_common::SampleFormat;
use tracing::warn;

/// Convert little-endian PCM bytes to f32 samples, appending to `out`.
/// Returns the number of samples converted. Trailing bytes that do not form
/// a whole sample are ignored (producers send whole frames).
pub fn pcm_to_f32(format: SampleFormat, bytes: &[u8], out: &mut Vec<f32>) -> usize {
    let sample_size = format.bytes_per_sample();
    let whole = bytes.len() / sample_size * sample_size;
    if whole != bytes.len() {
        warn!(
            len = bytes.len(),
            sample_size, "input chunk is not a whole number of samples; tail dropped"
        );
    }
    let before = out.len();
    match format {
        SampleFormat::I16 => {
            for chunk in bytes[..whole].chunks_exact(2) {
                let v = i16::from_le_bytes([chunk[0], chunk[1]]);
                out.push(v as f32 / 32768.0);
            }
        }
        SampleFormat::I24 => {
            for chunk in bytes[..whole].chunks_exact(3) {
                // Sign-extend the 24-bit value through the top of an i32
                let v = i32::from_le_bytes([0, chunk[0], chunk[1], chunk[2]]) >> 8;
                out.push(v as f32 / 8_388_608.0);
            }
        }
        SampleFormat::I32 => {
            for chunk in bytes[..whole].chunks_exact(4) {
                let v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out.push(v as f32 / 2_147_483_648.0);
            }
        }
        SampleFormat::F32 => {
            for chunk in bytes[..whole].chunks_exact(4) {
                let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Guard against NaN payloads reaching the device
                out.push(if v.is_nan() { 0.0 } else { v });
            }
        }
    }
    out.len() - before
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i16_full_scale() {
        let mut out = Vec::new();
        let bytes = [
            0x00, 0x80, // i16::MIN
            0xFF, 0x7F, // i16::MAX
            0x00, 0x00, // zero
        ];
        let n = pcm_to_f32(SampleFormat::I16, &bytes, &mut out);
        assert_eq!(n, 3);
        assert_eq!(out[0], -1.0);
        assert!((out[1] - 1.0).abs() < 1.0 / 32768.0);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn test_i24_sign_extension() {
        let mut out = Vec::new();
        // -1 as 24-bit little-endian
        let bytes = [0xFF, 0xFF, 0xFF];
        pcm_to_f32(SampleFormat::I24, &bytes, &mut out);
        assert!(out[0] < 0.0);
        assert!(out[0].abs() < 1.0 / 1_000_000.0);
    }

    #[test]
    fn test_i32_half_scale() {
        let mut out = Vec::new();
        let half = (i32::MAX / 2).to_le_bytes();
        pcm_to_f32(SampleFormat::I32, &half, &mut out);
        assert!((out[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_f32_passthrough_and_nan_guard() {
        let mut out = Vec::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0.25f32.to_le_bytes());
        bytes.extend_from_slice(&f32::NAN.to_le_bytes());
        pcm_to_f32(SampleFormat::F32, &bytes, &mut out);
        assert_eq!(out, vec![0.25, 0.0]);
    }

    #[test]
    fn test_partial_sample_tail_dropped() {
        let mut out = Vec::new();
        let bytes = [0x00, 0x00, 0x01]; // one i16 sample plus a stray byte
        let n = pcm_to_f32(SampleFormat::I16, &bytes, &mut out);
        assert_eq!(n, 1);
    }
}
