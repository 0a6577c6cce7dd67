//! Stateless sample and wire conversions.
//!
//! Everything here is a pure function and safe to call from any thread:
//! the capture thread, the inbound transport task and the sink all share it.
//!
//! Integer scaling is asymmetric in both directions. Negative samples map
//! through `32768`, non-negative samples through `32767`, so `-1.0` lands on
//! `i16::MIN` and `1.0` on `i16::MAX` with no overflow.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{LiveError, Result};

const NEG_SCALE: f32 = 32_768.0;
const POS_SCALE: f32 = 32_767.0;

/// Encode raw bytes into the transport's text-safe representation.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode the transport's text representation back into raw bytes.
///
/// # Errors
/// `LiveError::Decode` when the payload is not valid base64.
pub fn decode_base64(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| LiveError::Decode(format!("base64: {e}")))
}

/// Convert one float sample to i16, clamping to `[-1, 1]` first.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence.
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    let scaled = if s < 0.0 { s * NEG_SCALE } else { s * POS_SCALE };
    scaled.round() as i16
}

/// Inverse of [`f32_to_i16`].
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / NEG_SCALE
    } else {
        sample as f32 / POS_SCALE
    }
}

pub fn f32_to_i16_buffer(samples: &[f32]) -> Vec<i16> {
    samples.iter().copied().map(f32_to_i16).collect()
}

pub fn i16_to_f32_buffer(samples: &[i16]) -> Vec<f32> {
    samples.iter().copied().map(i16_to_f32).collect()
}

/// Pack i16 samples as little-endian bytes (the PCM16 wire layout).
pub fn i16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Unpack little-endian PCM16 bytes.
///
/// # Errors
/// `LiveError::Decode` when the byte count is odd.
pub fn le_bytes_to_i16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(LiveError::Decode(format!(
            "odd PCM16 byte count: {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trips_arbitrary_bytes() {
        let bytes: Vec<u8> = (0..=255u8).chain([0, 0, 255, 1]).collect();
        let text = encode_base64(&bytes);
        assert_eq!(decode_base64(&text).unwrap(), bytes);
        assert_eq!(decode_base64(&encode_base64(&[])).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn invalid_base64_is_decode_error() {
        let err = decode_base64("not base64 !!").unwrap_err();
        assert!(matches!(err, LiveError::Decode(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn extremes_hit_integer_limits() {
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(-1.0), i16::MIN);
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(7.5), i16::MAX);
        assert_eq!(f32_to_i16(-3.0), i16::MIN);
        assert_eq!(f32_to_i16(f32::NAN), 0);
    }

    #[test]
    fn rounds_to_nearest() {
        // 0.5 * 32767 = 16383.5 → rounds away from zero
        assert_eq!(f32_to_i16(0.5), 16_384);
        // -0.25 * 32768 = -8192 exactly
        assert_eq!(f32_to_i16(-0.25), -8_192);
        let just_above = 1.4 / POS_SCALE;
        assert_eq!(f32_to_i16(just_above), 1);
        let just_below = 1.6 / POS_SCALE;
        assert_eq!(f32_to_i16(just_below), 2);
    }

    #[test]
    fn float_round_trip_error_is_bounded() {
        let steps = 200_000;
        for i in 0..=steps {
            let x = -1.0 + 2.0 * (i as f32 / steps as f32);
            let back = i16_to_f32(f32_to_i16(x));
            assert!(
                (back - x).abs() <= 1.0 / 32_768.0 + f32::EPSILON,
                "x={x} back={back}"
            );
        }
    }

    #[test]
    fn byte_layout_is_little_endian() {
        let bytes = i16_to_le_bytes(&[1, -2, i16::MAX]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF, 0xFF, 0x7F]);
        assert_eq!(le_bytes_to_i16(&bytes).unwrap(), vec![1, -2, i16::MAX]);
    }

    #[test]
    fn odd_byte_count_is_rejected() {
        let err = le_bytes_to_i16(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, LiveError::Decode(_)));
    }
}
