//! Soft limiter and PCM16 output clamp. Always the last stage of the chain.

use crate::constants::{SAMPLE_MAX, SAMPLE_MIN};

/// Ratio applied to the part of a sample above the threshold.
const COMPRESSION_RATIO: f32 = 4.0;

/// Limiter threshold in PCM16 scale. Stronger anti-howling pulls the ceiling
/// down to leave more headroom against runaway feedback.
pub fn limiter_threshold(strength: f32) -> f32 {
    (0.95 - strength * 0.22) * SAMPLE_MAX
}

/// Compresses the excess above `threshold` 4:1, keeping the sign.
pub fn soft_limit(sample: f32, threshold: f32) -> f32 {
    let magnitude = sample.abs();
    if magnitude <= threshold {
        return sample;
    }
    let compressed = threshold + (magnitude - threshold) / COMPRESSION_RATIO;
    if sample >= 0.0 {
        compressed
    } else {
        -compressed
    }
}

/// Converts to PCM16, truncating toward zero and clamping to the format range.
/// NaN maps to silence.
pub fn to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    sample.trunc().clamp(SAMPLE_MIN, SAMPLE_MAX) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_threshold_passes_through() {
        let threshold = limiter_threshold(0.55);
        assert_eq!(soft_limit(1234.5, threshold), 1234.5);
        assert_eq!(soft_limit(-threshold, threshold), -threshold);
    }

    #[test]
    fn test_excess_compressed_four_to_one() {
        assert_eq!(soft_limit(30000.0, 20000.0), 22500.0);
        assert_eq!(soft_limit(-30000.0, 20000.0), -22500.0);
    }

    #[test]
    fn test_threshold_range() {
        assert!((limiter_threshold(0.0) - 0.95 * 32767.0).abs() < 0.01);
        assert!((limiter_threshold(1.0) - 0.73 * 32767.0).abs() < 0.01);
    }

    #[test]
    fn test_clamp_to_pcm16() {
        assert_eq!(to_pcm16(1e9), i16::MAX);
        assert_eq!(to_pcm16(-1e9), i16::MIN);
        assert_eq!(to_pcm16(-0.9), 0);
        assert_eq!(to_pcm16(123.99), 123);
        assert_eq!(to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn test_limiting_is_monotonic_up_to_ten_times_full_scale() {
        for strength in [0.0, 0.55, 1.0] {
            let threshold = limiter_threshold(strength);
            let mut last = i16::MIN;
            for step in -1000..=1000 {
                let x = (step as f32 / 1000.0) * 10.0 * SAMPLE_MAX;
                let out = to_pcm16(soft_limit(x, threshold));
                assert!(out >= last, "limiter must not fold over at {}", x);
                last = out;
            }
            assert_eq!(last, i16::MAX);
            assert_eq!(to_pcm16(soft_limit(-10.0 * SAMPLE_MAX, threshold)), i16::MIN);
        }
    }
}
