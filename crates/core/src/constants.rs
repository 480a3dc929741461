//! Shared constants for the singloop processing chain.

/// Default session sample rate (44.1kHz)
pub const SAMPLE_RATE: u32 = 44100;

/// Largest representable PCM16 sample as a float
pub const SAMPLE_MAX: f32 = i16::MAX as f32;

/// Smallest representable PCM16 sample as a float
pub const SAMPLE_MIN: f32 = i16::MIN as f32;

// Mic gain range
pub const DEFAULT_MIC_GAIN: f32 = 2.2;
pub const MIN_MIC_GAIN: f32 = 1.0;
pub const MAX_MIC_GAIN: f32 = 6.0;

// AGC
pub const DEFAULT_AGC_ENABLED: bool = true;
pub const DEFAULT_AGC_TARGET_LEVEL: f32 = 0.18;
pub const MIN_AGC_TARGET_LEVEL: f32 = 0.08;
pub const MAX_AGC_TARGET_LEVEL: f32 = 0.45;

// Anti-howling
pub const DEFAULT_ANTI_HOWLING_ENABLED: bool = true;
pub const DEFAULT_ANTI_HOWLING_STRENGTH: f32 = 0.55;
pub const MIN_ANTI_HOWLING_STRENGTH: f32 = 0.0;
pub const MAX_ANTI_HOWLING_STRENGTH: f32 = 1.0;

// Reverb
pub const DEFAULT_REVERB_ENABLED: bool = true;
pub const DEFAULT_REVERB_MIX: f32 = 0.28;
pub const MIN_REVERB_MIX: f32 = 0.0;
pub const MAX_REVERB_MIX: f32 = 0.65;

/// Delay time of each comb line, in seconds
pub const REVERB_DELAY_SECONDS: [f32; 3] = [0.031, 0.043, 0.057];

/// Feedback coefficient of each comb line
pub const REVERB_FEEDBACK: [f32; 3] = [0.58, 0.52, 0.47];

/// Shortest allowed comb line, in samples
pub const MIN_DELAY_SAMPLES: usize = 64;

/// Resolves the per-iteration frame length from the platform-reported
/// minimum buffer size, falling back to 100ms of audio when the report is
/// missing or zero.
pub fn frame_len(reported: Option<usize>, sample_rate: u32) -> usize {
    match reported {
        Some(len) if len > 0 => len,
        _ => {
            let fallback = (sample_rate as usize / 10).max(1);
            log::warn!(
                "Invalid minimum buffer size {:?}, falling back to {} samples",
                reported,
                fallback
            );
            fallback
        }
    }
}
