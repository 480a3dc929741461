//! Frame-rate automatic gain control.
//!
//! Fast attack (gain drops quickly when the singer gets louder), slow release
//! (gain recovers gently when they get quieter). When disabled the gain glides
//! back to unity instead of snapping, so toggling is inaudible.

pub const MIN_AGC_GAIN: f32 = 0.35;
pub const MAX_AGC_GAIN: f32 = 8.0;

const ATTACK_SMOOTHING: f32 = 0.35;
const RELEASE_SMOOTHING: f32 = 0.08;
const BYPASS_SMOOTHING: f32 = 0.15;
const RMS_EPSILON: f32 = 1e-4;

/// Normalized RMS of a PCM16 frame (full scale = 1.0). Empty frames are silent.
pub fn compute_rms(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = frame
        .iter()
        .map(|&s| {
            let normalized = s as f64 / 32768.0;
            normalized * normalized
        })
        .sum();
    (sum_squares / frame.len() as f64).sqrt() as f32
}

/// Gain the controller is steering toward for a frame of the given RMS.
pub fn desired_gain(target_level: f32, rms: f32) -> f32 {
    (target_level / (rms + RMS_EPSILON)).clamp(MIN_AGC_GAIN, MAX_AGC_GAIN)
}

#[derive(Debug)]
pub struct AutoGain {
    gain: f32,
}

impl Default for AutoGain {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoGain {
    pub fn new() -> Self {
        Self { gain: 1.0 }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Advances the control loop by one frame whose RMS is already known.
    pub fn update_with_rms(&mut self, rms: f32, enabled: bool, target_level: f32) -> f32 {
        if enabled {
            let desired = desired_gain(target_level, rms);
            let smoothing = if desired < self.gain {
                ATTACK_SMOOTHING
            } else {
                RELEASE_SMOOTHING
            };
            self.gain += (desired - self.gain) * smoothing;
        } else {
            self.gain += (1.0 - self.gain) * BYPASS_SMOOTHING;
        }
        self.gain
    }

    /// Advances the control loop by one captured frame.
    pub fn update(&mut self, frame: &[i16], enabled: bool, target_level: f32) -> f32 {
        self.update_with_rms(compute_rms(frame), enabled, target_level)
    }
}
