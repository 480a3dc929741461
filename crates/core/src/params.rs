//! Live-tunable parameters shared between control threads and the DSP thread.
//!
//! Every field is its own atomic cell. A write to one field is immediately
//! visible to the DSP thread, but there is no ordering between fields: the
//! processing loop may observe a new mic gain together with an old reverb mix
//! for one frame. Nothing in the chain depends on cross-field consistency.

use crate::constants::*;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Lock-free f32 cell stored as raw bits.
#[derive(Debug)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// User-facing parameter set. Setters clamp to the documented range, so the
/// stored value is always valid.
#[derive(Debug)]
pub struct LoopbackParams {
    mic_gain: AtomicF32,
    agc_enabled: AtomicBool,
    agc_target_level: AtomicF32,
    anti_howling_enabled: AtomicBool,
    anti_howling_strength: AtomicF32,
    reverb_enabled: AtomicBool,
    reverb_mix: AtomicF32,
}

/// Plain copy of the parameters, taken once per frame by the DSP thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSnapshot {
    pub mic_gain: f32,
    pub agc_enabled: bool,
    pub agc_target_level: f32,
    pub anti_howling_enabled: bool,
    pub anti_howling_strength: f32,
    pub reverb_enabled: bool,
    pub reverb_mix: f32,
}

impl Default for LoopbackParams {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackParams {
    pub fn new() -> Self {
        Self {
            mic_gain: AtomicF32::new(DEFAULT_MIC_GAIN),
            agc_enabled: AtomicBool::new(DEFAULT_AGC_ENABLED),
            agc_target_level: AtomicF32::new(DEFAULT_AGC_TARGET_LEVEL),
            anti_howling_enabled: AtomicBool::new(DEFAULT_ANTI_HOWLING_ENABLED),
            anti_howling_strength: AtomicF32::new(DEFAULT_ANTI_HOWLING_STRENGTH),
            reverb_enabled: AtomicBool::new(DEFAULT_REVERB_ENABLED),
            reverb_mix: AtomicF32::new(DEFAULT_REVERB_MIX),
        }
    }

    pub fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot {
            mic_gain: self.mic_gain(),
            agc_enabled: self.agc_enabled(),
            agc_target_level: self.agc_target_level(),
            anti_howling_enabled: self.anti_howling_enabled(),
            anti_howling_strength: self.anti_howling_strength(),
            reverb_enabled: self.reverb_enabled(),
            reverb_mix: self.reverb_mix(),
        }
    }

    pub fn mic_gain(&self) -> f32 {
        self.mic_gain.load()
    }

    pub fn set_mic_gain(&self, gain: f32) {
        self.mic_gain.store(clamp_or(gain, MIN_MIC_GAIN, MAX_MIC_GAIN));
    }

    pub fn agc_enabled(&self) -> bool {
        self.agc_enabled.load(Ordering::Relaxed)
    }

    pub fn set_agc_enabled(&self, enabled: bool) {
        self.agc_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn agc_target_level(&self) -> f32 {
        self.agc_target_level.load()
    }

    pub fn set_agc_target_level(&self, level: f32) {
        self.agc_target_level
            .store(clamp_or(level, MIN_AGC_TARGET_LEVEL, MAX_AGC_TARGET_LEVEL));
    }

    pub fn anti_howling_enabled(&self) -> bool {
        self.anti_howling_enabled.load(Ordering::Relaxed)
    }

    pub fn set_anti_howling_enabled(&self, enabled: bool) {
        self.anti_howling_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn anti_howling_strength(&self) -> f32 {
        self.anti_howling_strength.load()
    }

    pub fn set_anti_howling_strength(&self, strength: f32) {
        self.anti_howling_strength.store(clamp_or(
            strength,
            MIN_ANTI_HOWLING_STRENGTH,
            MAX_ANTI_HOWLING_STRENGTH,
        ));
    }

    pub fn reverb_enabled(&self) -> bool {
        self.reverb_enabled.load(Ordering::Relaxed)
    }

    pub fn set_reverb_enabled(&self, enabled: bool) {
        self.reverb_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn reverb_mix(&self) -> f32 {
        self.reverb_mix.load()
    }

    pub fn set_reverb_mix(&self, mix: f32) {
        self.reverb_mix.store(clamp_or(mix, MIN_REVERB_MIX, MAX_REVERB_MIX));
    }
}

/// Clamps `value` into `[min, max]`. NaN has no position in the range and
/// maps to `min`.
fn clamp_or(value: f32, min: f32, max: f32) -> f32 {
    if value.is_nan() {
        min
    } else {
        value.clamp(min, max)
    }
}

/// Telemetry published by the DSP thread once per frame.
#[derive(Debug)]
pub struct LoopbackMeters {
    input_rms: AtomicF32,
    agc_gain: AtomicF32,
}

impl Default for LoopbackMeters {
    fn default() -> Self {
        Self {
            input_rms: AtomicF32::new(0.0),
            agc_gain: AtomicF32::new(1.0),
        }
    }
}

impl LoopbackMeters {
    /// Normalized RMS of the last captured frame.
    pub fn input_rms(&self) -> f32 {
        self.input_rms.load()
    }

    /// AGC gain applied to the last frame (before mic gain).
    pub fn agc_gain(&self) -> f32 {
        self.agc_gain.load()
    }

    pub(crate) fn publish(&self, input_rms: f32, agc_gain: f32) {
        self.input_rms.store(input_rms);
        self.agc_gain.store(agc_gain);
    }
}
