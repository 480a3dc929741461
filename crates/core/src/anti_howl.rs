//! Anti-howling pre-filter: one-pole high-pass followed by a soft noise gate.
//!
//! Both stages are driven by a single `strength` control in `[0, 1]`. Higher
//! strength lowers the high-pass coefficient (more low-frequency rolloff),
//! raises the gate threshold and deepens the gate attenuation.

/// Per-frame coefficients derived from the strength control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HowlCoefficients {
    pub alpha: f32,
    pub gate_threshold: f32,
    pub gate_floor: f32,
}

impl HowlCoefficients {
    pub fn from_strength(strength: f32) -> Self {
        Self {
            alpha: 0.985 - strength * 0.02,
            gate_threshold: 160.0 + strength * 2200.0,
            gate_floor: 1.0 - strength * 0.92,
        }
    }
}

/// High-pass recursion state carried across frames.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FilterState {
    pub previous_input: f32,
    pub previous_output: f32,
}

/// Anti-howling filter. Owned by the processing thread for one session.
#[derive(Debug, Default)]
pub struct AntiHowl {
    state: FilterState,
}

impl AntiHowl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Filters one sample in PCM16 scale. The recursion state is updated
    /// before gating, so the gate never feeds back into the filter.
    pub fn process(&mut self, sample: f32, coeffs: &HowlCoefficients) -> f32 {
        let filtered =
            coeffs.alpha * (self.state.previous_output + sample - self.state.previous_input);
        self.state.previous_input = sample;
        self.state.previous_output = filtered;

        if filtered.abs() < coeffs.gate_threshold {
            filtered * coeffs.gate_floor
        } else {
            filtered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coefficients_at_extremes() {
        let soft = HowlCoefficients::from_strength(0.0);
        assert!((soft.alpha - 0.985).abs() < 1e-6);
        assert!((soft.gate_threshold - 160.0).abs() < 1e-3);
        assert!((soft.gate_floor - 1.0).abs() < 1e-6);

        let hard = HowlCoefficients::from_strength(1.0);
        assert!((hard.alpha - 0.965).abs() < 1e-6);
        assert!((hard.gate_threshold - 2360.0).abs() < 1e-3);
        assert!((hard.gate_floor - 0.08).abs() < 1e-6);
    }

    #[test]
    fn test_dc_is_removed() {
        let coeffs = HowlCoefficients::from_strength(0.0);
        let mut filter = AntiHowl::new();
        let mut out = 0.0;
        for _ in 0..2000 {
            out = filter.process(10000.0, &coeffs);
        }
        assert!(out.abs() < 1.0, "DC should decay to ~0: got {}", out);
    }

    #[test]
    fn test_state_updates_before_gate() {
        let coeffs = HowlCoefficients::from_strength(1.0);
        let mut filter = AntiHowl::new();
        // Small first sample falls under the gate threshold
        let out = filter.process(100.0, &coeffs);
        let state = filter.state();
        assert_eq!(state.previous_input, 100.0);
        assert!((state.previous_output - 96.5).abs() < 1e-3);
        assert!((out - 96.5 * 0.08).abs() < 1e-3, "gated output: {}", out);
    }

    #[test]
    fn test_loud_transient_passes_gate() {
        let coeffs = HowlCoefficients::from_strength(0.55);
        let mut filter = AntiHowl::new();
        let out = filter.process(20000.0, &coeffs);
        assert!((out - coeffs.alpha * 20000.0).abs() < 1e-2);
    }

    #[test]
    fn test_stable_for_all_strengths() {
        for step in 0..=10 {
            let strength = step as f32 / 10.0;
            let coeffs = HowlCoefficients::from_strength(strength);
            let mut filter = AntiHowl::new();
            let mut peak = 0.0f32;
            for i in 0..20_000 {
                // Worst case: full-scale square wave
                let x = if (i / 7) % 2 == 0 { 32767.0 } else { -32768.0 };
                let y = filter.process(x, &coeffs);
                peak = peak.max(y.abs());
                assert!(y.is_finite());
            }
            assert!(peak < 70_000.0, "strength {} peak {}", strength, peak);
        }
    }
}
