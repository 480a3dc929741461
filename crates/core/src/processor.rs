use crate::agc::{compute_rms, AutoGain};
use crate::anti_howl::{AntiHowl, FilterState, HowlCoefficients};
use crate::limiter::{limiter_threshold, soft_limit, to_pcm16};
use crate::params::{LoopbackMeters, ParamSnapshot};
use crate::reverb::Reverb;

/// Per-session DSP state: anti-howling filter, AGC loop and reverb lines.
///
/// Owned exclusively by the processing thread and rebuilt on every start, so
/// a restarted session never hears the previous session's reverb tail.
pub struct LoopbackProcessor {
    anti_howl: AntiHowl,
    agc: AutoGain,
    reverb: Reverb,
}

impl LoopbackProcessor {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            anti_howl: AntiHowl::new(),
            agc: AutoGain::new(),
            reverb: Reverb::new(sample_rate),
        }
    }

    pub fn agc_gain(&self) -> f32 {
        self.agc.gain()
    }

    pub fn filter_state(&self) -> FilterState {
        self.anti_howl.state()
    }

    pub fn reverb(&self) -> &Reverb {
        &self.reverb
    }

    /// Runs one captured frame through the chain:
    /// anti-howling, AGC and mic gain, reverb, limiter, PCM16 clamp.
    ///
    /// `output` must be at least as long as `input`; only the first
    /// `input.len()` samples are written.
    pub fn process_frame(
        &mut self,
        input: &[i16],
        output: &mut [i16],
        params: &ParamSnapshot,
        meters: Option<&LoopbackMeters>,
    ) {
        let rms = compute_rms(input);
        let agc_gain = self
            .agc
            .update_with_rms(rms, params.agc_enabled, params.agc_target_level);
        if let Some(meters) = meters {
            meters.publish(rms, agc_gain);
        }

        let total_gain = agc_gain * params.mic_gain;
        let howl = HowlCoefficients::from_strength(params.anti_howling_strength);
        let threshold = limiter_threshold(params.anti_howling_strength);

        for (out, &raw) in output.iter_mut().zip(input.iter()) {
            let mut sample = raw as f32;

            if params.anti_howling_enabled {
                sample = self.anti_howl.process(sample, &howl);
            }

            sample *= total_gain;

            if params.reverb_enabled {
                sample = self.reverb.process(sample, params.reverb_mix);
            }

            *out = to_pcm16(soft_limit(sample, threshold));
        }
    }
}
