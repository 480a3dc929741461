//! Reverb built from three parallel damped comb filters.
//!
//! Each line reads its oldest sample, smooths it through a one-pole damping
//! memory, and feeds it back scaled by a fixed coefficient. The averaged line
//! outputs form the wet signal, which is blended with the dry input.

use crate::constants::{
    MAX_REVERB_MIX, MIN_DELAY_SAMPLES, MIN_REVERB_MIX, REVERB_DELAY_SECONDS, REVERB_FEEDBACK,
};

const DAMP_CURRENT: f32 = 0.65;
const DAMP_MEMORY: f32 = 0.35;
/// Make-up gain for the energy the comb bank loses.
const WET_MAKEUP: f32 = 1.1;
/// Mix at or below which the reverb is skipped entirely.
const WET_EPSILON: f32 = 0.001;

/// One feedback delay line with damping.
#[derive(Debug)]
struct CombLine {
    buffer: Vec<f32>,
    cursor: usize,
    feedback: f32,
    damp_memory: f32,
}

impl CombLine {
    fn new(len: usize, feedback: f32) -> Self {
        Self {
            buffer: vec![0.0; len],
            cursor: 0,
            feedback,
            damp_memory: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let delayed = self.buffer[self.cursor];
        let damped = delayed * DAMP_CURRENT + self.damp_memory * DAMP_MEMORY;
        self.damp_memory = damped;
        self.buffer[self.cursor] = input + damped * self.feedback;
        self.cursor += 1;
        if self.cursor == self.buffer.len() {
            self.cursor = 0;
        }
        damped
    }
}

/// Comb-filter bank. Line lengths are fixed at construction.
#[derive(Debug)]
pub struct Reverb {
    lines: [CombLine; 3],
}

impl Reverb {
    pub fn new(sample_rate: u32) -> Self {
        let line = |i: usize| {
            let len = ((sample_rate as f32 * REVERB_DELAY_SECONDS[i]) as usize)
                .max(MIN_DELAY_SAMPLES);
            CombLine::new(len, REVERB_FEEDBACK[i])
        };
        Self {
            lines: [line(0), line(1), line(2)],
        }
    }

    pub fn delay_lengths(&self) -> [usize; 3] {
        [
            self.lines[0].buffer.len(),
            self.lines[1].buffer.len(),
            self.lines[2].buffer.len(),
        ]
    }

    /// Blends `input` with the reverb tail. `wet` is re-clamped here so an
    /// out-of-range value can never destabilize the mix.
    pub fn process(&mut self, input: f32, wet: f32) -> f32 {
        if wet <= WET_EPSILON || wet.is_nan() {
            return input;
        }

        let mut acc = 0.0f32;
        for line in self.lines.iter_mut() {
            acc += line.process(input);
        }
        let wet_signal = acc / self.lines.len() as f32;

        let wet_mix = wet.clamp(MIN_REVERB_MIX, MAX_REVERB_MIX);
        let dry_mix = 1.0 - wet_mix;
        input * dry_mix + wet_signal * wet_mix * WET_MAKEUP
    }
}
