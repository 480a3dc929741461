//! Desktop stand-ins for platform echo cancellation and noise suppression.
//!
//! Effects attach to a capture session by id, the way platform audio effects
//! attach to a recording session. The controller only ever flips their
//! enabled flags; the audio itself is processed inside the capture path by an
//! [`EffectStage`], in fixed 10ms blocks.

use aec3::voip::VoipAec3;
use nnnoiseless::DenoiseState;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::{HeapCons, HeapRb};
use singloop_core::limiter::to_pcm16;
use singloop_core::{EffectFactory, PlatformEffect};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Rate both effect engines are built for.
pub const EFFECT_SAMPLE_RATE: u32 = 48000;

/// Samples per effect block (10ms at 48kHz), the RNNoise frame size.
pub const BLOCK_SIZE: usize = 480;

const PCM_SCALE: f32 = 32768.0;

/// Capacity for the rings feeding an [`EffectStage`]. Never smaller than a
/// few blocks, however small the device buffer is, so `pump` always sees a
/// whole block eventually.
pub fn ring_capacity(buffer_frames: usize) -> usize {
    (buffer_frames * 2).max(BLOCK_SIZE * 4)
}

/// Builds the WebRTC AEC3 engine at the effect rate, mono in and out.
pub fn echo_canceller() -> Option<VoipAec3> {
    VoipAec3::builder(EFFECT_SAMPLE_RATE as usize, 1, 1)
        .build()
        .ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    EchoCanceller,
    NoiseSuppressor,
}

impl EffectKind {
    fn name(self) -> &'static str {
        match self {
            EffectKind::EchoCanceller => "echo-canceller",
            EffectKind::NoiseSuppressor => "noise-suppressor",
        }
    }
}

/// Enabled flags for one capture session, shared between the effect handles
/// (control side) and the capture path (DSP side).
#[derive(Debug, Default)]
pub struct SessionEffects {
    echo_supported: bool,
    noise_supported: bool,
    echo_cancel: AtomicBool,
    noise_suppress: AtomicBool,
}

impl SessionEffects {
    pub fn new(echo_supported: bool, noise_supported: bool) -> Self {
        Self {
            echo_supported,
            noise_supported,
            ..Self::default()
        }
    }

    pub fn supports(&self, kind: EffectKind) -> bool {
        match kind {
            EffectKind::EchoCanceller => self.echo_supported,
            EffectKind::NoiseSuppressor => self.noise_supported,
        }
    }

    pub fn is_enabled(&self, kind: EffectKind) -> bool {
        match kind {
            EffectKind::EchoCanceller => self.echo_cancel.load(Ordering::Relaxed),
            EffectKind::NoiseSuppressor => self.noise_suppress.load(Ordering::Relaxed),
        }
    }

    fn set_enabled(&self, kind: EffectKind, enabled: bool) {
        match kind {
            EffectKind::EchoCanceller => self.echo_cancel.store(enabled, Ordering::Relaxed),
            EffectKind::NoiseSuppressor => self.noise_suppress.store(enabled, Ordering::Relaxed),
        }
    }
}

/// Open capture sessions, keyed by session id.
#[derive(Clone, Default)]
pub struct SessionRegistry(Arc<Mutex<HashMap<u32, Arc<SessionEffects>>>>);

impl SessionRegistry {
    pub fn insert(&self, session_id: u32, effects: Arc<SessionEffects>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, effects);
    }

    pub fn remove(&self, session_id: u32) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
    }

    pub fn get(&self, session_id: u32) -> Option<Arc<SessionEffects>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .cloned()
    }
}

/// Creates effect handles for sessions opened by the cpal backend.
pub struct SessionEffectFactory {
    kind: EffectKind,
    registry: SessionRegistry,
}

impl SessionEffectFactory {
    pub fn new(kind: EffectKind, registry: SessionRegistry) -> Self {
        Self { kind, registry }
    }
}

impl EffectFactory for SessionEffectFactory {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn available(&self) -> bool {
        true
    }

    fn create(&self, session_id: u32) -> Option<Box<dyn PlatformEffect>> {
        let session = self.registry.get(session_id)?;
        if !session.supports(self.kind) {
            return None;
        }
        Some(Box::new(SessionEffectHandle {
            kind: self.kind,
            session,
            released: false,
        }))
    }
}

struct SessionEffectHandle {
    kind: EffectKind,
    session: Arc<SessionEffects>,
    released: bool,
}

impl PlatformEffect for SessionEffectHandle {
    fn set_enabled(&mut self, enabled: bool) -> anyhow::Result<()> {
        anyhow::ensure!(!self.released, "{} already released", self.kind.name());
        self.session.set_enabled(self.kind, enabled);
        log::debug!("{} {}", self.kind.name(), if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    fn release(&mut self) {
        self.session.set_enabled(self.kind, false);
        self.released = true;
    }
}

/// Runs the session's enabled effects over captured audio.
///
/// Bridges arbitrary read sizes to fixed `BLOCK_SIZE` blocks: raw samples are
/// consumed in whole blocks and the results queue up in `pending` until the
/// reader takes them. Every block goes through the stage whether or not an
/// effect is on, so toggling never reorders or drops samples.
pub struct EffectStage {
    session: Arc<SessionEffects>,
    denoise: Box<DenoiseState<'static>>,
    echo: Option<VoipAec3>,
    far_end: Option<HeapCons<f32>>,
    pending: HeapRb<i16>,
    block_raw: [i16; BLOCK_SIZE],
    block: [f32; BLOCK_SIZE],
    block_norm: [f32; BLOCK_SIZE],
    block_ref: [f32; BLOCK_SIZE],
    block_out: [f32; BLOCK_SIZE],
}

// SAFETY: EffectStage owns its effect engines exclusively and is moved, never
// shared, into the processing thread together with its capture source. The
// only cross-thread state is the Arc<SessionEffects> of atomics.
unsafe impl Send for EffectStage {}

impl EffectStage {
    pub fn new(
        session: Arc<SessionEffects>,
        echo: Option<VoipAec3>,
        far_end: Option<HeapCons<f32>>,
        capacity: usize,
    ) -> Self {
        Self {
            session,
            denoise: DenoiseState::new(),
            echo,
            far_end,
            pending: HeapRb::<i16>::new(capacity.max(BLOCK_SIZE * 2)),
            block_raw: [0; BLOCK_SIZE],
            block: [0.0; BLOCK_SIZE],
            block_norm: [0.0; BLOCK_SIZE],
            block_ref: [0.0; BLOCK_SIZE],
            block_out: [0.0; BLOCK_SIZE],
        }
    }

    /// Samples processed and waiting to be read.
    pub fn ready_len(&self) -> usize {
        self.pending.occupied_len()
    }

    /// Processes every whole block available in `raw`. Returns the number of
    /// blocks processed.
    pub fn pump(&mut self, raw: &mut HeapCons<i16>) -> usize {
        let mut blocks = 0;
        while raw.occupied_len() >= BLOCK_SIZE && self.pending.vacant_len() >= BLOCK_SIZE {
            raw.pop_slice(&mut self.block_raw);
            for (dst, &src) in self.block.iter_mut().zip(self.block_raw.iter()) {
                *dst = src as f32;
            }

            self.cancel_echo();

            if self.session.is_enabled(EffectKind::NoiseSuppressor) {
                // RNNoise works on PCM16-scaled floats
                self.denoise.process_frame(&mut self.block_out, &self.block);
                self.block.copy_from_slice(&self.block_out);
            }

            for &sample in self.block.iter() {
                let _ = self.pending.try_push(to_pcm16(sample));
            }
            blocks += 1;
        }
        blocks
    }

    /// Moves processed samples into `out`. Returns how many were written.
    pub fn pop(&mut self, out: &mut [i16]) -> usize {
        self.pending.pop_slice(out)
    }

    /// Drops queued audio so a restarted session starts fresh.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(far_end) = self.far_end.as_mut() {
            far_end.clear();
        }
    }

    fn cancel_echo(&mut self) {
        let Some(far_end) = self.far_end.as_mut() else {
            return;
        };
        // Consume the reference even when disabled so it stays aligned
        if far_end.occupied_len() < BLOCK_SIZE {
            return;
        }
        far_end.pop_slice(&mut self.block_ref);

        if !self.session.is_enabled(EffectKind::EchoCanceller) {
            return;
        }
        let Some(echo) = self.echo.as_mut() else {
            return;
        };
        for (dst, &src) in self.block_norm.iter_mut().zip(self.block.iter()) {
            *dst = src / PCM_SCALE;
        }
        self.block_out.fill(0.0);

        // level_change = false: the loopback never moves the device volume
        if let Err(e) = echo.process(
            &self.block_norm,
            Some(&self.block_ref),
            false,
            &mut self.block_out,
        ) {
            log::warn!("AEC error: {:?}", e);
            return;
        }
        for (dst, &src) in self.block.iter_mut().zip(self.block_out.iter()) {
            *dst = src * PCM_SCALE;
        }
    }
}
