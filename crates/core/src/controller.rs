//! Loopback lifecycle: owns the devices, the platform effects and the
//! dedicated processing thread.

use crate::constants::{frame_len, SAMPLE_RATE};
use crate::device::{
    AudioBackend, CaptureSource, DeviceError, EffectFactory, Interrupt, PlatformEffect, RenderSink,
    StreamSpec,
};
use crate::params::{LoopbackMeters, LoopbackParams};
use crate::processor::LoopbackProcessor;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thread_priority::{set_current_thread_priority, ThreadPriority};

/// Pause after a failed read/write so a dead device cannot spin the thread.
const IO_ERROR_BACKOFF: Duration = Duration::from_millis(5);
/// Log every Nth consecutive I/O failure after the first.
const IO_ERROR_LOG_EVERY: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Terminal. Every later `start()` fails.
    Released,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            4 => LifecycleState::Released,
            _ => LifecycleState::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub sample_rate: u32,
    pub thread_name: String,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            thread_name: "singloop-dsp".to_string(),
        }
    }
}

struct Devices {
    capture: Box<dyn CaptureSource>,
    render: Box<dyn RenderSink>,
}

impl Devices {
    fn halt(&mut self) {
        if let Err(e) = self.capture.stop() {
            warn!("Capture stop failed: {}", e);
        }
        if let Err(e) = self.render.stop() {
            warn!("Render stop failed: {}", e);
        }
    }

    fn close(mut self) {
        self.capture.close();
        self.render.close();
    }
}

struct Session {
    backend: Option<Box<dyn AudioBackend>>,
    /// Halted devices kept between stop and the next start.
    devices: Option<Devices>,
    /// Worker hands the devices back when it exits.
    worker: Option<JoinHandle<Devices>>,
    interrupt: Option<Interrupt>,
}

struct AttachedEffect {
    name: String,
    effect: Box<dyn PlatformEffect>,
}

/// Real-time microphone loopback.
///
/// Parameter setters never block the processing thread: they write atomic
/// cells that the thread samples once per frame. Lifecycle calls are
/// serialized internally, so the controller can be shared behind an `Arc`.
pub struct LoopbackController {
    config: LoopbackConfig,
    params: Arc<LoopbackParams>,
    meters: Arc<LoopbackMeters>,
    running: Arc<AtomicBool>,
    /// Written only with `session` held; readable without it, so the
    /// transient `Starting`/`Stopping` states are observable mid-transition.
    state: AtomicU8,
    session: Mutex<Session>,
    factories: Mutex<Vec<Box<dyn EffectFactory>>>,
    effects: Mutex<Vec<AttachedEffect>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LoopbackController {
    pub fn new(backend: Box<dyn AudioBackend>) -> Self {
        Self::with_config(backend, LoopbackConfig::default())
    }

    pub fn with_config(backend: Box<dyn AudioBackend>, config: LoopbackConfig) -> Self {
        Self {
            config,
            params: Arc::new(LoopbackParams::new()),
            meters: Arc::new(LoopbackMeters::default()),
            running: Arc::new(AtomicBool::new(false)),
            state: AtomicU8::new(LifecycleState::Stopped as u8),
            session: Mutex::new(Session {
                backend: Some(backend),
                devices: None,
                worker: None,
                interrupt: None,
            }),
            factories: Mutex::new(Vec::new()),
            effects: Mutex::new(Vec::new()),
        }
    }

    /// Registers a platform effect (echo canceller, noise suppressor) that is
    /// attached to the capture session on every start.
    pub fn with_effect(self, factory: Box<dyn EffectFactory>) -> Self {
        lock(&self.factories).push(factory);
        self
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    pub fn params(&self) -> Arc<LoopbackParams> {
        self.params.clone()
    }

    pub fn meters(&self) -> Arc<LoopbackMeters> {
        self.meters.clone()
    }

    /// Current lifecycle state. Never blocks on an in-flight start or stop.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts the loopback. Returns `true` if it is running afterwards.
    /// Calling it while already running is a successful no-op.
    pub fn start(&self) -> bool {
        let mut session = lock(&self.session);
        match self.state() {
            LifecycleState::Running => return true,
            LifecycleState::Released => {
                warn!("Loopback already released, refusing to start");
                return false;
            }
            _ => {}
        }
        self.set_state(LifecycleState::Starting);

        let sample_rate = self.config.sample_rate;
        let reported = session
            .backend
            .as_ref()
            .and_then(|b| b.min_buffer_frames(sample_rate));
        let frame_len = frame_len(reported, sample_rate);

        let halted = session.devices.take();
        let mut devices = match halted {
            Some(devices) => devices,
            None => match Self::open_devices(&mut session, sample_rate, frame_len) {
                Ok(devices) => devices,
                Err(e) => {
                    log_start_failure(&e);
                    self.set_state(LifecycleState::Stopped);
                    return false;
                }
            },
        };

        self.attach_effects(devices.capture.session_id());

        if let Err(e) = devices.capture.start().and_then(|_| devices.render.start()) {
            log_start_failure(&e);
            devices.halt();
            devices.close();
            self.release_effects();
            self.set_state(LifecycleState::Stopped);
            return false;
        }

        let interrupt = devices.capture.interrupter();
        if let Some(interrupt) = &interrupt {
            interrupt.clear();
        }

        self.running.store(true, Ordering::Release);
        let worker = ProcessingLoop {
            devices,
            processor: LoopbackProcessor::new(sample_rate),
            params: self.params.clone(),
            meters: self.meters.clone(),
            running: self.running.clone(),
            frame_len,
        };

        match thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                session.worker = Some(handle);
                session.interrupt = interrupt;
                self.set_state(LifecycleState::Running);
                info!(
                    "Loopback started ({} Hz, {} samples per frame)",
                    sample_rate, frame_len
                );
                true
            }
            Err(e) => {
                error!("Failed to spawn processing thread: {}", e);
                self.running.store(false, Ordering::Release);
                self.release_effects();
                self.set_state(LifecycleState::Stopped);
                false
            }
        }
    }

    /// Stops the processing thread and halts the devices without releasing
    /// them. No-op unless running.
    pub fn stop(&self) {
        let mut session = lock(&self.session);
        self.stop_locked(&mut session);
    }

    /// Stops, then releases platform effects and devices. Terminal and
    /// idempotent.
    pub fn release(&self) {
        let mut session = lock(&self.session);
        if self.state() == LifecycleState::Released {
            return;
        }
        self.stop_locked(&mut session);
        self.release_effects();
        if let Some(devices) = session.devices.take() {
            devices.close();
        }
        session.backend = None;
        self.set_state(LifecycleState::Released);
        info!("Loopback resources released");
    }

    fn stop_locked(&self, session: &mut Session) {
        if self.state() != LifecycleState::Running {
            return;
        }
        self.set_state(LifecycleState::Stopping);
        self.running.store(false, Ordering::Release);
        if let Some(interrupt) = session.interrupt.take() {
            interrupt.raise();
        }

        if let Some(worker) = session.worker.take() {
            match worker.join() {
                Ok(mut devices) => {
                    devices.halt();
                    session.devices = Some(devices);
                }
                Err(_) => error!("Processing thread panicked, devices dropped"),
            }
        }
        self.set_state(LifecycleState::Stopped);
        info!("Loopback stopped");
    }

    fn open_devices(
        session: &mut Session,
        sample_rate: u32,
        frame_len: usize,
    ) -> Result<Devices, DeviceError> {
        let backend = session
            .backend
            .as_mut()
            .ok_or_else(|| DeviceError::Unavailable("backend released".into()))?;
        let spec = StreamSpec {
            sample_rate,
            buffer_frames: frame_len * 2,
        };

        let mut capture = backend.open_capture(&spec)?;
        match backend.open_render(&spec) {
            Ok(render) => Ok(Devices { capture, render }),
            Err(e) => {
                capture.close();
                Err(e)
            }
        }
    }

    fn attach_effects(&self, session_id: u32) {
        self.release_effects();
        if session_id == 0 {
            debug!("Capture has no session id, skipping platform effects");
            return;
        }

        let factories = lock(&self.factories);
        let mut effects = lock(&self.effects);
        for factory in factories.iter() {
            if !factory.available() {
                debug!("Platform effect {} unavailable", factory.name());
                continue;
            }
            match factory.create(session_id) {
                Some(effect) => effects.push(AttachedEffect {
                    name: factory.name().to_string(),
                    effect,
                }),
                None => warn!("Platform effect {} could not be created", factory.name()),
            }
        }
        drop(effects);
        self.update_effect_state();
    }

    fn update_effect_state(&self) {
        let enabled = self.params.anti_howling_enabled();
        for attached in lock(&self.effects).iter_mut() {
            if let Err(e) = attached.effect.set_enabled(enabled) {
                warn!("Failed to toggle {}: {:#}", attached.name, e);
            }
        }
    }

    fn release_effects(&self) {
        for mut attached in lock(&self.effects).drain(..) {
            attached.effect.release();
        }
    }

    // ── Parameters ───────────────────────────────────────────────

    pub fn mic_gain(&self) -> f32 {
        self.params.mic_gain()
    }

    pub fn set_mic_gain(&self, gain: f32) {
        self.params.set_mic_gain(gain);
    }

    pub fn is_agc_enabled(&self) -> bool {
        self.params.agc_enabled()
    }

    pub fn set_agc_enabled(&self, enabled: bool) {
        self.params.set_agc_enabled(enabled);
    }

    pub fn agc_target_level(&self) -> f32 {
        self.params.agc_target_level()
    }

    pub fn set_agc_target_level(&self, level: f32) {
        self.params.set_agc_target_level(level);
    }

    pub fn is_anti_howling_enabled(&self) -> bool {
        self.params.anti_howling_enabled()
    }

    /// Also toggles the attached platform effects, best-effort.
    pub fn set_anti_howling_enabled(&self, enabled: bool) {
        self.params.set_anti_howling_enabled(enabled);
        self.update_effect_state();
    }

    pub fn anti_howling_strength(&self) -> f32 {
        self.params.anti_howling_strength()
    }

    pub fn set_anti_howling_strength(&self, strength: f32) {
        self.params.set_anti_howling_strength(strength);
    }

    pub fn is_reverb_enabled(&self) -> bool {
        self.params.reverb_enabled()
    }

    pub fn set_reverb_enabled(&self, enabled: bool) {
        self.params.set_reverb_enabled(enabled);
    }

    pub fn reverb_mix(&self) -> f32 {
        self.params.reverb_mix()
    }

    pub fn set_reverb_mix(&self, mix: f32) {
        self.params.set_reverb_mix(mix);
    }
}

impl Drop for LoopbackController {
    fn drop(&mut self) {
        self.release();
    }
}

fn log_start_failure(err: &DeviceError) {
    match err {
        DeviceError::PermissionDenied(_) => error!("No microphone permission: {}", err),
        _ => error!("Loopback start failed: {}", err),
    }
}

/// Everything the processing thread owns for one session.
struct ProcessingLoop {
    devices: Devices,
    processor: LoopbackProcessor,
    params: Arc<LoopbackParams>,
    meters: Arc<LoopbackMeters>,
    running: Arc<AtomicBool>,
    frame_len: usize,
}

impl ProcessingLoop {
    fn run(mut self) -> Devices {
        if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
            warn!("Could not raise processing thread priority: {:?}", e);
        }

        let mut input = vec![0i16; self.frame_len];
        let mut output = vec![0i16; self.frame_len];
        let mut read_errors = 0u32;
        let mut write_errors = 0u32;

        while self.running.load(Ordering::Acquire) {
            let read = match self.devices.capture.read(&mut input) {
                Ok(n) => {
                    read_errors = 0;
                    n.min(self.frame_len)
                }
                Err(e) => {
                    read_errors += 1;
                    if read_errors == 1 || read_errors % IO_ERROR_LOG_EVERY == 0 {
                        warn!("Capture read failed ({} in a row): {}", read_errors, e);
                    }
                    thread::sleep(IO_ERROR_BACKOFF);
                    continue;
                }
            };
            if read == 0 {
                continue;
            }

            let params = self.params.snapshot();
            self.processor.process_frame(
                &input[..read],
                &mut output[..read],
                &params,
                Some(&self.meters),
            );

            if !self.running.load(Ordering::Acquire) {
                break;
            }
            match self.devices.render.write(&output[..read]) {
                Ok(()) => write_errors = 0,
                Err(e) => {
                    write_errors += 1;
                    if write_errors == 1 || write_errors % IO_ERROR_LOG_EVERY == 0 {
                        warn!("Render write failed ({} in a row): {}", write_errors, e);
                    }
                    thread::sleep(IO_ERROR_BACKOFF);
                }
            }
        }

        debug!("Processing thread exiting");
        self.devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoDevices;

    impl AudioBackend for NoDevices {
        fn min_buffer_frames(&self, _sample_rate: u32) -> Option<usize> {
            None
        }

        fn open_capture(&mut self, _spec: &StreamSpec) -> Result<Box<dyn CaptureSource>, DeviceError> {
            Err(DeviceError::PermissionDenied("microphone".into()))
        }

        fn open_render(&mut self, _spec: &StreamSpec) -> Result<Box<dyn RenderSink>, DeviceError> {
            Err(DeviceError::Unavailable("no speaker".into()))
        }
    }

    #[test]
    fn test_start_fails_without_devices() {
        let controller = LoopbackController::new(Box::new(NoDevices));
        assert!(!controller.start());
        assert!(!controller.is_running());
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_release_is_terminal_and_idempotent() {
        let controller = LoopbackController::new(Box::new(NoDevices));
        controller.release();
        controller.release();
        assert_eq!(controller.state(), LifecycleState::Released);
        assert!(!controller.start());
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let controller = LoopbackController::new(Box::new(NoDevices));
        controller.stop();
        controller.stop();
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_setters_clamp_through_controller() {
        let controller = LoopbackController::new(Box::new(NoDevices));
        controller.set_mic_gain(10.0);
        controller.set_agc_target_level(0.01);
        assert_eq!(controller.mic_gain(), 6.0);
        assert_eq!(controller.agc_target_level(), 0.08);
        assert_eq!(controller.params().mic_gain(), 6.0);
    }

    #[test]
    fn test_controller_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LoopbackController>();
    }
}
