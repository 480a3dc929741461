//! Scripted in-memory collaborators for driving the controller in tests.

#![allow(dead_code)]

use singloop_core::{
    AudioBackend, CaptureSource, DeviceError, EffectFactory, Interrupt, PlatformEffect, RenderSink,
    StreamSpec,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub enum Step {
    Frame(Vec<i16>),
    Empty,
    Fail,
}

/// Observable side effects of the fake devices.
#[derive(Default)]
pub struct Probe {
    pub captures_opened: usize,
    pub renders_opened: usize,
    pub capture_closed: bool,
    pub render_closed: bool,
    pub capture_running: bool,
    pub render_running: bool,
    pub written: Vec<i16>,
    pub write_sizes: Vec<usize>,
    pub writes_started: usize,
    pub last_spec: Option<StreamSpec>,
}

pub type SharedProbe = Arc<Mutex<Probe>>;

pub struct FakeBackend {
    pub probe: SharedProbe,
    pub script: Arc<Mutex<VecDeque<Step>>>,
    pub min_buffer: Option<usize>,
    pub fail_capture: Option<fn() -> DeviceError>,
    pub fail_render: bool,
    pub idle_timeout: Duration,
    pub write_delay: Duration,
    pub session_id: u32,
}

impl FakeBackend {
    pub fn new(min_buffer: Option<usize>) -> Self {
        Self {
            probe: Arc::new(Mutex::new(Probe::default())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            min_buffer,
            fail_capture: None,
            fail_render: false,
            idle_timeout: Duration::from_millis(5),
            write_delay: Duration::ZERO,
            session_id: 7,
        }
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }
}

impl AudioBackend for FakeBackend {
    fn min_buffer_frames(&self, _sample_rate: u32) -> Option<usize> {
        self.min_buffer
    }

    fn open_capture(&mut self, spec: &StreamSpec) -> Result<Box<dyn CaptureSource>, DeviceError> {
        if let Some(make_err) = self.fail_capture {
            return Err(make_err());
        }
        let mut probe = self.probe.lock().unwrap();
        probe.captures_opened += 1;
        probe.last_spec = Some(*spec);
        Ok(Box::new(FakeCapture {
            probe: self.probe.clone(),
            script: self.script.clone(),
            interrupt: Interrupt::new(),
            idle_timeout: self.idle_timeout,
            session_id: self.session_id,
        }))
    }

    fn open_render(&mut self, _spec: &StreamSpec) -> Result<Box<dyn RenderSink>, DeviceError> {
        if self.fail_render {
            return Err(DeviceError::Unavailable("speaker busy".into()));
        }
        self.probe.lock().unwrap().renders_opened += 1;
        Ok(Box::new(FakeRender {
            probe: self.probe.clone(),
            write_delay: self.write_delay,
        }))
    }
}

pub struct FakeCapture {
    probe: SharedProbe,
    script: Arc<Mutex<VecDeque<Step>>>,
    interrupt: Interrupt,
    idle_timeout: Duration,
    session_id: u32,
}

impl CaptureSource for FakeCapture {
    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.probe.lock().unwrap().capture_running = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError> {
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Frame(frame)) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Some(Step::Empty) => Ok(0),
            Some(Step::Fail) => Err(DeviceError::Io("glitch".into())),
            None => {
                // Idle microphone: block until timeout or interrupt
                let deadline = Instant::now() + self.idle_timeout;
                while Instant::now() < deadline && !self.interrupt.is_raised() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(0)
            }
        }
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.probe.lock().unwrap().capture_running = false;
        Ok(())
    }

    fn close(&mut self) {
        self.probe.lock().unwrap().capture_closed = true;
    }

    fn interrupter(&self) -> Option<Interrupt> {
        Some(self.interrupt.clone())
    }
}

pub struct FakeRender {
    probe: SharedProbe,
    write_delay: Duration,
}

impl RenderSink for FakeRender {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.probe.lock().unwrap().render_running = true;
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        self.probe.lock().unwrap().writes_started += 1;
        if !self.write_delay.is_zero() {
            // Slow speaker: the write cannot be interrupted
            thread::sleep(self.write_delay);
        }
        let mut probe = self.probe.lock().unwrap();
        probe.written.extend_from_slice(samples);
        probe.write_sizes.push(samples.len());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.probe.lock().unwrap().render_running = false;
        Ok(())
    }

    fn close(&mut self) {
        self.probe.lock().unwrap().render_closed = true;
    }
}

/// What happened to the effects a [`RecordingFactory`] created.
#[derive(Default)]
pub struct EffectLog {
    pub created_for: Vec<u32>,
    pub enabled_calls: Vec<bool>,
    pub released: usize,
}

pub struct RecordingFactory {
    pub log: Arc<Mutex<EffectLog>>,
    pub available: bool,
    pub fail_toggle: bool,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(EffectLog::default())),
            available: true,
            fail_toggle: false,
        }
    }
}

impl EffectFactory for RecordingFactory {
    fn name(&self) -> &str {
        "recording"
    }

    fn available(&self) -> bool {
        self.available
    }

    fn create(&self, session_id: u32) -> Option<Box<dyn PlatformEffect>> {
        self.log.lock().unwrap().created_for.push(session_id);
        Some(Box::new(RecordingEffect {
            log: self.log.clone(),
            fail_toggle: self.fail_toggle,
        }))
    }
}

struct RecordingEffect {
    log: Arc<Mutex<EffectLog>>,
    fail_toggle: bool,
}

impl PlatformEffect for RecordingEffect {
    fn set_enabled(&mut self, enabled: bool) -> anyhow::Result<()> {
        self.log.lock().unwrap().enabled_calls.push(enabled);
        if self.fail_toggle {
            anyhow::bail!("effect engine refused");
        }
        Ok(())
    }

    fn release(&mut self) {
        self.log.lock().unwrap().released += 1;
    }
}

pub fn sine(len: usize, freq: f32, sample_rate: f32, amplitude: f32) -> Vec<i16> {
    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate;
            ((2.0 * std::f32::consts::PI * freq * t).sin() * amplitude) as i16
        })
        .collect()
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
