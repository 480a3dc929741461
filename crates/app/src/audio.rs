//! cpal-backed capture source and render sink.
//!
//! `cpal::Stream` is not `Send`, so every stream lives on a small host thread
//! of its own and is driven through a command channel. The handles the
//! controller moves into its processing thread only hold ring buffer ends.

use crate::effects::{
    echo_canceller, ring_capacity, EffectKind, EffectStage, SessionEffectFactory,
    SessionEffects, SessionRegistry, EFFECT_SAMPLE_RATE,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use log::{info, warn};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use singloop_core::constants::SAMPLE_MAX;
use singloop_core::limiter::to_pcm16;
use singloop_core::{
    AudioBackend, CaptureSource, DeviceError, EffectFactory, Interrupt, RenderSink, StreamSpec,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Sleep between ring buffer polls while waiting for audio or space.
const POLL_INTERVAL: Duration = Duration::from_micros(500);
/// Lower bound for read/write waits.
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(20);

/// Looks up an input device by name, or the default one for `"default"`.
fn find_input(host: &cpal::Host, name: &str) -> Result<cpal::Device, DeviceError> {
    if name == "default" {
        host.default_input_device()
            .ok_or_else(|| DeviceError::Unavailable("No default input found".into()))
    } else {
        host.input_devices()
            .map_err(|e| classify("Failed to enumerate input devices", e))?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| DeviceError::Unavailable(format!("Input device not found: {}", name)))
    }
}

/// Looks up an output device by name, or the default one for `"default"`.
fn find_output(host: &cpal::Host, name: &str) -> Result<cpal::Device, DeviceError> {
    if name == "default" {
        host.default_output_device()
            .ok_or_else(|| DeviceError::Unavailable("No default output found".into()))
    } else {
        host.output_devices()
            .map_err(|e| classify("Failed to enumerate output devices", e))?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| DeviceError::Unavailable(format!("Output device not found: {}", name)))
    }
}

/// Maps a cpal error to a device error. cpal has no dedicated permission
/// variant, so access problems are recognized from the backend message.
fn classify(context: &str, err: impl std::fmt::Display) -> DeviceError {
    let message = format!("{}: {}", context, err);
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("access") || lower.contains("denied") {
        DeviceError::PermissionDenied(message)
    } else {
        DeviceError::Unavailable(message)
    }
}

fn stream_config(spec: &StreamSpec) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(spec.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Time covered by `buffer_frames` samples, floored at `MIN_IO_TIMEOUT`.
fn buffer_duration(spec: &StreamSpec) -> Duration {
    let secs = spec.buffer_frames as f64 / spec.sample_rate.max(1) as f64;
    Duration::from_secs_f64(secs).max(MIN_IO_TIMEOUT)
}

type Reply = Sender<Result<(), DeviceError>>;

enum StreamCommand {
    Play(Reply),
    Pause(Reply),
    Close,
}

/// Owns one cpal stream on a dedicated thread.
struct StreamHost {
    commands: Sender<StreamCommand>,
    worker: Option<JoinHandle<()>>,
}

impl StreamHost {
    fn spawn<F>(name: &str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<cpal::Stream, DeviceError> + Send + 'static,
    {
        let (commands, inbox) = crossbeam_channel::unbounded::<StreamCommand>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let worker = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                Self::serve(stream, inbox);
            })
            .map_err(|e| DeviceError::Unavailable(format!("Failed to spawn {}: {}", name, e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(DeviceError::Unavailable(format!("{} exited during setup", name)))
            }
        }
    }

    fn serve(stream: cpal::Stream, inbox: Receiver<StreamCommand>) {
        for command in inbox.iter() {
            match command {
                StreamCommand::Play(reply) => {
                    let _ = reply.send(stream.play().map_err(|e| classify("Failed to start stream", e)));
                }
                StreamCommand::Pause(reply) => {
                    let _ = reply.send(
                        stream
                            .pause()
                            .map_err(|e| DeviceError::Io(format!("Failed to pause stream: {}", e))),
                    );
                }
                StreamCommand::Close => break,
            }
        }
    }

    fn request(&self, command: fn(Reply) -> StreamCommand) -> Result<(), DeviceError> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.commands
            .send(command(reply))
            .map_err(|_| DeviceError::Unavailable("Stream thread is gone".into()))?;
        response
            .recv()
            .map_err(|_| DeviceError::Unavailable("Stream thread is gone".into()))?
    }

    fn play(&self) -> Result<(), DeviceError> {
        self.request(StreamCommand::Play)
    }

    fn pause(&self) -> Result<(), DeviceError> {
        self.request(StreamCommand::Pause)
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(StreamCommand::Close);
            let _ = worker.join();
        }
    }
}

impl Drop for StreamHost {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens cpal streams by device name and hands out session-bound effects.
pub struct CpalBackend {
    input_device: String,
    output_device: String,
    buffer_override: Option<usize>,
    registry: SessionRegistry,
    next_session: u32,
    /// Far-end reference producer, created with a capture and taken by the
    /// render sink opened after it.
    far_end: Option<HeapProd<f32>>,
}

impl CpalBackend {
    pub fn new(input_device: &str, output_device: &str, buffer_override: Option<usize>) -> Self {
        Self {
            input_device: input_device.to_string(),
            output_device: output_device.to_string(),
            buffer_override,
            registry: SessionRegistry::default(),
            next_session: 1,
            far_end: None,
        }
    }

    /// Echo canceller and noise suppressor bound to this backend's sessions.
    pub fn effect_factories(&self) -> Vec<Box<dyn EffectFactory>> {
        vec![
            Box::new(SessionEffectFactory::new(
                EffectKind::EchoCanceller,
                self.registry.clone(),
            )),
            Box::new(SessionEffectFactory::new(
                EffectKind::NoiseSuppressor,
                self.registry.clone(),
            )),
        ]
    }
}

impl AudioBackend for CpalBackend {
    fn min_buffer_frames(&self, _sample_rate: u32) -> Option<usize> {
        if let Some(frames) = self.buffer_override {
            return Some(frames);
        }
        let host = cpal::default_host();
        let device = find_input(&host, &self.input_device).ok()?;
        let config = device.default_input_config().ok()?;
        match config.buffer_size() {
            cpal::SupportedBufferSize::Range { min, .. } => Some(*min as usize),
            cpal::SupportedBufferSize::Unknown => None,
        }
    }

    fn open_capture(&mut self, spec: &StreamSpec) -> Result<Box<dyn CaptureSource>, DeviceError> {
        let capacity = ring_capacity(spec.buffer_frames);
        let (mut raw_prod, raw_cons) = HeapRb::<i16>::new(capacity).split();
        let input_name = self.input_device.clone();
        let config = stream_config(spec);

        let host = StreamHost::spawn("singloop-capture", move || {
            let host = cpal::default_host();
            info!("Audio host: {}", host.id().name());
            let device = find_input(&host, &input_name)?;
            info!(
                "Using input device: {}",
                device.name().unwrap_or_default()
            );
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for &sample in data {
                            let _ = raw_prod.try_push(to_pcm16(sample * SAMPLE_MAX));
                        }
                    },
                    |err| warn!("Input error: {}", err),
                    None,
                )
                .map_err(|e| classify("Failed to open input stream", e))
        })?;

        let effects_supported = spec.sample_rate == EFFECT_SAMPLE_RATE;
        let echo = if effects_supported {
            echo_canceller()
        } else {
            None
        };
        let session = Arc::new(SessionEffects::new(echo.is_some(), effects_supported));
        let session_id = self.next_session;
        self.next_session = self.next_session.wrapping_add(1).max(1);
        self.registry.insert(session_id, session.clone());

        let (far_prod, far_cons) = HeapRb::<f32>::new(capacity).split();
        self.far_end = Some(far_prod);

        Ok(Box::new(CpalCapture {
            host,
            raw: raw_cons,
            stage: EffectStage::new(session, echo, Some(far_cons), capacity),
            interrupt: Interrupt::new(),
            read_timeout: buffer_duration(spec),
            session_id,
            registry: self.registry.clone(),
            closed: false,
        }))
    }

    fn open_render(&mut self, spec: &StreamSpec) -> Result<Box<dyn RenderSink>, DeviceError> {
        let (queue, mut queue_cons) = HeapRb::<i16>::new(ring_capacity(spec.buffer_frames)).split();
        let output_name = self.output_device.clone();
        let config = stream_config(spec);

        let host = StreamHost::spawn("singloop-render", move || {
            let host = cpal::default_host();
            let device = find_output(&host, &output_name)?;
            info!(
                "Using output device: {}",
                device.name().unwrap_or_default()
            );
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for out in data.iter_mut() {
                            *out = queue_cons
                                .try_pop()
                                .map(|s| s as f32 / 32768.0)
                                .unwrap_or(0.0);
                        }
                    },
                    |err| warn!("Output error: {}", err),
                    None,
                )
                .map_err(|e| classify("Failed to open output stream", e))
        })?;

        Ok(Box::new(CpalRender {
            host,
            queue,
            far_end: self.far_end.take(),
            write_timeout: buffer_duration(spec),
            closed: false,
        }))
    }
}

pub struct CpalCapture {
    host: StreamHost,
    raw: HeapCons<i16>,
    stage: EffectStage,
    interrupt: Interrupt,
    read_timeout: Duration,
    session_id: u32,
    registry: SessionRegistry,
    closed: bool,
}

impl CaptureSource for CpalCapture {
    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.host.play()
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError> {
        if self.closed {
            return Err(DeviceError::Io("Capture closed".into()));
        }
        let deadline = Instant::now() + self.read_timeout;
        loop {
            self.stage.pump(&mut self.raw);
            if self.stage.ready_len() >= buf.len()
                || self.interrupt.is_raised()
                || Instant::now() >= deadline
            {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(self.stage.pop(buf))
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        let result = self.host.pause();
        self.raw.clear();
        self.stage.reset();
        result
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.host.close();
        self.registry.remove(self.session_id);
        self.closed = true;
    }

    fn interrupter(&self) -> Option<Interrupt> {
        Some(self.interrupt.clone())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct CpalRender {
    host: StreamHost,
    queue: HeapProd<i16>,
    far_end: Option<HeapProd<f32>>,
    write_timeout: Duration,
    closed: bool,
}

impl RenderSink for CpalRender {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.host.play()
    }

    fn write(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Io("Render closed".into()));
        }
        let deadline = Instant::now() + self.write_timeout;
        let mut written = 0;
        loop {
            written += self.queue.push_slice(&samples[written..]);
            if written == samples.len() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Io(format!(
                    "Render queue full, dropped {} samples",
                    samples.len() - written
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }

        if let Some(far_end) = self.far_end.as_mut() {
            for &sample in samples {
                let _ = far_end.try_push(sample as f32 / 32768.0);
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.host.pause()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.host.close();
        self.closed = true;
    }
}

impl Drop for CpalRender {
    fn drop(&mut self) {
        self.close();
    }
}
