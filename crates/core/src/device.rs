//! Collaborator seam between the loopback core and a concrete audio stack.
//!
//! The core never talks to an audio API directly. A front end supplies an
//! [`AudioBackend`] that opens mono PCM16 capture and render handles, and any
//! number of [`EffectFactory`] implementations standing in for platform
//! echo cancellation or noise suppression.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Failures reported by capture and render collaborators.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Recording is not permitted (e.g. microphone access denied).
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The device is missing, busy or failed to initialize.
    #[error("device unavailable: {0}")]
    Unavailable(String),
    /// A single read or write failed; the session can continue.
    #[error("device I/O failed: {0}")]
    Io(String),
}

/// Stream shape requested from the backend. Channels are always mono and the
/// sample format is always signed 16-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    /// Device-side buffer size in samples.
    pub buffer_frames: usize,
}

/// Wakes a capture source blocked in [`CaptureSource::read`].
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Opens capture and render handles for a session.
pub trait AudioBackend: Send {
    /// Platform minimum buffer size in samples, if known.
    fn min_buffer_frames(&self, sample_rate: u32) -> Option<usize>;

    fn open_capture(&mut self, spec: &StreamSpec) -> Result<Box<dyn CaptureSource>, DeviceError>;

    fn open_render(&mut self, spec: &StreamSpec) -> Result<Box<dyn RenderSink>, DeviceError>;
}

/// Microphone side of the loopback.
pub trait CaptureSource: Send {
    /// Identifier platform effects attach to. Zero means "no session".
    fn session_id(&self) -> u32 {
        0
    }

    fn start(&mut self) -> Result<(), DeviceError>;

    /// Blocks until samples are available, the timeout elapses, or the
    /// interrupt is raised. Returns the number of samples written to `buf`,
    /// which may be zero.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, DeviceError>;

    /// Halts capture without releasing the device.
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Releases the device. Further calls are no-ops.
    fn close(&mut self);

    /// Handle that unblocks a pending `read`, if the source supports it.
    fn interrupter(&self) -> Option<Interrupt> {
        None
    }
}

/// Speaker side of the loopback.
pub trait RenderSink: Send {
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Blocks until `samples` has been queued for playback.
    fn write(&mut self, samples: &[i16]) -> Result<(), DeviceError>;

    /// Halts playback without releasing the device.
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Releases the device. Further calls are no-ops.
    fn close(&mut self);
}

/// Creates an optional platform effect (echo canceller, noise suppressor)
/// bound to a capture session.
pub trait EffectFactory: Send {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn create(&self, session_id: u32) -> Option<Box<dyn PlatformEffect>>;
}

/// Opaque platform effect. Every call is best-effort.
pub trait PlatformEffect: Send {
    fn set_enabled(&mut self, enabled: bool) -> anyhow::Result<()>;

    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_shared_between_clones() {
        let interrupt = Interrupt::new();
        let remote = interrupt.clone();
        assert!(!interrupt.is_raised());
        remote.raise();
        assert!(interrupt.is_raised());
        interrupt.clear();
        assert!(!remote.is_raised());
    }

    #[test]
    fn test_error_messages() {
        let err = DeviceError::PermissionDenied("microphone".into());
        assert_eq!(err.to_string(), "permission denied: microphone");
        let err = DeviceError::Io("underrun".into());
        assert_eq!(err.to_string(), "device I/O failed: underrun");
    }
}
