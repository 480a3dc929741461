//! Karaoke microphone loopback: anti-howling, AGC, reverb and limiting on a
//! dedicated real-time thread, behind a small lifecycle controller.

pub mod agc;
pub mod anti_howl;
pub mod constants;
pub mod controller;
pub mod device;
pub mod limiter;
pub mod params;
pub mod processor;
pub mod reverb;

pub use controller::{LifecycleState, LoopbackConfig, LoopbackController};
pub use device::{
    AudioBackend, CaptureSource, DeviceError, EffectFactory, Interrupt, PlatformEffect, RenderSink,
    StreamSpec,
};
pub use params::{LoopbackMeters, LoopbackParams, ParamSnapshot};
pub use processor::LoopbackProcessor;
