use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use singloop_core::constants::*;
use singloop_core::LoopbackController;
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted device choice and loopback settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_device")]
    pub input_device: String,
    #[serde(default = "default_device")]
    pub output_device: String,
    /// Overrides the device-reported minimum buffer, in frames.
    #[serde(default)]
    pub buffer_frames: Option<usize>,
    #[serde(default = "default_mic_gain")]
    pub mic_gain: f32,
    #[serde(default = "default_agc_enabled")]
    pub agc_enabled: bool,
    #[serde(default = "default_agc_target")]
    pub agc_target_level: f32,
    #[serde(default = "default_anti_howling_enabled")]
    pub anti_howling_enabled: bool,
    #[serde(default = "default_anti_howling_strength")]
    pub anti_howling_strength: f32,
    #[serde(default = "default_reverb_enabled")]
    pub reverb_enabled: bool,
    #[serde(default = "default_reverb_mix")]
    pub reverb_mix: f32,
}

fn default_device() -> String {
    "default".to_string()
}

fn default_mic_gain() -> f32 {
    DEFAULT_MIC_GAIN
}

fn default_agc_enabled() -> bool {
    DEFAULT_AGC_ENABLED
}

fn default_agc_target() -> f32 {
    DEFAULT_AGC_TARGET_LEVEL
}

fn default_anti_howling_enabled() -> bool {
    DEFAULT_ANTI_HOWLING_ENABLED
}

fn default_anti_howling_strength() -> f32 {
    DEFAULT_ANTI_HOWLING_STRENGTH
}

fn default_reverb_enabled() -> bool {
    DEFAULT_REVERB_ENABLED
}

fn default_reverb_mix() -> f32 {
    DEFAULT_REVERB_MIX
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_device: default_device(),
            output_device: default_device(),
            buffer_frames: None,
            mic_gain: default_mic_gain(),
            agc_enabled: default_agc_enabled(),
            agc_target_level: default_agc_target(),
            anti_howling_enabled: default_anti_howling_enabled(),
            anti_howling_strength: default_anti_howling_strength(),
            reverb_enabled: default_reverb_enabled(),
            reverb_mix: default_reverb_mix(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from disk, or returns default if not found.
    pub fn load() -> Self {
        config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    /// Loads from `path`; a missing or malformed file yields the defaults.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Saves configuration to disk in JSON format.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = config_path().context("No config directory for this platform")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Pushes the stored settings into a controller. Out-of-range values are
    /// clamped by the controller's setters.
    pub fn apply_to(&self, controller: &LoopbackController) {
        controller.set_mic_gain(self.mic_gain);
        controller.set_agc_enabled(self.agc_enabled);
        controller.set_agc_target_level(self.agc_target_level);
        controller.set_anti_howling_enabled(self.anti_howling_enabled);
        controller.set_anti_howling_strength(self.anti_howling_strength);
        controller.set_reverb_enabled(self.reverb_enabled);
        controller.set_reverb_mix(self.reverb_mix);
    }

    /// Copies the controller's current (clamped) settings back.
    pub fn capture_from(&mut self, controller: &LoopbackController) {
        self.mic_gain = controller.mic_gain();
        self.agc_enabled = controller.is_agc_enabled();
        self.agc_target_level = controller.agc_target_level();
        self.anti_howling_enabled = controller.is_anti_howling_enabled();
        self.anti_howling_strength = controller.anti_howling_strength();
        self.reverb_enabled = controller.is_reverb_enabled();
        self.reverb_mix = controller.reverb_mix();
    }
}

pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "singloop", "singloop")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use singloop_core::{AudioBackend, CaptureSource, DeviceError, RenderSink, StreamSpec};

    struct NoDevices;

    impl AudioBackend for NoDevices {
        fn min_buffer_frames(&self, _sample_rate: u32) -> Option<usize> {
            None
        }

        fn open_capture(&mut self, _: &StreamSpec) -> Result<Box<dyn CaptureSource>, DeviceError> {
            Err(DeviceError::Unavailable("none".into()))
        }

        fn open_render(&mut self, _: &StreamSpec) -> Result<Box<dyn RenderSink>, DeviceError> {
            Err(DeviceError::Unavailable("none".into()))
        }
    }

    #[test]
    fn test_default_config_values() {
        let config = AppConfig::default();
        assert_eq!(config.input_device, "default");
        assert_eq!(config.mic_gain, 2.2);
        assert_eq!(config.agc_target_level, 0.18);
        assert_eq!(config.anti_howling_strength, 0.55);
        assert_eq!(config.reverb_mix, 0.28);
        assert!(config.agc_enabled && config.anti_howling_enabled && config.reverb_enabled);
        assert_eq!(config.buffer_frames, None);
    }

    #[test]
    fn test_config_deserialization_with_defaults() {
        // Minimal JSON - should fill in defaults
        let json = r#"{"input_device":"USB Mic","reverb_enabled":false}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.input_device, "USB Mic");
        assert_eq!(config.output_device, "default");
        assert!(!config.reverb_enabled);
        assert_eq!(config.mic_gain, DEFAULT_MIC_GAIN);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = AppConfig {
            output_device: "Headphones".to_string(),
            buffer_frames: Some(1024),
            reverb_mix: 0.5,
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path), config);
    }

    #[test]
    fn test_missing_or_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(AppConfig::load_from(&path), AppConfig::default());

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load_from(&path), AppConfig::default());
    }

    #[test]
    fn test_apply_clamps_and_capture_reads_back() {
        let controller = LoopbackController::new(Box::new(NoDevices));
        let mut config = AppConfig {
            mic_gain: 10.0,
            agc_enabled: false,
            reverb_mix: 0.4,
            anti_howling_strength: -1.0,
            ..Default::default()
        };

        config.apply_to(&controller);
        assert!(!controller.is_agc_enabled());
        assert_eq!(controller.reverb_mix(), 0.4);

        config.capture_from(&controller);
        assert_eq!(config.mic_gain, MAX_MIC_GAIN, "Gain should be clamped");
        assert_eq!(config.anti_howling_strength, MIN_ANTI_HOWLING_STRENGTH);
    }
}
