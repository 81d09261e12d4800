pub mod capture;
pub mod display;
pub mod error;
pub mod inference;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use capture::{Frame, FrameSource, SourceSpec};
pub use display::DisplaySurface;
pub use error::{CaptureError, ConfigError, InferenceError};
pub use inference::{InferenceEngine, Overlay, Rgba};
pub use pipeline::{Annotation, DisplayPair, Pipeline, PipelineEvent, SyncCoordinator};

/// Environment prefix for layered configuration (`VESSELSIGHT__OVERLAY__GAMMA=2.0`)
pub const ENV_PREFIX: &str = "VESSELSIGHT";

/// Default configuration file looked up in the working directory
pub const CONFIG_FILE: &str = "vesselsight.toml";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub model: ModelConfig,
    pub overlay: OverlayConfig,
    pub pipeline: PipelineConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// "auto", a camera index, or a file path
    pub source: String,
    pub width: u32,
    pub height: u32,
    /// Capture rate requested from cameras; pacing rate for files without a native rate
    pub fps: f64,
    /// Explicit playback rate for files, overriding the native rate
    pub playback_fps: Option<f64>,
    pub loop_video: bool,
    /// Camera indices `0..probe_count` are tried by auto-detect
    pub probe_count: u32,
    pub auto_file_fallback: bool,
    /// Directory searched for a default video file; working directory when unset
    pub media_dir: Option<PathBuf>,
    pub warmup_ms: u64,
    pub read_timeout_ms: u64,
    /// Consecutive camera read failures tolerated before reporting a disconnect
    pub max_read_failures: u32,
    pub buffer_count: u32,
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl FromStr for Device {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            // "cuda:0" selects the first accelerator
            _ if s == "cuda" || s.starts_with("cuda:") => Ok(Device::Cuda),
            _ => Err(ConfigError::Device(s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Segmentation checkpoint; the edge fallback runs when unset
    pub path: Option<PathBuf>,
    pub device: Device,
    pub input_width: u32,
    pub input_height: u32,
    /// Upper bound on forward passes per second
    pub target_rate: f64,
    pub dequeue_timeout_ms: u64,
    pub slow_inference_warn_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub enabled: bool,
    pub color: Rgba,
    /// Probabilities at or below this contribute no alpha
    pub threshold: f32,
    /// > 1.0 compresses low confidences, < 1.0 expands them
    pub gamma: f32,
    pub opacity: f32,
    pub match_frame_size: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of each coordinator cache (frames and overlays by id)
    pub cache_capacity: usize,
    pub event_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Also forward raw frames while an overlay is pending. The display may
    /// then step back from a newer raw frame to the older pair once it lands.
    pub passthrough_while_pending: bool,
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                source: "auto".into(),
                width: 1280,
                height: 720,
                fps: 30.0,
                playback_fps: None,
                loop_video: true,
                probe_count: 4,
                auto_file_fallback: true,
                media_dir: None,
                warmup_ms: 150,
                read_timeout_ms: 100,
                max_read_failures: 5,
                buffer_count: 4,
                pin_core: None,
            },
            model: ModelConfig {
                path: None,
                device: Device::Cpu,
                input_width: 512,
                input_height: 512,
                target_rate: 5.0,
                dequeue_timeout_ms: 250,
                slow_inference_warn_ms: 1000,
            },
            overlay: OverlayConfig {
                enabled: true,
                color: Rgba::new(255, 0, 0, 255),
                threshold: 0.5,
                gamma: 1.5,
                opacity: 0.7,
                match_frame_size: true,
            },
            pipeline: PipelineConfig {
                cache_capacity: 8,
                event_queue: 64,
            },
            display: DisplayConfig {
                passthrough_while_pending: false,
                screenshot_dir: None,
            },
        }
    }
}

impl Config {
    /// Load defaults, then `vesselsight.toml` (or `$VESSELSIGHT_CONFIG`), then environment
    pub fn load() -> Result<Self> {
        let file = std::env::var_os("VESSELSIGHT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
        let mut config = Self::load_from(Some(&file))?;
        config.apply_legacy_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Layered load without the legacy flat variables
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = file {
            debug!("Config file: {}", path.display());
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        info!(
            "Configuration loaded: source={} model={:?} overlay_enabled={}",
            config.capture.source, config.model.path, config.overlay.enabled
        );
        Ok(config)
    }

    /// Apply the flat variables used by earlier deployments
    /// (`MODEL_PATH`, `DEVICE`, `MODEL_INPUT_SIZE`, `OVERLAY_THR`, `OVERLAY_GAMMA`, `OVERLAY_COLOR`)
    pub fn apply_legacy_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = lookup("MODEL_PATH") {
            self.model.path = Some(PathBuf::from(path));
        }
        if let Some(device) = lookup("DEVICE") {
            self.model.device = device.parse()?;
        }
        if let Some(size) = lookup("MODEL_INPUT_SIZE") {
            let (w, h) = parse_size(&size)?;
            self.model.input_width = w;
            self.model.input_height = h;
        }
        // Unparseable numbers keep the configured value
        if let Some(thr) = lookup("OVERLAY_THR").and_then(|v| v.trim().parse().ok()) {
            self.overlay.threshold = thr;
        }
        if let Some(gamma) = lookup("OVERLAY_GAMMA").and_then(|v| v.trim().parse().ok()) {
            self.overlay.gamma = gamma;
        }
        if let Some(color) = lookup("OVERLAY_COLOR") {
            self.overlay.color = color.parse()?;
        }
        Ok(())
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }
}

impl ModelConfig {
    pub fn input_size(&self) -> (u32, u32) {
        (self.input_width.max(1), self.input_height.max(1))
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms.max(1))
    }

    /// Minimum spacing between forward passes; a rate too small to
    /// represent waits forever, a non-positive one not at all
    pub fn min_interval(&self) -> Duration {
        if self.target_rate > 0.0 {
            Duration::try_from_secs_f64(1.0 / self.target_rate).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}

/// Parse "W,H" (also accepts "WxH")
pub fn parse_size(s: &str) -> Result<(u32, u32), ConfigError> {
    let parts: Vec<&str> = s.split([',', 'x']).map(str::trim).collect();
    match parts.as_slice() {
        [w, h] => match (w.parse::<u32>(), h.parse::<u32>()) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok((w, h)),
            _ => Err(ConfigError::Size(s.to_string())),
        },
        _ => Err(ConfigError::Size(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn legacy_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MODEL_PATH", "models/vessels.onnx"),
            ("DEVICE", "cuda:0"),
            ("MODEL_INPUT_SIZE", "384,256"),
            ("OVERLAY_THR", "0.3"),
            ("OVERLAY_GAMMA", "not-a-number"),
            ("OVERLAY_COLOR", "#00FF00CC"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_legacy_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.model.path, Some(PathBuf::from("models/vessels.onnx")));
        assert_eq!(config.model.device, Device::Cuda);
        assert_eq!(config.model.input_size(), (384, 256));
        assert!((config.overlay.threshold - 0.3).abs() < 1e-6);
        assert!((config.overlay.gamma - 1.5).abs() < 1e-6);
        assert_eq!(config.overlay.color, Rgba::new(0, 255, 0, 0xCC));
    }

    #[test]
    fn legacy_env_rejects_bad_color() {
        let mut config = Config::default();
        let err = config
            .apply_legacy_env(|k| (k == "OVERLAY_COLOR").then(|| "red".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Color(_)));
    }

    #[test]
    fn min_interval_saturates_for_tiny_rates() {
        let mut model = Config::default().model;
        model.target_rate = 1e-30;
        assert_eq!(model.min_interval(), Duration::MAX);
        model.target_rate = 4.0;
        assert_eq!(model.min_interval(), Duration::from_millis(250));
        model.target_rate = f64::NAN;
        assert_eq!(model.min_interval(), Duration::ZERO);
        model.target_rate = -1.0;
        assert_eq!(model.min_interval(), Duration::ZERO);
    }

    #[test]
    fn parse_sizes() {
        assert_eq!(parse_size("512,512").unwrap(), (512, 512));
        assert_eq!(parse_size("640x480").unwrap(), (640, 480));
        assert!(parse_size("512").is_err());
        assert!(parse_size("0,10").is_err());
    }

    #[test]
    fn load_defaults_and_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vesselsight.toml");
        std::fs::write(
            &path,
            "[overlay]\nthreshold = 0.25\ncolor = \"0,0,255\"\n\n[capture]\nloop_video = false\n",
        )
        .unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert!((config.overlay.threshold - 0.25).abs() < 1e-6);
        assert_eq!(config.overlay.color, Rgba::new(0, 0, 255, 255));
        assert!(!config.capture.loop_video);
        assert_eq!(config.model.input_size(), (512, 512));
    }

    #[test]
    fn min_interval_from_rate() {
        let mut model = Config::default().model;
        assert_eq!(model.min_interval(), Duration::from_millis(200));
        model.target_rate = 0.0;
        assert_eq!(model.min_interval(), Duration::ZERO);
    }
}
