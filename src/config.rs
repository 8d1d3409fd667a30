use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::matcher::DEFAULT_THRESHOLD;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEMATCH_CONFIG_PATH").unwrap_or("/usr/local/etc/facematch/config.toml"))
});

pub static FACE_STORE_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEMATCH_STORE_PREFIX").unwrap_or("/usr/local/etc/facematch"))
});

pub static MODEL_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEMATCH_MODEL_PREFIX").unwrap_or("/usr/local/share/facematch/models"))
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Largest descriptor distance accepted as a match.
    pub threshold: f32,
    pub camera: String,
    pub store_dir: PathBuf,
    pub detector_model: PathBuf,
    pub encoder_model: PathBuf,
    /// Minimum detector score for a face to be considered.
    pub detection_score: f32,
    pub nms_iou: f32,
    /// Frames to try before giving up on a capture.
    pub max_frames: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            camera: "/dev/video0".to_string(),
            store_dir: FACE_STORE_PREFIX.to_path_buf(),
            detector_model: MODEL_PREFIX.join("face_detection_yunet_2023mar.onnx"),
            encoder_model: MODEL_PREFIX.join("face_recognition_sface_2021dec.onnx"),
            detection_score: 0.6,
            nms_iou: 0.3,
            max_frames: 30,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            anyhow::bail!("threshold must be a positive number, got {}", self.threshold);
        }
        if !(0.0..=1.0).contains(&self.detection_score) {
            anyhow::bail!("detection_score must be within [0, 1], got {}", self.detection_score);
        }
        if self.max_frames == 0 {
            anyhow::bail!("max_frames must be at least 1");
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        log::debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data).with_context(|| format!("writing config {}", path.display()))?;
    Ok(())
}
