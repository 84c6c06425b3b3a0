//! Pipeline configuration
//!
//! Every component takes its own config struct; `PipelineConfig` bundles them so a
//! single JSON file (or `SOMA_ASSETS_CONFIG`) can tune the whole pipeline.
//! Missing fields fall back to the defaults below.

use crate::error::{AssetError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable pointing at a JSON config file
pub const CONFIG_ENV: &str = "SOMA_ASSETS_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub compression: CompressionConfig,
    pub upload: UploadConfig,
    pub loader: LoaderConfig,
    pub color: ColorConfig,
}

impl PipelineConfig {
    /// Load from a JSON file; absent keys keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded pipeline config");
        Ok(config)
    }

    /// Load from `SOMA_ASSETS_CONFIG` if set, otherwise defaults
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.compression.validate()?;
        if self.upload.batch_size == 0 {
            return Err(AssetError::Config("batch_size must be at least 1".to_string()));
        }
        if self.loader.max_concurrent_loads == 0 {
            return Err(AssetError::Config("max_concurrent_loads must be at least 1".to_string()));
        }
        if self.color.sample_stride == 0 || self.color.chunk_pixels == 0 || self.color.max_sample_dimension == 0 {
            return Err(AssetError::Config("color sampling parameters must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Adaptive JPEG compression parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Longest edge after downscaling
    pub max_dimension: u32,
    pub min_quality: f32,
    pub max_quality: f32,
    pub initial_quality: f32,
    pub max_attempts: u32,
    /// Accept results up to `target * tolerance`
    pub tolerance: f64,
    /// Stop when successive qualities move less than this
    pub convergence_delta: f32,
    /// Files at or below this size are uploaded untouched
    pub threshold_bytes: u64,
    pub target_size_bytes: u64,
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_dimension: 1920,
            min_quality: 0.1,
            max_quality: 0.95,
            initial_quality: 0.9,
            max_attempts: 10,
            tolerance: 1.1,
            convergence_delta: 0.01,
            threshold_bytes: 300 * 1024,
            target_size_bytes: 300 * 1024,
            enabled: true,
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.min_quality && self.min_quality < self.max_quality && self.max_quality <= 1.0) {
            return Err(AssetError::Config(format!(
                "quality bounds must satisfy 0 < min < max <= 1 (got {} .. {})",
                self.min_quality, self.max_quality
            )));
        }
        if self.max_attempts == 0 {
            return Err(AssetError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.max_dimension == 0 {
            return Err(AssetError::Config("max_dimension must be non-zero".to_string()));
        }
        if self.tolerance < 1.0 {
            return Err(AssetError::Config("tolerance must be >= 1.0".to_string()));
        }
        if self.target_size_bytes == 0 {
            return Err(AssetError::Config("target_size_bytes must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Items in flight per batch
    pub batch_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { batch_size: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Global ceiling on concurrent asset fetches
    pub max_concurrent_loads: usize,
    /// Pause before re-dispatching after a completion
    pub redispatch_delay_ms: u64,
}

impl LoaderConfig {
    pub fn redispatch_delay(&self) -> Duration {
        Duration::from_millis(self.redispatch_delay_ms)
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 2,
            redispatch_delay_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    /// Images are sampled at no more than this many pixels per edge
    pub max_sample_dimension: u32,
    /// Every Nth pixel contributes to the average
    pub sample_stride: usize,
    /// Pixels swept between yields
    pub chunk_pixels: usize,
    /// Luminance above which a color counts as bright
    pub brightness_threshold: f32,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            max_sample_dimension: 200,
            sample_stride: 20,
            chunk_pixels: 50_000,
            brightness_threshold: 160.0,
        }
    }
}
