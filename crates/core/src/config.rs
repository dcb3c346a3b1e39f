//! Engine configuration, loaded from `ember.toml`.
//!
//! Every field has a default so a partial (or empty) file is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Upper bound on the frame ring size accepted by [`EngineConfig::validate`].
pub const MAX_FRAMES_IN_FLIGHT: u32 = 4;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of frame slots the CPU may record ahead of the GPU
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: u32,
    /// Enable the Khronos validation layer
    #[serde(default)]
    pub validation: bool,
    /// Tracing filter directives, overridden by `RUST_LOG`
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub descriptors: DescriptorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_title")]
    pub title: String,
    /// FIFO presentation when set, mailbox (if available) otherwise
    #[serde(default = "default_true")]
    pub vsync: bool,
}

/// Bounds on every blocking GPU wait, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_frame_fence_ms")]
    pub frame_fence_ms: u64,
    #[serde(default = "default_acquire_ms")]
    pub acquire_ms: u64,
    #[serde(default = "default_immediate_ms")]
    pub immediate_ms: u64,
    #[serde(default = "default_flush_ms")]
    pub flush_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorConfig {
    /// Capacity multiplier applied each time a new pool is created
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f32,
    /// Hard cap on the set capacity of any single pool
    #[serde(default = "default_max_sets_per_pool")]
    pub max_sets_per_pool: u32,
    /// Engine-lifetime allocator
    #[serde(default = "PoolConfig::global")]
    pub global: PoolConfig,
    /// Allocator owned by each frame slot, reset every frame
    #[serde(default = "PoolConfig::frame")]
    pub frame: PoolConfig,
}

/// Initial capacity and per-type ratios of one descriptor allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub initial_sets: u32,
    pub ratios: Vec<PoolRatio>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolRatio {
    pub kind: DescriptorKind,
    pub ratio: f32,
}

/// Descriptor types that can be named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    StorageImage,
    SampledImage,
    Sampler,
}

impl PoolConfig {
    fn global() -> Self {
        Self {
            initial_sets: 10,
            ratios: vec![
                PoolRatio::new(DescriptorKind::UniformBuffer, 1.0),
                PoolRatio::new(DescriptorKind::StorageBuffer, 1.0),
                PoolRatio::new(DescriptorKind::StorageImage, 1.0),
            ],
        }
    }

    fn frame() -> Self {
        Self {
            initial_sets: 1000,
            ratios: vec![
                PoolRatio::new(DescriptorKind::StorageImage, 3.0),
                PoolRatio::new(DescriptorKind::StorageBuffer, 3.0),
                PoolRatio::new(DescriptorKind::UniformBuffer, 3.0),
                PoolRatio::new(DescriptorKind::CombinedImageSampler, 4.0),
            ],
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.initial_sets == 0 {
            return Err(Error::Config(format!(
                "descriptors.{name}.initial_sets must be at least 1"
            )));
        }
        if self.ratios.is_empty() {
            return Err(Error::Config(format!(
                "descriptors.{name}.ratios must name at least one descriptor kind"
            )));
        }
        if let Some(bad) = self.ratios.iter().find(|r| r.ratio.is_nan() || r.ratio <= 0.0) {
            return Err(Error::Config(format!(
                "descriptors.{name}: ratio for {:?} must be positive, got {}",
                bad.kind, bad.ratio
            )));
        }
        Ok(())
    }
}

impl PoolRatio {
    pub const fn new(kind: DescriptorKind, ratio: f32) -> Self {
        Self { kind, ratio }
    }
}

impl TimeoutConfig {
    pub fn frame_fence(&self) -> Duration {
        Duration::from_millis(self.frame_fence_ms)
    }

    pub fn acquire(&self) -> Duration {
        Duration::from_millis(self.acquire_ms)
    }

    pub fn immediate(&self) -> Duration {
        Duration::from_millis(self.immediate_ms)
    }

    pub fn flush(&self) -> Duration {
        Duration::from_millis(self.flush_ms)
    }
}

impl EngineConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// holds out-of-range values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            return Err(Error::Config(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::Config("window size must be non-zero".into()));
        }

        let timeouts = &self.timeouts;
        for (name, ms) in [
            ("frame_fence_ms", timeouts.frame_fence_ms),
            ("acquire_ms", timeouts.acquire_ms),
            ("immediate_ms", timeouts.immediate_ms),
            ("flush_ms", timeouts.flush_ms),
        ] {
            if ms == 0 {
                return Err(Error::Config(format!("timeouts.{name} must be non-zero")));
            }
        }

        let descriptors = &self.descriptors;
        if descriptors.growth_factor.is_nan() || descriptors.growth_factor < 1.0 {
            return Err(Error::Config(format!(
                "descriptors.growth_factor must be >= 1.0, got {}",
                descriptors.growth_factor
            )));
        }
        if descriptors.max_sets_per_pool == 0 {
            return Err(Error::Config(
                "descriptors.max_sets_per_pool must be at least 1".into(),
            ));
        }
        descriptors.global.validate("global")?;
        descriptors.frame.validate("frame")?;
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: default_frames_in_flight(),
            validation: false,
            log_filter: None,
            window: WindowConfig::default(),
            timeouts: TimeoutConfig::default(),
            descriptors: DescriptorConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            title: default_title(),
            vsync: true,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            frame_fence_ms: default_frame_fence_ms(),
            acquire_ms: default_acquire_ms(),
            immediate_ms: default_immediate_ms(),
            flush_ms: default_flush_ms(),
        }
    }
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            growth_factor: default_growth_factor(),
            max_sets_per_pool: default_max_sets_per_pool(),
            global: PoolConfig::global(),
            frame: PoolConfig::frame(),
        }
    }
}

fn default_frames_in_flight() -> u32 {
    3
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_title() -> String {
    "Ember".to_string()
}

fn default_true() -> bool {
    true
}

fn default_frame_fence_ms() -> u64 {
    1000
}

fn default_acquire_ms() -> u64 {
    1000
}

fn default_immediate_ms() -> u64 {
    10_000
}

fn default_flush_ms() -> u64 {
    1000
}

fn default_growth_factor() -> f32 {
    1.5
}

fn default_max_sets_per_pool() -> u32 {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.timeouts.frame_fence(), Duration::from_secs(1));
        assert_eq!(config.descriptors.frame.initial_sets, 1000);
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            frames_in_flight = 2

            [window]
            title = "demo"

            [descriptors.global]
            initial_sets = 4
            ratios = [{ kind = "combined_image_sampler", ratio = 2.0 }]
            "#,
        )
        .unwrap();

        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.window.title, "demo");
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.descriptors.global.initial_sets, 4);
        assert_eq!(
            config.descriptors.global.ratios,
            vec![PoolRatio::new(DescriptorKind::CombinedImageSampler, 2.0)]
        );
        assert_eq!(config.descriptors.frame, PoolConfig::frame());
    }

    #[test]
    fn test_rejects_out_of_range_frames_in_flight() {
        for bad in ["frames_in_flight = 0", "frames_in_flight = 5"] {
            let err = EngineConfig::from_toml_str(bad).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn test_rejects_shrinking_growth_factor() {
        let err = EngineConfig::from_toml_str("[descriptors]\ngrowth_factor = 0.5").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_non_positive_ratio() {
        let err = EngineConfig::from_toml_str(
            r#"
            [descriptors.frame]
            initial_sets = 8
            ratios = [{ kind = "uniform_buffer", ratio = 0.0 }]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("descriptors.frame"));
    }

    #[test]
    fn test_unknown_descriptor_kind_is_parse_error() {
        let err = EngineConfig::from_toml_str(
            r#"
            [descriptors.frame]
            initial_sets = 8
            ratios = [{ kind = "acceleration_structure", ratio = 1.0 }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }
}
