use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ChonkerError, ChonkerResult};
use crate::logging::LoggingConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChonkerConfig {
    pub normalizer: NormalizerConfig,
    pub grid: GridConfig,
    pub fusion: FusionConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Font size used when the extraction record carries none
    pub fallback_font_size: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Cell width as a fraction of the modal font size
    pub cell_width_ratio: f32,

    /// Cell height as a fraction of the modal font size
    pub cell_height_ratio: f32,

    /// Smallest grid dimension, applied to both axes
    pub min_cells: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Resolution of the synthetic matrix raster handed to the detector
    pub raster_dpi: f32,

    /// Detected regions below this confidence are discarded
    pub confidence_threshold: f32,

    /// Fraction of a run's own area that must fall inside a region
    pub min_overlap: f32,

    /// Bound on a single detector invocation
    pub detector_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of resident pages
    pub capacity: usize,

    /// Serve a fast low-DPI raster first, upgrade in the background
    pub progressive: bool,

    /// Render the neighbours of every requested page in the background
    pub prefetch_adjacent: bool,

    /// Background render workers
    pub worker_threads: usize,

    /// DPI of the `Low` quality tier
    pub low_tier_dpi: f32,

    pub dpi_tiers: DpiTiers,
}

/// Display-width to DPI table. Widths up to and including `max_width` of
/// the first matching tier get its DPI; anything wider gets `fallback_dpi`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpiTiers {
    pub tiers: Vec<DpiTier>,
    pub fallback_dpi: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DpiTier {
    pub max_width: u32,
    pub dpi: f32,
}


impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            fallback_font_size: 12.0,
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cell_width_ratio: 0.6,
            cell_height_ratio: 1.2,
            min_cells: 10,
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            raster_dpi: 300.0,
            confidence_threshold: 0.5,
            min_overlap: 0.10,
            detector_timeout_ms: 30_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            progressive: true,
            prefetch_adjacent: true,
            worker_threads: 2,
            low_tier_dpi: 36.0,
            dpi_tiers: DpiTiers::default(),
        }
    }
}

impl Default for DpiTiers {
    fn default() -> Self {
        Self {
            tiers: vec![
                DpiTier { max_width: 79, dpi: 72.0 },   // Small terminal
                DpiTier { max_width: 120, dpi: 96.0 },  // Medium terminal
                DpiTier { max_width: 200, dpi: 120.0 }, // Large terminal
            ],
            fallback_dpi: 150.0,
        }
    }
}


impl DpiTiers {
    pub fn select(&self, display_width: u32) -> f32 {
        self.tiers
            .iter()
            .find(|tier| display_width <= tier.max_width)
            .map(|tier| tier.dpi)
            .unwrap_or(self.fallback_dpi)
    }
}

impl FusionConfig {
    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }
}

impl ChonkerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow!("Failed to read config file: {}", e))?;

        let config: ChonkerConfig = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file: {}", e))?;

        Ok(config)
    }

    pub fn load_from_env() -> Self {
        let mut config = Self::default();

        // Override with environment variables
        if let Some(value) = env_parse::<f32>("CHONKER_CONFIDENCE_THRESHOLD") {
            config.fusion.confidence_threshold = value;
        }

        if let Some(value) = env_parse::<f32>("CHONKER_MIN_OVERLAP") {
            config.fusion.min_overlap = value;
        }

        if let Some(value) = env_parse::<u64>("CHONKER_DETECTOR_TIMEOUT_MS") {
            config.fusion.detector_timeout_ms = value;
        }

        if let Some(value) = env_parse::<usize>("CHONKER_CACHE_CAPACITY") {
            config.cache.capacity = value;
        }

        if let Ok(level) = std::env::var("CHONKER_LOG_LEVEL") {
            config.logging.level = level.to_lowercase();
        }

        config
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| anyhow!("Failed to write config file: {}", e))?;

        Ok(())
    }

    /// Reject values that would break grid or cache invariants
    pub fn validate(&self) -> ChonkerResult<()> {
        if !(self.normalizer.fallback_font_size > 0.0) {
            return Err(ChonkerError::configuration(
                "normalizer.fallback_font_size must be positive",
            ));
        }
        if !(self.grid.cell_width_ratio > 0.0) || !(self.grid.cell_height_ratio > 0.0) {
            return Err(ChonkerError::configuration("grid cell ratios must be positive"));
        }
        if self.grid.min_cells == 0 {
            return Err(ChonkerError::configuration("grid.min_cells must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.fusion.confidence_threshold) {
            return Err(ChonkerError::configuration(
                "fusion.confidence_threshold must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.fusion.min_overlap) {
            return Err(ChonkerError::configuration(
                "fusion.min_overlap must be within [0, 1]",
            ));
        }
        if !(self.fusion.raster_dpi > 0.0) {
            return Err(ChonkerError::configuration("fusion.raster_dpi must be positive"));
        }
        if self.cache.capacity == 0 {
            return Err(ChonkerError::configuration("cache.capacity must be at least 1"));
        }
        if self.cache.worker_threads == 0 {
            return Err(ChonkerError::configuration(
                "cache.worker_threads must be at least 1",
            ));
        }
        if !(self.cache.low_tier_dpi > 0.0) {
            return Err(ChonkerError::configuration("cache.low_tier_dpi must be positive"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ChonkerConfig::default();
        assert_eq!(config.normalizer.fallback_font_size, 12.0);
        assert_eq!(config.fusion.confidence_threshold, 0.5);
        assert_eq!(config.fusion.min_overlap, 0.10);
        assert_eq!(config.cache.capacity, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = ChonkerConfig::default();
        config.cache.capacity = 32;
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        config.save_to_file(&config_path).unwrap();

        let loaded_config = ChonkerConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded_config.cache.capacity, 32);
        assert_eq!(loaded_config.cache.dpi_tiers, DpiTiers::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("partial.toml");
        std::fs::write(&config_path, "[fusion]\nmin_overlap = 0.25\n").unwrap();

        let config = ChonkerConfig::load_from_file(&config_path).unwrap();
        assert_eq!(config.fusion.min_overlap, 0.25);
        assert_eq!(config.fusion.confidence_threshold, 0.5);
        assert_eq!(config.grid.min_cells, 10);
    }

    #[test]
    fn test_dpi_selection_defaults() {
        let tiers = DpiTiers::default();
        assert_eq!(tiers.select(40), 72.0);
        assert_eq!(tiers.select(79), 72.0);
        assert_eq!(tiers.select(80), 96.0);
        assert_eq!(tiers.select(120), 96.0);
        assert_eq!(tiers.select(121), 120.0);
        assert_eq!(tiers.select(200), 120.0);
        assert_eq!(tiers.select(201), 150.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ChonkerConfig::default();
        config.fusion.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = ChonkerConfig::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ChonkerConfig::default();
        config.grid.cell_width_ratio = 0.0;
        assert!(config.validate().is_err());
    }
}
