//! Application Configuration
//!
//! User settings stored in TOML format.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where the collection and rasters live
    pub storage: StorageSettings,
    /// Rectangle detector tuning
    pub detection: DetectionSettings,
    /// Info lookup behavior
    pub lookup: LookupSettings,
}

/// Storage-related settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Data directory override; the platform data directory is used when unset
    pub data_dir: Option<PathBuf>,
    /// Collection file name inside the data directory
    pub collection_file: String,
    /// Raster directory name inside the data directory
    pub images_dir: String,
    /// JPEG quality for stored rasters (1-100)
    pub jpeg_quality: u8,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            collection_file: crate::storage::collection::COLLECTION_FILE.to_string(),
            images_dir: "images".to_string(),
            jpeg_quality: crate::storage::raster::DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Contour detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Gaussian blur sigma applied before edge detection (0 disables blurring)
    pub blur_sigma: f32,
    /// Canny low threshold
    pub canny_low: f32,
    /// Canny high threshold
    pub canny_high: f32,
    /// Minimum contour area in pixels
    pub min_area: f64,
    /// Maximum contour area in pixels
    pub max_area: f64,
    /// Polygon approximation tolerance as a fraction of the contour perimeter
    pub approx_epsilon: f64,
    /// Minimum bounding box aspect ratio (width / height)
    pub min_aspect_ratio: f64,
    /// Maximum bounding box aspect ratio (width / height)
    pub max_aspect_ratio: f64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            blur_sigma: 1.0,
            canny_low: 50.0,
            canny_high: 150.0,
            min_area: 1000.0,
            max_area: 50_000.0,
            approx_epsilon: 0.02,
            min_aspect_ratio: 0.5,
            max_aspect_ratio: 2.0,
        }
    }
}

/// Info lookup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupSettings {
    /// Lower bound of simulated latency in milliseconds
    pub min_latency_ms: u64,
    /// Upper bound of simulated latency in milliseconds
    pub max_latency_ms: u64,
    /// Probability (0.0 - 1.0) that a simulated lookup fails
    pub failure_probability: f64,
    /// Seed for the simulated lookup; random when unset
    pub seed: Option<u64>,
    /// Remote lookup endpoint; the simulated service is used when unset
    pub endpoint: Option<String>,
    /// Request timeout for the remote lookup in milliseconds
    pub timeout_ms: u64,
}

impl Default for LookupSettings {
    fn default() -> Self {
        Self {
            min_latency_ms: 500,
            max_latency_ms: 1500,
            failure_probability: 0.1,
            seed: None,
            endpoint: None,
            timeout_ms: 10_000,
        }
    }
}

impl AppConfig {
    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let lookup = &self.lookup;
        if lookup.min_latency_ms > lookup.max_latency_ms {
            bail!(
                "lookup.min_latency_ms ({}) exceeds lookup.max_latency_ms ({})",
                lookup.min_latency_ms,
                lookup.max_latency_ms
            );
        }
        if !(0.0..=1.0).contains(&lookup.failure_probability) {
            bail!(
                "lookup.failure_probability must be within 0.0-1.0, got {}",
                lookup.failure_probability
            );
        }
        if lookup.timeout_ms == 0 {
            bail!("lookup.timeout_ms must be positive");
        }
        if !(1..=100).contains(&self.storage.jpeg_quality) {
            bail!(
                "storage.jpeg_quality must be within 1-100, got {}",
                self.storage.jpeg_quality
            );
        }
        let detection = &self.detection;
        if detection.min_area > detection.max_area {
            bail!("detection.min_area exceeds detection.max_area");
        }
        if detection.min_aspect_ratio > detection.max_aspect_ratio {
            bail!("detection.min_aspect_ratio exceeds detection.max_aspect_ratio");
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config: AppConfig =
        toml::from_str(&content).with_context(|| format!("Failed to parse config {:?}", path))?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load configuration if the file exists, otherwise fall back to defaults
pub fn load_or_default(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        let config = load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    } else {
        info!("Using default configuration");
        Ok(AppConfig::default())
    }
}

/// Default location of the configuration file
pub fn default_config_path() -> Result<PathBuf> {
    Ok(crate::storage::get_config_dir()?.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        // Check storage defaults
        assert!(config.storage.data_dir.is_none());
        assert_eq!(config.storage.collection_file, "collection.json");
        assert_eq!(config.storage.images_dir, "images");
        assert_eq!(config.storage.jpeg_quality, 80);

        // Check detection defaults
        assert!((config.detection.min_area - 1000.0).abs() < f64::EPSILON);
        assert!((config.detection.max_area - 50_000.0).abs() < f64::EPSILON);
        assert!((config.detection.min_aspect_ratio - 0.5).abs() < f64::EPSILON);
        assert!((config.detection.max_aspect_ratio - 2.0).abs() < f64::EPSILON);

        // Check lookup defaults
        assert_eq!(config.lookup.min_latency_ms, 500);
        assert_eq!(config.lookup.max_latency_ms, 1500);
        assert!((config.lookup.failure_probability - 0.1).abs() < f64::EPSILON);
        assert!(config.lookup.seed.is_none());
        assert!(config.lookup.endpoint.is_none());

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AppConfig::default();
        config.lookup.seed = Some(42);
        config.storage.data_dir = Some(PathBuf::from("/var/lib/stamps"));

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.lookup.seed, Some(42));
        assert_eq!(parsed.storage.data_dir, Some(PathBuf::from("/var/lib/stamps")));
        assert_eq!(parsed.lookup.max_latency_ms, config.lookup.max_latency_ms);
        assert_eq!(parsed.storage.jpeg_quality, config.storage.jpeg_quality);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str("[lookup]\nfailure_probability = 0.5\n").unwrap();

        assert!((parsed.lookup.failure_probability - 0.5).abs() < f64::EPSILON);
        assert_eq!(parsed.lookup.min_latency_ms, 500);
        assert_eq!(parsed.storage.images_dir, "images");
    }

    #[test]
    fn test_save_and_load_config() {
        let config = AppConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.storage.collection_file, loaded.storage.collection_file);
        assert_eq!(config.lookup.timeout_ms, loaded.lookup.timeout_ms);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let config = load_or_default(Path::new("/nonexistent/path/config.toml")).unwrap();
        assert_eq!(config.lookup.max_latency_ms, 1500);
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut config = AppConfig::default();
        config.lookup.min_latency_ms = 2000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.lookup.failure_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.storage.jpeg_quality = 0;
        assert!(config.validate().is_err());
    }
}
