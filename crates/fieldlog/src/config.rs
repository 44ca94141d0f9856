//! Configuration management for fieldlog.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::flash::{FlashGeometry, FlashLayout};
use crate::storage::record::RECORD_SIZE;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "fieldlog";

/// Default flash image file name.
const IMAGE_FILE_NAME: &str = "flash.img";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `FIELDLOG_`, sections split on `__`)
/// 2. TOML config file at `~/.config/fieldlog/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Flash geometry and image location.
    pub flash: FlashConfig,
    /// Logging session timing and buffering.
    pub session: SessionConfig,
    /// KML export styling.
    pub export: ExportConfig,
}

/// Flash-related configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Path to the flash image file.
    /// Defaults to `~/.local/share/fieldlog/flash.img`
    pub image_path: Option<PathBuf>,
    /// Total size of the medium in bytes.
    pub capacity_bytes: u32,
    /// Program granularity in bytes.
    pub page_size: u32,
    /// Erase granularity in bytes.
    pub sector_size: u32,
    /// Bytes reserved at the start of the medium for the metadata journal.
    pub journal_bytes: u32,
}

/// Session-related configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between recorded samples in milliseconds.
    pub sample_interval_ms: u64,
    /// Interval between forced buffer flushes in milliseconds.
    pub flush_interval_ms: u64,
    /// Capacity of the write-coalescing buffer in bytes.
    pub buffer_capacity: usize,
    /// Buffer fill level that triggers a flush.
    pub flush_threshold: usize,
}

/// Export-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Width of track segments in the rendered document.
    pub line_width: u32,
    /// HSV saturation of the speed ramp.
    pub saturation: f32,
    /// HSV value of the speed ramp.
    pub value: f32,
    /// Number of lines processed between cooperative yields.
    pub yield_every_lines: usize,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            image_path: None, // Resolved to the data directory at runtime
            capacity_bytes: 4 * 1024 * 1024,
            page_size: 256,
            sector_size: 4096,
            journal_bytes: 64 * 1024,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
            flush_interval_ms: 1500,
            buffer_capacity: 512,
            flush_threshold: 256,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            line_width: 4,
            saturation: 1.0,
            value: 0.95,
            yield_every_lines: 64,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file).nested())
            .merge(Env::prefixed("FIELDLOG_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let flash = &self.flash;
        let record = u32::try_from(RECORD_SIZE).unwrap_or(u32::MAX);

        if flash.page_size == 0 || flash.page_size % record != 0 {
            return Err(invalid(format!(
                "page_size ({}) must be a non-zero multiple of {record}",
                flash.page_size
            )));
        }
        if flash.sector_size == 0 || flash.sector_size % flash.page_size != 0 {
            return Err(invalid(format!(
                "sector_size ({}) must be a multiple of page_size ({})",
                flash.sector_size, flash.page_size
            )));
        }
        if flash.journal_bytes == 0 || flash.journal_bytes % flash.sector_size != 0 {
            return Err(invalid(format!(
                "journal_bytes ({}) must be a non-zero multiple of sector_size ({})",
                flash.journal_bytes, flash.sector_size
            )));
        }
        if flash.capacity_bytes % flash.sector_size != 0 {
            return Err(invalid(format!(
                "capacity_bytes ({}) must be a multiple of sector_size ({})",
                flash.capacity_bytes, flash.sector_size
            )));
        }
        if flash.journal_bytes >= flash.capacity_bytes {
            return Err(invalid(format!(
                "journal_bytes ({}) must leave room for data in capacity_bytes ({})",
                flash.journal_bytes, flash.capacity_bytes
            )));
        }

        let session = &self.session;
        if session.sample_interval_ms == 0 || session.flush_interval_ms == 0 {
            return Err(invalid(
                "sample_interval_ms and flush_interval_ms must be greater than 0",
            ));
        }
        if session.flush_threshold == 0 || session.flush_threshold > session.buffer_capacity {
            return Err(invalid(format!(
                "flush_threshold ({}) must be between 1 and buffer_capacity ({})",
                session.flush_threshold, session.buffer_capacity
            )));
        }

        let export = &self.export;
        for (name, v) in [("saturation", export.saturation), ("value", export.value)] {
            if !(v > 0.0 && v <= 1.0) {
                return Err(invalid(format!("export.{name} ({v}) must be in (0, 1]")));
            }
        }
        if export.yield_every_lines == 0 {
            return Err(invalid("yield_every_lines must be greater than 0"));
        }

        Ok(())
    }

    /// Get the flash image path, resolving defaults if not set.
    #[must_use]
    pub fn image_path(&self) -> PathBuf {
        self.flash
            .image_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(IMAGE_FILE_NAME))
    }

    /// Device geometry described by the flash section.
    #[must_use]
    pub fn geometry(&self) -> FlashGeometry {
        FlashGeometry {
            capacity: self.flash.capacity_bytes,
            page_size: self.flash.page_size,
            sector_size: self.flash.sector_size,
        }
    }

    /// Journal/data split described by the flash section.
    #[must_use]
    pub fn layout(&self) -> FlashLayout {
        FlashLayout::new(self.flash.journal_bytes, self.flash.capacity_bytes)
    }

    /// Get the sample interval as a Duration.
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.session.sample_interval_ms)
    }

    /// Get the flush interval as a Duration.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.session.flush_interval_ms)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_default_flash_config() {
        let flash = FlashConfig::default();

        assert!(flash.image_path.is_none());
        assert_eq!(flash.capacity_bytes, 4 * 1024 * 1024);
        assert_eq!(flash.page_size, 256);
        assert_eq!(flash.sector_size, 4096);
        assert_eq!(flash.journal_bytes, 64 * 1024);
    }

    #[test]
    fn test_default_session_config() {
        let session = SessionConfig::default();

        assert_eq!(session.sample_interval_ms, 1000);
        assert_eq!(session.flush_interval_ms, 1500);
        assert_eq!(session.buffer_capacity, 512);
        assert_eq!(session.flush_threshold, 256);
    }

    #[test]
    fn test_validate_sector_not_multiple_of_page() {
        let mut config = Config::default();
        config.flash.sector_size = 1000;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sector_size"));
    }

    #[test]
    fn test_validate_page_smaller_than_record() {
        let mut config = Config::default();
        config.flash.page_size = 128;
        config.flash.sector_size = 4096;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("page_size"));
    }

    #[test]
    fn test_validate_journal_fills_device() {
        let mut config = Config::default();
        config.flash.journal_bytes = config.flash.capacity_bytes;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("journal_bytes"));
    }

    #[test]
    fn test_validate_threshold_above_capacity() {
        let mut config = Config::default();
        config.session.flush_threshold = 1024;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("flush_threshold"));
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = Config::default();
        config.session.sample_interval_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sample_interval_ms"));
    }

    #[test]
    fn test_validate_saturation_range() {
        let mut config = Config::default();
        config.export.saturation = 1.5;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("saturation"));
    }

    #[test]
    fn test_image_path_default() {
        let config = Config::default();
        assert!(config.image_path().to_string_lossy().contains("flash.img"));
    }

    #[test]
    fn test_image_path_custom() {
        let mut config = Config::default();
        config.flash.image_path = Some(PathBuf::from("/tmp/card.img"));

        assert_eq!(config.image_path(), PathBuf::from("/tmp/card.img"));
    }

    #[test]
    fn test_layout_from_config() {
        let layout = Config::default().layout();

        assert_eq!(layout.journal, 0..64 * 1024);
        assert_eq!(layout.data, 64 * 1024..4 * 1024 * 1024);
    }

    #[test]
    fn test_intervals() {
        let config = Config::default();

        assert_eq!(config.sample_interval(), Duration::from_secs(1));
        assert_eq!(config.flush_interval(), Duration::from_millis(1500));
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("fieldlog"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[flash]\ncapacity_bytes = 1048576\njournal_bytes = 8192\n\n[session]\nflush_interval_ms = 500\n",
        )
        .unwrap();

        let config = Config::load_from(Some(path)).unwrap();
        assert_eq!(config.flash.capacity_bytes, 1_048_576);
        assert_eq!(config.flash.journal_bytes, 8192);
        assert_eq!(config.session.flush_interval_ms, 500);
        assert_eq!(config.flash.page_size, 256);
    }

    #[test]
    fn test_flash_config_deserialize() {
        let json = r#"{"capacity_bytes": 2097152, "sector_size": 65536}"#;
        let flash: FlashConfig = serde_json::from_str(json).unwrap();
        assert_eq!(flash.capacity_bytes, 2_097_152);
        assert_eq!(flash.sector_size, 65_536);
        assert_eq!(flash.page_size, 256);
    }
}
