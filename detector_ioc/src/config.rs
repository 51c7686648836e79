/*!
Configuration management for the detector IOC.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::naming::format_template;
use shared::pvdb::{DatabaseDefaults, ARRAY_DATA_CAPACITY};
use shared::table::DEFAULT_SUBSCRIBER_CAPACITY;
use shared::SharedError;
use std::path::Path;
use std::time::Duration;

/// Number of detectors the simulated SDK enumerates
pub const SIMULATED_DEVICE_COUNT: usize = 1;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub detector: DetectorConfig,
    pub defaults: DefaultsConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            server: ServerConfig::default(),
            detector: DetectorConfig::default(),
            defaults: DefaultsConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Reject values the IOC cannot run with
    pub fn validate(&self) -> shared::Result<()> {
        let detector = &self.detector;
        if detector.index >= SIMULATED_DEVICE_COUNT {
            return Err(SharedError::config(format!(
                "detector index {} out of range ({} device available)",
                detector.index, SIMULATED_DEVICE_COUNT
            )));
        }
        let pixels = u64::from(detector.width) * u64::from(detector.height);
        if pixels == 0 || pixels > ARRAY_DATA_CAPACITY as u64 {
            return Err(SharedError::config(format!(
                "detector size {}x{} must be non-empty and at most {} pixels",
                detector.width, detector.height, ARRAY_DATA_CAPACITY
            )));
        }

        if self.server.prefix.is_empty() {
            return Err(SharedError::config("server prefix must not be empty"));
        }
        if self.server.poll_interval_ms == 0 {
            return Err(SharedError::config("poll_interval_ms must be positive"));
        }

        let defaults = &self.defaults;
        if !defaults.acquire_time.is_finite() || defaults.acquire_time < 0.0 {
            return Err(SharedError::config(format!(
                "acquire_time {} must be a non-negative number of seconds",
                defaults.acquire_time
            )));
        }
        if defaults.num_images < 0 {
            return Err(SharedError::config("num_images must not be negative"));
        }
        format_template(&defaults.file_template, &defaults.file_name, 0)?;
        Ok(())
    }

    /// Initial table values for a device with the given identity and size
    pub fn database_defaults(&self, model: &str, width: u32, height: u32) -> DatabaseDefaults {
        let defaults = &self.defaults;
        DatabaseDefaults {
            model: model.to_string(),
            max_size_x: width,
            max_size_y: height,
            acquire_time: defaults.acquire_time,
            num_images: defaults.num_images,
            file_path: defaults.file_path.clone(),
            file_name: defaults.file_name.clone(),
            file_template: defaults.file_template.clone(),
            auto_increment: defaults.auto_increment,
            auto_save: defaults.auto_save,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Access protocol and poll loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP bind address
    pub bind_addr: String,

    /// UDP port to listen on
    pub port: u16,

    /// Prefix clients put in front of every process variable name
    pub prefix: String,

    /// How often changed values are pushed to monitors
    pub poll_interval_ms: u64,

    /// Queue depth between the table and the poll loop
    pub subscriber_capacity: usize,
}

impl ServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 5064,
            prefix: "13PIXET:cam1:".to_string(),
            poll_interval_ms: 100,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// Which detector to open and, for the simulated one, what it looks like
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Index of the enumerated device to open
    pub index: usize,

    pub model: String,

    pub width: u32,

    pub height: u32,

    /// Readout time added to every frame
    pub frame_overhead_ms: u64,
}

impl DetectorConfig {
    pub fn frame_overhead(&self) -> Duration {
        Duration::from_millis(self.frame_overhead_ms)
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            index: 0,
            model: "Simulated Timepix".to_string(),
            width: 256,
            height: 256,
            frame_overhead_ms: 5,
        }
    }
}

/// Initial values of the writable process variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Exposure per frame in seconds
    pub acquire_time: f64,
    pub num_images: i64,
    pub file_path: String,
    pub file_name: String,
    pub file_template: String,
    pub auto_increment: bool,
    pub auto_save: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        let db = DatabaseDefaults::default();
        Self {
            acquire_time: db.acquire_time,
            num_images: db.num_images,
            file_path: db.file_path,
            file_name: db.file_name,
            file_template: db.file_template,
            auto_increment: db.auto_increment,
            auto_save: db.auto_save,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let mut original_config = AppConfig::new();
        original_config.server.port = 6064;
        original_config.defaults.file_path = "/tmp/frames".to_string();

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        assert_eq!(original_config, loaded_config);
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.server.prefix, "13PIXET:cam1:");
        assert_eq!(config.server.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.detector.index, 0);
        assert_eq!((config.detector.width, config.detector.height), (256, 256));
        assert_eq!(config.defaults.acquire_time, 0.1);
        assert_eq!(config.defaults.num_images, 1);
        assert_eq!(config.defaults.file_name, "test");
        assert_eq!(config.defaults.file_template, "%s_%04d.h5");
        assert!(config.defaults.auto_increment);
        assert!(config.defaults.auto_save);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[server]\nport = 7000\n").unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.prefix, "13PIXET:cam1:");
        assert_eq!(config.detector, DetectorConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::new();
        config.detector.index = 3;
        assert!(matches!(config.validate(), Err(SharedError::Config(_))));

        let mut config = AppConfig::new();
        config.detector.width = 4096;
        config.detector.height = 4096;
        assert!(matches!(config.validate(), Err(SharedError::Config(_))));

        let mut config = AppConfig::new();
        config.defaults.acquire_time = -1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::new();
        config.defaults.file_template = "%s_%d_%d".to_string();
        assert!(matches!(config.validate(), Err(SharedError::Template { .. })));
    }

    #[test]
    fn test_database_defaults_carry_device_identity() {
        let mut config = AppConfig::new();
        config.defaults.num_images = 10;

        let db = config.database_defaults("sim", 64, 32);
        assert_eq!(db.model, "sim");
        assert_eq!((db.max_size_x, db.max_size_y), (64, 32));
        assert_eq!(db.num_images, 10);
        assert_eq!(db.file_template, "%s_%04d.h5");
    }
}
