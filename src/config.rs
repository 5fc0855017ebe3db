//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `bridge.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - SerialConfig: Port, baud rate, settle delay, read timeout.
//!     - BridgeLoopConfig: How often the bridge polls the device.
//!     - ServiceConfig: Where the data service lives and how long to wait on it.
//!     - ServerConfig: Bind address of the reference data service.
//!     - MonitorConfig: Refresh period of the operator monitor.
//!     - LoggingConfig: Log level, whether readings are logged at info.
//!
//!     every section is optional; missing keys take the defaults below.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::BridgeSettings;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub serial: SerialConfig,
    pub bridge: BridgeLoopConfig,
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    /// e.g. "/dev/ttyACM0" or "COM3"; can also be given on the command line
    pub port: Option<String>,
    pub baud_rate: u32,
    pub settle_ms: u64,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeLoopConfig {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub refresh_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self { port: None, baud_rate: 9600, settle_ms: 2000, read_timeout_ms: 200 }
    }
}

impl Default for BridgeLoopConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 1000 }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { base_url: "http://localhost:8000".to_string(), request_timeout_ms: 5000 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8000".to_string() }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { refresh_seconds: 5 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

/// where the active configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    /// a file was found but could not be used
    Invalid { path: PathBuf, error: String },
    Defaults,
}

impl BridgeConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: BridgeConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load with default fallback
    ///
    /// logging is not up yet when this runs, so the outcome is returned rather
    /// than logged.
    pub fn load_or_default() -> (Self, ConfigSource) {
        let paths = [
            PathBuf::from("config").join("bridge.toml"),
            PathBuf::from("..").join("config").join("bridge.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return match Self::load(path) {
                    Ok(config) => (config, ConfigSource::File(path.clone())),
                    Err(e) => (
                        Self::default(),
                        ConfigSource::Invalid { path: path.clone(), error: e.to_string() },
                    ),
                };
            }
        }

        (Self::default(), ConfigSource::Defaults)
    }

    /// Log configuration summary
    pub fn log_summary(&self, source: &ConfigSource) {
        match source {
            ConfigSource::File(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
            ConfigSource::Invalid { path, error } => {
                tracing::warn!(path = %path.display(), %error, "Failed to load config, using defaults")
            }
            ConfigSource::Defaults => tracing::warn!("No config file found - using defaults"),
        }
        tracing::info!(
            port = self.serial.port.as_deref().unwrap_or("-"),
            baud_rate = self.serial.baud_rate,
            poll_ms = self.bridge.poll_interval_ms,
            service = %self.service.base_url,
            "Configuration"
        );
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
            poll_interval: Duration::from_millis(self.bridge.poll_interval_ms),
            show_sensor_data: self.logging.show_sensor_data,
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.serial.settle_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.service.request_timeout_ms)
    }
}
