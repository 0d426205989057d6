//! Configuration System using Figment
//!
//! Strongly-typed configuration for the acquisition pipeline. Configuration is
//! loaded from:
//! 1. an optional TOML file (base configuration)
//! 2. environment variables (prefixed with `CCD_DAQ_`)
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration that reproduces the hardware's standard timing.
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! CCD_DAQ_APPLICATION__LOG_LEVEL=debug
//! CCD_DAQ_READINESS__TIMEOUT_MS=120000
//! CCD_DAQ_RETRY__DOWNLOAD_RETRIES=2
//! ```
//!
//! # Example
//!
//! ```toml
//! [timing]
//! ready_to_download_ms = 200
//!
//! [readiness]
//! timeout_ms = 600000
//!
//! [retry]
//! download_retries = 2
//! backoff_ms = 500
//!
//! [storage]
//! output_dir = "/data/raw"
//! ```

use crate::acquisition::retry::RetryPolicy;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or merged.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Settle delays between hardware phases
    pub timing: SettleTiming,
    /// Bounds on the readiness wait
    pub readiness: ReadinessConfig,
    /// Retry policy for failed exposures and downloads
    pub retry: RetryPolicy,
    /// Output file settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Fixed settle delays, in milliseconds.
///
/// The camera needs quiet periods between phases that its status signalling
/// does not reflect. The values are constants, not adaptive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleTiming {
    /// After reading the sensor geometry, before applying the subframe
    pub after_geometry_ms: u64,
    /// Between readiness and the download-start command
    pub ready_to_download_ms: u64,
    /// Between download-start and the image fetch
    pub download_to_fetch_ms: u64,
    /// After the image fetch
    pub after_fetch_ms: u64,
    /// Redownload path: before the download-start command
    pub redownload_before_download_ms: u64,
    /// Redownload path: between download-start and the image fetch
    pub redownload_download_to_fetch_ms: u64,
}

impl Default for SettleTiming {
    fn default() -> Self {
        Self {
            after_geometry_ms: 50,
            ready_to_download_ms: 200,
            download_to_fetch_ms: 20,
            after_fetch_ms: 50,
            redownload_before_download_ms: 2000,
            redownload_download_to_fetch_ms: 200,
        }
    }
}

impl SettleTiming {
    /// All delays zero. Useful for simulations and tests.
    pub fn none() -> Self {
        Self {
            after_geometry_ms: 0,
            ready_to_download_ms: 0,
            download_to_fetch_ms: 0,
            after_fetch_ms: 0,
            redownload_before_download_ms: 0,
            redownload_download_to_fetch_ms: 0,
        }
    }
}

/// Readiness wait bounds. The default waits forever, like the hardware SDK.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Give up waiting for readiness after this long (absent = no timeout)
    pub timeout_ms: Option<u64>,
    /// Pause between status queries (0 = query back to back)
    pub poll_interval_ms: u64,
}

impl ReadinessConfig {
    /// Timeout as a duration.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for frames (absent = current directory)
    pub output_dir: Option<PathBuf>,
    /// File extension of generated file names
    pub extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            extension: "fits".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file plus environment variables
    ///
    /// Configuration is loaded in this order of precedence (highest to lowest):
    /// 1. Environment variables (`CCD_DAQ_` prefix)
    /// 2. The TOML file, when given
    /// 3. Built-in defaults
    ///
    /// After loading, configuration is validated.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("CCD_DAQ_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - File extension is not empty
    /// - The redownload path waits longer before downloading than the primary path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.storage.extension.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.extension cannot be empty".to_string(),
            ));
        }

        let t = &self.timing;
        if t.redownload_before_download_ms <= t.ready_to_download_ms
            && (t.redownload_before_download_ms, t.ready_to_download_ms) != (0, 0)
        {
            return Err(ConfigError::ValidationError(format!(
                "timing.redownload_before_download_ms ({}) must be longer than timing.ready_to_download_ms ({})",
                t.redownload_before_download_ms, t.ready_to_download_ms
            )));
        }

        Ok(())
    }

    /// Directory frames are written to.
    pub fn output_dir(&self) -> PathBuf {
        self.storage
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
