//! Configuration loading for ics-server.
//!
//! Configuration is loaded from a TOML file (default: `ics.toml`). Every
//! section and field has a default, so an empty file is valid.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for ics-server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Connection and handle limits.
    #[serde(default)]
    pub server: ServerConfig,
    /// FastTransfer delivery tuning.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection and handle limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Maximum concurrent connections (default: 256).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum open handles per connection (default: 1024).
    #[serde(default = "default_max_handles_per_connection")]
    pub max_handles_per_connection: usize,
}

/// FastTransfer delivery tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Buffer size used when a client asks for `0xBABE` (default: 32767).
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Soft byte budget for one export production batch (default: 16384).
    #[serde(default = "default_export_batch_bytes")]
    pub export_batch_bytes: usize,
    /// Extra steps added to the initial TotalStepCount estimate (default: 1).
    #[serde(default = "default_progress_margin_steps")]
    pub progress_margin_steps: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive, overridden by `RUST_LOG` (default: "info").
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

// Default value functions
fn default_max_connections() -> usize {
    256
}

fn default_max_handles_per_connection() -> usize {
    1024
}

fn default_max_buffer_size() -> usize {
    32767
}

fn default_export_batch_bytes() -> usize {
    16 * 1024
}

fn default_progress_margin_steps() -> u32 {
    1
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_handles_per_connection: default_max_handles_per_connection(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            export_batch_bytes: default_export_batch_bytes(),
            progress_margin_steps: default_progress_margin_steps(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
