//! Configuration management for the uplink service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the uplink service.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    /// Analysis service and subject identity
    pub service: ServiceConfig,

    /// Change detection configuration
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Batch upload configuration
    #[serde(default)]
    pub batch: BatchConfig,

    /// Event channel configuration
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Directory replay configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote service endpoints and the monitored subject.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Analysis service base URL (e.g., "http://analysis:8000")
    pub base_url: String,

    /// Event channel base URL (e.g., "ws://analysis:8000")
    pub events_url: String,

    /// Subject (patient) identifier
    pub subject_id: String,

    /// Capture device identifier
    #[serde(default)]
    pub source_id: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Change detection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Minimum difference score for a frame to be admitted
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

/// Batch upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Number of buffered frames that triggers a transmission
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time between transmissions in milliseconds
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

/// Event channel reconnection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Reconnect attempts after an unsolicited close (0 = never reconnect)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Fixed delay before each reconnect attempt in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Directory replay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Directory holding the image files to replay
    #[serde(default = "default_capture_directory")]
    pub directory: String,

    /// Interval between captured frames in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// File extensions to pick up (case-insensitive)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Restart from the first file after the last one
    #[serde(default)]
    pub loop_playback: bool,

    /// Maximum captured frames waiting to be sampled
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_request_timeout() -> u64 {
    30
}
fn default_threshold() -> f64 {
    0.15
}
fn default_batch_size() -> usize {
    5
}
fn default_max_wait_ms() -> u64 {
    15_000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    3_000
}
fn default_capture_directory() -> String {
    "frames".to_string()
}
fn default_interval_ms() -> u64 {
    1_000
}
fn default_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}
fn default_queue_size() -> usize {
    16
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            directory: default_capture_directory(),
            interval_ms: default_interval_ms(),
            extensions: default_extensions(),
            loop_playback: false,
            queue_size: default_queue_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn environment() -> Environment {
    // e.g., UPLINK_SERVICE__BASE_URL, UPLINK_CAPTURE__EXTENSIONS=jpg,png
    Environment::with_prefix("UPLINK")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("capture.extensions")
}

impl UplinkConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with UPLINK_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(environment())
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder().add_source(environment()).build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.service.base_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "service.base_url".to_string(),
            ));
        }
        if !self.service.base_url.starts_with("http://")
            && !self.service.base_url.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "service.base_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if self.service.events_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "service.events_url".to_string(),
            ));
        }
        if !self.service.events_url.starts_with("ws://")
            && !self.service.events_url.starts_with("wss://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "service.events_url".to_string(),
                message: "URL must start with ws:// or wss://".to_string(),
            });
        }

        if self.service.subject_id.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "service.subject_id".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detector.threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.threshold".to_string(),
                message: "Threshold must be between 0 and 1".to_string(),
            });
        }

        if self.batch.batch_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "batch.batch_size".to_string(),
                message: "Batch size must be greater than 0".to_string(),
            });
        }

        if self.capture.interval_ms == 0 || self.capture.queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.interval_ms/queue_size".to_string(),
                message: "Interval and queue size must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl ServiceConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl BatchConfig {
    /// Get maximum wait as Duration.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl ChannelConfig {
    /// Get reconnect delay as Duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl CaptureConfig {
    /// Get capture interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn create_test_config() -> UplinkConfig {
        UplinkConfig {
            service: ServiceConfig {
                base_url: "http://analysis:8000".to_string(),
                events_url: "ws://analysis:8000".to_string(),
                subject_id: "patient-12".to_string(),
                source_id: Some("ward-cam-3".to_string()),
                request_timeout_secs: 30,
            },
            detector: DetectorConfig::default(),
            batch: BatchConfig::default(),
            channel: ChannelConfig::default(),
            capture: CaptureConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_base_url() {
        let mut config = create_test_config();
        config.service.base_url = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_events_url() {
        let mut config = create_test_config();
        config.service.events_url = "http://analysis:8000".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_subject_id() {
        let mut config = create_test_config();
        config.service.subject_id = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_threshold_out_of_range() {
        let mut config = create_test_config();
        config.detector.threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));

        config.detector.threshold = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = create_test_config();
        config.batch.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_defaults_from_minimal_file() {
        let raw = r#"
            [service]
            base_url = "https://analysis.example"
            events_url = "wss://analysis.example"
            subject_id = "patient-1"
        "#;

        let config: UplinkConfig = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.service.source_id, None);
        assert_eq!(config.service.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.detector.threshold, 0.15);
        assert_eq!(config.batch.batch_size, 5);
        assert_eq!(config.batch.max_wait(), Duration::from_millis(15_000));
        assert_eq!(config.channel.max_reconnect_attempts, 5);
        assert_eq!(config.channel.reconnect_delay(), Duration::from_millis(3_000));
        assert_eq!(config.capture.extensions, vec!["jpg", "jpeg", "png"]);
        assert_eq!(config.logging.format, "json");
    }
}
