//! Configuration module for WCS Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("WCS_PUT_DOMAIN", "https://up.example.com");
/// let result = expand_env_vars("${WCS_PUT_DOMAIN}");
/// assert_eq!(result, "https://up.example.com");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

/// Custom deserializer for strings with environment variable expansion.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

/// Same as [`deserialize_with_env`] for optional values.
fn deserialize_option_with_env<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    Ok(s.map(|s| expand_env_vars(&s)))
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub record: RecordConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub tracing: Option<TracingConfig>,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Build a configuration that only names the upload domain, everything
    /// else at its default.
    pub fn with_put_domain(put_domain: impl Into<String>) -> Self {
        Self {
            endpoint: EndpointConfig {
                put_domain: put_domain.into(),
                connect_timeout_seconds: default_connect_timeout(),
                request_timeout_seconds: default_request_timeout(),
                user_agent: None,
            },
            upload: UploadConfig::default(),
            record: RecordConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            tracing: None,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.endpoint.put_domain) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid put_domain '{}': must start with http:// or https://",
                self.endpoint.put_domain
            )));
        }

        if self.endpoint.request_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_seconds must be greater than zero".into(),
            ));
        }

        self.upload.validate()?;

        if self.record.dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "Record directory cannot be empty".into(),
            ));
        }

        if let Some(ref tracing) = self.tracing {
            if tracing.enabled {
                if !is_valid_http_url(&tracing.otlp.endpoint) {
                    return Err(ConfigError::ValidationError(
                        "Invalid OTLP endpoint: must start with http:// or https://".into(),
                    ));
                }

                if tracing.service_name.trim().is_empty() {
                    return Err(ConfigError::ValidationError(
                        "Service name cannot be empty when tracing is enabled".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Remote upload endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Upload domain, e.g. `https://example.up0.v1.wcsapi.com`.
    /// Supports ${VAR} expansion.
    #[serde(deserialize_with = "deserialize_with_env")]
    pub put_domain: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// Upper bound for a single mkblk/bput/mkfile round trip. A call that
    /// does not answer in time counts as a timeout and is retried.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl EndpointConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Calls per block before a run of timeouts becomes fatal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_millis: u64,
}

impl UploadConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_millis)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || self.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "block_size and chunk_size must be greater than zero".into(),
            ));
        }

        if self.chunk_size > self.block_size {
            return Err(ConfigError::ValidationError(format!(
                "chunk_size {} exceeds block_size {}",
                self.chunk_size, self.block_size
            )));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_attempts must be at least 1".into(),
            ));
        }

        if self.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "concurrency must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            chunk_size: default_chunk_size(),
            max_attempts: default_max_attempts(),
            concurrency: default_concurrency(),
            retry_backoff_millis: default_retry_backoff(),
        }
    }
}

fn default_block_size() -> u64 {
    4194304 // 4MB
}

fn default_chunk_size() -> u64 {
    4194304 // 4MB
}

fn default_max_attempts() -> u32 {
    3
}

fn default_concurrency() -> usize {
    5
}

fn default_retry_backoff() -> u64 {
    200
}

/// Resume record configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Directory holding `<key>.rcd` state logs and `<key>.log` event logs.
    #[serde(default = "default_record_dir")]
    pub dir: PathBuf,
    /// `fsync` the state log after every snapshot.
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            dir: default_record_dir(),
            sync_writes: default_sync_writes(),
        }
    }
}

fn default_record_dir() -> PathBuf {
    std::env::temp_dir().join("wcs-uploadr")
}

fn default_sync_writes() -> bool {
    true
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Upload token handed out by the signing service.
    /// Supports ${VAR} expansion.
    #[serde(default, deserialize_with = "deserialize_option_with_env")]
    pub upload_token: Option<String>,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

// ============================================================================
// Tracing Configuration
// ============================================================================

/// OpenTelemetry distributed tracing configuration.
///
/// # Example
///
/// ```yaml
/// tracing:
///   enabled: true
///   service_name: "wcs-uploadr"
///   otlp:
///     endpoint: "http://localhost:4317"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Enable or disable tracing. Default: false
    #[serde(default)]
    pub enabled: bool,

    /// Service name for trace identification. Supports ${VAR} and ${VAR:-default} expansion.
    #[serde(
        default = "default_service_name",
        deserialize_with = "deserialize_with_env"
    )]
    pub service_name: String,

    #[serde(default)]
    pub otlp: OtlpConfig,
}

fn default_service_name() -> String {
    "wcs-uploadr".to_string()
}

/// OTLP exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtlpConfig {
    /// OTLP collector endpoint URL. Supports ${VAR} expansion.
    #[serde(deserialize_with = "deserialize_with_env")]
    pub endpoint: String,

    /// Timeout for OTLP export in seconds. Default: 10
    #[serde(default = "default_otlp_timeout")]
    pub timeout_seconds: u64,
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_seconds: default_otlp_timeout(),
        }
    }
}

fn default_otlp_timeout() -> u64 {
    10
}
