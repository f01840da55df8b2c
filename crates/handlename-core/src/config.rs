//! Configuration management for handlename
//!
//! Handles loading and validation of `handlename.toml` configuration files.
//! Every section and field has a default, so an empty file is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Config file name looked up in the user config directory.
pub const CONFIG_FILE_NAME: &str = "handlename.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Resolver and cache settings
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// DOM reconciler settings
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Trigger scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Data directory; relative cache paths are resolved against it
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("handlename")
}

/// Resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Origin that channel page paths are appended to
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Cache entry lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Quiet period before a snapshot write, in milliseconds
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// User agent sent with page requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Key the snapshot is stored under
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    /// Snapshot file; relative paths resolve against `general.data_dir`
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ttl_secs: default_ttl_secs(),
            persist_debounce_ms: default_persist_debounce_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
            storage_key: default_storage_key(),
            cache_file: default_cache_file(),
        }
    }
}

impl ResolverConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://www.youtube.com".to_string()
}

fn default_ttl_secs() -> u64 {
    12 * 60 * 60
}

fn default_persist_debounce_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    crate::fetch::DEFAULT_USER_AGENT.to_string()
}

fn default_storage_key() -> String {
    "display_name_cache_v3".to_string()
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("cache.json")
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Elements that carry identity mentions
    #[serde(default = "default_anchor_selector")]
    pub anchor_selector: String,

    /// Preferred text target inside an anchor
    #[serde(default = "default_target_selector")]
    pub target_selector: String,

    /// Re-requests allowed after a transient bridge failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Minimum spacing between attempts for one key, in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Passes a key may stay unresolved before it is reported
    #[serde(default = "default_unresolved_report_after")]
    pub unresolved_report_after: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            anchor_selector: default_anchor_selector(),
            target_selector: default_target_selector(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            unresolved_report_after: default_unresolved_report_after(),
        }
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

fn default_anchor_selector() -> String {
    "a#name, a#author-text".to_string()
}

fn default_target_selector() -> String {
    "yt-formatted-string.author-text".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    4000
}

fn default_unresolved_report_after() -> u32 {
    3
}

/// Trigger scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Quiet period after DOM mutations, in milliseconds
    #[serde(default = "default_mutation_debounce_ms")]
    pub mutation_debounce_ms: u64,

    /// Minimum spacing of scroll-triggered passes, in milliseconds
    #[serde(default = "default_scroll_throttle_ms")]
    pub scroll_throttle_ms: u64,

    /// Fallback pass interval, in milliseconds
    #[serde(default = "default_fallback_interval_ms")]
    pub fallback_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mutation_debounce_ms: default_mutation_debounce_ms(),
            scroll_throttle_ms: default_scroll_throttle_ms(),
            fallback_interval_ms: default_fallback_interval_ms(),
        }
    }
}

fn default_mutation_debounce_ms() -> u64 {
    100
}

fn default_scroll_throttle_ms() -> u64 {
    300
}

fn default_fallback_interval_ms() -> u64 {
    10_000
}

impl Config {
    /// Default config file location (`$XDG_CONFIG_HOME/handlename/handlename.toml`).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("handlename").join(CONFIG_FILE_NAME))
    }

    /// Load configuration from the default location, falling back to
    /// defaults when no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration text
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = url::Url::parse(&self.resolver.base_url).map_err(|err| {
            ConfigError::Invalid(format!(
                "resolver.base_url {:?}: {err}",
                self.resolver.base_url
            ))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "resolver.base_url must be http or https, got {}",
                base.scheme()
            )));
        }
        if self.resolver.ttl_secs == 0 {
            return Err(ConfigError::Invalid("resolver.ttl_secs must be > 0".into()));
        }
        if self.resolver.persist_debounce_ms == 0 {
            return Err(ConfigError::Invalid(
                "resolver.persist_debounce_ms must be > 0".into(),
            ));
        }
        if self.resolver.storage_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "resolver.storage_key must not be empty".into(),
            ));
        }
        if crate::dom::Selector::parse(&self.reconciler.anchor_selector).is_none() {
            return Err(ConfigError::Invalid(format!(
                "reconciler.anchor_selector {:?} is not a supported selector",
                self.reconciler.anchor_selector
            )));
        }
        if crate::dom::Selector::parse(&self.reconciler.target_selector).is_none() {
            return Err(ConfigError::Invalid(format!(
                "reconciler.target_selector {:?} is not a supported selector",
                self.reconciler.target_selector
            )));
        }
        Ok(())
    }

    /// Absolute path of the snapshot file
    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        if self.resolver.cache_file.is_absolute() {
            self.resolver.cache_file.clone()
        } else {
            self.general.data_dir.join(&self.resolver.cache_file)
        }
    }
}
