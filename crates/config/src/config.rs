//! Settings snapshot structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// What a worker does when the destination file already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Let the encoder replace the existing file
    #[default]
    Overwrite,
    /// Report success without encoding
    Skip,
    /// Append " (n)" before the extension until the name is free
    Rename,
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::Overwrite => write!(f, "overwrite"),
            DuplicatePolicy::Skip => write!(f, "skip"),
            DuplicatePolicy::Rename => write!(f, "rename"),
        }
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overwrite" => Ok(DuplicatePolicy::Overwrite),
            "skip" => Ok(DuplicatePolicy::Skip),
            "rename" => Ok(DuplicatePolicy::Rename),
            other => Err(format!(
                "unknown duplicate policy '{}' (expected overwrite, skip or rename)",
                other
            )),
        }
    }
}

/// Queue-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum concurrently running conversions (0 = auto-derive from cores)
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    /// Duplicate-destination handling
    #[serde(default)]
    pub on_exists: DuplicatePolicy,
}

fn default_max_parallel() -> u32 {
    2
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            on_exists: DuplicatePolicy::default(),
        }
    }
}

/// Per-format encoder thread counts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadsConfig {
    #[serde(default = "default_codec_threads")]
    pub codec_threads: BTreeMap<String, u32>,
}

fn default_codec_threads() -> BTreeMap<String, u32> {
    ["mp3", "aac", "m4a", "flac", "wav"]
        .iter()
        .map(|fmt| (fmt.to_string(), 1))
        .collect()
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            codec_threads: default_codec_threads(),
        }
    }
}

impl ThreadsConfig {
    /// Thread count for a target format, 1 when the format is not listed
    pub fn threads_for(&self, format: &str) -> u32 {
        self.codec_threads
            .get(&format.to_lowercase())
            .copied()
            .unwrap_or(1)
            .max(1)
    }
}

/// Encoder process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Explicit ffmpeg executable (searched in PATH if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    /// Hard ceiling on running time per encoder process
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Outputs smaller than this are treated as failed conversions
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    /// How often the run loop checks the process
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Liveness progress interval when no real progress was parsed
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Silence on the diagnostic stream before a warning is logged
    #[serde(default = "default_idle_warning_secs")]
    pub idle_warning_secs: u64,
    /// Maximum length of a completion message, in characters
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_min_output_bytes() -> u64 {
    1024
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_idle_warning_secs() -> u64 {
    30
}

fn default_message_limit() -> usize {
    300
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            timeout_secs: default_timeout_secs(),
            min_output_bytes: default_min_output_bytes(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            idle_warning_secs: default_idle_warning_secs(),
            message_limit: default_message_limit(),
        }
    }
}

/// Auto-retry rules.
///
/// Loaded for the front end only: the orchestrator never resubmits failed jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoRetryConfig {
    #[serde(default = "default_auto_retry_enabled")]
    pub enabled: bool,
    #[serde(default = "default_auto_retry_patterns")]
    pub patterns: Vec<String>,
}

fn default_auto_retry_enabled() -> bool {
    true
}

fn default_auto_retry_patterns() -> Vec<String> {
    vec![
        "Error while decoding".to_string(),
        "Invalid data found".to_string(),
        "could not find codec parameters".to_string(),
    ]
}

impl Default for AutoRetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_auto_retry_enabled(),
            patterns: default_auto_retry_patterns(),
        }
    }
}

impl AutoRetryConfig {
    /// Returns the first pattern contained in `message`, if rules are enabled
    pub fn matching_pattern(&self, message: &str) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.patterns
            .iter()
            .find(|p| !p.is_empty() && message.contains(p.as_str()))
            .map(String::as_str)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub threads: ThreadsConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub auto_retry: AutoRetryConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing optional fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - HANDFORGE_MAX_PARALLEL -> queue.max_parallel
    /// - HANDFORGE_ON_EXISTS -> queue.on_exists
    /// - HANDFORGE_FFMPEG_PATH -> encoder.ffmpeg_path
    /// - HANDFORGE_ENCODER_TIMEOUT_SECS -> encoder.timeout_secs
    /// - HANDFORGE_MIN_OUTPUT_BYTES -> encoder.min_output_bytes
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("HANDFORGE_MAX_PARALLEL") {
            if let Ok(n) = val.parse::<u32>() {
                self.queue.max_parallel = n;
            }
        }

        if let Ok(val) = env::var("HANDFORGE_ON_EXISTS") {
            if let Ok(policy) = val.parse::<DuplicatePolicy>() {
                self.queue.on_exists = policy;
            }
        }

        if let Ok(val) = env::var("HANDFORGE_FFMPEG_PATH") {
            if !val.trim().is_empty() {
                self.encoder.ffmpeg_path = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("HANDFORGE_ENCODER_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.encoder.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("HANDFORGE_MIN_OUTPUT_BYTES") {
            if let Ok(bytes) = val.parse::<u64>() {
                self.encoder.min_output_bytes = bytes;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
