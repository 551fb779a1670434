//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
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

/// External encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Path or name of the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Target duration of each HLS segment in seconds
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u32,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_segment_duration_secs() -> u32 {
    6
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            segment_duration_secs: default_segment_duration_secs(),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Number of workers (0 = derive from CPU count)
    #[serde(default)]
    pub count: u32,
    /// Safety-net wake interval for idle workers
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 0,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// On-disk locations for job records and transcoded output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root of the `<collection>/<audio file>/<variant>` output tree
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory holding one JSON file per job
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("transcodes")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("transcode-jobs")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            state_dir: default_state_dir(),
        }
    }
}

/// Progress reporting settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressConfig {
    /// Minimum advance in percentage points before progress is persisted
    #[serde(default = "default_min_step_percent")]
    pub min_step_percent: u8,
}

fn default_min_step_percent() -> u8 {
    5
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_step_percent: default_min_step_percent(),
        }
    }
}

/// Requested bitrates per output variant, clamped to each variant's bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantsConfig {
    #[serde(default = "default_stereo_bitrate_kbps")]
    pub stereo_bitrate_kbps: u32,
    #[serde(default = "default_spatial_bitrate_kbps")]
    pub spatial_bitrate_kbps: u32,
}

fn default_stereo_bitrate_kbps() -> u32 {
    128
}

fn default_spatial_bitrate_kbps() -> u32 {
    384
}

impl Default for VariantsConfig {
    fn default() -> Self {
        Self {
            stereo_bitrate_kbps: default_stereo_bitrate_kbps(),
            spatial_bitrate_kbps: default_spatial_bitrate_kbps(),
        }
    }
}

/// HTTP surface settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub variants: VariantsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
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
    /// - TRANSCODE_FFMPEG_PATH -> encoder.ffmpeg_path
    /// - TRANSCODE_SEGMENT_SECS -> encoder.segment_duration_secs
    /// - TRANSCODE_WORKERS -> workers.count
    /// - TRANSCODE_POLL_INTERVAL_SECS -> workers.poll_interval_secs
    /// - TRANSCODE_OUTPUT_DIR -> storage.output_dir
    /// - TRANSCODE_STATE_DIR -> storage.state_dir
    /// - TRANSCODE_MIN_PROGRESS_STEP -> progress.min_step_percent
    /// - TRANSCODE_BIND -> server.bind
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TRANSCODE_FFMPEG_PATH") {
            if !val.is_empty() {
                self.encoder.ffmpeg_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TRANSCODE_SEGMENT_SECS") {
            if let Ok(secs) = val.parse::<u32>() {
                if secs > 0 {
                    self.encoder.segment_duration_secs = secs;
                }
            }
        }

        if let Ok(val) = env::var("TRANSCODE_WORKERS") {
            if let Ok(count) = val.parse::<u32>() {
                self.workers.count = count;
            }
        }

        if let Ok(val) = env::var("TRANSCODE_POLL_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                if secs > 0 {
                    self.workers.poll_interval_secs = secs;
                }
            }
        }

        if let Ok(val) = env::var("TRANSCODE_OUTPUT_DIR") {
            if !val.is_empty() {
                self.storage.output_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TRANSCODE_STATE_DIR") {
            if !val.is_empty() {
                self.storage.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TRANSCODE_MIN_PROGRESS_STEP") {
            if let Ok(step) = val.parse::<u8>() {
                if (1..=100).contains(&step) {
                    self.progress.min_step_percent = step;
                }
            }
        }

        if let Ok(val) = env::var("TRANSCODE_BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
