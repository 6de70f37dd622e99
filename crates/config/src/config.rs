//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values parsed but are not usable together
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
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

/// Watched source directory settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Directory holding the media pool (not walked recursively)
    #[serde(default = "default_watch_dir")]
    pub watch_dir: PathBuf,
    /// Accepted extensions, without the leading dot, compared case-insensitively
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// File name of the concat manifest written inside `watch_dir`
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("streamer_1/raw")
}

fn default_extensions() -> Vec<String> {
    vec!["mp4".to_string(), "mkv".to_string(), "mov".to_string()]
}

fn default_manifest_name() -> String {
    "file_list.txt".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            watch_dir: default_watch_dir(),
            extensions: default_extensions(),
            manifest_name: default_manifest_name(),
        }
    }
}

impl SourceConfig {
    /// Full path of the manifest file
    pub fn manifest_path(&self) -> PathBuf {
        self.watch_dir.join(&self.manifest_name)
    }

    /// Whether a file called `name` would be picked up as media
    pub fn is_media_name(&self, name: &str) -> bool {
        let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = ext.to_lowercase();
        self.extensions
            .iter()
            .any(|e| e.trim().trim_start_matches('.').to_lowercase() == ext)
    }
}

/// Outbound stream and cycle settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// Network sink the encoder publishes to
    #[serde(default = "default_sink_url")]
    pub sink_url: String,
    /// Maximum number of files handed to one encoder invocation
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Inventory size needed before a cycle starts
    #[serde(default = "default_min_media")]
    pub min_media: usize,
    /// Oldest files removed after each completed cycle
    #[serde(default = "default_delete_count")]
    pub delete_count: usize,
}

fn default_sink_url() -> String {
    "rtmp://localhost:1935/live".to_string()
}

fn default_batch_size() -> usize {
    5
}

fn default_min_media() -> usize {
    1
}

fn default_delete_count() -> usize {
    2
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sink_url: default_sink_url(),
            batch_size: default_batch_size(),
            min_media: default_min_media(),
            delete_count: default_delete_count(),
        }
    }
}

/// External encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable, resolved through PATH when not absolute
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_tune")]
    pub tune: String,
    /// Target and maximum video bitrate in kbit/s
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    /// Rate control buffer size in kbit
    #[serde(default = "default_bufsize_kbps")]
    pub bufsize_kbps: u32,
    /// Muxer used for the live payload
    #[serde(default = "default_output_format")]
    pub output_format: String,
    /// Kill an encoder invocation after this many seconds (unset: wait forever)
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_tune() -> String {
    "zerolatency".to_string()
}

fn default_bitrate_kbps() -> u32 {
    3000
}

fn default_bufsize_kbps() -> u32 {
    6000
}

fn default_output_format() -> String {
    "flv".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            video_codec: default_video_codec(),
            preset: default_preset(),
            tune: default_tune(),
            bitrate_kbps: default_bitrate_kbps(),
            bufsize_kbps: default_bufsize_kbps(),
            output_format: default_output_format(),
            job_timeout_secs: None,
        }
    }
}

impl EncoderConfig {
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

/// Delays used by the watcher and the idle loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Pause after a filesystem event before the file is looked at
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// First wait while the inventory is below the threshold
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound of the idle backoff; equal to `poll_interval_secs` means a fixed wait
    #[serde(default = "default_max_poll_interval_secs")]
    pub max_poll_interval_secs: u64,
    /// Capacity of the watcher -> orchestrator signal queue
    #[serde(default = "default_signal_queue_capacity")]
    pub signal_queue_capacity: usize,
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_poll_interval_secs() -> u64 {
    30
}

fn default_signal_queue_capacity() -> usize {
    8
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_interval_secs: default_max_poll_interval_secs(),
            signal_queue_capacity: default_signal_queue_capacity(),
        }
    }
}

impl TimingConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs(self.max_poll_interval_secs)
    }
}

/// Viewer sampler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewersConfig {
    /// First port sampled (inclusive)
    #[serde(default = "default_port_start")]
    pub port_start: u16,
    /// End of the sampled range (exclusive)
    #[serde(default = "default_port_end")]
    pub port_end: u16,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_port_start() -> u16 {
    1935
}

fn default_port_end() -> u16 {
    1950
}

fn default_check_interval_secs() -> u64 {
    5
}

impl Default for ViewersConfig {
    fn default() -> Self {
        Self {
            port_start: default_port_start(),
            port_end: default_port_end(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl ViewersConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Relegation timer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelegationConfig {
    /// Directory renamed to `<name>_relegated` once the delay elapses
    #[serde(default = "default_target_dir")]
    pub target_dir: PathBuf,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

fn default_target_dir() -> PathBuf {
    PathBuf::from("streamer_1")
}

fn default_delay_secs() -> u64 {
    60
}

impl Default for RelegationConfig {
    fn default() -> Self {
        Self {
            target_dir: default_target_dir(),
            delay_secs: default_delay_secs(),
        }
    }
}

impl RelegationConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Status endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_status_enabled() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:7979".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            bind_addr: default_bind_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub viewers: ViewersConfig,
    #[serde(default)]
    pub relegation: RelegationConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and fills missing optional fields with defaults.
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
    /// - LOOPCAST_WATCH_DIR -> source.watch_dir
    /// - LOOPCAST_SINK_URL -> stream.sink_url
    /// - LOOPCAST_BATCH_SIZE -> stream.batch_size
    /// - LOOPCAST_MIN_MEDIA -> stream.min_media
    /// - LOOPCAST_DELETE_COUNT -> stream.delete_count
    /// - LOOPCAST_SETTLE_DELAY_MS -> timing.settle_delay_ms
    /// - LOOPCAST_POLL_INTERVAL_SECS -> timing.poll_interval_secs
    /// - LOOPCAST_FFMPEG_PATH -> encoder.ffmpeg_path
    /// - LOOPCAST_JOB_TIMEOUT_SECS -> encoder.job_timeout_secs
    /// - LOOPCAST_STATUS_ADDR -> status.bind_addr
    ///
    /// Values that do not parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = non_empty_var("LOOPCAST_WATCH_DIR") {
            self.source.watch_dir = PathBuf::from(val);
        }

        if let Some(val) = non_empty_var("LOOPCAST_SINK_URL") {
            self.stream.sink_url = val;
        }

        if let Some(n) = parsed_var::<usize>("LOOPCAST_BATCH_SIZE") {
            self.stream.batch_size = n;
        }

        if let Some(n) = parsed_var::<usize>("LOOPCAST_MIN_MEDIA") {
            self.stream.min_media = n;
        }

        if let Some(n) = parsed_var::<usize>("LOOPCAST_DELETE_COUNT") {
            self.stream.delete_count = n;
        }

        if let Some(ms) = parsed_var::<u64>("LOOPCAST_SETTLE_DELAY_MS") {
            self.timing.settle_delay_ms = ms;
        }

        if let Some(secs) = parsed_var::<u64>("LOOPCAST_POLL_INTERVAL_SECS") {
            self.timing.poll_interval_secs = secs;
            // A raised poll interval drags the backoff ceiling along with it
            if self.timing.max_poll_interval_secs < secs {
                self.timing.max_poll_interval_secs = secs;
            }
        }

        if let Some(val) = non_empty_var("LOOPCAST_FFMPEG_PATH") {
            self.encoder.ffmpeg_path = PathBuf::from(val);
        }

        if let Some(secs) = parsed_var::<u64>("LOOPCAST_JOB_TIMEOUT_SECS") {
            // 0 switches the timeout off
            self.encoder.job_timeout_secs = if secs == 0 { None } else { Some(secs) };
        }

        if let Some(val) = non_empty_var("LOOPCAST_STATUS_ADDR") {
            self.status.bind_addr = val;
        }
    }

    /// Check that the settings can drive a pipeline
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.batch_size == 0 {
            return Err(ConfigError::Invalid("stream.batch_size must be at least 1".into()));
        }
        if self.stream.min_media == 0 {
            return Err(ConfigError::Invalid("stream.min_media must be at least 1".into()));
        }
        if self.source.extensions.iter().all(|e| e.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "source.extensions must name at least one extension".into(),
            ));
        }
        if self.source.manifest_name.trim().is_empty() {
            return Err(ConfigError::Invalid("source.manifest_name must not be empty".into()));
        }
        if self.source.is_media_name(&self.source.manifest_name) {
            return Err(ConfigError::Invalid(format!(
                "source.manifest_name {} has a media extension and would be streamed as media",
                self.source.manifest_name
            )));
        }
        if self.stream.sink_url.trim().is_empty() {
            return Err(ConfigError::Invalid("stream.sink_url must not be empty".into()));
        }
        if self.viewers.port_start >= self.viewers.port_end {
            return Err(ConfigError::Invalid(format!(
                "viewers port range {}..{} is empty",
                self.viewers.port_start, self.viewers.port_end
            )));
        }
        if self.timing.max_poll_interval_secs < self.timing.poll_interval_secs {
            return Err(ConfigError::Invalid(
                "timing.max_poll_interval_secs must not be below timing.poll_interval_secs".into(),
            ));
        }
        if self.timing.signal_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "timing.signal_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides, for runs without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
