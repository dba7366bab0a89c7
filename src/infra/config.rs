//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument (parsed in main)
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! The file must exist: the session labels and export credentials have no
//! meaningful defaults. Loaded once at start; read-only afterwards.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Path to the capture tool (tshark)
    #[serde(default = "default_tool_path")]
    pub tool_path: String,
    /// Adapter used until discovery finds a better one
    #[serde(default = "default_adapter")]
    pub adapter: String,
    /// Seconds each capture runs
    #[serde(default = "default_capture_duration")]
    pub duration_secs: u64,
    /// Seconds between the start of consecutive cycles (0 = back to back)
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Re-run adapter discovery every N cycles
    #[serde(default = "default_rediscover_every")]
    pub rediscover_every: u32,
    /// Field extracted from each frame
    #[serde(default = "default_field")]
    pub field: String,
    /// Identifiers shorter than this are discarded
    #[serde(default = "default_min_identifier_len")]
    pub min_identifier_len: usize,
    /// Consecutive failed captures before the stage gives up
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Interface name prefix preferred by adapter discovery
    #[serde(default = "default_adapter_prefix")]
    pub adapter_prefix: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            tool_path: default_tool_path(),
            adapter: default_adapter(),
            duration_secs: default_capture_duration(),
            cycle_interval_secs: default_cycle_interval(),
            rediscover_every: default_rediscover_every(),
            field: default_field(),
            min_identifier_len: default_min_identifier_len(),
            max_consecutive_failures: default_max_consecutive_failures(),
            adapter_prefix: default_adapter_prefix(),
        }
    }
}

fn default_tool_path() -> String {
    "/usr/bin/tshark".to_string()
}

fn default_adapter() -> String {
    "wlan1".to_string()
}

fn default_capture_duration() -> u64 {
    45
}

fn default_cycle_interval() -> u64 {
    60
}

fn default_rediscover_every() -> u32 {
    10
}

fn default_field() -> String {
    "wlan.sa".to_string()
}

fn default_min_identifier_len() -> usize {
    crate::domain::types::MAC_LENGTH
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_adapter_prefix() -> String {
    "wlan".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_durations_db")]
    pub durations_db: String,
    #[serde(default = "default_queues_db")]
    pub queues_db: String,
    #[serde(default = "default_www_root")]
    pub www_root: String,
    #[serde(default = "default_images_dir")]
    pub images_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            durations_db: default_durations_db(),
            queues_db: default_queues_db(),
            www_root: default_www_root(),
            images_dir: default_images_dir(),
        }
    }
}

fn default_durations_db() -> String {
    "/www/imls/durations.sqlite".to_string()
}

fn default_queues_db() -> String {
    "/www/imls/queues.sqlite".to_string()
}

fn default_www_root() -> String {
    "/www/imls".to_string()
}

fn default_images_dir() -> String {
    "/www/imls/images".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// First-come-first-served sequence id of this device
    pub fcfs_seq_id: String,
    /// Human-readable tag for the device location
    pub device_tag: String,
    /// How often the sessionizer checks whether the session is complete
    #[serde(default = "default_reset_check")]
    pub reset_check_secs: u64,
    /// Close sessions after this many seconds instead of at local midnight
    #[serde(default)]
    pub reset_interval_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fcfs_seq_id: default_fcfs_seq_id(),
            device_tag: default_device_tag(),
            reset_check_secs: default_reset_check(),
            reset_interval_secs: None,
        }
    }
}

fn default_fcfs_seq_id() -> String {
    "ME0000-001".to_string()
}

fn default_device_tag() -> String {
    "unset".to_string()
}

fn default_reset_check() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_enabled")]
    pub enabled: bool,
    /// Durations endpoint; expected to end with '/'
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Value of the X-Api-Key header
    #[serde(default)]
    pub api_key: String,
    /// Seconds between export passes over the queue
    #[serde(default = "default_export_interval")]
    pub interval_secs: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: default_export_enabled(),
            endpoint: default_endpoint(),
            api_key: String::new(),
            interval_secs: default_export_interval(),
        }
    }
}

fn default_export_enabled() -> bool {
    true
}

fn default_endpoint() -> String {
    "https://api.data.gov/TEST/10x-imls/v2/durations/".to_string()
}

fn default_export_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    /// Seconds between passes over the image queue
    #[serde(default = "default_images_interval")]
    pub interval_secs: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self { interval_secs: default_images_interval() }
    }
}

fn default_images_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    /// Reply budget for stages without long blocking work
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            stage_timeout_secs: default_stage_timeout(),
        }
    }
}

fn default_probe_interval() -> u64 {
    5
}

fn default_stage_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResolverConfig {
    /// Optional OUI file extending the built-in vendor table
    #[serde(default)]
    pub manufacturers_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    capture_tool_path: String,
    capture_adapter: String,
    capture_duration_secs: u64,
    capture_cycle_interval_secs: u64,
    capture_rediscover_every: u32,
    capture_field: String,
    min_identifier_len: usize,
    max_consecutive_capture_failures: u32,
    adapter_prefix: String,
    durations_db: String,
    queues_db: String,
    www_root: String,
    images_dir: String,
    fcfs_seq_id: String,
    device_tag: String,
    reset_check_secs: u64,
    reset_interval_secs: Option<u64>,
    export_enabled: bool,
    export_endpoint: String,
    api_key: String,
    export_interval_secs: u64,
    images_interval_secs: u64,
    probe_interval_secs: u64,
    stage_timeout_secs: u64,
    metrics_interval_secs: u64,
    manufacturers_path: Option<String>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(
            TomlConfig {
                capture: CaptureConfig::default(),
                storage: StorageConfig::default(),
                session: SessionConfig::default(),
                export: ExportConfig::default(),
                images: ImagesConfig::default(),
                supervisor: SupervisorConfig::default(),
                metrics: MetricsConfig::default(),
                resolver: ResolverConfig::default(),
            },
            "default".to_string(),
        )
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            capture_tool_path: toml_config.capture.tool_path,
            capture_adapter: toml_config.capture.adapter,
            capture_duration_secs: toml_config.capture.duration_secs,
            capture_cycle_interval_secs: toml_config.capture.cycle_interval_secs,
            // Zero would disable rediscovery modulo arithmetic
            capture_rediscover_every: toml_config.capture.rediscover_every.max(1),
            capture_field: toml_config.capture.field,
            min_identifier_len: toml_config.capture.min_identifier_len,
            max_consecutive_capture_failures: toml_config.capture.max_consecutive_failures.max(1),
            adapter_prefix: toml_config.capture.adapter_prefix,
            durations_db: toml_config.storage.durations_db,
            queues_db: toml_config.storage.queues_db,
            www_root: toml_config.storage.www_root,
            images_dir: toml_config.storage.images_dir,
            fcfs_seq_id: toml_config.session.fcfs_seq_id,
            device_tag: toml_config.session.device_tag,
            reset_check_secs: toml_config.session.reset_check_secs.max(1),
            reset_interval_secs: toml_config.session.reset_interval_secs,
            export_enabled: toml_config.export.enabled,
            export_endpoint: toml_config.export.endpoint,
            api_key: toml_config.export.api_key,
            export_interval_secs: toml_config.export.interval_secs.max(1),
            images_interval_secs: toml_config.images.interval_secs.max(1),
            probe_interval_secs: toml_config.supervisor.probe_interval_secs.max(1),
            stage_timeout_secs: toml_config.supervisor.stage_timeout_secs,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            manufacturers_path: toml_config.resolver.manufacturers_path,
            config_file,
        }
    }

    /// Config file path when none is given on the command line
    pub fn resolve_config_path() -> String {
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path; a missing file is an error
    pub fn load_from_path(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            anyhow::bail!("config file {path} not found");
        }
        Self::from_file(path)
    }

    /// Load configuration from `CONFIG_FILE` or the default path
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from_path(&Self::resolve_config_path())
    }

    pub fn capture_tool_path(&self) -> &str {
        &self.capture_tool_path
    }

    pub fn capture_adapter(&self) -> &str {
        &self.capture_adapter
    }

    pub fn capture_duration(&self) -> Duration {
        Duration::from_secs(self.capture_duration_secs)
    }

    pub fn capture_cycle_interval(&self) -> Duration {
        Duration::from_secs(self.capture_cycle_interval_secs)
    }

    pub fn capture_rediscover_every(&self) -> u32 {
        self.capture_rediscover_every
    }

    pub fn capture_field(&self) -> &str {
        &self.capture_field
    }

    pub fn min_identifier_len(&self) -> usize {
        self.min_identifier_len
    }

    pub fn max_consecutive_capture_failures(&self) -> u32 {
        self.max_consecutive_capture_failures
    }

    pub fn adapter_prefix(&self) -> &str {
        &self.adapter_prefix
    }

    pub fn durations_db(&self) -> &str {
        &self.durations_db
    }

    pub fn queues_db(&self) -> &str {
        &self.queues_db
    }

    pub fn www_root(&self) -> &str {
        &self.www_root
    }

    pub fn images_dir(&self) -> &str {
        &self.images_dir
    }

    pub fn fcfs_seq_id(&self) -> &str {
        &self.fcfs_seq_id
    }

    pub fn device_tag(&self) -> &str {
        &self.device_tag
    }

    pub fn reset_check(&self) -> Duration {
        Duration::from_secs(self.reset_check_secs)
    }

    pub fn reset_interval_secs(&self) -> Option<u64> {
        self.reset_interval_secs
    }

    pub fn export_enabled(&self) -> bool {
        self.export_enabled
    }

    pub fn export_endpoint(&self) -> &str {
        &self.export_endpoint
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs)
    }

    pub fn images_interval(&self) -> Duration {
        Duration::from_secs(self.images_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn manufacturers_path(&self) -> Option<&str> {
        self.manufacturers_path.as_deref()
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
