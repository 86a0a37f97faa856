use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Log tags the completion marker is scraped from.
pub const DEFAULT_LOG_TAGS: [&str; 5] = [
    "Unity",
    "ActivityManager",
    "PackageManager",
    "dalvikvm",
    "DEBUG",
];

pub const DEFAULT_ACTIVITY_CLASS: &str = "com.unity3d.player.UnityPlayerActivity";

/// Floor for the log polling interval so a zero setting cannot spin on adb.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How the Waiting state collects its result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitMode {
    /// Wait the full duration, then scrape the log once.
    #[default]
    SteadyState,
    /// Poll immediately and record the time until the first marker.
    Startup,
}

impl std::fmt::Display for WaitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitMode::SteadyState => write!(f, "steady-state"),
            WaitMode::Startup => write!(f, "startup"),
        }
    }
}

pub(crate) fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("io", "scenebench", "SceneBench")
        .context("Unable to resolve platform data directory")
}

/// Persistent user configuration for SceneBench.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Explicit adb binary; otherwise resolved from the SDK root or PATH.
    #[serde(default)]
    pub adb_path: Option<PathBuf>,
    /// Where per-device result files are written.
    #[serde(default)]
    pub results_root: Option<PathBuf>,
    /// JSON-L attempt transition log.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
    #[serde(default = "default_activity_class")]
    pub activity_class: String,
    #[serde(default = "default_log_tags")]
    pub log_tags: Vec<String>,
    /// Tag filter for attribute scanning; empty means the unfiltered log.
    #[serde(default)]
    pub attribute_tags: Vec<String>,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub inventory: InventorySettings,
    #[serde(default)]
    pub traces: TraceSettings,
}

fn default_activity_class() -> String {
    DEFAULT_ACTIVITY_CLASS.to_string()
}

fn default_log_tags() -> Vec<String> {
    DEFAULT_LOG_TAGS.iter().map(|tag| tag.to_string()).collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adb_path: None,
            results_root: None,
            event_log: None,
            activity_class: default_activity_class(),
            log_tags: default_log_tags(),
            attribute_tags: Vec::new(),
            timing: TimingSettings::default(),
            store: StoreSettings::default(),
            inventory: InventorySettings::default(),
            traces: TraceSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Resolve the directory holding per-device result files.
    pub fn resolve_results_root(&self) -> Result<PathBuf> {
        if let Some(path) = &self.results_root {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("results"))
    }

    /// Resolve path to the JSON-L attempt event log.
    pub fn resolve_event_log(&self) -> Result<PathBuf> {
        if let Some(path) = &self.event_log {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("events").join("attempts.jsonl"))
    }
}

/// Delays and budgets for talking to the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Pause after clearing app data and after clearing the log buffer.
    #[serde(default = "TimingSettings::default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    #[serde(default = "TimingSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "TimingSettings::default_attribute_timeout_secs")]
    pub attribute_timeout_secs: u64,
    /// Tries per device command before it counts as failed.
    #[serde(default = "TimingSettings::default_device_retry_count")]
    pub device_retry_count: u32,
    #[serde(default = "TimingSettings::default_log_buffer_size")]
    pub log_buffer_size: String,
}

impl TimingSettings {
    const fn default_settle_delay_secs() -> u64 {
        5
    }

    const fn default_poll_interval_ms() -> u64 {
        500
    }

    const fn default_attribute_timeout_secs() -> u64 {
        5
    }

    const fn default_device_retry_count() -> u32 {
        3
    }

    fn default_log_buffer_size() -> String {
        "10M".into()
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            settle_delay_secs: Self::default_settle_delay_secs(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            attribute_timeout_secs: Self::default_attribute_timeout_secs(),
            device_retry_count: Self::default_device_retry_count(),
            log_buffer_size: Self::default_log_buffer_size(),
        }
    }
}

/// Remote metrics store endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "StoreSettings::default_url")]
    pub url: String,
    #[serde(default = "StoreSettings::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl StoreSettings {
    fn default_url() -> String {
        "http://localhost:9200".into()
    }

    const fn default_timeout_secs() -> u64 {
        5
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

/// Optional asset-inventory lookup used to name devices in remote records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventorySettings {
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the inventory API token.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Controls the JSON trace-file export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "TraceSettings::default_max_files")]
    pub max_files: usize,
}

impl TraceSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

/// Immutable per-run configuration handed to every component.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub package: String,
    pub activity_class: String,
    pub device: Option<String>,
    pub cycles: u32,
    pub wait: Duration,
    pub retry_budget: u32,
    pub mode: WaitMode,
    pub index: Option<String>,
    pub capture_screenshots: bool,
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub attribute_timeout: Duration,
    /// Tries per device command, separate from the attempt-level retry budget.
    pub device_retry_count: u32,
    /// Passed to `logcat -G` once per run.
    pub log_buffer_size: String,
    pub log_tags: Vec<String>,
    pub attribute_tags: Vec<String>,
}

impl RunConfig {
    /// Seed a run configuration for `package` from persisted settings.
    pub fn from_settings(package: impl Into<String>, settings: &Settings) -> Self {
        Self {
            package: package.into(),
            activity_class: settings.activity_class.clone(),
            device: None,
            cycles: 1,
            wait: Duration::from_secs(5 * 60),
            retry_budget: 2,
            mode: WaitMode::SteadyState,
            index: None,
            capture_screenshots: false,
            settle_delay: Duration::from_secs(settings.timing.settle_delay_secs),
            poll_interval: Duration::from_millis(settings.timing.poll_interval_ms)
                .max(MIN_POLL_INTERVAL),
            attribute_timeout: Duration::from_secs(settings.timing.attribute_timeout_secs),
            device_retry_count: settings.timing.device_retry_count,
            log_buffer_size: settings.timing.log_buffer_size.clone(),
            log_tags: settings.log_tags.clone(),
            attribute_tags: settings.attribute_tags.clone(),
        }
    }

    /// Fully-qualified launch component, e.g. `com.acme.game/com.unity3d.player.UnityPlayerActivity`.
    pub fn component(&self) -> String {
        format!("{}/{}", self.package, self.activity_class)
    }

    /// Total attempts allowed per (build, cycle).
    pub fn max_attempts(&self) -> u32 {
        self.retry_budget.saturating_add(1)
    }
}

/// Compute the default path to the SceneBench configuration file.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}
