//! Runtime configuration for the ingestion engine.
//!
//! Configuration is read through a shared handle at the point of use rather
//! than snapshotted at startup, so a live reload takes effect on the next
//! poll tick, semaphore acquire, or download.

pub mod events;

pub use events::ReloadBroadcaster;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Minimum worker count after clamping.
pub const MIN_WORKERS: u32 = 1;

/// Maximum worker count after clamping.
///
/// The scheduler semaphores are sized to the least common multiple of
/// `1..=16`, so this cap must not be raised without resizing them.
pub const MAX_WORKERS: u32 = 16;

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

/// Scheduler timing and concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often to poll for new jobs, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum number of jobs processed concurrently. Clamped to [1, 16].
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// Maximum number of concurrent image downloads. Clamped to [1, 16].
    #[serde(default = "default_download_workers")]
    pub download_workers: u32,
    /// How long shutdown waits for in-flight jobs, in milliseconds.
    #[serde(default = "default_exit_timeout_ms")]
    pub exit_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_workers() -> u32 {
    3
}

fn default_download_workers() -> u32 {
    5
}

fn default_exit_timeout_ms() -> u64 {
    10_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_workers: default_max_workers(),
            download_workers: default_download_workers(),
            exit_timeout_ms: default_exit_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    pub fn clamped_max_workers(&self) -> u32 {
        self.max_workers.clamp(MIN_WORKERS, MAX_WORKERS)
    }

    pub fn clamped_download_workers(&self) -> u32 {
        self.download_workers.clamp(MIN_WORKERS, MAX_WORKERS)
    }
}

/// Download directories and safety checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Root directory for the primary image store and per-device copies.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Directory for in-progress downloads. A `claw/` subdirectory is created
    /// inside it.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    /// Maximum generated filename length including the extension.
    #[serde(default = "default_filename_max_length")]
    pub filename_max_length: usize,
    #[serde(default)]
    pub stall_monitor: StallMonitorConfig,
    #[serde(default)]
    pub sanity_check: SanityCheckConfig,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./claw")
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_filename_max_length() -> usize {
    100
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            tmp_dir: default_tmp_dir(),
            filename_max_length: default_filename_max_length(),
            stall_monitor: StallMonitorConfig::default(),
            sanity_check: SanityCheckConfig::default(),
        }
    }
}

/// Stall detection for in-flight downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Average throughput (bytes per second) below which a download is
    /// considered stalling.
    #[serde(default = "default_threshold_speed")]
    pub threshold_speed: u64,
    /// How long throughput must stay below the threshold before the download
    /// fails, in milliseconds.
    #[serde(default = "default_threshold_duration_ms")]
    pub threshold_duration_ms: u64,
    /// How long to wait for a single chunk before the download fails, in
    /// milliseconds. Zero disables the no-data detector.
    #[serde(default = "default_no_data_received_duration_ms")]
    pub no_data_received_duration_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_threshold_speed() -> u64 {
    10 * 1024 // 10 KiB/s
}

fn default_threshold_duration_ms() -> u64 {
    10_000
}

fn default_no_data_received_duration_ms() -> u64 {
    10_000
}

impl Default for StallMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_speed: default_threshold_speed(),
            threshold_duration_ms: default_threshold_duration_ms(),
            no_data_received_duration_ms: default_no_data_received_duration_ms(),
        }
    }
}

impl StallMonitorConfig {
    pub fn threshold_duration(&self) -> Duration {
        Duration::from_millis(self.threshold_duration_ms)
    }

    pub fn no_data_received_duration(&self) -> Duration {
        Duration::from_millis(self.no_data_received_duration_ms)
    }
}

/// Minimum-filesize heuristic that detects truncated prior downloads and
/// forces a re-fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanityCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Files smaller than this (bytes) are treated as missing.
    #[serde(default = "default_min_image_filesize")]
    pub min_image_filesize: u64,
}

fn default_min_image_filesize() -> u64 {
    64 * 1024
}

impl Default for SanityCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_image_filesize: default_min_image_filesize(),
        }
    }
}

/// Shared, reloadable configuration handle.
///
/// Readers take a cheap clone of the current tree; `replace` swaps the whole
/// tree at once so a reload is observed atomically.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Config>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Snapshot the current configuration.
    pub fn get(&self) -> Config {
        self.inner.read().clone()
    }

    /// Swap in a new configuration. Callers publish a reload signal afterwards
    /// so long-lived tasks pick up the change.
    pub fn replace(&self, config: Config) {
        *self.inner.write() = config;
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
