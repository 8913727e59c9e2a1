//! Engine configuration.
//!
//! A single keyed configuration object loaded from a JSON file. Every key
//! has a default, so an empty file (or no file) yields a working debug
//! setup against `bookflow.db` in the current directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file could not be parsed.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn default_max_concurrent_tasks() -> usize {
    10
}
fn default_max_workers() -> usize {
    4
}
fn default_cache_ttl_minutes() -> u64 {
    5
}
fn default_check_every_n() -> u64 {
    10
}
fn default_min_match_score() -> f64 {
    0.6
}
fn default_format_priority() -> Vec<String> {
    ["epub", "mobi", "azw3", "pdf", "txt"]
        .into_iter()
        .map(str::to_string)
        .collect()
}
fn default_stale_hours() -> i64 {
    3
}
fn default_stuck_minutes() -> i64 {
    30
}
fn default_gc_completed_hours() -> i64 {
    2
}
fn default_gc_failed_hours() -> i64 {
    24
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("data/downloads")
}
fn default_store_url() -> PathBuf {
    PathBuf::from("bookflow.db")
}
fn default_http_timeout_secs() -> u64 {
    30
}

/// Quota manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Minutes the cached allowance stays fresh.
    pub cache_ttl_minutes: u64,
    /// Download-gate cadence: re-check quota every N handler invocations.
    pub check_every_n_dispatches: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            cache_ttl_minutes: default_cache_ttl_minutes(),
            check_every_n_dispatches: default_check_every_n(),
        }
    }
}

/// Search stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Score floor in [0, 1] for accepting a candidate.
    pub min_match_score: f64,
    /// Preferred file extensions, best first.
    pub format_priority: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_match_score: default_min_match_score(),
            format_priority: default_format_priority(),
        }
    }
}

/// Scheduler and reconciliation timing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minutes before an `*_ACTIVE` item is considered stuck.
    pub stuck_minutes: i64,
    /// Hours before completed/cancelled task rows are garbage-collected.
    pub task_gc_completed_hours: i64,
    /// Hours before exhausted failed task rows are garbage-collected.
    pub task_gc_failed_hours: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stuck_minutes: default_stuck_minutes(),
            task_gc_completed_hours: default_gc_completed_hours(),
            task_gc_failed_hours: default_gc_failed_hours(),
        }
    }
}

/// External endpoint settings for the default source clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// JSON export of the want-to-read list.
    pub feed_path: Option<PathBuf>,
    /// Base URL of the remote e-book repository API.
    pub repository_url: Option<String>,
    /// Base URL of the library ingest service.
    pub library_url: Option<String>,
    /// Optional webhook for best-effort notifications.
    pub notify_webhook: Option<String>,
}

/// Engine configuration, deserialized from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduler slot count.
    #[serde(rename = "max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Handler worker count.
    #[serde(rename = "pipeline.max_workers")]
    pub max_workers: usize,
    pub quota: QuotaConfig,
    pub search: SearchConfig,
    /// Hours before `DETAIL_FETCHING` items reset to `NEW`.
    #[serde(rename = "detail.stale_hours")]
    pub detail_stale_hours: i64,
    pub scheduler: SchedulerConfig,
    /// File output directory.
    #[serde(rename = "download.dir")]
    pub download_dir: PathBuf,
    /// Path to the SQLite store.
    #[serde(rename = "store.url")]
    pub store_url: PathBuf,
    /// Per-call network timeout for handlers, in seconds.
    #[serde(rename = "http.timeout_secs")]
    pub http_timeout_secs: u64,
    pub endpoints: EndpointsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_workers: default_max_workers(),
            quota: QuotaConfig::default(),
            search: SearchConfig::default(),
            detail_stale_hours: default_stale_hours(),
            scheduler: SchedulerConfig::default(),
            download_dir: default_download_dir(),
            store_url: default_store_url(),
            http_timeout_secs: default_http_timeout_secs(),
            endpoints: EndpointsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] on failure.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies the `--debug` override: single-slot scheduler, one worker.
    #[must_use]
    pub fn with_debug(mut self) -> Self {
        self.max_concurrent_tasks = 1;
        self.max_workers = 1;
        self
    }
}
