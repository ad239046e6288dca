//! Application configuration.
//!
//! Stored as TOML at `$BULKPUT_CONFIG`, or else
//! `~/.config/bulkput/bulkput.toml`. A default file is written on first run.

use std::path::PathBuf;

use bulkput_bundle::BundleConfig;
use serde::{Deserialize, Serialize};

const CONFIG_ENV: &str = "BULKPUT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Local directory tree to upload. Becomes the bundle local root.
    #[serde(default)]
    pub source: Option<PathBuf>,

    /// Directory backing the store.
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    /// Compute content checksums on store lookups.
    #[serde(default = "default_true")]
    pub store_checksums: bool,

    /// Files at least this large bypass bundling and go through the
    /// parallel job scheduler.
    #[serde(default = "default_large_file_size")]
    pub large_file_size: i64,

    /// Thread budget shared by all large-file uploads.
    #[serde(default = "default_parallel_threads")]
    pub parallel_threads: usize,

    /// Remove bundle archives left behind by earlier runs before starting.
    #[serde(default = "default_true")]
    pub clean_leftovers: bool,

    /// Progress logging interval in milliseconds.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,

    /// Append a JSON line per landed entry to this file.
    #[serde(default)]
    pub report_path: Option<PathBuf>,

    #[serde(default)]
    pub bundle: BundleConfig,
}

fn default_store_root() -> PathBuf {
    std::env::temp_dir().join("bulkput-store")
}

fn default_true() -> bool {
    true
}

fn default_large_file_size() -> i64 {
    1024 * 1024 * 1024
}

fn default_parallel_threads() -> usize {
    8
}

fn default_progress_interval() -> u64 {
    1000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source: None,
            store_root: default_store_root(),
            store_checksums: default_true(),
            large_file_size: default_large_file_size(),
            parallel_threads: default_parallel_threads(),
            clean_leftovers: default_true(),
            progress_interval_ms: default_progress_interval(),
            report_path: None,
            bundle: BundleConfig {
                remote_dest: "/zone/home/bulkput/upload".into(),
                ..BundleConfig::default()
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: AppConfig = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration read");
            Ok(config)
        } else {
            let config = AppConfig::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Saves the current configuration to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, toml::to_string_pretty(self)?)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("bulkput")
        .join("bulkput.toml")
}
