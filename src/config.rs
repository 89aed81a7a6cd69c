//! Configuration - `~/.devmaster/config.yml`
//!
//! Every field has a default, so an empty or missing file is valid.

use crate::core::DEFAULT_INTERVAL_MS;
use crate::workspace::{Scanner, DEFAULT_IGNORED_DIRS, DEFAULT_MAX_DEPTH};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Resource sampling period
    pub monitor_interval_ms: u64,
    /// Runner used when a start request names none
    pub default_runner: String,
    /// Extra environment for every spawned task, applied over `FORCE_COLOR=1`
    pub env: HashMap<String, String>,
    /// Time given to kills to land before the process exits
    pub shutdown_grace_ms: u64,
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_depth: usize,
    pub ignored_dirs: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor_interval_ms: DEFAULT_INTERVAL_MS,
            default_runner: "npm".to_string(),
            env: HashMap::new(),
            shutdown_grace_ms: 500,
            scan: ScanConfig::default(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            ignored_dirs: DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Config {
    /// Get the default config path
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".devmaster")
            .join("config.yml")
    }

    /// Load an explicit file, or the default file if present, or defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(self.scan.max_depth, self.scan.ignored_dirs.iter().cloned())
    }
}
