//! Configuration consumed by the dispatch core.
//!
//! Read from a TOML file with serde defaults for every field, so an empty or
//! missing section still yields a working config:
//!
//! ```toml
//! max_rework_attempts = 2
//! profile = "default"
//! state_path = "/var/lib/overseer/state.json"
//! run_timeout_secs = 1800
//!
//! [lock]
//! retry_interval_ms = 100
//! acquire_timeout_secs = 10
//! stale_after_secs = 30
//! ```

use crate::state::lock::LockSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default run timeout (30 minutes), matching the executor's hard ceiling.
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverseerConfig {
    /// How many rework cycles a failing dispatch gets before escalation.
    #[serde(default = "default_max_rework_attempts")]
    pub max_rework_attempts: u32,
    /// Execution profile handed to the run executor.
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Path of the persisted state file.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Hard timeout passed to the run executor per run.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_lock_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_lock_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_max_rework_attempts() -> u32 {
    2
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_state_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("overseer")
        .join("state.json")
}

fn default_run_timeout_secs() -> u64 {
    DEFAULT_RUN_TIMEOUT_SECS
}

fn default_lock_retry_interval_ms() -> u64 {
    100
}

fn default_lock_acquire_timeout_secs() -> u64 {
    10
}

fn default_lock_stale_after_secs() -> u64 {
    30
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            max_rework_attempts: default_max_rework_attempts(),
            profile: default_profile(),
            state_path: default_state_path(),
            run_timeout_secs: default_run_timeout_secs(),
            lock: LockConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_lock_retry_interval_ms(),
            acquire_timeout_secs: default_lock_acquire_timeout_secs(),
            stale_after_secs: default_lock_stale_after_secs(),
        }
    }
}

impl OverseerConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            retry_interval: Duration::from_millis(self.lock.retry_interval_ms),
            acquire_timeout: Duration::from_secs(self.lock.acquire_timeout_secs),
            stale_after: Duration::from_secs(self.lock.stale_after_secs),
        }
    }
}
