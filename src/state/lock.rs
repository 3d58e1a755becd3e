//! Advisory file lock guarding the state file.
//!
//! The lock is a sentinel file created with exclusive-create semantics next to
//! the state file (`<path>.lock`). Acquisition polls on a fixed interval up to
//! a timeout. A sentinel older than the staleness threshold belongs to a
//! crashed holder: it is evicted and acquisition retried once unconditionally
//! before falling back to polling.
//!
//! The staleness threshold must comfortably exceed the slowest single
//! mutation (serialize + rename); it recovers from crashes mid-hold, not from
//! ordinary contention.

use crate::errors::StoreError;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Tuning knobs for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Interval between acquisition attempts.
    pub retry_interval: Duration,
    /// Give up after waiting this long.
    pub acquire_timeout: Duration,
    /// A sentinel older than this is treated as abandoned.
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(100),
            acquire_timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Held advisory lock. Removes the sentinel when dropped.
#[derive(Debug)]
pub struct StateLock {
    sentinel: PathBuf,
}

impl StateLock {
    /// Acquire the lock for the given state file.
    pub async fn acquire(state_path: &Path, settings: &LockSettings) -> Result<Self, StoreError> {
        let sentinel = sentinel_path(state_path);
        let start = Instant::now();

        loop {
            match try_create(&sentinel) {
                Ok(()) => {
                    debug!(path = %sentinel.display(), "Acquired state lock");
                    return Ok(Self { sentinel });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&sentinel, settings.stale_after) {
                        warn!(
                            path = %sentinel.display(),
                            "Evicting stale state lock (holder presumed crashed)"
                        );
                        // Ignore removal errors: another waiter may have
                        // evicted it between our check and this call.
                        let _ = std::fs::remove_file(&sentinel);
                        if try_create(&sentinel).is_ok() {
                            return Ok(Self { sentinel });
                        }
                    }
                }
                Err(source) => {
                    return Err(StoreError::LockIo {
                        path: sentinel,
                        source,
                    });
                }
            }

            if start.elapsed() >= settings.acquire_timeout {
                return Err(StoreError::LockTimeout {
                    path: sentinel,
                    waited: start.elapsed(),
                });
            }
            tokio::time::sleep(settings.retry_interval).await;
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.sentinel) {
            warn!(path = %self.sentinel.display(), error = %e, "Failed to release state lock");
        }
    }
}

/// Sentinel path for a state file.
pub fn sentinel_path(state_path: &Path) -> PathBuf {
    let mut name = state_path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn try_create(sentinel: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(sentinel)?;
    // Holder pid, for operators inspecting a wedged installation.
    let _ = write!(file, "{}", std::process::id());
    Ok(())
}

fn is_stale(sentinel: &Path, stale_after: Duration) -> bool {
    let Ok(meta) = std::fs::metadata(sentinel) else {
        // Sentinel vanished between create attempt and here.
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > stale_after,
        Err(_) => false,
    }
}
