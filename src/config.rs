use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{HOUR_MS, MINUTE_MS, Ms};

/// Admission and cancellation tuning. Passed into the engine at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Write attempts per admission, shared by read-time and write-time conflicts.
    pub max_attempts: u32,
    /// Backoff before retry `n` is `base_backoff * n`.
    pub base_backoff: Duration,
    pub min_duration: Ms,
    pub max_duration: Ms,
    pub min_cancellation_notice: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            min_duration: 2 * HOUR_MS,
            max_duration: 24 * HOUR_MS,
            min_cancellation_notice: 30 * MINUTE_MS,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_or("FLEETBOOK_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            base_backoff: Duration::from_millis(env_or(
                "FLEETBOOK_BASE_BACKOFF_MS",
                defaults.base_backoff.as_millis() as u64,
            )),
            min_duration: env_or("FLEETBOOK_MIN_DURATION_MS", defaults.min_duration),
            max_duration: env_or("FLEETBOOK_MAX_DURATION_MS", defaults.max_duration),
            min_cancellation_notice: env_or(
                "FLEETBOOK_MIN_CANCEL_NOTICE_MS",
                defaults.min_cancellation_notice,
            ),
        }
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// How long a writer waits for a resource lock before reporting a transient conflict.
    /// Compaction holds every resource's read lock while it snapshots memory,
    /// but not during its file I/O.
    pub lock_wait: Duration,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            lock_wait: Duration::from_millis(1000),
            compact_threshold: 1000,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("FLEETBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            lock_wait: Duration::from_millis(env_or(
                "FLEETBOOK_LOCK_WAIT_MS",
                defaults.lock_wait.as_millis() as u64,
            )),
            compact_threshold: env_or("FLEETBOOK_COMPACT_THRESHOLD", defaults.compact_threshold),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
