//! Engine configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Which store backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-memory store (tests, embedded experiments; not durable)
    Memory,

    /// Embedded SQLite store
    Sqlite,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    pub backend: StoreBackend,

    /// Database file path (SQLite backend)
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: Some(PathBuf::from("loom.db")),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of cooperative worker loops
    pub count: usize,

    /// Base poll interval when the queue is empty
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Upper bound for the idle-backoff poll interval
    #[serde(with = "duration_millis")]
    pub poll_max_interval: Duration,

    /// Multiplier applied to the poll interval while idle
    pub poll_backoff_multiplier: f64,

    /// How long to wait for in-flight tasks during shutdown
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Age after which a Running task with no progress is requeued
    #[serde(with = "duration_millis")]
    pub stale_task_timeout: Duration,

    /// How often workers scan for stale tasks
    #[serde(with = "duration_millis")]
    pub reclaim_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            poll_interval: Duration::from_millis(500),
            poll_max_interval: Duration::from_secs(5),
            poll_backoff_multiplier: 1.5,
            shutdown_timeout: Duration::from_secs(30),
            stale_task_timeout: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
        }
    }
}

/// Activity execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Retries after the initial attempt
    pub default_retry_count: u32,

    /// Wall-clock timeout per attempt
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,

    /// Upper bound on any retry delay
    #[serde(with = "duration_millis")]
    pub backoff_cap: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            default_retry_count: 3,
            default_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

impl ActivityConfig {
    /// The retry policy implied by these defaults
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retries(self.default_retry_count)
            .with_backoff_base(self.backoff_base)
            .with_backoff_cap(self.backoff_cap)
    }
}

/// Top-level engine configuration
///
/// # Example
///
/// ```
/// use loom_durable::LoomConfig;
/// use std::time::Duration;
///
/// let config = LoomConfig::default()
///     .with_worker_count(8)
///     .with_poll_interval(Duration::from_millis(250));
/// assert_eq!(config.worker.count, 8);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoomConfig {
    /// Store backend selection
    pub store: StoreConfig,

    /// Worker pool tuning
    pub worker: WorkerConfig,

    /// Activity execution defaults
    pub activity: ActivityConfig,
}

impl LoomConfig {
    /// Configure the in-memory store backend
    pub fn in_memory(mut self) -> Self {
        self.store.backend = StoreBackend::Memory;
        self.store.path = None;
        self
    }

    /// Configure the SQLite backend at the given path
    pub fn with_sqlite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.backend = StoreBackend::Sqlite;
        self.store.path = Some(path.into());
        self
    }

    /// Set the worker count
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker.count = count.max(1);
        self
    }

    /// Set the base poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.worker.poll_interval = interval;
        self
    }

    /// Set the default activity retry count
    pub fn with_default_retry_count(mut self, retry_count: u32) -> Self {
        self.activity.default_retry_count = retry_count;
        self
    }

    /// Set the default activity timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.activity.default_timeout = timeout;
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = LoomConfig::default();
        assert_eq!(config.worker.count, 4);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(500));
        assert_eq!(config.activity.default_retry_count, 3);
        assert_eq!(config.activity.default_timeout, Duration::from_secs(30));
        assert_eq!(config.activity.backoff_base, Duration::from_secs(1));
        assert_eq!(config.activity.backoff_cap, Duration::from_secs(300));
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn test_builders() {
        let config = LoomConfig::default()
            .in_memory()
            .with_worker_count(0)
            .with_default_retry_count(5);

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.store.path.is_none());
        // Worker count is clamped to at least one
        assert_eq!(config.worker.count, 1);
        assert_eq!(config.activity.default_retry_count, 5);
    }

    #[test]
    fn test_default_retry_policy() {
        let config = LoomConfig::default().with_default_retry_count(2);
        let policy = config.activity.default_retry_policy();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.backoff_base, Duration::from_secs(1));
        assert_eq!(policy.backoff_cap, Duration::from_secs(300));
    }

    #[test]
    fn test_config_serialization() {
        let config = LoomConfig::default().with_sqlite_path("/tmp/wf.db");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LoomConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.store.path, Some(PathBuf::from("/tmp/wf.db")));
    }
}
