//! Engine configuration

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::monitor::{FreezeConfig, TimeoutConfig};
use crate::persistence::StoreConfig;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy, WriteRetryPolicy};
use crate::worker::WorkerPoolConfig;

/// Everything the engine needs, one section per component
///
/// ```
/// use std::time::Duration;
/// use stockdigest_durable::engine::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.pool.pool_size, 3);
/// assert_eq!(config.timeout.processing_timeout, Duration::from_secs(45 * 60));
/// assert_eq!(config.freeze.threshold, Duration::from_secs(5 * 60));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub pool: WorkerPoolConfig,
    pub timeout: TimeoutConfig,
    pub freeze: FreezeConfig,
    pub breaker: CircuitBreakerConfig,
    pub write_retry: WriteRetryPolicy,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by environment variables
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `DATABASE_URL` | `store.database_url` |
    /// | `DB_MAX_CONNECTIONS` | `store.max_connections` |
    /// | `WORKER_ID` | `pool.worker_id` |
    /// | `WORKER_POOL_SIZE` | `pool.pool_size` |
    /// | `QUEUE_TIMEOUT_SECS` | `timeout.queue_timeout` |
    /// | `PROCESSING_TIMEOUT_SECS` | `timeout.processing_timeout` |
    /// | `MONITOR_INTERVAL_SECS` | `timeout.interval`, `freeze.interval` |
    /// | `FREEZE_THRESHOLD_SECS` | `freeze.threshold` |
    /// | `BREAKER_THRESHOLD` | `breaker.failure_threshold` |
    /// | `BREAKER_COOLDOWN_SECS` | `breaker.cooldown` |
    /// | `MAX_RETRIES` | `retry.max_retries` |
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let mut config = Self::default();

        if let Some(url) = vars.string("DATABASE_URL") {
            config.store.database_url = url;
        }
        if let Some(max) = vars.parse("DB_MAX_CONNECTIONS") {
            config.store = config.store.with_max_connections(max);
        }

        if let Some(worker_id) = vars.string("WORKER_ID") {
            config.pool.worker_id = worker_id;
        }
        if let Some(size) = vars.parse("WORKER_POOL_SIZE") {
            config.pool = config.pool.with_pool_size(size);
        }

        if let Some(timeout) = vars.secs("QUEUE_TIMEOUT_SECS") {
            config.timeout.queue_timeout = timeout;
        }
        if let Some(timeout) = vars.secs("PROCESSING_TIMEOUT_SECS") {
            config.timeout.processing_timeout = timeout;
        }
        if let Some(interval) = vars.secs("MONITOR_INTERVAL_SECS") {
            config.timeout.interval = interval;
            config.freeze.interval = interval;
        }
        if let Some(threshold) = vars.secs("FREEZE_THRESHOLD_SECS") {
            config.freeze.threshold = threshold;
        }

        if let Some(threshold) = vars.parse("BREAKER_THRESHOLD") {
            config.breaker = config.breaker.with_failure_threshold(threshold);
        }
        if let Some(cooldown) = vars.secs("BREAKER_COOLDOWN_SECS") {
            config.breaker.cooldown = cooldown;
        }

        if let Some(max_retries) = vars.parse("MAX_RETRIES") {
            config.retry = config.retry.with_max_retries(max_retries);
        }

        if config.freeze.threshold >= config.timeout.processing_timeout {
            warn!(
                freeze_threshold_secs = config.freeze.threshold.as_secs(),
                processing_timeout_secs = config.timeout.processing_timeout.as_secs(),
                "freeze threshold is not shorter than the processing timeout"
            );
        }

        config
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_freeze(mut self, freeze: FreezeConfig) -> Self {
        self.freeze = freeze;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_write_retry(mut self, policy: WriteRetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.string(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable environment variable");
                None
            }
        }
    }

    fn secs(&self, key: &str) -> Option<Duration> {
        self.parse::<u64>(key).map(Duration::from_secs)
    }
}
