//! System-level circuit breaker
//!
//! Halts new claims after repeated system failures (store outages, resource
//! exhaustion) while ignoring business failures of individual jobs. State
//! lives in the store so every worker sharing it sees the same gate.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::persistence::{BreakerRecord, JobStore, StoreError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, claims allowed
    Closed,

    /// Failure threshold reached, claims refused
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CircuitState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            other => Err(StoreError::Database(format!(
                "unknown circuit state: {}",
                other
            ))),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  consecutive system failures  ┌─────────┐
/// │ Closed  │ ────────────────────────────► │  Open   │
/// └─────────┘                               └─────────┘
///      ▲                                         │
///      └──────── cool-down / admin reset ────────┘
/// ```
///
/// # Example
///
/// ```
/// use stockdigest_durable::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_cooldown(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive system-level failures required to open the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before claims resume on their own
    #[serde(with = "crate::duration_millis")]
    pub cooldown: Duration,

    /// How long a worker may serve breaker reads from its local cache
    #[serde(with = "crate::duration_millis")]
    pub cache_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(5 * 60),
            cache_duration: Duration::from_secs(1),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the cool-down after which an open circuit closes by itself
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set the local cache duration (zero disables caching)
    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = duration;
        self
    }
}

/// Error types for circuit breaker operations
#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, claims are not allowed
    #[error("circuit breaker is open until {retry_at} after {consecutive_failures} system failures")]
    Open {
        opened_at: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        consecutive_failures: u32,
    },

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
struct CachedRecord {
    record: BreakerRecord,
    cached_at: DateTime<Utc>,
}

impl CachedRecord {
    fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now()
            .signed_duration_since(self.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        max_age.is_zero() || age > max_age
    }
}

/// Store-backed circuit breaker in front of the claim protocol
///
/// ```ignore
/// let breaker = SystemCircuitBreaker::new(CircuitBreakerConfig::default(), store);
///
/// match breaker.allow_claim().await {
///     Ok(()) => { /* claim_next */ }
///     Err(CircuitBreakerError::Open { retry_at, .. }) => { /* back off */ }
///     Err(e) => return Err(e),
/// }
/// ```
pub struct SystemCircuitBreaker {
    config: CircuitBreakerConfig,
    store: Arc<dyn JobStore>,
    /// Local cache to reduce database reads
    local_cache: RwLock<Option<CachedRecord>>,
}

impl SystemCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            store,
            local_cache: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Gate a claim attempt
    ///
    /// An open circuit whose cool-down has elapsed is closed here, so claims
    /// resume without operator action.
    pub async fn allow_claim(&self) -> Result<(), CircuitBreakerError> {
        self.allow_claim_at(Utc::now()).await
    }

    pub async fn allow_claim_at(&self, now: DateTime<Utc>) -> Result<(), CircuitBreakerError> {
        let record = self.record().await?;

        match record.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = record.opened_at.unwrap_or(record.updated_at);
                let retry_at = self.retry_at(opened_at);
                if now >= retry_at {
                    info!(%opened_at, "circuit breaker cool-down elapsed, closing");
                    self.store.close_breaker().await?;
                    self.invalidate().await;
                    Ok(())
                } else {
                    Err(CircuitBreakerError::Open {
                        opened_at,
                        retry_at,
                        consecutive_failures: record.consecutive_failures,
                    })
                }
            }
        }
    }

    /// Whether claims are currently being refused
    pub async fn is_open(&self) -> Result<bool, CircuitBreakerError> {
        match self.allow_claim().await {
            Ok(()) => Ok(false),
            Err(CircuitBreakerError::Open { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Current persisted state
    pub async fn state(&self) -> Result<BreakerRecord, CircuitBreakerError> {
        Ok(self.store.load_breaker().await?)
    }

    /// A job finished without a system-level failure
    pub async fn record_success(&self) -> Result<(), CircuitBreakerError> {
        let record = self.store.record_breaker_success().await?;
        self.remember(record).await;
        Ok(())
    }

    /// Count one system-level failure; returns the resulting state
    pub async fn record_system_failure(&self) -> Result<CircuitState, CircuitBreakerError> {
        let record = self
            .store
            .record_breaker_failure(self.config.failure_threshold, Utc::now())
            .await?;

        if record.state == CircuitState::Open {
            warn!(
                consecutive_failures = record.consecutive_failures,
                threshold = self.config.failure_threshold,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit breaker open, new claims refused"
            );
        }

        let state = record.state;
        self.remember(record).await;
        Ok(state)
    }

    /// Administrative reset: force closed with a zero counter
    pub async fn reset(&self) -> Result<BreakerRecord, CircuitBreakerError> {
        let record = self.store.close_breaker().await?;
        info!("circuit breaker reset");
        self.remember(record.clone()).await;
        Ok(record)
    }

    fn retry_at(&self, opened_at: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.cooldown)
            .ok()
            .and_then(|c| opened_at.checked_add_signed(c))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn record(&self) -> Result<BreakerRecord, CircuitBreakerError> {
        {
            let cache = self.local_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if !cached.is_stale(self.config.cache_duration) {
                    return Ok(cached.record.clone());
                }
            }
        }

        let record = self.store.load_breaker().await?;
        self.remember(record.clone()).await;
        Ok(record)
    }

    async fn remember(&self, record: BreakerRecord) {
        *self.local_cache.write().await = Some(CachedRecord {
            record,
            cached_at: Utc::now(),
        });
    }

    async fn invalidate(&self) {
        *self.local_cache.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryJobStore;

    fn create_test_breaker(cooldown: Duration) -> SystemCircuitBreaker {
        let store = Arc::new(InMemoryJobStore::new());
        SystemCircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_cooldown(cooldown)
                .with_cache_duration(Duration::ZERO),
            store,
        )
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.cooldown, Duration::from_secs(300));
    }

    #[test]
    fn test_config_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["cooldown"], 300_000);
        let parsed: CircuitBreakerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!("open".parse::<CircuitState>().unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let breaker = create_test_breaker(Duration::from_secs(300));
        assert!(breaker.allow_claim().await.is_ok());
        assert_eq!(breaker.state().await.unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_three_system_failures() {
        let breaker = create_test_breaker(Duration::from_secs(300));

        assert_eq!(
            breaker.record_system_failure().await.unwrap(),
            CircuitState::Closed
        );
        assert_eq!(
            breaker.record_system_failure().await.unwrap(),
            CircuitState::Closed
        );
        assert_eq!(
            breaker.record_system_failure().await.unwrap(),
            CircuitState::Open
        );

        let result = breaker.allow_claim().await;
        assert!(matches!(
            result,
            Err(CircuitBreakerError::Open {
                consecutive_failures: 3,
                ..
            })
        ));
        assert!(breaker.is_open().await.unwrap());
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let breaker = create_test_breaker(Duration::from_secs(300));

        breaker.record_system_failure().await.unwrap();
        breaker.record_system_failure().await.unwrap();
        breaker.record_success().await.unwrap();
        breaker.record_system_failure().await.unwrap();
        breaker.record_system_failure().await.unwrap();

        let record = breaker.state().await.unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.consecutive_failures, 2);
        assert!(breaker.allow_claim().await.is_ok());
    }

    #[tokio::test]
    async fn test_closes_after_cooldown() {
        let breaker = create_test_breaker(Duration::from_millis(100));

        for _ in 0..3 {
            breaker.record_system_failure().await.unwrap();
        }
        assert!(breaker.allow_claim().await.is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(breaker.allow_claim().await.is_ok());
        let record = breaker.state().await.unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_cooldown_measured_from_opened_at() {
        let breaker = create_test_breaker(Duration::from_secs(300));
        for _ in 0..3 {
            breaker.record_system_failure().await.unwrap();
        }

        let later = Utc::now() + chrono::Duration::minutes(6);
        assert!(breaker.allow_claim_at(later).await.is_ok());
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = create_test_breaker(Duration::from_secs(300));
        for _ in 0..3 {
            breaker.record_system_failure().await.unwrap();
        }

        let record = breaker.reset().await.unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert!(breaker.allow_claim().await.is_ok());
    }

    #[tokio::test]
    async fn test_cache_serves_reads() {
        let store = Arc::new(InMemoryJobStore::new());
        let breaker = SystemCircuitBreaker::new(
            CircuitBreakerConfig::default().with_cache_duration(Duration::from_secs(60)),
            store.clone(),
        );

        assert!(breaker.allow_claim().await.is_ok());

        // Opened behind the breaker's back; the cached closed state still wins
        for _ in 0..3 {
            store.record_breaker_failure(3, Utc::now()).await.unwrap();
        }
        assert!(breaker.allow_claim().await.is_ok());
    }
}
