//! Fixed-window rate limiting over an external counter store.

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::CounterStore;

use log::warn;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// A `{interval, limit}` profile. `scope` namespaces the counters so profiles
/// applied to the same client do not share a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub scope: &'static str,
    pub interval: Duration,
    pub limit: u64,
}

impl RateLimitConfig {
    pub const fn new(scope: &'static str, interval: Duration, limit: u64) -> Self {
        Self {
            scope,
            interval,
            limit,
        }
    }

    fn interval_secs(&self) -> i64 {
        self.interval.as_secs().max(1) as i64
    }
}

/// Endpoint classes and their limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitTier {
    /// Media fetches. Generous, since cached results rarely reach upstream.
    Download,
    /// General API calls.
    Api,
    /// Traffic that already looks automated.
    Strict,
    /// Cheap analytics beacons.
    Telemetry,
}

impl RateLimitTier {
    pub const fn config(self) -> RateLimitConfig {
        match self {
            Self::Download => RateLimitConfig::new("download", Duration::from_secs(60), 30),
            Self::Api => RateLimitConfig::new("api", Duration::from_secs(60), 60),
            Self::Strict => RateLimitConfig::new("strict", Duration::from_secs(60), 10),
            Self::Telemetry => RateLimitConfig::new("telemetry", Duration::from_secs(60), 300),
        }
    }
}

/// Result of one rate-limit check. `reset` is a unix timestamp in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitOutcome {
    pub success: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset: i64,
}

/// Fixed-window counter per identifier.
///
/// Without a store every call succeeds. When the store errors or times out the
/// call succeeds if `fail_open` is set, and is refused otherwise.
pub struct RateLimiter {
    store: Option<Arc<dyn CounterStore>>,
    clock: Arc<dyn Clock>,
    fail_open: bool,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Option<Arc<dyn CounterStore>>, clock: Arc<dyn Clock>) -> Self {
        if store.is_none() {
            warn!("No counter store configured, rate limiting is disabled");
        }
        Self {
            store,
            clock,
            fail_open: true,
            store_timeout: Duration::from_secs(2),
        }
    }

    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Count one request from `identifier` against `config`.
    pub async fn rate_limit(&self, identifier: &str, config: RateLimitConfig) -> RateLimitOutcome {
        let interval = config.interval_secs();
        let window = self.clock.now().timestamp().div_euclid(interval);
        let reset = (window + 1) * interval;

        let Some(store) = &self.store else {
            return Self::full_quota(config, reset);
        };

        let key = format!("{}:{}:{}", config.scope, identifier, window);
        let counted = tokio::time::timeout(
            self.store_timeout,
            store.incr_with_expiry(&key, Duration::from_secs(interval as u64)),
        )
        .await
        .unwrap_or(Err(StoreError::Timeout(self.store_timeout)));

        match counted {
            Ok(count) => RateLimitOutcome {
                success: count <= config.limit,
                limit: config.limit,
                remaining: config.limit.saturating_sub(count),
                reset,
            },
            Err(e) if self.fail_open => {
                warn!("Rate limit store unavailable, admitting {}: {}", identifier, e);
                Self::full_quota(config, reset)
            }
            Err(e) => {
                warn!("Rate limit store unavailable, refusing {}: {}", identifier, e);
                RateLimitOutcome {
                    success: false,
                    limit: config.limit,
                    remaining: 0,
                    reset,
                }
            }
        }
    }

    fn full_quota(config: RateLimitConfig, reset: i64) -> RateLimitOutcome {
        RateLimitOutcome {
            success: true,
            limit: config.limit,
            remaining: config.limit,
            reset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryCounterStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn incr_with_expiry(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Unexpected("connection refused".to_string()))
        }
    }

    struct HungStore;

    #[async_trait]
    impl CounterStore for HungStore {
        async fn incr_with_expiry(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            futures::future::pending().await
        }
    }

    const FIVE_PER_MINUTE: RateLimitConfig =
        RateLimitConfig::new("test", Duration::from_secs(60), 5);

    fn clock_at_window_start() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()))
    }

    #[tokio::test]
    async fn limit_within_one_window() {
        let clock = clock_at_window_start();
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = RateLimiter::new(Some(store), clock.clone());

        for i in 1..=5 {
            let outcome = limiter.rate_limit("1.2.3.4", FIVE_PER_MINUTE).await;
            assert!(outcome.success);
            assert_eq!(outcome.remaining, 5 - i);
        }

        let sixth = limiter.rate_limit("1.2.3.4", FIVE_PER_MINUTE).await;
        assert!(!sixth.success);
        assert_eq!(sixth.remaining, 0);
        assert_eq!(sixth.reset, clock.now().timestamp() + 60);

        // Other identifiers are counted separately.
        assert!(limiter.rate_limit("5.6.7.8", FIVE_PER_MINUTE).await.success);
    }

    #[tokio::test]
    async fn next_window_starts_fresh() {
        let clock = clock_at_window_start();
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = RateLimiter::new(Some(store), clock.clone());

        clock.advance(Duration::from_secs(50));
        for _ in 0..6 {
            limiter.rate_limit("ip", FIVE_PER_MINUTE).await;
        }
        assert!(!limiter.rate_limit("ip", FIVE_PER_MINUTE).await.success);

        clock.advance(Duration::from_secs(10));
        let outcome = limiter.rate_limit("ip", FIVE_PER_MINUTE).await;
        assert!(outcome.success);
        assert_eq!(outcome.remaining, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_share_one_counter() {
        let clock = clock_at_window_start();
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = Arc::new(RateLimiter::new(Some(store), clock));

        let calls = (0..50).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.rate_limit("1.2.3.4", FIVE_PER_MINUTE).await })
        });
        let outcomes: Vec<RateLimitOutcome> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(outcomes.iter().filter(|o| o.success).count(), 5);
        let mut remaining: Vec<u64> = outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.remaining)
            .collect();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn unconfigured_store_always_admits() {
        let limiter = RateLimiter::new(None, clock_at_window_start());
        assert!(!limiter.is_enabled());
        for _ in 0..1000 {
            let outcome = limiter.rate_limit("ip", FIVE_PER_MINUTE).await;
            assert!(outcome.success);
            assert_eq!(outcome.remaining, 5);
        }
    }

    #[tokio::test]
    async fn store_failure_follows_policy() {
        let open = RateLimiter::new(Some(Arc::new(DownStore)), clock_at_window_start());
        for _ in 0..20 {
            assert!(open.rate_limit("ip", FIVE_PER_MINUTE).await.success);
        }

        let closed =
            RateLimiter::new(Some(Arc::new(DownStore)), clock_at_window_start()).fail_open(false);
        assert!(!closed.rate_limit("ip", FIVE_PER_MINUTE).await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_store_times_out_open() {
        let limiter = RateLimiter::new(Some(Arc::new(HungStore)), clock_at_window_start())
            .store_timeout(Duration::from_millis(250));
        let outcome = limiter.rate_limit("ip", FIVE_PER_MINUTE).await;
        assert!(outcome.success);
        assert_eq!(outcome.remaining, 5);
    }

    #[test]
    fn tiers_are_distinct_scopes() {
        let scopes = [
            RateLimitTier::Download,
            RateLimitTier::Api,
            RateLimitTier::Strict,
            RateLimitTier::Telemetry,
        ]
        .map(|t| t.config().scope);
        let unique: std::collections::HashSet<_> = scopes.iter().collect();
        assert_eq!(unique.len(), scopes.len());
        assert!(RateLimitTier::Strict.config().limit < RateLimitTier::Download.config().limit);
    }
}
