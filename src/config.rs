//! Configuration for the lease pool and the gateway as a whole.

use std::net::SocketAddr;
use std::time::Duration;

/// Default base URL of the proxy-leasing API.
pub const DEFAULT_LEASE_API_BASE_URL: &str = "https://ephemeral-proxies.p.rapidapi.com";

/// Configuration for the lease pool.
#[derive(Debug, Clone)]
pub struct LeasePoolConfig {
    /// Number of leases acquired at warm-up.
    pub pool_size: usize,
    /// Period of the renewal cycle.
    pub renewal_interval: Duration,
    /// Leases with less than this left before expiry are renewed.
    pub renewal_margin: Duration,
    /// Number of distinct leases a single fetch may try.
    pub attempt_count: usize,
    /// Upper bound on a single proxied attempt.
    pub attempt_timeout: Duration,
    /// Maximum requests per second per lease.
    pub max_requests_per_second: f64,
}

impl LeasePoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> LeasePoolConfigBuilder {
        LeasePoolConfigBuilder::new()
    }
}

impl Default for LeasePoolConfig {
    fn default() -> Self {
        LeasePoolConfigBuilder::new().build()
    }
}

/// Builder for `LeasePoolConfig`.
pub struct LeasePoolConfigBuilder {
    pool_size: Option<usize>,
    renewal_interval: Option<Duration>,
    renewal_margin: Option<Duration>,
    attempt_count: Option<usize>,
    attempt_timeout: Option<Duration>,
    max_requests_per_second: Option<f64>,
}

impl LeasePoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            pool_size: None,
            renewal_interval: None,
            renewal_margin: None,
            attempt_count: None,
            attempt_timeout: None,
            max_requests_per_second: None,
        }
    }

    /// Set the number of leases acquired at warm-up.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Set the period of the renewal cycle.
    pub fn renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = Some(interval);
        self
    }

    /// Set the remaining lifetime below which a lease is renewed.
    pub fn renewal_margin(mut self, margin: Duration) -> Self {
        self.renewal_margin = Some(margin);
        self
    }

    /// Set the number of distinct leases tried per fetch.
    pub fn attempt_count(mut self, count: usize) -> Self {
        self.attempt_count = Some(count);
        self
    }

    /// Set the timeout of a single proxied attempt.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Set the maximum requests per second per lease.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> LeasePoolConfig {
        LeasePoolConfig {
            pool_size: self.pool_size.unwrap_or(20),
            renewal_interval: self.renewal_interval.unwrap_or(Duration::from_secs(25 * 60)),
            renewal_margin: self.renewal_margin.unwrap_or(Duration::from_secs(10 * 60)),
            attempt_count: self.attempt_count.unwrap_or(3).max(1),
            attempt_timeout: self.attempt_timeout.unwrap_or(Duration::from_secs(15)),
            max_requests_per_second: self.max_requests_per_second.unwrap_or(5.0),
        }
    }
}

impl Default for LeasePoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Credentials for the proxy-leasing API.
#[derive(Debug, Clone)]
pub struct LeaseApiCredentials {
    pub base_url: String,
    pub api_key: String,
    pub api_host: String,
}

/// Location and token of the REST counter store.
#[derive(Debug, Clone)]
pub struct CounterStoreConfig {
    pub url: String,
    pub token: String,
}

/// Process-wide gateway settings, read from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// `None` disables the proxy pool; the relay then answers 500.
    pub lease_api: Option<LeaseApiCredentials>,
    /// `None` disables rate limiting (fail open).
    pub counter_store: Option<CounterStoreConfig>,
    /// Admit traffic when the counter store errors or times out.
    pub fail_open: bool,
    pub store_timeout: Duration,
    pub permanent_blacklist: Vec<String>,
    pub whitelist: Vec<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let listen_addr = read_env("LISTEN_ADDR")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8787)));

        let lease_api = match (
            read_env("EPHEMERAL_PROXIES_API_KEY"),
            read_env("EPHEMERAL_PROXIES_API_HOST"),
        ) {
            (Some(api_key), Some(api_host)) => Some(LeaseApiCredentials {
                base_url: read_env("EPHEMERAL_PROXIES_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_LEASE_API_BASE_URL.to_string()),
                api_key,
                api_host,
            }),
            _ => None,
        };

        let counter_store = match (
            read_env("UPSTASH_REDIS_REST_URL"),
            read_env("UPSTASH_REDIS_REST_TOKEN"),
        ) {
            (Some(url), Some(token)) => Some(CounterStoreConfig { url, token }),
            _ => None,
        };

        let fail_open = read_env("RATE_LIMIT_FAIL_OPEN")
            .and_then(|s| parse_bool(&s))
            .unwrap_or(true);

        let store_timeout = read_env("RATE_LIMIT_STORE_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(2));

        Self {
            listen_addr,
            lease_api,
            counter_store,
            fail_open,
            store_timeout,
            permanent_blacklist: read_env("GATE_PERMANENT_BLACKLIST")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            whitelist: read_env("GATE_WHITELIST")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = LeasePoolConfig::builder().build();
        assert_eq!(config.pool_size, 20);
        assert_eq!(config.renewal_interval, Duration::from_secs(1500));
        assert_eq!(config.renewal_margin, Duration::from_secs(600));
        assert_eq!(config.attempt_count, 3);
        assert_eq!(config.attempt_timeout, Duration::from_secs(15));
    }

    #[test]
    fn list_and_bool_parsing() {
        assert_eq!(split_list(" 1.1.1.1, ,2.2.2.2 "), vec!["1.1.1.1", "2.2.2.2"]);
        assert_eq!(parse_bool("Off"), Some(false));
        assert_eq!(parse_bool("yes"), Some(true));
        assert_eq!(parse_bool("maybe"), None);
    }
}
