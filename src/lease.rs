//! A rented upstream proxy.

use chrono::{DateTime, TimeDelta, Utc};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// One short-lived proxy leased from the provider.
#[derive(Debug, Clone)]
pub struct ProxyLease {
    /// Opaque lease identifier assigned by the provider.
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Absolute expiry; only ever moved forward by renewal.
    pub expires_at: DateTime<Utc>,
    pub country: String,
    pub country_code: String,
    /// Paces requests sent through this lease.
    pub limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>>,
}

impl ProxyLease {
    /// Create a lease with the given request-per-second ceiling.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        expires_at: DateTime<Utc>,
        max_rps: f64,
    ) -> Self {
        let per_second = NonZeroU32::new(max_rps.ceil() as u32).unwrap_or(NonZeroU32::MIN);

        Self {
            id: id.into(),
            host: host.into(),
            port,
            expires_at,
            country: String::new(),
            country_code: String::new(),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
        }
    }

    /// Attach the provider's reported location.
    pub fn with_location(
        mut self,
        country: impl Into<String>,
        country_code: impl Into<String>,
    ) -> Self {
        self.country = country.into();
        self.country_code = country_code.into();
        self
    }

    /// The proxy address as an http proxy URL.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Convert the lease into a reqwest::Proxy.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        reqwest::Proxy::all(self.url())
    }

    /// Whether the lease is still usable at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Time left before expiry; negative once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> TimeDelta {
        self.expires_at - now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_is_strict() {
        let now = Utc::now();
        let lease = ProxyLease::new("a", "10.0.0.1", 8080, now, 5.0);
        assert!(!lease.is_live_at(now));
        assert!(lease.is_live_at(now - TimeDelta::seconds(1)));
        assert_eq!(lease.url(), "http://10.0.0.1:8080");
    }

    #[test]
    fn zero_rps_still_admits_one() {
        let lease = ProxyLease::new("a", "h", 1, Utc::now(), 0.0);
        assert!(lease.limiter.check().is_ok());
    }
}
