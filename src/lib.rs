//! # relay-guard
//!
//! An abuse-resistant gateway in front of expensive media downloads.
//!
//! This library provides a pool of short-lived proxy leases that is kept alive by
//! periodic renewal, a download relay that fetches through that pool with bounded
//! retries, and an admission pipeline (IP blacklist, fixed-window rate limiting
//! and per-IP bot detection) guarding it.

pub mod admission;
pub mod blacklist;
pub mod bot;
pub mod clock;
pub mod config;
pub mod error;
pub mod lease;
pub mod middleware;
pub mod pool;
pub mod provider;
pub mod rate_limit;
pub mod relay;
pub mod store;
pub mod task;

pub use admission::{admission_layer, client_ip, Admission, Gatekeeper};
pub use blacklist::Blacklist;
pub use bot::{is_suspicious_pattern, BotDetector, BotVerdict};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GatewayConfig, LeasePoolConfig, LeasePoolConfigBuilder};
pub use error::{PoolError, ProviderError, RelayError, StoreError};
pub use lease::ProxyLease;
pub use middleware::LeaseRotationMiddleware;
pub use pool::{LeasePool, PoolState};
pub use provider::{HttpLeaseProvider, LeaseGrant, LeaseProvider};
pub use rate_limit::{RateLimitConfig, RateLimitOutcome, RateLimitTier, RateLimiter};
pub use relay::{router, Relay, RelayState};
pub use store::{CounterStore, MemoryCounterStore, RestCounterStore};
pub use task::BackgroundTask;
