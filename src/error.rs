//! Error types for the relay-guard crate.

use thiserror::Error;

/// Failure talking to the proxy-leasing API.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The HTTP request itself failed.
    #[error("lease request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The API answered with a non-success status.
    #[error("lease API returned status {0}")]
    Status(reqwest::StatusCode),
    /// The API answered `success: false`.
    #[error("lease API rejected the request")]
    Rejected,
    /// The payload did not have the expected shape.
    #[error("malformed lease payload: {0}")]
    Malformed(String),
}

/// Errors surfaced by the proxy pool.
///
/// `Clone` so a single in-flight initialization can hand its outcome to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// No leasing credentials were configured.
    #[error("proxy service is not configured")]
    NotConfigured,
    /// Every acquisition during warm-up failed.
    #[error("failed to acquire any of {attempted} proxy leases")]
    NoLeasesAcquired { attempted: usize },
    /// The pool holds no unexpired lease.
    #[error("no valid proxies available")]
    NoValidProxies,
}

/// Failure talking to the rate-limit counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("counter store returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("unexpected counter store reply: {0}")]
    Unexpected(String),
    #[error("counter store did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// Failure fetching media through the proxy pool.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("target url is not a valid http(s) url: {0}")]
    InvalidTarget(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("all {attempts} proxy attempts failed: {last_error}")]
    AttemptsExhausted { attempts: usize, last_error: String },
}
