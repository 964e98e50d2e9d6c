//! Middleware that sends each outbound request through a rotating proxy lease.

use crate::error::RelayError;
use crate::pool::LeasePool;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// Tries up to `attempt_count` distinct live leases, each bounded by
/// `attempt_timeout`, and returns the first response with a success status.
#[derive(Clone)]
pub struct LeaseRotationMiddleware {
    /// The lease pool.
    pool: Arc<LeasePool>,
}

impl LeaseRotationMiddleware {
    /// The pool must already be initialized; see `LeasePool::initialize`.
    pub fn new(pool: Arc<LeasePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Middleware for LeaseRotationMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let max_attempts = self.pool.config.attempt_count;
        let timeout = self.pool.config.attempt_timeout;
        let mut tried = HashSet::new();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            let lease = match self.pool.get_random_proxy_excluding(&tried) {
                Ok(lease) => lease,
                Err(e) if tried.is_empty() => {
                    return Err(Error::Middleware(anyhow!(RelayError::Pool(e))));
                }
                // Fewer live leases than attempts.
                Err(_) => break,
            };
            tried.insert(lease.id.clone());

            let proxied_request = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                ))
            })?;

            let proxy_url = lease.url();
            info!("Using proxy: {} (attempt {}/{})", proxy_url, attempt, max_attempts);

            lease.limiter.until_ready().await;

            let client = match lease
                .to_reqwest_proxy()
                .and_then(|proxy| reqwest::Client::builder().proxy(proxy).build())
            {
                Ok(client) => client,
                Err(e) => {
                    warn!("Failed to build client with proxy {}: {}", proxy_url, e);
                    last_error = e.to_string();
                    continue;
                }
            };

            match tokio::time::timeout(timeout, client.execute(proxied_request)).await {
                Ok(Ok(response)) if response.status().is_success() => return Ok(response),
                Ok(Ok(response)) => {
                    warn!(
                        "Proxy {} got status {} (attempt {})",
                        proxy_url,
                        response.status(),
                        attempt
                    );
                    last_error = format!("upstream returned {}", response.status());
                }
                Ok(Err(e)) => {
                    warn!("Request failed with proxy {} (attempt {}): {}", proxy_url, attempt, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(
                        "Proxy {} timed out after {:?} (attempt {})",
                        proxy_url, timeout, attempt
                    );
                    last_error = format!("timed out after {timeout:?}");
                }
            }
        }

        Err(Error::Middleware(anyhow!(RelayError::AttemptsExhausted {
            attempts: tried.len(),
            last_error,
        })))
    }
}
