//! Admission control for inbound requests: blacklist first, then rate limit.
//!
//! Client addresses are read from forwarding headers. Those are only trustworthy
//! when an edge layer in front of the gateway overwrites them; a caller that can
//! reach the gateway directly can claim any address.

use crate::blacklist::Blacklist;
use crate::bot::{is_suspicious_pattern, BotDetector};
use crate::rate_limit::{RateLimitConfig, RateLimitOutcome, RateLimiter};

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;

/// Sentinel used when no forwarding header names the client.
pub const UNKNOWN_IP: &str = "unknown";

/// Headers consulted for the client address, most preferred first.
const CLIENT_IP_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
    "x-nf-client-connection-ip",
];

pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Resolve the client address from forwarding headers.
///
/// For `x-forwarded-for` only the first, client-most entry is used.
pub fn client_ip(headers: &HeaderMap) -> String {
    CLIENT_IP_HEADERS
        .iter()
        .find_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// The outcome of an admission check.
#[derive(Debug)]
pub enum Admission {
    /// Let the request through; merge `headers` into the eventual response.
    Admitted { ip: String, headers: HeaderMap },
    /// Answer with this response instead.
    Rejected(Response),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Composes the blacklist, rate limiter and bot detector.
pub struct Gatekeeper {
    pub blacklist: Arc<Blacklist>,
    pub limiter: RateLimiter,
    pub detector: Arc<BotDetector>,
}

impl Gatekeeper {
    pub fn new(
        blacklist: Arc<Blacklist>,
        limiter: RateLimiter,
        detector: Arc<BotDetector>,
    ) -> Self {
        Self {
            blacklist,
            limiter,
            detector,
        }
    }

    /// Decide whether a request may proceed.
    ///
    /// Banned clients are refused before the rate limiter is consulted, so they
    /// never cost a counter-store round trip.
    pub async fn with_rate_limit(&self, headers: &HeaderMap, config: RateLimitConfig) -> Admission {
        let ip = client_ip(headers);

        if self.blacklist.is_blacklisted(&ip) {
            warn!("Refusing blacklisted client {}", ip);
            return Admission::Rejected(blacklisted_response());
        }

        let outcome = self.limiter.rate_limit(&ip, config).await;
        if !outcome.success {
            warn!("Rate limit exceeded for {} on {}", ip, config.scope);
            let now = self.limiter.now().timestamp();
            return Admission::Rejected(throttled_response(&outcome, now));
        }

        Admission::Admitted {
            ip,
            headers: rate_limit_headers(&outcome),
        }
    }

    /// Build the state for `admission_layer` on a route.
    pub fn layer_state(self: &Arc<Self>, config: RateLimitConfig) -> AdmissionState {
        AdmissionState {
            gate: Arc::clone(self),
            config,
        }
    }
}

/// Router state for `admission_layer`.
#[derive(Clone)]
pub struct AdmissionState {
    pub gate: Arc<Gatekeeper>,
    pub config: RateLimitConfig,
}

/// Axum middleware running the admission check ahead of a handler.
///
/// Admitted requests are also recorded with the bot detector; a request that
/// trips it still completes, and the ban applies from the next one.
pub async fn admission_layer(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let inbound = request.headers().clone();
    let (ip, headers) = match state.gate.with_rate_limit(&inbound, state.config).await {
        Admission::Admitted { ip, headers } => (ip, headers),
        Admission::Rejected(response) => return response,
    };

    let value_of = |name: HeaderName| inbound.get(name).and_then(|v| v.to_str().ok());
    if is_suspicious_pattern(
        value_of(header::USER_AGENT),
        value_of(header::ORIGIN),
        value_of(header::REFERER),
    ) {
        debug!("Suspicious request pattern from {}", ip);
    }

    // Every header-less caller shares the sentinel; banning it would ban them all.
    if ip != UNKNOWN_IP {
        let verdict = state.gate.detector.detect_bot(&ip);
        if verdict.is_bot {
            info!(
                "Bot detected at {}: {}",
                ip,
                verdict.reason.as_deref().unwrap_or_default()
            );
        }
    }

    let mut response = next.run(request).await;
    response.headers_mut().extend(headers);
    response
}

fn rate_limit_headers(outcome: &RateLimitOutcome) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(outcome.limit));
    headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(outcome.remaining));
    headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(outcome.reset));
    headers
}

/// CORS headers shared by every browser-facing response, rejections included.
pub(crate) fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

fn blacklisted_response() -> Response {
    let mut response = (
        StatusCode::FORBIDDEN,
        Json(json!({
            "status": "error",
            "message": "Access denied. Your IP has been blocked due to suspicious activity.",
        })),
    )
        .into_response();
    apply_cors(response.headers_mut());
    response
}

fn throttled_response(outcome: &RateLimitOutcome, now: i64) -> Response {
    let retry_after = (outcome.reset - now).max(1);
    let body = Json(json!({
        "status": "error",
        "message": "Too many requests. Please try again later.",
        "retryAfter": retry_after,
        "limit": outcome.limit,
        "reset": outcome.reset,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    headers.extend(rate_limit_headers(outcome));
    apply_cors(headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::StoreError;
    use crate::store::{CounterStore, MemoryCounterStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingStore {
        inner: MemoryCounterStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for CountingStore {
        async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.incr_with_expiry(key, ttl).await
        }
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn gate() -> (Gatekeeper, Arc<CountingStore>) {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(CountingStore {
            inner: MemoryCounterStore::new(clock.clone()),
            calls: AtomicUsize::new(0),
        });
        let blacklist = Arc::new(Blacklist::new(clock.clone()));
        let detector = BotDetector::new(blacklist.clone(), clock.clone());
        let limiter = RateLimiter::new(Some(store.clone()), clock);
        (Gatekeeper::new(blacklist, limiter, detector), store)
    }

    const TWO_PER_HOUR: RateLimitConfig = RateLimitConfig::new("t", Duration::from_secs(3600), 2);

    #[test]
    fn ip_header_precedence() {
        assert_eq!(
            client_ip(&headers(&[
                ("x-nf-client-connection-ip", "4.4.4.4"),
                ("cf-connecting-ip", "3.3.3.3"),
                ("x-real-ip", "2.2.2.2"),
                ("x-forwarded-for", " 1.1.1.1 , 10.0.0.1"),
            ])),
            "1.1.1.1"
        );
        assert_eq!(
            client_ip(&headers(&[("cf-connecting-ip", "3.3.3.3"), ("x-real-ip", "2.2.2.2")])),
            "2.2.2.2"
        );
        assert_eq!(
            client_ip(&headers(&[
                ("x-nf-client-connection-ip", "4.4.4.4"),
                ("cf-connecting-ip", "3.3.3.3"),
            ])),
            "3.3.3.3"
        );
        assert_eq!(client_ip(&headers(&[("x-nf-client-connection-ip", "4.4.4.4")])), "4.4.4.4");
        assert_eq!(client_ip(&headers(&[("x-forwarded-for", " ")])), UNKNOWN_IP);
        assert_eq!(client_ip(&HeaderMap::new()), UNKNOWN_IP);
    }

    #[tokio::test]
    async fn blacklisted_clients_skip_the_limiter() {
        let (gate, store) = gate();
        gate.blacklist.add_to_temp_blacklist("9.9.9.9", "test");

        let admission = gate
            .with_rate_limit(&headers(&[("x-real-ip", "9.9.9.9")]), TWO_PER_HOUR)
            .await;
        let Admission::Rejected(response) = admission else {
            panic!("blacklisted client admitted");
        };
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn throttled_clients_get_retry_metadata() {
        let (gate, _) = gate();
        let caller = headers(&[("x-real-ip", "8.8.4.4")]);

        for remaining in [1u64, 0] {
            match gate.with_rate_limit(&caller, TWO_PER_HOUR).await {
                Admission::Admitted { ip, headers } => {
                    assert_eq!(ip, "8.8.4.4");
                    assert_eq!(headers[&X_RATELIMIT_REMAINING], remaining.to_string().as_str());
                    assert_eq!(headers[&X_RATELIMIT_LIMIT], "2");
                }
                Admission::Rejected(_) => panic!("rejected within limit"),
            }
        }

        let Admission::Rejected(response) = gate.with_rate_limit(&caller, TWO_PER_HOUR).await else {
            panic!("third request admitted");
        };
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: i64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=3600).contains(&retry_after));
        assert_eq!(response.headers()[&X_RATELIMIT_REMAINING], "0");
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["limit"], 2);
        assert_eq!(body["retryAfter"], retry_after);
    }
}
