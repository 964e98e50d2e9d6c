//! Client for the proxy-leasing API.

use crate::config::LeaseApiCredentials;
use crate::error::ProviderError;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// A lease as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub expires_at: DateTime<Utc>,
    pub country: String,
    pub country_code: String,
}

/// Source of short-lived proxy leases.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Rent a new proxy.
    async fn acquire(&self) -> Result<LeaseGrant, ProviderError>;

    /// Extend an existing lease. The returned grant carries the new expiry.
    async fn extend(&self, lease_id: &str) -> Result<LeaseGrant, ProviderError>;
}

/// HTTP client for the datacenter proxy endpoints.
pub struct HttpLeaseProvider {
    client: Client,
    credentials: LeaseApiCredentials,
}

impl HttpLeaseProvider {
    pub fn new(credentials: LeaseApiCredentials) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, credentials })
    }

    async fn get(&self, path: &str) -> Result<LeaseGrant, ProviderError> {
        let url = format!("{}{}", self.credentials.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .header("X-RapidAPI-Key", &self.credentials.api_key)
            .header("X-RapidAPI-Host", &self.credentials.api_host)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status));
        }

        let body = response.text().await?;
        parse_lease_payload(&body)
    }
}

#[async_trait]
impl LeaseProvider for HttpLeaseProvider {
    async fn acquire(&self) -> Result<LeaseGrant, ProviderError> {
        self.get("/v2/datacenter/proxy").await
    }

    async fn extend(&self, lease_id: &str) -> Result<LeaseGrant, ProviderError> {
        let path = format!("/v2/datacenter/proxy/{}/extend", urlencoding::encode(lease_id));
        self.get(&path).await
    }
}

#[derive(Deserialize)]
struct Envelope {
    success: bool,
    proxy: Option<WireProxy>,
}

#[derive(Deserialize)]
struct WireProxy {
    id: String,
    host: String,
    port: u16,
    expires_at: String,
    #[serde(default)]
    visibility: WireVisibility,
}

#[derive(Deserialize, Default)]
struct WireVisibility {
    #[serde(default)]
    country: String,
    #[serde(default)]
    country_iso: String,
}

/// Parse a `{success, proxy:{...}}` payload into a grant.
pub(crate) fn parse_lease_payload(body: &str) -> Result<LeaseGrant, ProviderError> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    if !envelope.success {
        return Err(ProviderError::Rejected);
    }

    let proxy = envelope
        .proxy
        .ok_or_else(|| ProviderError::Malformed("missing proxy object".to_string()))?;

    Ok(LeaseGrant {
        expires_at: parse_expiry(&proxy.expires_at)?,
        id: proxy.id,
        host: proxy.host,
        port: proxy.port,
        country: proxy.visibility.country,
        country_code: proxy.visibility.country_iso,
    })
}

// Timestamps without an offset are taken as UTC.
fn parse_expiry(raw: &str) -> Result<DateTime<Utc>, ProviderError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ProviderError::Malformed(format!("bad expires_at: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_acquisition_payload() {
        let body = r#"{
            "success": true,
            "proxy": {
                "id": "a1b2",
                "host": "203.0.113.7",
                "port": 8080,
                "expires_at": "2024-05-01T12:30:00Z",
                "whitelisted_ips": ["198.51.100.1"],
                "visibility": {"ip": "203.0.113.7", "country": "Germany", "country_iso": "DE"}
            }
        }"#;

        let grant = parse_lease_payload(body).unwrap();
        assert_eq!(grant.id, "a1b2");
        assert_eq!(grant.port, 8080);
        assert_eq!(grant.country_code, "DE");
        assert_eq!(grant.expires_at, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn naive_expiry_is_utc() {
        let expiry = parse_expiry("2024-05-01T12:30:00.250").unwrap();
        assert_eq!(expiry.timestamp_millis() % 1000, 250);
    }

    #[test]
    fn rejected_and_malformed_payloads() {
        assert!(matches!(
            parse_lease_payload(r#"{"success": false}"#),
            Err(ProviderError::Rejected)
        ));
        assert!(matches!(
            parse_lease_payload(r#"{"success": true}"#),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(parse_lease_payload("<html>"), Err(ProviderError::Malformed(_))));
    }
}
