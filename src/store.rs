//! Counter stores backing the rate limiter.

use crate::clock::{self, Clock};
use crate::config::CounterStoreConfig;
use crate::error::StoreError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A key-value store that can atomically increment a counter and set its expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and (re)set its time-to-live, atomically. Returns the new count.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;
}

/// Redis over the Upstash REST protocol. `INCR` and `EXPIRE` run as one
/// `MULTI/EXEC` transaction.
pub struct RestCounterStore {
    client: Client,
    config: CounterStoreConfig,
}

impl RestCounterStore {
    pub fn new(config: CounterStoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self { client, config })
    }
}

#[derive(Deserialize)]
struct CommandReply {
    result: Option<Value>,
    error: Option<String>,
}

#[async_trait]
impl CounterStore for RestCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let url = format!("{}/multi-exec", self.config.url.trim_end_matches('/'));
        let commands = json!([
            ["INCR", key],
            ["EXPIRE", key, ttl.as_secs().max(1).to_string()],
        ]);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&commands)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status(status));
        }

        let replies: Vec<CommandReply> = response.json().await?;
        parse_incr_reply(&replies)
    }
}

fn parse_incr_reply(replies: &[CommandReply]) -> Result<u64, StoreError> {
    let first = replies
        .first()
        .ok_or_else(|| StoreError::Unexpected("empty transaction reply".to_string()))?;

    if let Some(error) = &first.error {
        return Err(StoreError::Unexpected(error.clone()));
    }

    first
        .result
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::Unexpected(format!("INCR returned {:?}", first.result)))
}

/// Process-local counter store. Useful for single-instance deployments and tests.
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, (u64, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Drop expired counters.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.counters.lock().retain(|_, (_, expires)| *expires > now);
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let expires = now + clock::delta(ttl);

        let mut counters = self.counters.lock();
        let entry = counters.entry(key.to_string()).or_insert((0, expires));
        if entry.1 <= now {
            entry.0 = 0;
        }
        entry.0 += 1;
        entry.1 = expires;
        Ok(entry.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::{assert_err, assert_ok};

    fn replies(raw: &str) -> Vec<CommandReply> {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn reads_count_from_transaction_reply() {
        let parsed = parse_incr_reply(&replies(r#"[{"result": 7}, {"result": 1}]"#));
        assert_eq!(assert_ok!(parsed), 7);
    }

    #[test]
    fn surfaces_command_errors() {
        let parsed = parse_incr_reply(&replies(r#"[{"error": "WRONGTYPE"}]"#));
        assert!(matches!(parsed, Err(StoreError::Unexpected(msg)) if msg == "WRONGTYPE"));
        assert_err!(parse_incr_reply(&[]));
    }

    #[tokio::test]
    async fn memory_counters_expire() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryCounterStore::new(clock.clone());
        let ttl = Duration::from_secs(60);

        assert_eq!(store.incr_with_expiry("k", ttl).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("k", ttl).await.unwrap(), 2);
        assert_eq!(store.incr_with_expiry("other", ttl).await.unwrap(), 1);

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.incr_with_expiry("k", ttl).await.unwrap(), 1);

        clock.advance(Duration::from_secs(61));
        store.purge_expired();
        assert!(store.counters.lock().is_empty());
    }
}
