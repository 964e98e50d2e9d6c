//! Permanent and temporary IP bans, with a whitelist that overrides both.

use crate::clock::Clock;

use chrono::{DateTime, TimeDelta, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How long a temporary ban lasts.
pub const TEMP_BAN_DURATION: TimeDelta = TimeDelta::hours(24);

#[derive(Debug, Clone)]
struct TempBan {
    reason: String,
    banned_at: DateTime<Utc>,
}

#[derive(Default)]
struct Lists {
    permanent: HashSet<String>,
    temporary: HashMap<String, TempBan>,
    whitelist: HashSet<String>,
}

/// Sizes of the ban lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistStats {
    pub permanent: usize,
    pub temporary: usize,
    pub whitelisted: usize,
}

/// In-process ban store. Temporary bans expire lazily on lookup.
pub struct Blacklist {
    lists: Mutex<Lists>,
    clock: Arc<dyn Clock>,
}

impl Blacklist {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            lists: Mutex::new(Lists::default()),
            clock,
        }
    }

    /// Build a store seeded from static configuration.
    pub fn seeded<P, W>(clock: Arc<dyn Clock>, permanent: P, whitelist: W) -> Self
    where
        P: IntoIterator<Item = String>,
        W: IntoIterator<Item = String>,
    {
        let lists = Lists {
            permanent: permanent.into_iter().collect(),
            temporary: HashMap::new(),
            whitelist: whitelist.into_iter().collect(),
        };
        info!(
            "Blacklist seeded with {} permanent and {} whitelisted IPs",
            lists.permanent.len(),
            lists.whitelist.len()
        );
        Self {
            lists: Mutex::new(lists),
            clock,
        }
    }

    /// Whether `ip` is currently banned. Whitelisted IPs never are.
    ///
    /// An expired temporary ban is removed as a side effect.
    pub fn is_blacklisted(&self, ip: &str) -> bool {
        let now = self.clock.now();
        let mut lists = self.lists.lock();

        if lists.whitelist.contains(ip) {
            return false;
        }
        if lists.permanent.contains(ip) {
            return true;
        }

        match lists.temporary.get(ip) {
            Some(ban) if now - ban.banned_at < TEMP_BAN_DURATION => true,
            Some(_) => {
                lists.temporary.remove(ip);
                info!("Temporary ban on {} expired", ip);
                false
            }
            None => false,
        }
    }

    /// Ban `ip` for 24 hours from now. Repeat offenses restart the clock.
    pub fn add_to_temp_blacklist(&self, ip: &str, reason: &str) {
        let ban = TempBan {
            reason: reason.to_string(),
            banned_at: self.clock.now(),
        };
        self.lists.lock().temporary.insert(ip.to_string(), ban);
        warn!("Temporarily blacklisted {}: {}", ip, reason);
    }

    pub fn add_to_permanent_blacklist(&self, ip: &str) {
        self.lists.lock().permanent.insert(ip.to_string());
        warn!("Permanently blacklisted {}", ip);
    }

    /// Lift both permanent and temporary bans on `ip`.
    pub fn remove_from_blacklist(&self, ip: &str) {
        let mut lists = self.lists.lock();
        let permanent = lists.permanent.remove(ip);
        let temporary = lists.temporary.remove(ip).is_some();
        if permanent || temporary {
            info!("Removed {} from blacklist", ip);
        }
    }

    pub fn add_to_whitelist(&self, ip: &str) {
        self.lists.lock().whitelist.insert(ip.to_string());
        info!("Whitelisted {}", ip);
    }

    /// Reason recorded for an active temporary ban.
    pub fn temp_ban_reason(&self, ip: &str) -> Option<String> {
        let now = self.clock.now();
        self.lists
            .lock()
            .temporary
            .get(ip)
            .filter(|ban| now - ban.banned_at < TEMP_BAN_DURATION)
            .map(|ban| ban.reason.clone())
    }

    /// Drop every expired temporary ban. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut lists = self.lists.lock();
        let before = lists.temporary.len();
        lists
            .temporary
            .retain(|_, ban| now - ban.banned_at < TEMP_BAN_DURATION);
        before - lists.temporary.len()
    }

    pub fn stats(&self) -> BlacklistStats {
        let lists = self.lists.lock();
        BlacklistStats {
            permanent: lists.permanent.len(),
            temporary: lists.temporary.len(),
            whitelisted: lists.whitelist.len(),
        }
    }
}
