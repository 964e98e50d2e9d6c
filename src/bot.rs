//! Per-IP request pattern analysis.
//!
//! Every request appends a timestamp to its IP's tracker and runs three rules in
//! order, stopping at the first that fires:
//!
//! 1. volume: 50 or more requests in the trailing 10 minutes
//! 2. burst: 12 or more requests in the trailing 10 seconds
//! 3. regularity: with 10 or more tracked requests, mean gap under 3 s with
//!    variance under 50 000 ms², over every gap in the horizon
//!
//! A firing rule temporarily blacklists the IP.

use crate::blacklist::Blacklist;
use crate::clock::Clock;
use crate::task::BackgroundTask;

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Requests older than this are forgotten.
pub const TRACKING_HORIZON: TimeDelta = TimeDelta::minutes(10);
pub const VOLUME_THRESHOLD: usize = 50;
pub const BURST_WINDOW: TimeDelta = TimeDelta::seconds(10);
pub const BURST_THRESHOLD: usize = 12;
/// Tracked requests needed before timing is judged.
pub const REGULARITY_MIN_REQUESTS: usize = 10;
pub const MAX_REGULAR_MEAN_MS: f64 = 3000.0;
pub const MAX_REGULAR_VARIANCE: f64 = 50_000.0;
/// Trackers idle this long are evicted by cleanup.
pub const IDLE_EVICTION: TimeDelta = TimeDelta::hours(1);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30 * 60);

const BOT_SIGNATURES: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "scraper",
    "curl",
    "wget",
    "python",
    "java",
    "go-http-client",
    "okhttp",
    "axios",
    "node-fetch",
    "libwww",
    "httpclient",
    "headless",
    "phantomjs",
    "selenium",
    "puppeteer",
    "playwright",
];

/// Which rule classified a request as automated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotRule {
    Volume,
    Burst,
    Regularity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BotVerdict {
    pub is_bot: bool,
    pub rule: Option<BotRule>,
    pub reason: Option<String>,
    /// Requests seen from the IP in the tracking horizon, this one included.
    pub request_count: usize,
}

#[derive(Debug)]
struct RequestTracker {
    timestamps: VecDeque<DateTime<Utc>>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl RequestTracker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            timestamps: VecDeque::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.timestamps.push_back(now);
        self.last_seen = now;
        while let Some(oldest) = self.timestamps.front() {
            if now - *oldest > TRACKING_HORIZON {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn evaluate(&self, now: DateTime<Utc>) -> BotVerdict {
        let count = self.timestamps.len();

        if count >= VOLUME_THRESHOLD {
            return bot(
                BotRule::Volume,
                format!("automated behavior: {count} requests in 10 minutes"),
                count,
            );
        }

        let burst = self
            .timestamps
            .iter()
            .rev()
            .take_while(|ts| now - **ts < BURST_WINDOW)
            .count();
        if burst >= BURST_THRESHOLD {
            return bot(
                BotRule::Burst,
                format!("too fast: {burst} requests in 10 seconds"),
                count,
            );
        }

        if count >= REGULARITY_MIN_REQUESTS {
            let (mean, variance) = self.interval_stats();
            if mean < MAX_REGULAR_MEAN_MS && variance < MAX_REGULAR_VARIANCE {
                return bot(
                    BotRule::Regularity,
                    format!("perfect automated timing: mean {mean:.0}ms, variance {variance:.0}"),
                    count,
                );
            }
        }

        BotVerdict {
            is_bot: false,
            rule: None,
            reason: None,
            request_count: count,
        }
    }

    // Mean and population variance of the gaps between tracked requests.
    fn interval_stats(&self) -> (f64, f64) {
        let gaps: Vec<f64> = self
            .timestamps
            .iter()
            .zip(self.timestamps.iter().skip(1))
            .map(|(earlier, later)| (*later - *earlier).num_milliseconds() as f64)
            .collect();

        if gaps.is_empty() {
            return (0.0, 0.0);
        }

        let n = gaps.len() as f64;
        let mean = gaps.iter().sum::<f64>() / n;
        let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n;
        (mean, variance)
    }
}

fn bot(rule: BotRule, reason: String, count: usize) -> BotVerdict {
    BotVerdict {
        is_bot: true,
        rule: Some(rule),
        reason: Some(reason),
        request_count: count,
    }
}

/// Tracks request timing per IP and escalates automated clients to the blacklist.
pub struct BotDetector {
    trackers: Mutex<HashMap<String, RequestTracker>>,
    blacklist: Arc<Blacklist>,
    clock: Arc<dyn Clock>,
    cleanup: Mutex<Option<BackgroundTask>>,
}

impl BotDetector {
    pub fn new(blacklist: Arc<Blacklist>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            trackers: Mutex::new(HashMap::new()),
            blacklist,
            clock,
            cleanup: Mutex::new(None),
        })
    }

    /// Record a request from `ip` and classify it.
    ///
    /// Not a pure check: the request is counted, and a positive verdict bans the IP.
    pub fn detect_bot(&self, ip: &str) -> BotVerdict {
        let now = self.clock.now();

        let verdict = {
            let mut trackers = self.trackers.lock();
            let tracker = trackers
                .entry(ip.to_string())
                .or_insert_with(|| RequestTracker::new(now));
            tracker.record(now);
            tracker.evaluate(now)
        };

        match &verdict.reason {
            Some(reason) => self.blacklist.add_to_temp_blacklist(ip, reason),
            None if verdict.request_count * 5 >= VOLUME_THRESHOLD * 4 => {
                debug!("{} is nearing the volume limit: {} requests", ip, verdict.request_count);
            }
            None => {}
        }

        verdict
    }

    /// Evict trackers idle for more than an hour. Returns how many were removed.
    pub fn cleanup_idle(&self) -> usize {
        let now = self.clock.now();
        let mut trackers = self.trackers.lock();
        let before = trackers.len();
        trackers.retain(|_, t| now - t.last_seen <= IDLE_EVICTION);
        let evicted = before - trackers.len();
        if evicted > 0 {
            info!("Evicted {} idle request trackers, {} remain", evicted, trackers.len());
        }
        evicted
    }

    pub fn tracked_ips(&self) -> usize {
        self.trackers.lock().len()
    }

    /// When `ip` was first seen, if it is still tracked.
    pub fn first_seen(&self, ip: &str) -> Option<DateTime<Utc>> {
        self.trackers.lock().get(ip).map(|t| t.first_seen)
    }

    /// Run `cleanup_idle` every 30 minutes until shutdown.
    pub fn start_cleanup(self: &Arc<Self>) {
        let task = BackgroundTask::spawn_periodic(
            "tracker-cleanup",
            CLEANUP_INTERVAL,
            Arc::downgrade(self),
            |detector: Arc<BotDetector>| async move {
                detector.cleanup_idle();
            },
        );
        *self.cleanup.lock() = Some(task);
    }

    pub fn shutdown(&self) {
        if let Some(mut task) = self.cleanup.lock().take() {
            task.shutdown();
        }
    }
}

/// Cheap header heuristic for logging. Does not track or ban.
///
/// Flags a missing or very short user agent, a known automation library in the
/// user agent, or a request carrying neither Origin nor Referer.
pub fn is_suspicious_pattern(
    user_agent: Option<&str>,
    origin: Option<&str>,
    referer: Option<&str>,
) -> bool {
    let user_agent = user_agent.map(str::trim).unwrap_or_default();
    if user_agent.len() < 10 {
        return true;
    }

    let lowered = user_agent.to_ascii_lowercase();
    if BOT_SIGNATURES.iter().any(|sig| lowered.contains(sig)) {
        return true;
    }

    let absent = |value: Option<&str>| value.map_or(true, |v| v.trim().is_empty());
    absent(origin) && absent(referer)
}
