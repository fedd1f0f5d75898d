//! Per-identity sliding window rate limiter.
//!
//! All inbound requests share one limiter instance owned by [`crate::AppContext`].
//! Admission is a single atomic purge → check → record step under one lock, so
//! the `max_requests` bound holds under concurrent admission attempts.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

// ── Sliding window ───────────────────────────────────────────────────────────

/// A sliding-window admission record for a single identity.
///
/// Timestamps are insertion-ordered (oldest first), so evicting expired
/// entries is a prefix trim.
pub struct SlidingWindow {
    window_secs: u64,
    max_requests: u64,
    events: VecDeque<DateTime<Utc>>,
    /// When a cooldown is configured, rejected identities stay blocked
    /// until this instant even if the window has drained.
    blocked_until: Option<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new(window_secs: u64, max_requests: u64) -> Self {
        Self {
            window_secs,
            max_requests,
            events: VecDeque::new(),
            blocked_until: None,
        }
    }

    /// Discard events older than the window boundary.
    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(self.window_secs as i64);
        while self.events.front().is_some_and(|t| *t < cutoff) {
            self.events.pop_front();
        }
    }

    /// Count events within the current window.
    pub fn count_in_window(&mut self, now: DateTime<Utc>) -> u64 {
        self.evict(now);
        self.events.len() as u64
    }

    /// Returns `true` if the count in the current window has reached
    /// `max_requests`, or an explicit cooldown is still in force.
    pub fn is_limited(&mut self, now: DateTime<Utc>) -> bool {
        if self.blocked_until.is_some_and(|until| now < until) {
            return true;
        }
        self.count_in_window(now) >= self.max_requests
    }

    /// Check-then-record as one step: admit and record `now`, or reject.
    ///
    /// `block_secs > 0` adds a fixed cooldown on rejection, stamped once
    /// per block (off by default; the rolling window alone decides).
    pub fn try_admit(&mut self, now: DateTime<Utc>, block_secs: u64) -> bool {
        if self.is_limited(now) {
            let already_blocked = self.blocked_until.is_some_and(|until| now < until);
            if block_secs > 0 && !already_blocked {
                self.blocked_until = Some(now + Duration::seconds(block_secs as i64));
            }
            return false;
        }
        self.events.push_back(now);
        true
    }

    /// Time until the oldest event in the window expires.
    ///
    /// Returns `None` if the window is not currently limited.
    pub fn time_until_reset(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        if let Some(until) = self.blocked_until {
            if now < until {
                return Some(until - now);
            }
        }
        if !self.is_limited(now) {
            return None;
        }
        self.events.front().map(|oldest| {
            let expiry = *oldest + Duration::seconds(self.window_secs as i64);
            expiry - now
        })
    }
}

// ── Limiter ──────────────────────────────────────────────────────────────────

/// Default budget: 5 requests per rolling minute.
const DEFAULT_MAX_REQUESTS: u64 = 5;
const DEFAULT_WINDOW_SECS: u64 = 60;

/// Limiter configuration (`[limiter]` in config.toml).
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Admissions allowed per identity per rolling window. Default: 5.
    pub max_requests: u64,
    /// Rolling window length in seconds. Default: 60.
    pub window_seconds: u64,
    /// Fixed cooldown added on rejection, in seconds. Default: 0 (disabled).
    pub block_seconds: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window_seconds: DEFAULT_WINDOW_SECS,
            block_seconds: 0,
        }
    }
}

/// Process-wide sliding-window limiter, shared across all sessions.
///
/// Per-identity records are created lazily and never removed; identities are
/// bounded in practice (IP-derived) and the per-entry cost after trimming is
/// at most `max_requests` timestamps. One coarse lock protects the whole map;
/// contention is low at the request rates this daemon serves.
pub struct SlidingWindowLimiter {
    config: LimiterConfig,
    /// identity -> admission window
    windows: Mutex<HashMap<String, SlidingWindow>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically check the identity's window and record the admission.
    ///
    /// Returns `false` if the identity has exhausted its budget for the
    /// current window. A rejected call records nothing (unless a cooldown
    /// is configured, which only stamps `blocked_until`).
    pub async fn try_admit(&self, identity: &str) -> bool {
        self.try_admit_at(identity, Utc::now()).await
    }

    /// [`Self::try_admit`] with an explicit clock. Tests drive this directly.
    pub async fn try_admit_at(&self, identity: &str, now: DateTime<Utc>) -> bool {
        let mut map = self.windows.lock().await;
        let window = map
            .entry(identity.to_string())
            .or_insert_with(|| SlidingWindow::new(self.config.window_seconds, self.config.max_requests));
        let admitted = window.try_admit(now, self.config.block_seconds);
        if !admitted {
            tracing::warn!(identity = %identity, "rate limit exceeded, request rejected");
        }
        admitted
    }

    /// Remaining admissions for the identity in the current window.
    pub async fn remaining_capacity(&self, identity: &str) -> u64 {
        let now = Utc::now();
        let mut map = self.windows.lock().await;
        match map.get_mut(identity) {
            Some(window) => self.config.max_requests.saturating_sub(window.count_in_window(now)),
            None => self.config.max_requests,
        }
    }

    /// Seconds until the identity's oldest admission leaves the window.
    ///
    /// `None` when the identity is not currently limited.
    pub async fn retry_after_secs(&self, identity: &str) -> Option<i64> {
        let now = Utc::now();
        let mut map = self.windows.lock().await;
        map.get_mut(identity)
            .and_then(|w| w.time_until_reset(now))
            .map(|d| d.num_seconds().max(1))
    }
}
