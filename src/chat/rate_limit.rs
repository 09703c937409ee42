//! Per-identity fixed-window rate limiting with burst detection
//!
//! Each identity owns a [`RateWindow`]. A request is rejected when the
//! window's count already reached the limit, or when it is part of a run of
//! more than `burst_threshold` requests each arriving within
//! `burst_interval` of the previous one. Identities that overflow several
//! windows in a row get a sterner rejection message.

use crate::chat::types::UserId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Overflowed windows after which the rejection message escalates
pub const ESCALATION_THRESHOLD: u32 = 3;

/// Idle windows (in multiples of the window length) before an identity is purged
pub const IDLE_WINDOWS_BEFORE_PURGE: u32 = 10;

/// Rate limiter tuning
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window: Duration,
    pub burst_interval: Duration,
    pub burst_threshold: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window: Duration::from_secs(60),
            burst_interval: Duration::from_secs(1),
            burst_threshold: 5,
        }
    }
}

/// Counter state for one identity
#[derive(Clone, Debug, PartialEq)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: Instant,
    pub consecutive_overflows: u32,
    pub last_request_at: Instant,
    pub burst_count: u32,
}

impl RateWindow {
    fn open(now: Instant, consecutive_overflows: u32) -> Self {
        Self {
            count: 1,
            window_start: now,
            consecutive_overflows,
            last_request_at: now,
            burst_count: 1,
        }
    }
}

/// Outcome of one rate check
#[derive(Clone, Debug, PartialEq)]
pub struct RateDecision {
    pub limited: bool,
    pub burst: bool,
    pub remaining: u32,
    pub window_start: Instant,
    pub consecutive_overflows: u32,
}

impl RateDecision {
    /// Whole seconds until the window resets, at least 1
    pub fn retry_after(&self, window: Duration, now: Instant) -> u64 {
        let reset_at = self.window_start + window;
        let left = reset_at.saturating_duration_since(now).as_secs_f64().ceil() as u64;
        left.max(1)
    }

    /// Whether the identity keeps overflowing window after window
    pub fn is_persistent(&self) -> bool {
        self.consecutive_overflows > ESCALATION_THRESHOLD
    }
}

/// Human-readable rejection text for a limited decision
pub fn rejection_message(decision: &RateDecision, limit: u32, retry_after: u64) -> String {
    if decision.is_persistent() {
        "I'm sorry, but you've been sending too many messages. Please try again later.".to_string()
    } else {
        format!(
            "I'm sorry, you've reached the limit of {limit} messages per minute. Please try again in {retry_after} seconds."
        )
    }
}

/// Thread-safe map of identity → [`RateWindow`]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<UserId, RateWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn check(&self, user: &UserId) -> RateDecision {
        self.check_at(user, Instant::now())
    }

    /// Record a request from `user` at `now` and decide whether it is allowed
    pub fn check_at(&self, user: &UserId, now: Instant) -> RateDecision {
        let config = &self.config;
        let mut windows = self.windows.lock();

        let Some(window) = windows.get_mut(user) else {
            let window = RateWindow::open(now, 0);
            let decision = allowed(&window, config.limit);
            windows.insert(user.clone(), window);
            return decision;
        };

        if now.saturating_duration_since(window.window_start) > config.window {
            let overflows = if window.count >= config.limit {
                window.consecutive_overflows + 1
            } else {
                0
            };
            *window = RateWindow::open(now, overflows);
            debug!(user = %user, consecutive_overflows = overflows, "Opened new rate window");
            return allowed(window, config.limit);
        }

        if window.count >= config.limit {
            window.last_request_at = now;
            warn!(user = %user, count = window.count, "Rate limit exceeded");
            return limited(window, false);
        }

        if now.saturating_duration_since(window.last_request_at) < config.burst_interval {
            window.burst_count += 1;
        } else {
            window.burst_count = 1;
        }
        window.last_request_at = now;

        if window.burst_count > config.burst_threshold {
            warn!(user = %user, burst_count = window.burst_count, "Burst limit exceeded");
            return limited(window, true);
        }

        window.count += 1;
        allowed(window, config.limit)
    }

    /// Remove identities idle for longer than ten windows
    pub fn purge_idle(&self, now: Instant) -> usize {
        let idle_after = self.config.window * IDLE_WINDOWS_BEFORE_PURGE;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| now.saturating_duration_since(window.last_request_at) <= idle_after);
        before - windows.len()
    }

    /// Number of identities currently tracked
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn window_for(&self, user: &UserId) -> Option<RateWindow> {
        self.windows.lock().get(user).cloned()
    }
}

fn allowed(window: &RateWindow, limit: u32) -> RateDecision {
    RateDecision {
        limited: false,
        burst: false,
        remaining: limit.saturating_sub(window.count),
        window_start: window.window_start,
        consecutive_overflows: window.consecutive_overflows,
    }
}

fn limited(window: &RateWindow, burst: bool) -> RateDecision {
    RateDecision {
        limited: true,
        burst,
        remaining: 0,
        window_start: window.window_start,
        consecutive_overflows: window.consecutive_overflows,
    }
}
