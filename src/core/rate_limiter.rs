use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::{Clock, SystemClock};

pub const REFRESH_LIMIT_COUNT: usize = 10;
pub const REFRESH_LIMIT_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Per-key sliding window that drops calls over the limit.
///
/// Suppressed calls are not queued or retried.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window_millis: i64,
    clock: Arc<dyn Clock>,
    calls: Mutex<HashMap<String, Vec<i64>>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window_millis: window.as_millis() as i64,
            clock: Arc::new(SystemClock),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record a call for `key`, returning false when it is over the limit.
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let window_start = now - self.window_millis;
        let mut calls = self.calls.lock();

        calls.retain(|_, stamps| {
            stamps.retain(|&t| t > window_start);
            !stamps.is_empty()
        });

        let stamps = calls.entry(key.to_string()).or_default();
        if stamps.len() >= self.max_calls {
            return false;
        }
        stamps.push(now);
        true
    }

    /// Run `action` unless `key` is over the limit.
    pub async fn rate_limited<F, Fut, R>(&self, key: &str, action: F) -> Option<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        if !self.try_acquire(key) {
            tracing::debug!("Rate limited call for key {}", key);
            return None;
        }
        Some(action().await)
    }
}

/// Fixed-size ring of recent manual refresh attempts.
#[derive(Debug)]
pub struct RefreshLimiter {
    max_attempts: usize,
    window_millis: i64,
    clock: Arc<dyn Clock>,
    attempts: Mutex<VecDeque<i64>>,
}

impl RefreshLimiter {
    pub fn new(max_attempts: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts,
            window_millis: window.as_millis() as i64,
            clock,
            attempts: Mutex::new(VecDeque::with_capacity(max_attempts)),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now_millis();
        let mut attempts = self.attempts.lock();

        while let Some(&oldest) = attempts.front() {
            if now - oldest >= self.window_millis {
                attempts.pop_front();
            } else {
                break;
            }
        }

        if attempts.len() >= self.max_attempts {
            return false;
        }
        attempts.push_back(now);
        true
    }
}

impl Default for RefreshLimiter {
    fn default() -> Self {
        Self::new(
            REFRESH_LIMIT_COUNT,
            REFRESH_LIMIT_WINDOW,
            Arc::new(SystemClock),
        )
    }
}
