//! Fixed-window rate limiting keyed by string.
//!
//! The relay keeps two of these: one keyed by client IP for new
//! connections, one keyed by `"{ip}:{channel}"` for frames inside a channel.
//! Windows are hard: a burst straddling a boundary can admit up to twice the
//! limit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Count and start of one key's current window.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    start: Instant,
}

/// Fixed-window limiter.
///
/// A `None` limit admits everything and records nothing.
#[derive(Debug)]
pub struct RateLimiter {
    limit: Option<u32>,
    window: Duration,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `limit` calls per `window` for each key.
    #[must_use]
    pub fn new(limit: Option<u32>, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// A limiter that admits every call.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(None, Duration::from_secs(1))
    }

    /// Configured limit per window.
    #[must_use]
    pub const fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Records a call for `key` now and reports whether it is admitted.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Records a call for `key` at `now` and reports whether it is admitted.
    ///
    /// The first call of a window always passes. A call at or past the end of
    /// the window starts a new one.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let Some(limit) = self.limit else {
            return true;
        };

        let mut windows = self.windows.lock();
        match windows.get_mut(key) {
            Some(w) if now.saturating_duration_since(w.start) < self.window => {
                if w.count < limit {
                    w.count += 1;
                    true
                } else {
                    false
                }
            }
            _ => {
                windows.insert(
                    key.to_string(),
                    RateWindow {
                        count: 1,
                        start: now,
                    },
                );
                true
            }
        }
    }

    /// Drops windows that ended before `now`, returning how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.start) < self.window);
        before - windows.len()
    }

    /// Number of keys with a live window.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }
}
