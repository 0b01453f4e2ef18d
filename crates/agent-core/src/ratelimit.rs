//! Fixed-window admission control.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Window limits applied per identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests admitted per window
    pub max_requests: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window_secs: 60,
        }
    }
}

impl RateLimit {
    fn window(self) -> Duration {
        Duration::seconds(i64::try_from(self.window_secs).unwrap_or(i64::MAX / 1_000))
    }
}

/// Counter for the current window.
///
/// The window only rolls over on a check made after `window_end`; a fresh
/// window starts at that check, not at the old boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindow {
    pub window_end: DateTime<Utc>,
    pub count: u32,
}

impl FixedWindow {
    /// A window that has already lapsed at `now`, so the first check opens a new one
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_end: now,
            count: 0,
        }
    }

    /// Admit one request at `now`, or reject it without counting
    pub fn check(&mut self, now: DateTime<Utc>, limit: RateLimit) -> bool {
        if now > self.window_end {
            self.count = 0;
            self.window_end = now + limit.window();
        }

        if self.count >= limit.max_requests {
            return false;
        }

        self.count += 1;
        true
    }
}
