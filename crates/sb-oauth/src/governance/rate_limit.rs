//! Fixed-window rate limiting
//!
//! Windows start when the first request of a fresh window arrives. Exceeding
//! a limit returns `RateLimited { reset_at }` with no side effect; the
//! returned `reset_at` is the window end and is monotone within a window.

use chrono::Utc;
use parking_lot::Mutex;
use sb_types::{BrokerError, BrokerResult};
use std::collections::HashMap;

/// Which limit bucket an operation draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitKind {
    /// Browser authorizations: 10 per 24 hours per server
    Auth,
    /// Token refreshes: 30 per hour per server
    Refresh,
    /// General requests: 60 per minute per server
    General,
}

impl RateLimitKind {
    fn limit(&self) -> u32 {
        match self {
            RateLimitKind::Auth => 10,
            RateLimitKind::Refresh => 30,
            RateLimitKind::General => 60,
        }
    }

    fn window_ms(&self) -> i64 {
        match self {
            RateLimitKind::Auth => 24 * 3600 * 1000,
            RateLimitKind::Refresh => 3600 * 1000,
            RateLimitKind::General => 60 * 1000,
        }
    }
}

struct WindowState {
    window_start: i64,
    count: u32,
}

/// Per-(kind, server) fixed-window limiter
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(RateLimitKind, String), WindowState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge one request against a bucket
    pub fn check(&self, kind: RateLimitKind, server_id: &str) -> BrokerResult<()> {
        self.check_at(kind, server_id, Utc::now().timestamp_millis())
    }

    /// Clock-injected variant used by tests
    pub fn check_at(&self, kind: RateLimitKind, server_id: &str, now_ms: i64) -> BrokerResult<()> {
        let mut windows = self.windows.lock();
        let state = windows
            .entry((kind, server_id.to_string()))
            .or_insert(WindowState {
                window_start: now_ms,
                count: 0,
            });

        if now_ms - state.window_start >= kind.window_ms() {
            state.window_start = now_ms;
            state.count = 0;
        }

        if state.count >= kind.limit() {
            return Err(BrokerError::RateLimited {
                reset_at: state.window_start + kind.window_ms(),
            });
        }

        state.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_per_kind() {
        let limiter = RateLimiter::new();
        let t0 = 1_700_000_000_000;

        for _ in 0..10 {
            limiter.check_at(RateLimitKind::Auth, "srv", t0).unwrap();
        }
        assert!(limiter.check_at(RateLimitKind::Auth, "srv", t0 + 1).is_err());

        // Other kinds and other servers are unaffected
        limiter.check_at(RateLimitKind::Refresh, "srv", t0).unwrap();
        limiter.check_at(RateLimitKind::Auth, "other", t0).unwrap();
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new();
        let t0 = 1_700_000_000_000;

        for _ in 0..60 {
            limiter.check_at(RateLimitKind::General, "srv", t0).unwrap();
        }
        assert!(limiter.check_at(RateLimitKind::General, "srv", t0 + 59_999).is_err());

        // One window later the bucket is fresh
        limiter
            .check_at(RateLimitKind::General, "srv", t0 + 60_000)
            .unwrap();
    }

    #[test]
    fn test_reset_at_is_monotone_within_window() {
        let limiter = RateLimiter::new();
        let t0 = 1_700_000_000_000;

        for _ in 0..30 {
            limiter.check_at(RateLimitKind::Refresh, "srv", t0).unwrap();
        }

        let mut last_reset = 0;
        for dt in [1, 1000, 30_000, 3_599_999] {
            match limiter.check_at(RateLimitKind::Refresh, "srv", t0 + dt) {
                Err(BrokerError::RateLimited { reset_at }) => {
                    assert!(reset_at >= last_reset);
                    assert_eq!(reset_at, t0 + 3600 * 1000);
                    last_reset = reset_at;
                }
                other => panic!("expected RateLimited, got {:?}", other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_exceeding_has_no_side_effect() {
        let limiter = RateLimiter::new();
        let t0 = 1_700_000_000_000;

        for _ in 0..10 {
            limiter.check_at(RateLimitKind::Auth, "srv", t0).unwrap();
        }
        // Denied requests must not extend or refill the window
        for _ in 0..100 {
            assert!(limiter.check_at(RateLimitKind::Auth, "srv", t0 + 10).is_err());
        }
        limiter
            .check_at(RateLimitKind::Auth, "srv", t0 + 24 * 3600 * 1000)
            .unwrap();
    }
}
