//! Sliding-window rate limiter for per-session auth attempts (L1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Sliding-window cap on auth attempts per session.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    state: Arc<RwLock<HashMap<String, Vec<Instant>>>>,
}

impl RateLimiter {
    /// Non-positive configured values are replaced by the documented defaults
    /// (`max_attempts=10`, `window=1 minute`).
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 10 } else { max_attempts },
            window: if window.is_zero() {
                Duration::from_secs(60)
            } else {
                window
            },
            state: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn purge(attempts: &mut Vec<Instant>, now: Instant, window: Duration) {
        let window_start = now.checked_sub(window).unwrap_or(now);
        attempts.retain(|&t| t > window_start);
    }

    /// Purges stale attempts, then rejects if the remaining count is already at
    /// the cap; otherwise records `now` and accepts. Rejections do not extend
    /// the window: a rejected attempt is never pushed.
    pub async fn allow(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let attempts = state.entry(session_id.to_string()).or_default();
        Self::purge(attempts, now, self.window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }

    /// Remaining attempts in the current window after purging stale entries.
    pub async fn remaining(&self, session_id: &str) -> u32 {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let attempts = state.entry(session_id.to_string()).or_default();
        Self::purge(attempts, now, self.window);
        self.max_attempts.saturating_sub(attempts.len() as u32)
    }

    /// Drops the session's attempt list entirely.
    pub async fn reset(&self, session_id: &str) {
        let mut state = self.state.write().await;
        state.remove(session_id);
    }

    /// Drops any session whose attempt list becomes empty after purging.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut state = self.state.write().await;
        for attempts in state.values_mut() {
            Self::purge(attempts, now, self.window);
        }
        state.retain(|_, attempts| !attempts.is_empty());
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_max_attempts() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.allow("s1").await);
        }
        assert!(!limiter.allow("s1").await);
    }

    #[tokio::test]
    async fn rejections_do_not_extend_the_window() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("s1").await);
        for _ in 0..5 {
            assert!(!limiter.allow("s1").await);
        }
        assert_eq!(limiter.remaining("s1").await, 0);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("s1").await);
        assert!(limiter.allow("s2").await);
        assert!(!limiter.allow("s1").await);
    }

    #[tokio::test]
    async fn reset_restores_full_budget() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("s1").await);
        assert!(!limiter.allow("s1").await);
        limiter.reset("s1").await;
        assert!(limiter.allow("s1").await);
    }

    #[tokio::test]
    async fn remaining_reports_max_minus_used() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        limiter.allow("s1").await;
        limiter.allow("s1").await;
        assert_eq!(limiter.remaining("s1").await, 3);
    }

    #[tokio::test]
    async fn non_positive_config_falls_back_to_defaults() {
        let limiter = RateLimiter::new(0, Duration::from_secs(0));
        assert_eq!(limiter.remaining("s1").await, 10);
    }

    #[tokio::test]
    async fn cleanup_drops_sessions_with_empty_windows_after_purge() {
        let limiter = RateLimiter::new(2, Duration::from_millis(20));
        limiter.allow("s1").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        limiter.cleanup().await;
        assert_eq!(limiter.remaining("s1").await, 2);
    }
}
