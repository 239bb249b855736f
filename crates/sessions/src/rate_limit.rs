//! Sliding-window rate limiter (§3's rate-limit window, §8.8/E6).
//!
//! Per user: a time-ordered set of request timestamps trimmed to a window
//! of `window_s` seconds. A request is admitted iff the window size after
//! insertion is `<= requests_per_window`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use aegis_domain::config::RateLimitConfig;

pub struct RateLimiter {
    requests_per_window: u32,
    window: Duration,
    history: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            requests_per_window: config.requests_per_window,
            window: Duration::from_secs(config.window_s),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request attempt for `user_id` and report whether it's
    /// admitted. Trims timestamps older than the window before counting, so
    /// the window slides continuously rather than resetting at fixed
    /// boundaries.
    pub fn check(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut history = self.history.lock().unwrap();
        let timestamps = history.entry(user_id.to_string()).or_default();

        timestamps.retain(|t| now.duration_since(*t) < self.window);
        timestamps.push(now);

        timestamps.len() as u32 <= self.requests_per_window
    }

    /// Drop tracking for users with no requests in the current window, to
    /// bound memory for a long-running gateway process.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut history = self.history.lock().unwrap();
        history.retain(|_, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) < self.window);
            !timestamps.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(n: u32, window_s: u64) -> RateLimitConfig {
        RateLimitConfig { requests_per_window: n, window_s }
    }

    #[test]
    fn admits_up_to_the_limit() {
        let limiter = RateLimiter::new(&cfg(3, 60));
        assert!(limiter.check("u1"));
        assert!(limiter.check("u1"));
        assert!(limiter.check("u1"));
        assert!(!limiter.check("u1"));
    }

    #[test]
    fn tracks_users_independently() {
        let limiter = RateLimiter::new(&cfg(1, 60));
        assert!(limiter.check("u1"));
        assert!(limiter.check("u2"));
        assert!(!limiter.check("u1"));
    }

    #[test]
    fn sixty_first_request_in_window_is_denied() {
        let limiter = RateLimiter::new(&cfg(60, 60));
        for _ in 0..60 {
            assert!(limiter.check("u1"));
        }
        assert!(!limiter.check("u1"));
    }

    #[test]
    fn sweep_drops_empty_histories() {
        let limiter = RateLimiter::new(&cfg(1, 0));
        limiter.check("u1");
        std::thread::sleep(Duration::from_millis(5));
        limiter.sweep();
        assert!(limiter.history.lock().unwrap().is_empty());
    }
}
