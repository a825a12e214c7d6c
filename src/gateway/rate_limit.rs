//! Per-origin fixed-window limiter for bridge calls.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::broker::Origin;

/// Origins tracked before expired windows are pruned.
const PRUNE_ABOVE: usize = 1024;

/// Caps how many bridge calls each origin may make per window, so one page
/// cannot flood the operator with prompts or starve other sites.
pub struct RateLimiter {
    max_requests: u64,
    window: Duration,
    windows: Mutex<HashMap<Origin, Window>>,
}

struct Window {
    started: Instant,
    used: u64,
}

impl RateLimiter {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one call from `origin`. `false` means the caller is over budget.
    pub fn check(&self, origin: &Origin) -> bool {
        self.check_at(origin, Instant::now())
    }

    fn check_at(&self, origin: &Origin, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if windows.len() > PRUNE_ABOVE {
            windows.retain(|_, w| now.duration_since(w.started) < self.window);
        }

        let entry = windows.entry(origin.clone()).or_insert(Window {
            started: now,
            used: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.used = 0;
        }
        if entry.used >= self.max_requests {
            return false;
        }
        entry.used += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(raw: &str) -> Origin {
        Origin::parse(raw).unwrap()
    }

    #[test]
    fn caps_each_origin_separately() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let a = origin("https://a.example");
        let b = origin("https://b.example");

        assert!(limiter.check(&a));
        assert!(limiter.check(&a));
        assert!(!limiter.check(&a));
        assert!(limiter.check(&b));
    }

    #[test]
    fn budget_returns_when_the_window_rolls_over() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let a = origin("https://a.example");
        let start = Instant::now();

        assert!(limiter.check_at(&a, start));
        assert!(!limiter.check_at(&a, start + Duration::from_secs(59)));
        assert!(limiter.check_at(&a, start + Duration::from_secs(60)));
    }

    #[test]
    fn zero_budget_rejects_everything() {
        let limiter = RateLimiter::new(0, Duration::from_secs(60));
        assert!(!limiter.check(&origin("https://a.example")));
    }
}
