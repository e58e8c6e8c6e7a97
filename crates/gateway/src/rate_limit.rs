//! Per-API-key sliding-window admission control.
//!
//! Each key keeps the instants of its admitted requests from the trailing
//! [`WINDOW`]. A request is admitted while fewer than `rpm` remain after
//! purging. An instant exactly [`WINDOW`] old has already left the window.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

pub const WINDOW: Duration = Duration::from_secs(60);

/// Admissions between sweeps of idle keys.
const CLEANUP_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Whole seconds until the oldest request leaves the window (at least 1).
    Rejected { retry_after_secs: u64 },
}

struct Windows {
    rpm: usize,
    windows: HashMap<String, VecDeque<Instant>>,
    admitted: u64,
}

impl Windows {
    fn admit(&mut self, key: &str, now: Instant) -> Admission {
        let window = self.windows.entry(key.to_string()).or_default();
        while let Some(&oldest) = window.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.rpm {
            let wait = match window.front() {
                Some(&oldest) => WINDOW.saturating_sub(now.saturating_duration_since(oldest)),
                None => WINDOW,
            };
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            return Admission::Rejected {
                retry_after_secs: secs.max(1),
            };
        }

        window.push_back(now);
        self.admitted += 1;
        if self.admitted % CLEANUP_EVERY == 0 {
            self.cleanup(now);
        }
        Admission::Admitted
    }

    /// Forget keys whose window is empty or entirely stale.
    fn cleanup(&mut self, now: Instant) {
        let before = self.windows.len();
        self.windows.retain(|_, w| {
            w.back()
                .map_or(false, |&last| now.saturating_duration_since(last) < WINDOW)
        });
        debug!(removed = before - self.windows.len(), "Rate limiter sweep");
    }
}

/// Thread-safe sliding-window limiter shared by all requests.
pub struct RateLimiter(Mutex<Windows>);

impl RateLimiter {
    pub fn new(rpm: u32) -> Self {
        Self(Mutex::new(Windows {
            rpm: rpm as usize,
            windows: HashMap::new(),
            admitted: 0,
        }))
    }

    pub async fn check(&self, key: &str) -> Admission {
        self.check_at(key, Instant::now()).await
    }

    pub async fn check_at(&self, key: &str, now: Instant) -> Admission {
        self.0.lock().await.admit(key, now)
    }

    pub async fn tracked_keys(&self) -> usize {
        self.0.lock().await.windows.len()
    }
}

/// Last four characters of a key, for logs.
pub fn key_hint(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    chars[chars.len().saturating_sub(4)..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, secs: f64) -> Instant {
        base + Duration::from_secs_f64(secs)
    }

    #[tokio::test]
    async fn test_rejects_over_rpm_with_retry_after() {
        let limiter = RateLimiter::new(3);
        let base = Instant::now();
        for i in 0..3 {
            assert_eq!(limiter.check_at("key", at(base, i as f64)).await, Admission::Admitted);
        }
        // Oldest entry is 10.5s old: 49.5s left, rounded up.
        assert_eq!(
            limiter.check_at("key", at(base, 10.5)).await,
            Admission::Rejected { retry_after_secs: 50 }
        );
        // Other keys are unaffected.
        assert_eq!(limiter.check_at("other", at(base, 10.5)).await, Admission::Admitted);
    }

    #[tokio::test]
    async fn test_admitted_again_once_window_slides() {
        let limiter = RateLimiter::new(2);
        let base = Instant::now();
        assert_eq!(limiter.check_at("k", base).await, Admission::Admitted);
        assert_eq!(limiter.check_at("k", at(base, 1.0)).await, Admission::Admitted);
        assert!(matches!(limiter.check_at("k", at(base, 59.0)).await, Admission::Rejected { .. }));
        // Exactly 60s after the first request it no longer counts.
        assert_eq!(limiter.check_at("k", at(base, 60.0)).await, Admission::Admitted);
        assert!(matches!(limiter.check_at("k", at(base, 60.5)).await, Admission::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::new(1);
        let base = Instant::now();
        limiter.check_at("k", base).await;
        assert_eq!(
            limiter.check_at("k", at(base, 59.9999)).await,
            Admission::Rejected { retry_after_secs: 1 }
        );
    }

    #[tokio::test]
    async fn test_rejections_do_not_extend_the_window() {
        let limiter = RateLimiter::new(1);
        let base = Instant::now();
        limiter.check_at("k", base).await;
        for s in 1..60 {
            assert!(matches!(limiter.check_at("k", at(base, s as f64)).await, Admission::Rejected { .. }));
        }
        assert_eq!(limiter.check_at("k", at(base, 60.0)).await, Admission::Admitted);
    }

    #[tokio::test]
    async fn test_periodic_cleanup_drops_stale_keys() {
        let limiter = RateLimiter::new(1000);
        let base = Instant::now();
        limiter.check_at("idle", base).await;
        assert_eq!(limiter.tracked_keys().await, 1);

        let later = at(base, 120.0);
        for _ in 0..99 {
            limiter.check_at("busy", later).await;
        }
        // The 100th admission triggers the sweep.
        assert_eq!(limiter.tracked_keys().await, 1);
    }

    #[test]
    fn test_key_hint() {
        assert_eq!(key_hint("sk-abcdef1234"), "1234");
        assert_eq!(key_hint("ab"), "ab");
    }
}
