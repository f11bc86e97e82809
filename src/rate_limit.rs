//! Fixed-window per-caller rate limiting.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admit,
    /// Rejected; the window resets in `retry_after_secs` seconds.
    Reject { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, RateDecision::Admit)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window counter keyed by caller identity.
///
/// Buckets are only replaced on the next request after their window ends;
/// nothing sweeps them in the background.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    window: Duration,
    max_requests: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            window: config.window(),
            max_requests: config.max_requests,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check and count one request from `identity`.
    pub fn allow(&self, identity: &str) -> RateDecision {
        self.allow_at(identity, Instant::now())
    }

    /// [`allow`](Self::allow) with an explicit clock.
    pub fn allow_at(&self, identity: &str, now: Instant) -> RateDecision {
        if !self.enabled {
            return RateDecision::Admit;
        }

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(identity.to_string()).or_insert(Bucket {
            count: 0,
            reset_at: now,
        });

        if now >= bucket.reset_at {
            *bucket = Bucket {
                count: 1,
                reset_at: now + self.window,
            };
            return RateDecision::Admit;
        }

        if bucket.count >= self.max_requests {
            let remaining = bucket.reset_at.saturating_duration_since(now);
            return RateDecision::Reject {
                retry_after_secs: retry_after_secs(remaining),
            };
        }

        bucket.count += 1;
        RateDecision::Admit
    }

    /// Number of identities with a bucket.
    pub fn tracked(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Whole seconds until reset, rounded up, at least one.
fn retry_after_secs(remaining: Duration) -> u64 {
    let millis = remaining.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            window_ms,
            max_requests,
        })
    }

    #[test]
    fn test_admit_admit_reject_then_reset() {
        let limiter = limiter(2, 10_000);
        let start = Instant::now();

        assert_eq!(limiter.allow_at("1.2.3.4", start), RateDecision::Admit);
        assert_eq!(
            limiter.allow_at("1.2.3.4", start + Duration::from_secs(1)),
            RateDecision::Admit
        );
        assert_eq!(
            limiter.allow_at("1.2.3.4", start + Duration::from_millis(2_500)),
            RateDecision::Reject {
                retry_after_secs: 8
            }
        );

        let later = start + Duration::from_secs(11);
        assert_eq!(limiter.allow_at("1.2.3.4", later), RateDecision::Admit);
        assert_eq!(
            limiter.allow_at("1.2.3.4", later + Duration::from_millis(1)),
            RateDecision::Admit
        );
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = limiter(1, 10_000);
        let now = Instant::now();
        assert!(limiter.allow_at("a", now).is_admitted());
        assert!(!limiter.allow_at("a", now).is_admitted());
        assert!(limiter.allow_at("b", now).is_admitted());
        assert_eq!(limiter.tracked(), 2);
    }

    #[test]
    fn test_disabled_always_admits() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            enabled: false,
            window_ms: 1_000,
            max_requests: 0,
        });
        for _ in 0..10 {
            assert!(limiter.allow("x").is_admitted());
        }
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn test_retry_after_minimum_one_second() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1_001)), 2);
    }
}
