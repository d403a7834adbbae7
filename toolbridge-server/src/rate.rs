use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::Clock;

/// Per-subject token bucket settings: `max_requests` per `window_secs`,
/// with `burst` as the bucket capacity.
#[derive(Debug, Clone)]
pub struct RateSettings {
    pub max_requests: u32,
    pub window_secs: u64,
    pub burst: u32,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed { remaining: u64 },
    Limited { retry_after_secs: u64, reset_secs: u64 },
}

/// In-process token-bucket rate limiter keyed by subject. A single-replica
/// artifact: state is not shared across processes.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    settings: Option<RateSettings>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// `settings = None` disables limiting entirely.
    pub fn new(settings: Option<RateSettings>, clock: Arc<dyn Clock>) -> Self {
        Self { clock, settings, buckets: Mutex::new(HashMap::new()) }
    }

    pub fn check(&self, subject: &str) -> RateDecision {
        let Some(settings) = &self.settings else {
            return RateDecision::Allowed { remaining: u64::MAX };
        };

        let capacity = f64::from(settings.burst.max(settings.max_requests)).max(1.0);
        let rate_per_ms =
            f64::from(settings.max_requests) / (settings.window_secs.max(1) * 1000) as f64;
        let now = self.clock.now_ms();

        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = buckets
            .entry(subject.to_string())
            .or_insert(Bucket { tokens: capacity, last_refill_ms: now });

        let elapsed_ms = now.saturating_sub(bucket.last_refill_ms);
        bucket.tokens = (bucket.tokens + elapsed_ms as f64 * rate_per_ms).min(capacity);
        bucket.last_refill_ms = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision::Allowed { remaining: bucket.tokens as u64 }
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / rate_per_ms / 1000.0).ceil() as u64;
            let reset_secs = ((capacity - bucket.tokens) / rate_per_ms / 1000.0).ceil() as u64;
            RateDecision::Limited { retry_after_secs: retry_after_secs.max(1), reset_secs }
        }
    }
}
