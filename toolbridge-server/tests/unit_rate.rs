use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use toolbridge_server::rate::{RateDecision, RateLimiter, RateSettings};
use toolbridge_server::Clock;

const NOW: u64 = 1_735_689_600_000;

struct MockClock(AtomicU64);

impl MockClock {
    fn new(now: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(now)))
    }

    fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

fn limiter(max: u32, window_secs: u64, burst: u32) -> (RateLimiter, Arc<MockClock>) {
    let clock = MockClock::new(NOW);
    let settings = RateSettings { max_requests: max, window_secs, burst };
    (RateLimiter::new(Some(settings), clock.clone()), clock)
}

#[test]
fn test_burst_is_consumed_then_limited() {
    let (limiter, _) = limiter(60, 60, 3);

    for i in 0..3 {
        assert!(
            matches!(limiter.check("sub"), RateDecision::Allowed { .. }),
            "request {i} within burst must pass"
        );
    }
    match limiter.check("sub") {
        RateDecision::Limited { retry_after_secs, .. } => {
            assert!(retry_after_secs >= 1, "Retry-After must be at least one second");
        }
        other => panic!("expected Limited, got {other:?}"),
    }
}

#[test]
fn test_tokens_refill_over_time() {
    // 1 request per second, burst 1.
    let (limiter, clock) = limiter(60, 60, 1);

    assert!(matches!(limiter.check("sub"), RateDecision::Allowed { .. }));
    assert!(matches!(limiter.check("sub"), RateDecision::Limited { .. }));

    clock.advance(1000);
    assert!(matches!(limiter.check("sub"), RateDecision::Allowed { .. }));
}

#[test]
fn test_subjects_have_independent_buckets() {
    let (limiter, _) = limiter(60, 60, 1);

    assert!(matches!(limiter.check("alice"), RateDecision::Allowed { .. }));
    assert!(matches!(limiter.check("alice"), RateDecision::Limited { .. }));
    assert!(matches!(limiter.check("bob"), RateDecision::Allowed { .. }));
}

#[test]
fn test_disabled_limiter_always_allows() {
    let clock = MockClock::new(NOW);
    let limiter = RateLimiter::new(None, clock);
    for _ in 0..10_000 {
        assert!(matches!(limiter.check("sub"), RateDecision::Allowed { .. }));
    }
}

#[test]
fn test_bucket_does_not_exceed_capacity() {
    let (limiter, clock) = limiter(60, 60, 2);

    // A long idle period must not accumulate more than the burst capacity.
    clock.advance(60 * 60 * 1000);
    assert!(matches!(limiter.check("sub"), RateDecision::Allowed { .. }));
    assert!(matches!(limiter.check("sub"), RateDecision::Allowed { .. }));
    assert!(matches!(limiter.check("sub"), RateDecision::Limited { .. }));
}
