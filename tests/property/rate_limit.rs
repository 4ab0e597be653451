//! Property-based tests for the relay's fixed-window rate limiter.
//!
//! Uses proptest to verify:
//! 1. Exactly `limit` calls pass in one window; the rest fail.
//! 2. The first call at or after the window boundary always passes.
//! 3. Keys never affect each other.

use std::time::{Duration, Instant};

use huddle_relay::rate_limit::RateLimiter;
use proptest::prelude::*;

proptest! {
    #[test]
    fn admits_exactly_limit_within_window(
        limit in 1u32..50,
        extra in 1u32..50,
        window_ms in 10u64..10_000,
    ) {
        let window = Duration::from_millis(window_ms);
        let limiter = RateLimiter::new(Some(limit), window);
        let t0 = Instant::now();
        let step = window / (limit + extra + 1);

        let admitted = (0..limit + extra)
            .filter(|i| limiter.allow_at("k", t0 + step * *i))
            .count();
        prop_assert_eq!(admitted, limit as usize);
    }

    #[test]
    fn boundary_call_starts_new_window(
        limit in 1u32..20,
        window_ms in 1u64..10_000,
        late_ms in 0u64..10_000,
    ) {
        let window = Duration::from_millis(window_ms);
        let limiter = RateLimiter::new(Some(limit), window);
        let t0 = Instant::now();
        for _ in 0..limit {
            limiter.allow_at("k", t0);
        }
        prop_assert!(!limiter.allow_at("k", t0));
        prop_assert!(limiter.allow_at("k", t0 + window + Duration::from_millis(late_ms)));
    }

    #[test]
    fn keys_are_independent(limit in 1u32..20, keys in prop::collection::hash_set("[a-z0-9.:]{1,16}", 1..8)) {
        let limiter = RateLimiter::new(Some(limit), Duration::from_secs(60));
        let t0 = Instant::now();
        for key in &keys {
            for _ in 0..limit {
                prop_assert!(limiter.allow_at(key, t0));
            }
            prop_assert!(!limiter.allow_at(key, t0));
        }
        prop_assert_eq!(limiter.tracked_keys(), keys.len());
    }
}
