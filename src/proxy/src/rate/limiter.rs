// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A lock-free token bucket limiter driven by a [`NowFn`].

use std::sync::atomic::{AtomicU64, Ordering};

use vdb_ore::cast::CastLossy;
use vdb_ore::now::NowFn;

/// A token bucket refilling at `limit` tokens per second.
///
/// The bucket holds at most `max(limit, 1)` tokens and starts full. A
/// request costing more than the bucket can ever hold is admitted when the
/// bucket is full and leaves it in debt, so oversized requests are slowed
/// down rather than rejected forever.
///
/// Admission never takes a lock: the token count is an `f64` kept in an
/// [`AtomicU64`] and updated with compare-and-swap.
#[derive(Debug)]
pub struct TokenBucket {
    limit: f64,
    burst: f64,
    now: NowFn,
    /// Bits of the `f64` token count. Negative while in debt.
    tokens: AtomicU64,
    /// The last time, in epoch millis, whose refill has been claimed.
    last: AtomicU64,
}

impl TokenBucket {
    /// Creates a full bucket. `limit` must not be negative or NaN.
    pub fn new(limit: f64, now: NowFn) -> Self {
        let burst = limit.max(1.0);
        let last = now.now();
        TokenBucket {
            limit,
            burst,
            now,
            tokens: AtomicU64::new(burst.to_bits()),
            last: AtomicU64::new(last),
        }
    }

    /// The refill rate, in tokens per second.
    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Takes `cost` tokens if available.
    pub fn allow(&self, cost: f64) -> bool {
        if self.limit == f64::INFINITY || cost <= 0.0 {
            return true;
        }
        if self.limit == 0.0 {
            return false;
        }

        self.refill();
        self.update(|tokens| {
            (tokens >= cost || tokens >= self.burst).then(|| tokens - cost)
        })
    }

    /// Returns `cost` tokens taken by an admitted request that was then
    /// not executed.
    pub fn cancel(&self, cost: f64) {
        if self.limit == f64::INFINITY || self.limit == 0.0 || cost <= 0.0 {
            return;
        }
        self.update(|tokens| Some((tokens + cost).min(self.burst)));
    }

    /// Credits the tokens accrued since the last claimed refill. Only the
    /// caller that advances `last` credits a given interval; a clock that
    /// moves backwards credits nothing.
    fn refill(&self) {
        let now = self.now.now();
        let last = self.last.load(Ordering::Acquire);
        if now <= last {
            return;
        }
        if self
            .last
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let refill = f64::cast_lossy(now - last) / 1000.0 * self.limit;
        self.update(|tokens| Some((tokens + refill).min(self.burst)));
    }

    /// Applies `f` to the token count until it wins the race. Returns
    /// false, leaving the count untouched, if `f` declines.
    fn update(&self, mut f: impl FnMut(f64) -> Option<f64>) -> bool {
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                f(f64::from_bits(bits)).map(f64::to_bits)
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use vdb_ore::now::ManualClock;

    use super::*;

    #[test]
    fn refills_over_time() {
        let clock = ManualClock::new(1_000);
        let bucket = TokenBucket::new(2.0, clock.now_fn());
        assert!(bucket.allow(1.0));
        assert!(bucket.allow(1.0));
        assert!(!bucket.allow(1.0));

        clock.advance(500);
        assert!(bucket.allow(1.0));
        assert!(!bucket.allow(1.0));

        // Never refills past the burst.
        clock.advance(60_000);
        assert!(bucket.allow(2.0));
        assert!(!bucket.allow(1.0));
    }

    #[test]
    fn oversized_requests_go_into_debt() {
        let clock = ManualClock::new(0);
        let bucket = TokenBucket::new(10.0, clock.now_fn());
        assert!(bucket.allow(25.0));
        assert!(!bucket.allow(1.0));
        clock.advance(1_000);
        assert!(!bucket.allow(1.0));
        clock.advance(1_600);
        assert!(bucket.allow(1.0));
    }

    #[test]
    fn cancel_returns_tokens() {
        let clock = ManualClock::new(0);
        let bucket = TokenBucket::new(1.0, clock.now_fn());
        assert!(bucket.allow(1.0));
        assert!(!bucket.allow(1.0));
        bucket.cancel(1.0);
        assert!(bucket.allow(1.0));
    }

    #[test]
    fn concurrent_admission_respects_budget() {
        let bucket = TokenBucket::new(100.0, vdb_ore::now::NOW_ZERO.clone());
        let admitted: usize = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| (0..50).filter(|_| bucket.allow(1.0)).count()))
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("worker panicked"))
                .sum()
        });
        assert_eq!(admitted, 100);
        bucket.cancel(3.0);
        assert!(bucket.allow(3.0));
        assert!(!bucket.allow(1.0));
    }

    #[test]
    fn backwards_clock_credits_nothing() {
        let clock = ManualClock::new(5_000);
        let bucket = TokenBucket::new(1.0, clock.now_fn());
        assert!(bucket.allow(1.0));
        clock.set(1_000);
        assert!(!bucket.allow(1.0));
        clock.set(5_500);
        assert!(!bucket.allow(1.0));
        clock.set(6_000);
        assert!(bucket.allow(1.0));
    }

    proptest! {
        #[test]
        fn zero_denies_and_infinite_admits(cost in 0.001f64..1e12) {
            let bucket = TokenBucket::new(0.0, vdb_ore::now::NOW_ZERO.clone());
            prop_assert!(!bucket.allow(cost));
            let bucket = TokenBucket::new(f64::INFINITY, vdb_ore::now::NOW_ZERO.clone());
            for _ in 0..10 {
                prop_assert!(bucket.allow(cost));
            }
        }

        #[test]
        fn never_admits_more_than_budget(limit in 1u32..100, requests in 1usize..300) {
            let bucket = TokenBucket::new(f64::from(limit), vdb_ore::now::NOW_ZERO.clone());
            let admitted = (0..requests).filter(|_| bucket.allow(1.0)).count();
            prop_assert_eq!(admitted, requests.min(usize::try_from(limit).unwrap()));
        }
    }
}
