// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A sliding estimate of per-class throughput.
//!
//! Each metric keeps a ring of time buckets. Adds land in the bucket of the
//! current granule with a relaxed atomic increment, so concurrent requests
//! never serialize on the collector. A bucket that belongs to an older
//! granule is reset by the first add that finds it stale; an add racing
//! with that reset may be lost, which only makes the estimate slightly low.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vdb_ore::cast::{CastFrom, CastLossy};
use vdb_ore::now::{EpochMillis, NowFn};

/// The throughput metrics tracked by a [`RateCollector`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Throughput {
    /// Insert payload bytes received.
    InsertBytes,
    /// Delete payload bytes received.
    DeleteBytes,
    /// Query vectors searched.
    SearchVectors,
    /// Queries received.
    QueryRequests,
    /// Merged result bytes sent back.
    ReadResultBytes,
}

impl Throughput {
    pub const ALL: [Throughput; 5] = [
        Throughput::InsertBytes,
        Throughput::DeleteBytes,
        Throughput::SearchVectors,
        Throughput::QueryRequests,
        Throughput::ReadResultBytes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Throughput::InsertBytes => "insert_bytes",
            Throughput::DeleteBytes => "delete_bytes",
            Throughput::SearchVectors => "search_vectors",
            Throughput::QueryRequests => "query_requests",
            Throughput::ReadResultBytes => "read_result_bytes",
        }
    }

    fn index(&self) -> usize {
        match self {
            Throughput::InsertBytes => 0,
            Throughput::DeleteBytes => 1,
            Throughput::SearchVectors => 2,
            Throughput::QueryRequests => 3,
            Throughput::ReadResultBytes => 4,
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    granule: AtomicU64,
    value: AtomicU64,
}

#[derive(Debug)]
struct Ring {
    buckets: Vec<Bucket>,
}

/// Per-second throughput, averaged over a fixed window.
#[derive(Debug)]
pub struct RateCollector {
    now: NowFn,
    granularity_ms: u64,
    rings: Vec<Ring>,
}

impl RateCollector {
    /// Creates a collector averaging over `window` in steps of
    /// `granularity`.
    pub fn new(now: NowFn, window: Duration, granularity: Duration) -> Self {
        let granularity_ms = u64::try_from(granularity.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let slots = usize::cast_from((window_ms / granularity_ms).max(1));
        let rings = Throughput::ALL
            .iter()
            .map(|_| Ring {
                buckets: (0..slots).map(|_| Bucket::default()).collect(),
            })
            .collect();
        RateCollector {
            now,
            granularity_ms,
            rings,
        }
    }

    fn granule(&self, now: EpochMillis) -> u64 {
        now / self.granularity_ms
    }

    /// Records `amount` units of `metric` at the current time.
    pub fn add(&self, metric: Throughput, amount: u64) {
        let granule = self.granule(self.now.now());
        let ring = &self.rings[metric.index()];
        let bucket = &ring.buckets[usize::cast_from(granule) % ring.buckets.len()];
        let seen = bucket.granule.load(Ordering::Acquire);
        if seen != granule
            && bucket
                .granule
                .compare_exchange(seen, granule, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            bucket.value.store(0, Ordering::Release);
        }
        bucket.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// The average per-second rate of `metric` over the window.
    pub fn rate(&self, metric: Throughput) -> f64 {
        let current = self.granule(self.now.now());
        let ring = &self.rings[metric.index()];
        let slots = u64::cast_from(ring.buckets.len());
        let oldest = current.saturating_sub(slots - 1);
        let total: u64 = ring
            .buckets
            .iter()
            .filter(|b| {
                let g = b.granule.load(Ordering::Acquire);
                g >= oldest && g <= current
            })
            .map(|b| b.value.load(Ordering::Relaxed))
            .sum();
        let window_secs = f64::cast_lossy(slots * self.granularity_ms) / 1000.0;
        f64::cast_lossy(total) / window_secs
    }

    /// The rates of every metric.
    pub fn snapshot(&self) -> BTreeMap<Throughput, f64> {
        Throughput::ALL.iter().map(|m| (*m, self.rate(*m))).collect()
    }
}

#[cfg(test)]
mod tests {
    use vdb_ore::now::ManualClock;

    use super::*;

    #[test]
    fn sliding_window() {
        let clock = ManualClock::new(10_000);
        let collector = RateCollector::new(
            clock.now_fn(),
            Duration::from_secs(4),
            Duration::from_secs(1),
        );
        collector.add(Throughput::InsertBytes, 400);
        collector.add(Throughput::InsertBytes, 400);
        assert_eq!(collector.rate(Throughput::InsertBytes), 200.0);
        assert_eq!(collector.rate(Throughput::DeleteBytes), 0.0);

        clock.advance(2_000);
        collector.add(Throughput::InsertBytes, 400);
        assert_eq!(collector.rate(Throughput::InsertBytes), 300.0);

        // The first adds fall out of the window.
        clock.advance(3_000);
        assert_eq!(collector.rate(Throughput::InsertBytes), 100.0);

        // A stale bucket is reset before it is reused.
        clock.advance(4_000);
        collector.add(Throughput::InsertBytes, 4);
        assert_eq!(collector.rate(Throughput::InsertBytes), 1.0);
        assert_eq!(collector.snapshot()[&Throughput::InsertBytes], 1.0);
    }

    #[test]
    fn concurrent_adds() {
        let clock = ManualClock::new(0);
        let collector = std::sync::Arc::new(RateCollector::new(
            clock.now_fn(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let collector = std::sync::Arc::clone(&collector);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        collector.add(Throughput::QueryRequests, 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("thread panicked");
        }
        assert_eq!(collector.rate(Throughput::QueryRequests), 4000.0);
    }
}
