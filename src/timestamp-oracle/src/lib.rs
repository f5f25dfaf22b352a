// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The logical clock of the front-end.
//!
//! A [`TimestampOracle`] hands out timestamps that are strictly increasing
//! across calls, cluster-wide. Mutations commit at the timestamp they were
//! stamped with at enqueue and reads observe a snapshot bounded by one, so
//! every ordering decision in the front-end bottoms out here. An
//! [`IdAllocator`] hands out contiguous, never reused ranges of row ids.

use std::fmt;
use std::ops::Range;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vdb_ore::now::EpochMillis;

pub mod batching_oracle;
pub mod caching_allocator;
pub mod memory;
pub mod metrics;

/// Number of low bits of a [`Timestamp`] holding the logical counter.
pub const LOGICAL_BITS: u32 = 18;

const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// A hybrid logical timestamp.
///
/// The high bits hold wall-clock milliseconds and the low [`LOGICAL_BITS`]
/// bits a counter that orders events within the same millisecond. The
/// encoding is order preserving: comparing two timestamps compares their
/// (physical, logical) pairs lexicographically.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The minimum timestamp.
    pub const MIN: Timestamp = Timestamp(u64::MIN);
    /// The maximum timestamp.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Builds a timestamp from its physical and logical parts.
    ///
    /// Logical values wider than [`LOGICAL_BITS`] are truncated.
    pub const fn compose(physical: EpochMillis, logical: u64) -> Self {
        Timestamp((physical << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    /// The wall-clock milliseconds part.
    pub const fn physical(&self) -> EpochMillis {
        self.0 >> LOGICAL_BITS
    }

    /// The logical counter part.
    pub const fn logical(&self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// The raw encoded value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The smallest timestamp greater than `self`, if any.
    pub fn step_forward(&self) -> Option<Self> {
        self.0.checked_add(1).map(Timestamp)
    }

    /// The largest timestamp smaller than `self`, if any.
    pub fn step_back(&self) -> Option<Self> {
        self.0.checked_sub(1).map(Timestamp)
    }

    /// `self + n`, if it does not overflow.
    pub fn checked_add(&self, n: u64) -> Option<Self> {
        self.0.checked_add(n).map(Timestamp)
    }

    /// Moves the physical part back by `millis`, keeping the logical part.
    /// Saturates at the zero physical time.
    pub fn saturating_sub_millis(&self, millis: u64) -> Self {
        Timestamp::compose(self.physical().saturating_sub(millis), self.logical())
    }
}

impl From<u64> for Timestamp {
    fn from(ts: u64) -> Self {
        Timestamp(ts)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from the logical clock and id allocation service.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    /// The allocator could not be reached or refused the request.
    #[error("timestamp oracle unavailable: {0}")]
    Unavailable(String),
    /// A request for zero timestamps or ids.
    #[error("invalid allocation count: {0}")]
    InvalidCount(u32),
    /// The timestamp or id space is exhausted.
    #[error("allocation space exhausted")]
    Exhausted,
}

/// A source of strictly increasing, globally comparable timestamps.
#[async_trait]
pub trait TimestampOracle: fmt::Debug + Send + Sync {
    /// Allocates `count` contiguous timestamps and returns the first one.
    ///
    /// The returned block `[first, first + count)` is strictly greater than
    /// every timestamp returned by any earlier call.
    async fn alloc_timestamps(&self, count: u32) -> Result<Timestamp, OracleError>;

    /// Allocates a single timestamp.
    async fn alloc_timestamp(&self) -> Result<Timestamp, OracleError> {
        self.alloc_timestamps(1).await
    }
}

/// A source of contiguous, never reused row id ranges.
#[async_trait]
pub trait IdAllocator: fmt::Debug + Send + Sync {
    /// Allocates `count` ids as the half open range `[first, first + count)`.
    async fn alloc_id_range(&self, count: u32) -> Result<Range<i64>, OracleError>;
}

// Shared with the implementation tests of every crate that provides an
// oracle.
pub mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use futures::Future;
    use vdb_ore::now::{ManualClock, NowFn};

    use super::*;

    /// Exercises the contract of [`TimestampOracle`] against the oracles
    /// returned by `new_fn`, each reading the given clock.
    pub async fn timestamp_oracle_impl_test<F, NewFn>(
        mut new_fn: NewFn,
    ) -> Result<(), anyhow::Error>
    where
        F: Future<Output = Arc<dyn TimestampOracle>>,
        NewFn: FnMut(NowFn) -> F,
    {
        // A frozen clock still yields strictly increasing timestamps.
        let oracle = new_fn(NowFn::from(|| 0u64)).await;
        let t1 = oracle.alloc_timestamp().await?;
        let t2 = oracle.alloc_timestamp().await?;
        assert!(t1 < t2, "{t1} < {t2}");

        // A block is contiguous and the next allocation lands after it.
        let first = oracle.alloc_timestamps(5).await?;
        assert!(first > t2);
        let next = oracle.alloc_timestamp().await?;
        assert!(next >= first.checked_add(5).expect("small"), "{next}");

        // Zero sized requests are rejected.
        assert_eq!(
            oracle.alloc_timestamps(0).await,
            Err(OracleError::InvalidCount(0))
        );

        // Timestamps follow the wall clock, with a zero logical part on a
        // fresh millisecond.
        let clock = ManualClock::new(1_000);
        let oracle = new_fn(clock.now_fn()).await;
        let ts = oracle.alloc_timestamp().await?;
        assert_eq!(ts, Timestamp::compose(1_000, 0));
        let ts = oracle.alloc_timestamp().await?;
        assert_eq!(ts, Timestamp::compose(1_000, 1));
        clock.advance(5);
        let ts = oracle.alloc_timestamp().await?;
        assert_eq!(ts, Timestamp::compose(1_005, 0));

        // A clock moving backwards never makes timestamps regress.
        clock.set(10);
        let back = oracle.alloc_timestamp().await?;
        assert!(back > ts, "{back} > {ts}");

        // Concurrent callers get distinct timestamps.
        let oracle = new_fn(NowFn::from(|| 7u64)).await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let oracle = Arc::clone(&oracle);
            handles.push(tokio::spawn(async move {
                let mut out = Vec::new();
                for _ in 0..16 {
                    out.push(oracle.alloc_timestamp().await?);
                }
                Ok::<_, OracleError>(out)
            }));
        }
        let mut seen = BTreeSet::new();
        for handle in handles {
            let out = handle.await??;
            assert!(out.windows(2).all(|w| w[0] < w[1]));
            for ts in out {
                assert!(seen.insert(ts), "duplicate timestamp {ts}");
            }
        }
        assert_eq!(seen.len(), 8 * 16);

        Ok(())
    }
}

#[cfg(test)]
mod timestamp_tests {
    use super::*;

    #[test]
    fn hybrid_encoding() {
        let ts = Timestamp::compose(1_700_000_000_000, 42);
        assert_eq!(ts.physical(), 1_700_000_000_000);
        assert_eq!(ts.logical(), 42);
        assert!(Timestamp::compose(5, LOGICAL_MASK) < Timestamp::compose(6, 0));
        assert_eq!(
            Timestamp::compose(5, 0).step_forward(),
            Some(Timestamp::compose(5, 1))
        );
        assert_eq!(Timestamp::MAX.step_forward(), None);
        assert_eq!(Timestamp::MIN.step_back(), None);
    }

    #[test]
    fn staleness() {
        let ts = Timestamp::compose(1_000, 3);
        assert_eq!(ts.saturating_sub_millis(200), Timestamp::compose(800, 3));
        assert_eq!(ts.saturating_sub_millis(5_000), Timestamp::compose(0, 3));
    }
}
