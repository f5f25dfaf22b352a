// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-process implementations of the clock services.
//!
//! These back single-node deployments and tests. A clustered deployment
//! talks to a remote allocator through the same traits.

use std::ops::Range;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use vdb_ore::now::NowFn;

use crate::metrics::Metrics;
use crate::{IdAllocator, OracleError, Timestamp, TimestampOracle};

/// A [`TimestampOracle`] that keeps its high-water mark in memory.
///
/// Timestamps are composed from the wall clock read through `now`. When the
/// clock stalls or moves backwards the logical counter keeps the sequence
/// strictly increasing.
pub struct MemTimestampOracle {
    now: NowFn,
    last: Mutex<Option<Timestamp>>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for MemTimestampOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTimestampOracle")
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl MemTimestampOracle {
    /// Creates an oracle reading wall-clock time from `now`.
    pub fn new(now: NowFn, metrics: Arc<Metrics>) -> Self {
        MemTimestampOracle {
            now,
            last: Mutex::new(None),
            metrics,
        }
    }

    fn alloc(&self, count: u32) -> Result<Timestamp, OracleError> {
        if count == 0 {
            return Err(OracleError::InvalidCount(count));
        }
        let wall = Timestamp::compose(self.now.now(), 0);
        let mut last = self.last.lock().expect("lock poisoned");
        let first = match *last {
            Some(prev) => std::cmp::max(wall, prev.step_forward().ok_or(OracleError::Exhausted)?),
            None => wall,
        };
        let end = first
            .checked_add(u64::from(count) - 1)
            .ok_or(OracleError::Exhausted)?;
        *last = Some(end);
        Ok(first)
    }
}

#[async_trait]
impl TimestampOracle for MemTimestampOracle {
    #[tracing::instrument(name = "oracle::alloc_timestamps", level = "trace", skip(self))]
    async fn alloc_timestamps(&self, count: u32) -> Result<Timestamp, OracleError> {
        self.metrics
            .oracle
            .alloc_timestamps
            .run_op(|| async { self.alloc(count) })
            .await
    }
}

/// An [`IdAllocator`] backed by an in-memory counter.
#[derive(Debug)]
pub struct MemIdAllocator {
    next: AtomicI64,
    metrics: Arc<Metrics>,
}

impl MemIdAllocator {
    /// Creates an allocator whose first id is `first`.
    pub fn new(first: i64, metrics: Arc<Metrics>) -> Self {
        MemIdAllocator {
            next: AtomicI64::new(first),
            metrics,
        }
    }
}

#[async_trait]
impl IdAllocator for MemIdAllocator {
    async fn alloc_id_range(&self, count: u32) -> Result<Range<i64>, OracleError> {
        self.metrics
            .oracle
            .alloc_ids
            .run_op(|| async {
                if count == 0 {
                    return Err(OracleError::InvalidCount(count));
                }
                let count = i64::from(count);
                let start = self.next.fetch_add(count, Ordering::SeqCst);
                let end = start.checked_add(count).ok_or(OracleError::Exhausted)?;
                Ok(start..end)
            })
            .await
    }
}

impl MemIdAllocator {
    /// The id the next allocation will start at.
    pub fn peek_next(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use vdb_ore::metrics::MetricsRegistry;

    use super::*;

    #[tokio::test]
    async fn mem_timestamp_oracle() -> Result<(), anyhow::Error> {
        vdb_ore::test::init_logging();
        let metrics = Arc::new(Metrics::new(&MetricsRegistry::new()));
        crate::tests::timestamp_oracle_impl_test(|now| {
            let oracle: Arc<dyn TimestampOracle> =
                Arc::new(MemTimestampOracle::new(now, Arc::clone(&metrics)));
            std::future::ready(oracle)
        })
        .await?;
        assert!(metrics.oracle.alloc_timestamps.succeeded_count() > 0);
        assert_eq!(metrics.oracle.alloc_timestamps.failed_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn mem_id_allocator() -> Result<(), anyhow::Error> {
        let metrics = Arc::new(Metrics::new(&MetricsRegistry::new()));
        let ids = MemIdAllocator::new(100, metrics);
        assert_eq!(ids.alloc_id_range(3).await?, 100..103);
        assert_eq!(ids.alloc_id_range(1).await?, 103..104);
        assert_eq!(
            ids.alloc_id_range(0).await,
            Err(OracleError::InvalidCount(0))
        );
        assert_eq!(ids.peek_next(), 104);
        Ok(())
    }
}
