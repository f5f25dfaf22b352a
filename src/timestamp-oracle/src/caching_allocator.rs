// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An [`IdAllocator`] that prefetches id ranges.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::metrics::Metrics;
use crate::{IdAllocator, OracleError};

/// Serves small id requests from a locally cached range, refilling it from
/// the inner allocator `batch_size` ids at a time.
///
/// Ids left in the cache when a request does not fit are discarded, so the
/// ids a caller sees are unique and increasing but not gap free. Requests
/// larger than `batch_size` go straight to the inner allocator.
#[derive(Debug)]
pub struct CachingIdAllocator {
    inner: Arc<dyn IdAllocator>,
    batch_size: u32,
    cached: Mutex<Range<i64>>,
    metrics: Arc<Metrics>,
}

impl CachingIdAllocator {
    /// Wraps `inner`, fetching `batch_size` ids per refill.
    pub fn new(inner: Arc<dyn IdAllocator>, batch_size: u32, metrics: Arc<Metrics>) -> Self {
        CachingIdAllocator {
            inner,
            batch_size: batch_size.max(1),
            cached: Mutex::new(0..0),
            metrics,
        }
    }
}

#[async_trait]
impl IdAllocator for CachingIdAllocator {
    async fn alloc_id_range(&self, count: u32) -> Result<Range<i64>, OracleError> {
        if count == 0 {
            return Err(OracleError::InvalidCount(count));
        }
        if count > self.batch_size {
            self.metrics.id_cache.bypassed.inc();
            return self.inner.alloc_id_range(count).await;
        }

        let count = i64::from(count);
        let mut cached = self.cached.lock().await;
        if cached.end - cached.start < count {
            *cached = self.inner.alloc_id_range(self.batch_size).await?;
            self.metrics.id_cache.refills.inc();
        }
        let start = cached.start;
        cached.start += count;
        Ok(start..cached.start)
    }
}

#[cfg(test)]
mod tests {
    use vdb_ore::metrics::MetricsRegistry;

    use crate::memory::MemIdAllocator;

    use super::*;

    #[tokio::test]
    async fn serves_from_cache() -> Result<(), anyhow::Error> {
        let metrics = Arc::new(Metrics::new(&MetricsRegistry::new()));
        let inner = Arc::new(MemIdAllocator::new(1, Arc::clone(&metrics)));
        let ids = CachingIdAllocator::new(
            Arc::clone(&inner) as Arc<dyn IdAllocator>,
            10,
            Arc::clone(&metrics),
        );

        assert_eq!(ids.alloc_id_range(4).await?, 1..5);
        assert_eq!(ids.alloc_id_range(4).await?, 5..9);
        assert_eq!(metrics.id_cache.refills.get(), 1);

        // Does not fit in the two remaining ids: refill and drop them.
        assert_eq!(ids.alloc_id_range(4).await?, 11..15);
        assert_eq!(metrics.id_cache.refills.get(), 2);

        // Too large for the cache at all.
        assert_eq!(ids.alloc_id_range(50).await?, 21..71);
        assert_eq!(metrics.id_cache.bypassed.get(), 1);
        assert_eq!(inner.peek_next(), 71);
        Ok(())
    }
}
