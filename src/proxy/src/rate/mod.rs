// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Admission control.
//!
//! Every operation class has a [`TokenBucket`]. Admission is checked before
//! a task enters its queue, so a rejected request costs neither a timestamp
//! nor a queue slot. Limits are replaced at runtime by
//! [`MultiRateLimiter::set_rates`], which swaps in a new limiter set in one
//! step: a concurrent admission sees either the old limits or the new ones,
//! never a mix.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use prometheus::GaugeVec;
use serde::{Deserialize, Serialize};
use tracing::info;
use vdb_dyncfg::{Config, ConfigSet};
use vdb_ore::now::NowFn;

use crate::config;
use crate::error::ProxyError;

mod collector;
mod limiter;

pub use collector::{RateCollector, Throughput};
pub use limiter::TokenBucket;

/// The operation classes with independent rate budgets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RateType {
    /// Collection DDL, in requests.
    DdlCollection,
    /// Partition DDL, in requests.
    DdlPartition,
    /// Index DDL, in requests.
    DdlIndex,
    /// Flushes, in requests.
    DdlFlush,
    /// Manual compactions, in requests.
    DdlCompaction,
    /// Inserts, in payload bytes.
    DmlInsert,
    /// Deletes, in payload bytes.
    DmlDelete,
    /// Searches, in query vectors.
    DqlSearch,
    /// Queries, in requests.
    DqlQuery,
}

impl RateType {
    pub const ALL: [RateType; 9] = [
        RateType::DdlCollection,
        RateType::DdlPartition,
        RateType::DdlIndex,
        RateType::DdlFlush,
        RateType::DdlCompaction,
        RateType::DmlInsert,
        RateType::DmlDelete,
        RateType::DqlSearch,
        RateType::DqlQuery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateType::DdlCollection => "ddl_collection",
            RateType::DdlPartition => "ddl_partition",
            RateType::DdlIndex => "ddl_index",
            RateType::DdlFlush => "ddl_flush",
            RateType::DdlCompaction => "ddl_compaction",
            RateType::DmlInsert => "dml_insert",
            RateType::DmlDelete => "dml_delete",
            RateType::DqlSearch => "dql_search",
            RateType::DqlQuery => "dql_query",
        }
    }

    /// The dyncfg holding the limit this class starts with.
    fn initial_limit(&self) -> &'static Config<f64> {
        match self {
            RateType::DdlCollection => &config::RATE_DDL_COLLECTION,
            RateType::DdlPartition => &config::RATE_DDL_PARTITION,
            RateType::DdlIndex => &config::RATE_DDL_INDEX,
            RateType::DdlFlush => &config::RATE_DDL_FLUSH,
            RateType::DdlCompaction => &config::RATE_DDL_COMPACTION,
            RateType::DmlInsert => &config::RATE_DML_INSERT,
            RateType::DmlDelete => &config::RATE_DML_DELETE,
            RateType::DqlSearch => &config::RATE_DQL_SEARCH,
            RateType::DqlQuery => &config::RATE_DQL_QUERY,
        }
    }
}

impl fmt::Display for RateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type LimiterSet = BTreeMap<RateType, Arc<TokenBucket>>;

/// Rate limiters of every [`RateType`].
#[derive(Debug)]
pub struct MultiRateLimiter {
    now: NowFn,
    limiters: RwLock<Arc<LimiterSet>>,
    gauge: GaugeVec,
}

impl MultiRateLimiter {
    /// Creates limiters with the initial limits in `configs`.
    pub fn new(configs: &ConfigSet, now: NowFn, gauge: GaugeVec) -> Self {
        let limiters: LimiterSet = RateType::ALL
            .iter()
            .map(|rt| {
                let limit = rt.initial_limit().get(configs);
                gauge.with_label_values(&[rt.as_str()]).set(limit);
                (*rt, Arc::new(TokenBucket::new(limit, now.clone())))
            })
            .collect();
        MultiRateLimiter {
            now,
            limiters: RwLock::new(Arc::new(limiters)),
            gauge,
        }
    }

    fn current(&self) -> Arc<LimiterSet> {
        Arc::clone(&self.limiters.read().expect("lock poisoned"))
    }

    /// Admits a request of class `rate_type` costing `cost` units.
    pub fn admit(&self, rate_type: RateType, cost: f64) -> Result<(), ProxyError> {
        let limiters = self.current();
        match limiters.get(&rate_type) {
            Some(bucket) if !bucket.allow(cost) => Err(ProxyError::AdmissionDenied(rate_type)),
            _ => Ok(()),
        }
    }

    /// Gives back the cost of an admitted request that never ran.
    pub fn refund(&self, rate_type: RateType, cost: f64) {
        if let Some(bucket) = self.current().get(&rate_type) {
            bucket.cancel(cost);
        }
    }

    /// Replaces the limits of the given classes. Classes not named keep
    /// their limiter and its accumulated tokens.
    ///
    /// Rejects the whole update if any limit is negative or NaN.
    pub fn set_rates(&self, rates: &[(RateType, f64)]) -> Result<(), ProxyError> {
        if let Some((rt, limit)) = rates.iter().find(|(_, l)| l.is_nan() || *l < 0.0) {
            return Err(ProxyError::InvalidRequest(format!(
                "invalid limit {limit} for {rt}"
            )));
        }
        let mut limiters = self.limiters.write().expect("lock poisoned");
        let mut next = LimiterSet::clone(&limiters);
        for (rt, limit) in rates {
            next.insert(*rt, Arc::new(TokenBucket::new(*limit, self.now.clone())));
        }
        *limiters = Arc::new(next);
        drop(limiters);

        for (rt, limit) in rates {
            self.gauge.with_label_values(&[rt.as_str()]).set(*limit);
        }
        info!(?rates, "rate limits updated");
        Ok(())
    }

    /// The current limit of every class.
    pub fn limits(&self) -> BTreeMap<RateType, f64> {
        self.current()
            .iter()
            .map(|(rt, bucket)| (*rt, bucket.limit()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use vdb_ore::metrics::MetricsRegistry;
    use vdb_ore::now::ManualClock;

    use super::*;
    use crate::metrics::Metrics;

    fn limiter(clock: &ManualClock) -> MultiRateLimiter {
        let configs = config::all_dyncfgs(ConfigSet::default());
        let metrics = Metrics::register_into(&MetricsRegistry::new());
        MultiRateLimiter::new(&configs, clock.now_fn(), metrics.limiter_rate)
    }

    #[test]
    fn unlimited_by_default() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        for _ in 0..1000 {
            limiter
                .admit(RateType::DmlInsert, 1e9)
                .expect("unlimited");
        }
        assert!(limiter.limits().values().all(|l| *l == f64::INFINITY));
    }

    #[test]
    fn set_rates_applies_together() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        limiter
            .set_rates(&[(RateType::DqlSearch, 1.0), (RateType::DqlQuery, 0.0)])
            .expect("valid rates");
        assert!(limiter.admit(RateType::DqlSearch, 1.0).is_ok());
        assert!(matches!(
            limiter.admit(RateType::DqlSearch, 1.0),
            Err(ProxyError::AdmissionDenied(RateType::DqlSearch))
        ));
        assert!(limiter.admit(RateType::DqlQuery, 1.0).is_err());
        assert!(limiter.admit(RateType::DmlInsert, 1.0).is_ok());

        // An invalid entry rejects the whole update.
        assert!(limiter
            .set_rates(&[(RateType::DqlQuery, 5.0), (RateType::DmlDelete, f64::NAN)])
            .is_err());
        assert_eq!(limiter.limits()[&RateType::DqlQuery], 0.0);

        clock.advance(1_000);
        assert!(limiter.admit(RateType::DqlSearch, 1.0).is_ok());
    }
}
