// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus monitoring metrics.

use std::future::Future;
use std::time::Instant;

use vdb_ore::metric;
use vdb_ore::metrics::{Counter, CounterVec, IntCounter, IntCounterVec, MetricsRegistry};

/// Prometheus monitoring metrics for the clock services.
///
/// Intentionally not Clone because we expect this to be passed around in an
/// Arc.
pub struct Metrics {
    _vecs: MetricsVecs,

    /// Metrics for [`TimestampOracle`](crate::TimestampOracle) and
    /// [`IdAllocator`](crate::IdAllocator) operations.
    pub oracle: OracleMetrics,

    /// Metrics recording how many operations we batch into one oracle call,
    /// only when using the `BatchingTimestampOracle` wrapper.
    pub batching: BatchingMetrics,

    /// Metrics of the `CachingIdAllocator` wrapper.
    pub id_cache: IdCacheMetrics,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Returns a new [Metrics] instance connected to the given registry.
    pub fn new(registry: &MetricsRegistry) -> Self {
        let vecs = MetricsVecs::new(registry);

        Metrics {
            oracle: vecs.oracle_metrics(),
            batching: vecs.batching_metrics(),
            id_cache: IdCacheMetrics {
                refills: registry.register(metric!(
                    name: "vdb_ts_oracle_id_cache_refills_count",
                    help: "count of id ranges fetched to refill the id cache",
                )),
                bypassed: registry.register(metric!(
                    name: "vdb_ts_oracle_id_cache_bypassed_count",
                    help: "count of id requests too large to be served by the id cache",
                )),
            },
            _vecs: vecs,
        }
    }
}

#[derive(Debug)]
struct MetricsVecs {
    external_op_started: IntCounterVec,
    external_op_succeeded: IntCounterVec,
    external_op_failed: IntCounterVec,
    external_op_seconds: CounterVec,

    batched_op_count: IntCounterVec,
    batches_count: IntCounterVec,
}

impl MetricsVecs {
    fn new(registry: &MetricsRegistry) -> Self {
        MetricsVecs {
            external_op_started: registry.register(metric!(
                name: "vdb_ts_oracle_started_count",
                help: "count of oracle operations started",
                var_labels: ["op"],
            )),
            external_op_succeeded: registry.register(metric!(
                name: "vdb_ts_oracle_succeeded_count",
                help: "count of oracle operations succeeded",
                var_labels: ["op"],
            )),
            external_op_failed: registry.register(metric!(
                name: "vdb_ts_oracle_failed_count",
                help: "count of oracle operations failed",
                var_labels: ["op"],
            )),
            external_op_seconds: registry.register(metric!(
                name: "vdb_ts_oracle_seconds",
                help: "time spent in oracle operations",
                var_labels: ["op"],
            )),

            batched_op_count: registry.register(metric!(
                name: "vdb_ts_oracle_batched_op_count",
                help: "count of batched operations",
                var_labels: ["op"],
            )),
            batches_count: registry.register(metric!(
                name: "vdb_ts_oracle_batches_count",
                help: "count of batches of operations",
                var_labels: ["op"],
            )),
        }
    }

    fn oracle_metrics(&self) -> OracleMetrics {
        OracleMetrics {
            alloc_timestamps: self.external_op_metrics("alloc_timestamps"),
            alloc_ids: self.external_op_metrics("alloc_ids"),
        }
    }

    fn external_op_metrics(&self, op: &str) -> ExternalOpMetrics {
        ExternalOpMetrics {
            started: self.external_op_started.with_label_values(&[op]),
            succeeded: self.external_op_succeeded.with_label_values(&[op]),
            failed: self.external_op_failed.with_label_values(&[op]),
            seconds: self.external_op_seconds.with_label_values(&[op]),
        }
    }

    fn batching_metrics(&self) -> BatchingMetrics {
        BatchingMetrics {
            alloc_timestamp: BatchedOpMetrics {
                ops_count: self.batched_op_count.with_label_values(&["alloc_timestamp"]),
                batches_count: self.batches_count.with_label_values(&["alloc_timestamp"]),
            },
        }
    }
}

/// Counters around a single kind of oracle operation.
#[derive(Debug)]
pub struct ExternalOpMetrics {
    started: IntCounter,
    succeeded: IntCounter,
    failed: IntCounter,
    seconds: Counter,
}

impl ExternalOpMetrics {
    pub(crate) async fn run_op<R, E, F, OpFn>(&self, op_fn: OpFn) -> Result<R, E>
    where
        F: Future<Output = Result<R, E>>,
        OpFn: FnOnce() -> F,
    {
        self.started.inc();
        let start = Instant::now();
        let res = op_fn().await;
        self.seconds.inc_by(start.elapsed().as_secs_f64());
        match res.as_ref() {
            Ok(_) => self.succeeded.inc(),
            Err(_) => self.failed.inc(),
        };
        res
    }

    /// Operations that completed successfully.
    pub fn succeeded_count(&self) -> u64 {
        self.succeeded.get()
    }

    /// Operations that returned an error.
    pub fn failed_count(&self) -> u64 {
        self.failed.get()
    }
}

#[derive(Debug)]
pub struct OracleMetrics {
    pub alloc_timestamps: ExternalOpMetrics,
    pub alloc_ids: ExternalOpMetrics,
}

#[derive(Debug)]
pub struct BatchedOpMetrics {
    pub ops_count: IntCounter,
    pub batches_count: IntCounter,
}

#[derive(Debug)]
pub struct BatchingMetrics {
    pub alloc_timestamp: BatchedOpMetrics,
}

#[derive(Debug)]
pub struct IdCacheMetrics {
    pub refills: IntCounter,
    pub bypassed: IntCounter,
}
