// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use prometheus::{GaugeVec, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec};
use vdb_ore::metric;
use vdb_ore::metrics::MetricsRegistry;
use vdb_ore::stats::{histogram_byte_buckets, histogram_seconds_buckets};

#[derive(Debug, Clone)]
pub struct Metrics {
    pub function_calls: IntCounterVec,
    pub function_latency_seconds: HistogramVec,
    pub received_bytes: IntCounterVec,
    pub read_result_bytes: IntCounterVec,
    pub read_result_size_bytes: HistogramVec,
    pub mutation_latency_seconds: HistogramVec,
    pub sq_latency_seconds: HistogramVec,
    pub sq_wait_result_latency_seconds: HistogramVec,
    pub sq_reduce_result_latency_seconds: HistogramVec,
    pub insert_vectors: IntCounter,
    pub search_vectors: IntCounter,
    pub partial_shard_results: IntCounterVec,
    pub queue_depth: IntGaugeVec,
    pub queue_in_flight: IntGaugeVec,
    pub queue_wait_seconds: HistogramVec,
    pub limiter_rate: GaugeVec,
    pub collector_rate: GaugeVec,
    pub time_tick_physical_ms: IntGaugeVec,
    pub meta_cache: IntCounterVec,
}

impl Metrics {
    pub(crate) fn register_into(registry: &MetricsRegistry) -> Self {
        Self {
            function_calls: registry.register(metric!(
                name: "vdb_proxy_req_count",
                help: "The total number of handler calls by outcome.",
                var_labels: ["function_name", "status"],
            )),
            function_latency_seconds: registry.register(metric!(
                name: "vdb_proxy_req_latency_seconds",
                help: "Latency of successful handler calls.",
                var_labels: ["function_name"],
                buckets: histogram_seconds_buckets(0.000_128, 32.0),
            )),
            received_bytes: registry.register(metric!(
                name: "vdb_proxy_receive_bytes_count",
                help: "The total number of request payload bytes received.",
                var_labels: ["msg_type"],
            )),
            read_result_bytes: registry.register(metric!(
                name: "vdb_proxy_send_bytes_count",
                help: "The total number of merged result bytes sent back.",
                var_labels: ["query_type"],
            )),
            read_result_size_bytes: registry.register(metric!(
                name: "vdb_proxy_result_size_bytes",
                help: "Size of merged search and query results.",
                var_labels: ["query_type"],
                buckets: histogram_byte_buckets(64.0, 64.0 * 1024.0 * 1024.0),
            )),
            mutation_latency_seconds: registry.register(metric!(
                name: "vdb_proxy_mutation_latency_seconds",
                help: "Latency of successful inserts and deletes.",
                var_labels: ["msg_type"],
                buckets: histogram_seconds_buckets(0.000_128, 32.0),
            )),
            sq_latency_seconds: registry.register(metric!(
                name: "vdb_proxy_sq_latency_seconds",
                help: "Latency of successful searches and queries.",
                var_labels: ["query_type"],
                buckets: histogram_seconds_buckets(0.000_128, 32.0),
            )),
            sq_wait_result_latency_seconds: registry.register(metric!(
                name: "vdb_proxy_sq_wait_result_latency_seconds",
                help: "Time spent waiting for shard results.",
                var_labels: ["query_type"],
                buckets: histogram_seconds_buckets(0.000_128, 32.0),
            )),
            sq_reduce_result_latency_seconds: registry.register(metric!(
                name: "vdb_proxy_sq_reduce_result_latency_seconds",
                help: "Time spent merging shard results.",
                var_labels: ["query_type"],
                buckets: histogram_seconds_buckets(0.000_128, 8.0),
            )),
            insert_vectors: registry.register(metric!(
                name: "vdb_proxy_insert_vectors_count",
                help: "The total number of rows successfully inserted.",
            )),
            search_vectors: registry.register(metric!(
                name: "vdb_proxy_search_vectors_count",
                help: "The total number of query vectors successfully searched.",
            )),
            partial_shard_results: registry.register(metric!(
                name: "vdb_proxy_partial_shard_results_count",
                help: "The number of reads merged without every shard answering.",
                var_labels: ["query_type"],
            )),
            queue_depth: registry.register(metric!(
                name: "vdb_proxy_queue_depth",
                help: "The number of tasks waiting in a queue.",
                var_labels: ["queue"],
            )),
            queue_in_flight: registry.register(metric!(
                name: "vdb_proxy_queue_in_flight",
                help: "The number of tasks of a queue currently executing.",
                var_labels: ["queue"],
            )),
            queue_wait_seconds: registry.register(metric!(
                name: "vdb_proxy_queue_wait_seconds",
                help: "Time tasks spent queued before executing.",
                var_labels: ["queue"],
                buckets: histogram_seconds_buckets(0.000_128, 32.0),
            )),
            limiter_rate: registry.register(metric!(
                name: "vdb_proxy_limiter_rate",
                help: "The configured limit of a rate type; +Inf when unlimited.",
                var_labels: ["rate_type"],
            )),
            collector_rate: registry.register(metric!(
                name: "vdb_proxy_collector_rate",
                help: "The observed per-second throughput of an operation class.",
                var_labels: ["metric"],
            )),
            time_tick_physical_ms: registry.register(metric!(
                name: "vdb_proxy_sync_epoch_time",
                help: "Physical part of the last time tick published to a channel.",
                var_labels: ["channel"],
            )),
            meta_cache: registry.register(metric!(
                name: "vdb_proxy_cache_hit_count",
                help: "Metadata cache lookups by cache and outcome.",
                var_labels: ["cache", "result"],
            )),
        }
    }

    /// Records the outcome of a handler call.
    pub(crate) fn record_call(&self, function_name: &str, status: &str) {
        self.function_calls
            .with_label_values(&[function_name, status])
            .inc();
    }

    pub(crate) fn record_success(&self, function_name: &str, elapsed: Duration) {
        self.record_call(function_name, "success");
        self.function_latency_seconds
            .with_label_values(&[function_name])
            .observe(elapsed.as_secs_f64());
    }
}
