// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Configuration of the front-end.
//!
//! Values that operators tune at runtime are dyncfgs registered by
//! [`all_dyncfgs`]. Values fixed for the life of the process live in
//! [`ProxyConfig`].

use std::time::Duration;

use anyhow::{anyhow, Context};
use vdb_dyncfg::{Config, ConfigSet};
use vdb_ore::metrics::MetricsRegistry;
use vdb_ore::now::{NowFn, SYSTEM_TIME};
use vdb_ore::tracing::TracingConfig;

use crate::types::NodeId;

// All configuration names are prefixed with "proxy_" to avoid collisions
// with the configs of other components sharing a set.

/// Maximum number of DDL tasks executing at once.
pub const DDL_CONCURRENCY: Config<usize> = Config::new(
    "proxy_ddl_concurrency",
    1,
    "Maximum number of DDL tasks executing at once.",
);

/// Maximum number of DML tasks executing at once.
pub const DML_CONCURRENCY: Config<usize> = Config::new(
    "proxy_dml_concurrency",
    16,
    "Maximum number of DML tasks executing at once.",
);

/// Maximum number of DQL tasks executing at once.
pub const DQL_CONCURRENCY: Config<usize> = Config::new(
    "proxy_dql_concurrency",
    16,
    "Maximum number of DQL tasks executing at once.",
);

/// Capacity of each task queue. Fixed when the scheduler is created.
pub const QUEUE_CAPACITY: Config<usize> = Config::new(
    "proxy_queue_capacity",
    1024,
    "Capacity of each task queue; enqueue fails once a queue is full.",
);

/// Deadline of a task, from enqueue to completion.
pub const TASK_TIMEOUT: Config<Duration> = Config::new(
    "proxy_task_timeout",
    Duration::from_secs(60),
    "Deadline of a task, from enqueue to completion.",
);

/// Interval of the time-tick loop.
pub const TIME_TICK_INTERVAL: Config<Duration> = Config::new(
    "proxy_time_tick_interval",
    Duration::from_millis(200),
    "Interval at which time ticks are published to every channel.",
);

/// Interval at which shard routes are refreshed from the query cluster.
pub const SHARD_ROUTE_REFRESH_INTERVAL: Config<Duration> = Config::new(
    "proxy_shard_route_refresh_interval",
    Duration::from_secs(10),
    "Interval at which cached shard routes are refreshed from the query coordinator.",
);

/// Whether a query may succeed with results from a subset of its shards.
pub const ALLOW_PARTIAL_SHARD_RESULTS: Config<bool> = Config::new(
    "proxy_allow_partial_shard_results",
    true,
    "Whether search and query return merged results of the shards that answered \
    when some, but not all, shards failed.",
);

/// Staleness allowed by the `Bounded` consistency level.
pub const BOUNDED_STALENESS: Config<Duration> = Config::new(
    "proxy_bounded_staleness",
    Duration::from_secs(5),
    "Staleness allowed by the Bounded consistency level.",
);

/// Window over which throughput rates are averaged.
pub const RATE_COLLECTOR_WINDOW: Config<Duration> = Config::new(
    "proxy_rate_collector_window",
    Duration::from_secs(10),
    "Window over which throughput rates are averaged. Read when the collector is created.",
);

/// Width of one bucket of the rate collector window.
pub const RATE_COLLECTOR_GRANULARITY: Config<Duration> = Config::new(
    "proxy_rate_collector_granularity",
    Duration::from_secs(1),
    "Width of one bucket of the rate collector window. Read when the collector is created.",
);

/// Largest topk a search may request.
pub const MAX_TOPK: Config<u32> = Config::new(
    "proxy_max_topk",
    16384,
    "Largest topk (plus offset) a search may request.",
);

/// Largest insert request, in bytes.
pub const MAX_INSERT_SIZE: Config<usize> = Config::new(
    "proxy_max_insert_size",
    64 * 1024 * 1024,
    "Largest insert request accepted, in bytes.",
);

/// Row ids fetched from the allocator per refill of the local id cache.
pub const ID_ALLOC_BATCH_SIZE: Config<u32> = Config::new(
    "proxy_id_alloc_batch_size",
    10_000,
    "Row ids fetched from the allocator per refill of the local id cache.",
);

/// Initial limit of DDL collection operations, in requests per second.
pub const RATE_DDL_COLLECTION: Config<f64> = Config::new(
    "proxy_rate_ddl_collection",
    f64::INFINITY,
    "Initial limit of collection DDL, in requests per second.",
);

/// Initial limit of DDL partition operations, in requests per second.
pub const RATE_DDL_PARTITION: Config<f64> = Config::new(
    "proxy_rate_ddl_partition",
    f64::INFINITY,
    "Initial limit of partition DDL, in requests per second.",
);

/// Initial limit of DDL index operations, in requests per second.
pub const RATE_DDL_INDEX: Config<f64> = Config::new(
    "proxy_rate_ddl_index",
    f64::INFINITY,
    "Initial limit of index DDL, in requests per second.",
);

/// Initial limit of flush operations, in requests per second.
pub const RATE_DDL_FLUSH: Config<f64> = Config::new(
    "proxy_rate_ddl_flush",
    f64::INFINITY,
    "Initial limit of flushes, in requests per second.",
);

/// Initial limit of manual compactions, in requests per second.
pub const RATE_DDL_COMPACTION: Config<f64> = Config::new(
    "proxy_rate_ddl_compaction",
    f64::INFINITY,
    "Initial limit of manual compactions, in requests per second.",
);

/// Initial limit of inserts, in bytes per second.
pub const RATE_DML_INSERT: Config<f64> = Config::new(
    "proxy_rate_dml_insert",
    f64::INFINITY,
    "Initial limit of inserts, in bytes per second.",
);

/// Initial limit of deletes, in bytes per second.
pub const RATE_DML_DELETE: Config<f64> = Config::new(
    "proxy_rate_dml_delete",
    f64::INFINITY,
    "Initial limit of deletes, in bytes per second.",
);

/// Initial limit of searches, in query vectors per second.
pub const RATE_DQL_SEARCH: Config<f64> = Config::new(
    "proxy_rate_dql_search",
    f64::INFINITY,
    "Initial limit of searches, in query vectors per second.",
);

/// Initial limit of queries, in requests per second.
pub const RATE_DQL_QUERY: Config<f64> = Config::new(
    "proxy_rate_dql_query",
    f64::INFINITY,
    "Initial limit of queries, in requests per second.",
);

/// Adds the full set of all front-end `Config`s.
pub fn all_dyncfgs(configs: ConfigSet) -> ConfigSet {
    configs
        .add(&DDL_CONCURRENCY)
        .add(&DML_CONCURRENCY)
        .add(&DQL_CONCURRENCY)
        .add(&QUEUE_CAPACITY)
        .add(&TASK_TIMEOUT)
        .add(&TIME_TICK_INTERVAL)
        .add(&SHARD_ROUTE_REFRESH_INTERVAL)
        .add(&ALLOW_PARTIAL_SHARD_RESULTS)
        .add(&BOUNDED_STALENESS)
        .add(&RATE_COLLECTOR_WINDOW)
        .add(&RATE_COLLECTOR_GRANULARITY)
        .add(&MAX_TOPK)
        .add(&MAX_INSERT_SIZE)
        .add(&ID_ALLOC_BATCH_SIZE)
        .add(&RATE_DDL_COLLECTION)
        .add(&RATE_DDL_PARTITION)
        .add(&RATE_DDL_INDEX)
        .add(&RATE_DDL_FLUSH)
        .add(&RATE_DDL_COMPACTION)
        .add(&RATE_DML_INSERT)
        .add(&RATE_DML_DELETE)
        .add(&RATE_DQL_SEARCH)
        .add(&RATE_DQL_QUERY)
}

/// What to do when some shards of a query could not be reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartialResultPolicy {
    /// Merge the shards that answered; fail only if none did.
    AllowPartial,
    /// Fail the query naming the first unreachable shard.
    RequireAll,
}

impl PartialResultPolicy {
    pub fn from_configs(configs: &ConfigSet) -> Self {
        if ALLOW_PARTIAL_SHARD_RESULTS.get(configs) {
            PartialResultPolicy::AllowPartial
        } else {
            PartialResultPolicy::RequireAll
        }
    }
}

/// Configuration fixed for the life of a [`crate::Proxy`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// The id of this front-end node.
    pub node_id: NodeId,
    /// The partition mutations target when none is named.
    pub default_partition_name: String,
    /// Runtime tunables. Must contain [`all_dyncfgs`].
    pub configs: ConfigSet,
    /// Where metrics are registered.
    pub metrics_registry: MetricsRegistry,
    /// Wall clock used by the rate limiter and collector.
    pub now: NowFn,
}

impl ProxyConfig {
    /// A configuration with default tunables and a fresh registry.
    pub fn new(node_id: NodeId) -> Self {
        ProxyConfig {
            node_id,
            default_partition_name: DEFAULT_PARTITION_NAME.to_owned(),
            configs: all_dyncfgs(ConfigSet::default()),
            metrics_registry: MetricsRegistry::new(),
            now: SYSTEM_TIME.clone(),
        }
    }
}

/// The partition every collection is created with.
pub const DEFAULT_PARTITION_NAME: &str = "_default";

/// Command line arguments of the front-end, for embedding binaries to
/// flatten into theirs.
#[derive(Debug, Clone, clap::Parser)]
pub struct ProxyArgs {
    /// The id of this front-end node.
    #[clap(long, env = "PROXY_NODE_ID", default_value = "1")]
    pub node_id: i64,
    /// The partition mutations target when none is named.
    #[clap(long, env = "PROXY_DEFAULT_PARTITION_NAME", default_value = DEFAULT_PARTITION_NAME)]
    pub default_partition_name: String,
    /// Which log messages to emit, as `tracing` directives.
    #[clap(long, env = "PROXY_LOG_FILTER", default_value = "info")]
    pub log_filter: String,
    /// Overrides of dynamic configuration, as `name=value`.
    #[clap(long = "config", env = "PROXY_CONFIGS", value_delimiter = ',')]
    pub configs: Vec<String>,
}

impl ProxyArgs {
    /// The tracing setup these arguments ask for, to pass to
    /// [`vdb_ore::tracing::configure`].
    pub fn tracing_config(&self) -> Result<TracingConfig, anyhow::Error> {
        TracingConfig::from_filter(&self.log_filter, Some(format!("proxy-{}", self.node_id)))
            .with_context(|| format!("parsing log filter {:?}", self.log_filter))
    }

    /// Builds a [`ProxyConfig`], applying the `--config` overrides.
    pub fn into_config(self) -> Result<ProxyConfig, anyhow::Error> {
        let mut config = ProxyConfig::new(NodeId(self.node_id));
        config.default_partition_name = self.default_partition_name;
        for kv in &self.configs {
            let (name, val) = kv
                .split_once('=')
                .ok_or_else(|| anyhow!("config override must be name=value: {kv:?}"))?;
            config
                .configs
                .set_from_str(name.trim(), val.trim())
                .with_context(|| format!("applying config override {kv:?}"))?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn args_overrides() {
        let args = ProxyArgs::parse_from([
            "proxy",
            "--node-id",
            "7",
            "--config",
            "proxy_dml_concurrency=4,proxy_time_tick_interval=50ms",
        ]);
        let config = args.into_config().expect("valid overrides");
        assert_eq!(config.node_id, NodeId(7));
        assert_eq!(config.default_partition_name, DEFAULT_PARTITION_NAME);
        assert_eq!(DML_CONCURRENCY.get(&config.configs), 4);
        assert_eq!(
            TIME_TICK_INTERVAL.get(&config.configs),
            Duration::from_millis(50)
        );

        let args = ProxyArgs::parse_from(["proxy", "--config", "proxy_nope=1"]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn tracing_args() {
        let args = ProxyArgs::parse_from(["proxy", "--log-filter", "warn,vdb_proxy=debug"]);
        let config = args.tracing_config().expect("valid filter");
        assert_eq!(config.stderr_log.prefix.as_deref(), Some("proxy-1"));
        assert_eq!(
            vdb_ore::tracing::target_level(&config.stderr_log.filter, "vdb_proxy::scheduler"),
            tracing::Level::DEBUG
        );

        let args = ProxyArgs::parse_from(["proxy", "--log-filter", "vdb_proxy=loud"]);
        assert!(args.tracing_config().is_err());
    }

    #[test]
    fn partial_policy() {
        let configs = all_dyncfgs(ConfigSet::default());
        assert_eq!(
            PartialResultPolicy::from_configs(&configs),
            PartialResultPolicy::AllowPartial
        );
        ALLOW_PARTIAL_SHARD_RESULTS.set(&configs, false);
        assert_eq!(
            PartialResultPolicy::from_configs(&configs),
            PartialResultPolicy::RequireAll
        );
    }
}
