// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The front-end service.
//!
//! A [`Proxy`] owns every service the handlers use, constructed explicitly
//! in [`Proxy::new`]. Handlers are grouped by the queue they go through:
//! `ddl`, `dml` and `dql`. `admin` and `rbac` have the ones that bypass the
//! scheduler.
//!
//! Every queued handler follows the same steps: check health, enqueue
//! (which runs admission control), wait for the task's result and record
//! its outcome.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vdb_dyncfg::ConfigSet;
use vdb_timestamp_oracle::batching_oracle::BatchingTimestampOracle;
use vdb_timestamp_oracle::caching_allocator::CachingIdAllocator;
use vdb_timestamp_oracle::Timestamp;

use crate::backend::Backends;
use crate::channels::ChannelManager;
use crate::config::{self, ProxyConfig};
use crate::error::ProxyError;
use crate::meta_cache::MetaCache;
use crate::metrics::Metrics;
use crate::rate::{MultiRateLimiter, RateCollector};
use crate::scheduler::{ServiceState, TaskScheduler};
use crate::shard::ShardManager;
use crate::task::{QueuedTask, TaskEnv, TaskHandle};
use crate::types::{NodeId, StateCode};

mod admin;
mod ddl;
mod dml;
mod dql;
mod rbac;

pub use admin::CollectionInvalidation;

/// The request front-end.
#[derive(Debug)]
pub struct Proxy {
    node_id: NodeId,
    configs: ConfigSet,
    backends: Backends,
    state: Arc<ServiceState>,
    limiter: Arc<MultiRateLimiter>,
    collector: Arc<RateCollector>,
    env: Arc<TaskEnv>,
    scheduler: TaskScheduler,
    metrics: Metrics,
    /// Stops the background loops.
    background: CancellationToken,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Proxy {
    /// Builds a front-end over `backends`. It serves nothing until
    /// [`Proxy::start`].
    ///
    /// Timestamp requests are batched and row ids are cached locally on
    /// top of the given oracle and allocator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ProxyConfig, mut backends: Backends) -> Self {
        let ProxyConfig {
            node_id,
            default_partition_name,
            configs,
            metrics_registry,
            now,
        } = config;
        let metrics = Metrics::register_into(&metrics_registry);
        let oracle_metrics = Arc::new(vdb_timestamp_oracle::metrics::Metrics::new(
            &metrics_registry,
        ));
        backends.oracle = Arc::new(BatchingTimestampOracle::new(
            Arc::clone(&oracle_metrics),
            backends.oracle,
        ));
        backends.ids = Arc::new(CachingIdAllocator::new(
            backends.ids,
            config::ID_ALLOC_BATCH_SIZE.get(&configs),
            oracle_metrics,
        ));
        let limiter = Arc::new(MultiRateLimiter::new(
            &configs,
            now.clone(),
            metrics.limiter_rate.clone(),
        ));
        let collector = Arc::new(RateCollector::new(
            now,
            config::RATE_COLLECTOR_WINDOW.get(&configs),
            config::RATE_COLLECTOR_GRANULARITY.get(&configs),
        ));
        let state = Arc::new(ServiceState::new(StateCode::Initializing));
        let env = Arc::new(TaskEnv {
            backends: backends.clone(),
            meta_cache: Arc::new(MetaCache::new(
                Arc::clone(&backends.metadata),
                metrics.clone(),
            )),
            channels: Arc::new(ChannelManager::new(
                Arc::clone(&backends.stream),
                metrics.clone(),
            )),
            shards: Arc::new(ShardManager::new(
                Arc::clone(&backends.query),
                configs.clone(),
                metrics.clone(),
            )),
            collector: Arc::clone(&collector),
            configs: configs.clone(),
            metrics: metrics.clone(),
            default_partition_name,
        });
        let scheduler = TaskScheduler::new(
            &configs,
            Arc::clone(&backends.oracle),
            Arc::clone(&limiter),
            Arc::clone(&state),
            &metrics,
        );
        Proxy {
            node_id,
            configs,
            backends,
            state,
            limiter,
            collector,
            env,
            scheduler,
            metrics,
            background: CancellationToken::new(),
            background_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Loads policy state, starts the queue dispatchers, the time ticker
    /// and the shard route refresher, and begins serving.
    pub async fn start(&self) -> Result<(), ProxyError> {
        self.env.meta_cache.init_policy().await?;
        self.scheduler.start(Arc::clone(&self.env));

        let mut tasks = self.background_tasks.lock().expect("lock poisoned");
        tasks.push(vdb_ore::task::spawn(
            || "time_ticker",
            Arc::clone(&self.env.channels).run_ticker(
                Arc::clone(self.scheduler.dml_queue()),
                self.configs.clone(),
                self.background.clone(),
            ),
        ));
        tasks.push(vdb_ore::task::spawn(
            || "shard_route_refresher",
            Arc::clone(&self.env.shards).run_refresher(self.background.clone()),
        ));
        drop(tasks);

        self.state.set(StateCode::Healthy);
        info!(node_id = %self.node_id, "proxy serving");
        Ok(())
    }

    /// Stops serving. Tasks still queued fail, executing tasks finish, and
    /// the background loops stop.
    pub async fn shutdown(&self) {
        self.state.set(StateCode::Stopping);
        self.scheduler.shutdown().await;
        self.background.cancel();
        let tasks = std::mem::take(&mut *self.background_tasks.lock().expect("lock poisoned"));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task panicked");
            }
        }
        info!(node_id = %self.node_id, "proxy stopped");
    }

    pub fn state(&self) -> StateCode {
        self.state.get()
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn env(&self) -> &Arc<TaskEnv> {
        &self.env
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// A fresh timestamp, for calls that read metadata outside a task.
    async fn now_ts(&self) -> Result<Timestamp, ProxyError> {
        Ok(self.backends.oracle.alloc_timestamp().await?)
    }

    /// Enqueues `task` for handler `method`, recording a rejection.
    async fn enqueue<T: QueuedTask>(
        &self,
        method: &'static str,
        task: T,
    ) -> Result<TaskHandle<T::Output>, ProxyError> {
        self.metrics.record_call(method, "total");
        match self.scheduler.enqueue(task).await {
            Ok(handle) => {
                debug!(
                    method,
                    id = %handle.id(),
                    begin_ts = %handle.begin_ts(),
                    end_ts = %handle.end_ts(),
                    "task enqueued",
                );
                Ok(handle)
            }
            Err(e) => {
                warn!(method, error = %e, "failed to enqueue task");
                let status = match e {
                    ProxyError::AdmissionDenied(_) => "rejected",
                    _ => "abandon",
                };
                self.metrics.record_call(method, status);
                Err(e)
            }
        }
    }

    /// Waits for the result of a task enqueued at `started`.
    async fn wait<O>(
        &self,
        method: &'static str,
        started: Instant,
        handle: TaskHandle<O>,
    ) -> Result<O, ProxyError> {
        let id = handle.id();
        match handle.wait_for_completion().await {
            Ok(output) => {
                debug!(method, %id, "task done");
                self.metrics.record_success(method, started.elapsed());
                Ok(output)
            }
            Err(e) => {
                warn!(method, %id, error = %e, "task failed");
                self.metrics.record_call(method, "fail");
                Err(e)
            }
        }
    }

    /// Runs `task` to completion on behalf of handler `method`.
    async fn run_task<T: QueuedTask>(
        &self,
        method: &'static str,
        task: T,
    ) -> Result<T::Output, ProxyError> {
        let started = Instant::now();
        let handle = self.enqueue(method, task).await?;
        self.wait(method, started, handle).await
    }

    /// Runs a handler that bypasses the scheduler.
    async fn run_direct<T, F>(&self, method: &'static str, f: F) -> Result<T, ProxyError>
    where
        F: std::future::Future<Output = Result<T, ProxyError>>,
    {
        let started = Instant::now();
        self.metrics.record_call(method, "total");
        if let Err(e) = self.state.check_healthy() {
            self.metrics.record_call(method, "abandon");
            return Err(e);
        }
        match f.await {
            Ok(output) => {
                self.metrics.record_success(method, started.elapsed());
                Ok(output)
            }
            Err(e) => {
                warn!(method, error = %e, "request failed");
                self.metrics.record_call(method, "fail");
                Err(e)
            }
        }
    }
}

/// The error for a task output of the wrong shape.
fn unexpected_output(method: &str, output: impl std::fmt::Debug) -> ProxyError {
    ProxyError::ExecutionFailed(format!("{method} produced {output:?}"))
}
