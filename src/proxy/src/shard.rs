// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shard routes and read fan-out.
//!
//! A read is sent to one replica of every shard of its collection. The
//! replica is chosen round-robin among the replicas currently believed
//! healthy; a replica that fails is marked unhealthy and the next one is
//! tried. A shard fails only once every one of its replicas has failed.
//!
//! Routes are cached per collection, refreshed in the background, and
//! dropped on demand after a shard fails entirely so that the next read
//! fetches fresh leaders.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vdb_dyncfg::ConfigSet;

use crate::backend::QueryCoordinator;
use crate::config::{self, PartialResultPolicy};
use crate::error::{BackendError, ProxyError};
use crate::metrics::Metrics;
use crate::types::{CollectionId, NodeId, ShardId, ShardLeaders};

#[derive(Debug)]
struct Replica {
    node: NodeId,
    healthy: AtomicBool,
}

/// The replicas serving one shard.
#[derive(Debug)]
pub struct ShardRoute {
    shard: ShardId,
    channel: String,
    replicas: Vec<Replica>,
    cursor: AtomicUsize,
}

impl ShardRoute {
    fn new(leaders: ShardLeaders) -> Self {
        ShardRoute {
            shard: leaders.shard,
            channel: leaders.channel,
            replicas: leaders
                .replicas
                .into_iter()
                .map(|node| Replica {
                    node,
                    healthy: AtomicBool::new(true),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Replicas in the order to try them: healthy ones first, starting at
    /// the round-robin cursor, then the unhealthy ones.
    fn attempt_order(&self) -> Vec<&Replica> {
        let n = self.replicas.len();
        if n == 0 {
            return Vec::new();
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        let (healthy, unhealthy): (Vec<_>, Vec<_>) = (0..n)
            .map(|i| &self.replicas[(start + i) % n])
            .partition(|r| r.healthy.load(Ordering::Relaxed));
        healthy.into_iter().chain(unhealthy).collect()
    }

    /// Sends `call` to replicas of this shard until one answers.
    async fn call<R, F, Fut>(&self, call: &F) -> Result<R, BackendError>
    where
        F: Fn(NodeId, ShardId) -> Fut,
        Fut: Future<Output = Result<R, BackendError>>,
    {
        let mut last_error = BackendError::unreachable(
            "query cluster",
            format!("shard {} has no replicas", self.shard),
        );
        for replica in self.attempt_order() {
            match call(replica.node, self.shard).await {
                Ok(res) => {
                    replica.healthy.store(true, Ordering::Relaxed);
                    return Ok(res);
                }
                Err(e) => {
                    warn!(
                        shard = %self.shard,
                        channel = %self.channel,
                        node = %replica.node,
                        error = %e,
                        "shard replica failed",
                    );
                    replica.healthy.store(false, Ordering::Relaxed);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// The shard routes of one collection.
#[derive(Debug)]
pub struct CollectionRoute {
    shards: Vec<ShardRoute>,
}

impl CollectionRoute {
    fn new(leaders: Vec<ShardLeaders>) -> Self {
        let mut shards: Vec<_> = leaders.into_iter().map(ShardRoute::new).collect();
        shards.sort_by_key(|s| s.shard);
        CollectionRoute { shards }
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.shards.iter().map(|s| s.shard)
    }
}

/// The per-shard results of a dispatched read.
#[derive(Debug)]
pub struct DispatchOutcome<R> {
    /// Results of the shards that answered, in shard order.
    pub partials: Vec<(ShardId, R)>,
    /// Shards none of whose replicas answered.
    pub unanswered: Vec<ShardId>,
}

/// Cached shard routes and the fan-out over them.
#[derive(Debug)]
pub struct ShardManager {
    query: Arc<dyn QueryCoordinator>,
    routes: RwLock<BTreeMap<CollectionId, Arc<CollectionRoute>>>,
    configs: ConfigSet,
    metrics: Metrics,
}

impl ShardManager {
    pub fn new(query: Arc<dyn QueryCoordinator>, configs: ConfigSet, metrics: Metrics) -> Self {
        ShardManager {
            query,
            routes: RwLock::new(BTreeMap::new()),
            configs,
            metrics,
        }
    }

    /// The route of `collection`, fetched from the query coordinator if
    /// not cached.
    pub async fn route(
        &self,
        collection: CollectionId,
    ) -> Result<Arc<CollectionRoute>, ProxyError> {
        if let Some(route) = self.routes.read().await.get(&collection) {
            return Ok(Arc::clone(route));
        }
        let route = self.fetch(collection).await?;
        self.routes
            .write()
            .await
            .insert(collection, Arc::clone(&route));
        Ok(route)
    }

    async fn fetch(&self, collection: CollectionId) -> Result<Arc<CollectionRoute>, ProxyError> {
        let leaders = self.query.shard_leaders(collection).await?;
        if leaders.is_empty() {
            return Err(ProxyError::InvalidRequest(format!(
                "collection {collection} is not loaded"
            )));
        }
        debug!(%collection, shards = leaders.len(), "fetched shard leaders");
        Ok(Arc::new(CollectionRoute::new(leaders)))
    }

    /// Forgets the route of `collection`.
    pub async fn remove(&self, collection: CollectionId) {
        self.routes.write().await.remove(&collection);
    }

    /// Sends `call` to one replica of every shard of `collection`, all
    /// shards concurrently.
    ///
    /// Fails if no shard answered. Under [`PartialResultPolicy::RequireAll`]
    /// also fails if any shard did not answer; otherwise the unanswered
    /// shards are reported in the outcome.
    pub async fn dispatch<R, F, Fut>(
        &self,
        collection: CollectionId,
        query_type: &str,
        call: F,
    ) -> Result<DispatchOutcome<R>, ProxyError>
    where
        F: Fn(NodeId, ShardId) -> Fut,
        Fut: Future<Output = Result<R, BackendError>>,
    {
        let route = self.route(collection).await?;
        let results = join_all(route.shards.iter().map(|shard| async {
            (shard.shard, shard.call(&call).await)
        }))
        .await;

        let shards = results.len();
        let mut outcome = DispatchOutcome {
            partials: Vec::with_capacity(shards),
            unanswered: Vec::new(),
        };
        let mut last_error = None;
        for (shard, res) in results {
            match res {
                Ok(partial) => outcome.partials.push((shard, partial)),
                Err(e) => {
                    outcome.unanswered.push(shard);
                    last_error = Some(e);
                }
            }
        }
        let Some(last_error) = last_error else {
            return Ok(outcome);
        };

        // Some shard lost every replica; its leaders have likely moved.
        self.remove(collection).await;
        if outcome.partials.is_empty() {
            return Err(ProxyError::AllShardsFailed { shards, last_error });
        }
        match PartialResultPolicy::from_configs(&self.configs) {
            PartialResultPolicy::RequireAll => {
                Err(ProxyError::ShardUnavailable(outcome.unanswered[0]))
            }
            PartialResultPolicy::AllowPartial => {
                warn!(
                    %collection,
                    unanswered = ?outcome.unanswered,
                    "merging results without every shard",
                );
                self.metrics
                    .partial_shard_results
                    .with_label_values(&[query_type])
                    .inc();
                Ok(outcome)
            }
        }
    }

    /// Re-fetches every cached route, resetting replica health.
    pub async fn refresh(&self) {
        let collections: Vec<_> = self.routes.read().await.keys().copied().collect();
        for collection in collections {
            match self.fetch(collection).await {
                Ok(route) => {
                    let mut routes = self.routes.write().await;
                    // Skip collections removed while fetching.
                    if let Some(entry) = routes.get_mut(&collection) {
                        *entry = route;
                    }
                }
                Err(e) => warn!(%collection, error = %e, "failed to refresh shard route"),
            }
        }
    }

    /// Refreshes routes every [`config::SHARD_ROUTE_REFRESH_INTERVAL`]
    /// until `shutdown` fires.
    pub async fn run_refresher(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let interval = config::SHARD_ROUTE_REFRESH_INTERVAL.get(&self.configs);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.refresh().await,
            }
        }
        info!("shard route refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use vdb_ore::metrics::MetricsRegistry;

    use super::*;
    use crate::testing::MemQueryCoordinator;

    fn leaders(shards: u32, replicas: i64) -> Vec<ShardLeaders> {
        (0..shards)
            .map(|s| ShardLeaders {
                shard: ShardId(s),
                channel: format!("dml_{s}"),
                replicas: (0..replicas)
                    .map(|r| NodeId(i64::from(s) * 10 + r))
                    .collect(),
            })
            .collect()
    }

    fn manager(leaders: Vec<ShardLeaders>) -> (Arc<MemQueryCoordinator>, ShardManager) {
        let query = Arc::new(MemQueryCoordinator::default());
        query.set_shard_leaders(CollectionId(1), leaders);
        let configs = config::all_dyncfgs(ConfigSet::default());
        let metrics = Metrics::register_into(&MetricsRegistry::new());
        let manager = ShardManager::new(
            Arc::clone(&query) as Arc<dyn QueryCoordinator>,
            configs,
            metrics,
        );
        (query, manager)
    }

    #[tokio::test]
    async fn round_robin_over_replicas() {
        let (_query, manager) = manager(leaders(1, 3));
        let seen = Mutex::new(Vec::new());
        for _ in 0..6 {
            manager
                .dispatch(CollectionId(1), "search", |node, _shard| {
                    seen.lock().expect("lock poisoned").push(node);
                    async { Ok::<_, BackendError>(()) }
                })
                .await
                .expect("dispatched");
        }
        let seen = seen.into_inner().expect("lock poisoned");
        assert_eq!(
            seen,
            [0, 1, 2, 0, 1, 2].map(NodeId).to_vec(),
            "each replica is used in turn"
        );
    }

    #[tokio::test]
    async fn failed_replica_falls_over() {
        let (_query, manager) = manager(leaders(2, 2));
        let outcome = manager
            .dispatch(CollectionId(1), "search", |node, shard| async move {
                if node == NodeId(0) {
                    Err(BackendError::unreachable("worker", "down"))
                } else {
                    Ok((node, shard))
                }
            })
            .await
            .expect("dispatched");
        assert!(outcome.unanswered.is_empty());
        let nodes: BTreeSet<_> = outcome.partials.iter().map(|(_, (n, _))| *n).collect();
        assert!(!nodes.contains(&NodeId(0)));
        assert_eq!(outcome.partials.len(), 2);
    }

    #[tokio::test]
    async fn partial_and_total_failure() {
        let (_query, manager) = manager(leaders(4, 1));
        let outcome = manager
            .dispatch(CollectionId(1), "search", |_node, shard| async move {
                if shard == ShardId(3) {
                    Err(BackendError::unreachable("worker", "down"))
                } else {
                    Ok(shard)
                }
            })
            .await
            .expect("partial results allowed");
        assert_eq!(outcome.unanswered, vec![ShardId(3)]);
        assert_eq!(
            outcome.partials.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            vec![ShardId(0), ShardId(1), ShardId(2)]
        );

        let err = manager
            .dispatch(CollectionId(1), "search", |_node, _shard| async {
                Err::<(), _>(BackendError::unreachable("worker", "down"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::AllShardsFailed { shards: 4, .. }));

        config::ALLOW_PARTIAL_SHARD_RESULTS.set(&manager.configs, false);
        let err = manager
            .dispatch(CollectionId(1), "search", |_node, shard| async move {
                if shard == ShardId(2) {
                    Err(BackendError::unreachable("worker", "down"))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ShardUnavailable(ShardId(2))));
    }

    #[tokio::test]
    async fn routes_are_cached_and_refreshed() {
        let (query, manager) = manager(leaders(2, 1));
        let route = manager.route(CollectionId(1)).await.expect("route");
        assert_eq!(route.shards().count(), 2);

        query.set_shard_leaders(CollectionId(1), leaders(3, 1));
        let cached = manager.route(CollectionId(1)).await.expect("route");
        assert!(Arc::ptr_eq(&route, &cached));

        manager.refresh().await;
        let refreshed = manager.route(CollectionId(1)).await.expect("route");
        assert_eq!(refreshed.shards().count(), 3);

        let err = manager.route(CollectionId(2)).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }
}
