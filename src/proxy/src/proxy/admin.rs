// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Handlers that bypass the task queues.
//!
//! These either only touch local state (cache invalidation, rate limits,
//! metrics) or pass through to a single coordinator.

use futures::future;
use serde_json::json;
use tracing::info;
use vdb_dyncfg::ConfigUpdates;
use vdb_ore::cast::CastFrom;

use crate::error::ProxyError;
use crate::proxy::Proxy;
use crate::rate::RateType;
use crate::types::{
    CollectionId, CompactionState, ComponentStates, Credential, HealthReport, PolicyRefresh,
    QuerySegmentInfo, ReplicaInfo, SegmentId, SegmentInfo, SegmentState,
};

/// A push from the metadata authority that a collection changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionInvalidation {
    pub collection_name: Option<String>,
    pub collection_id: Option<CollectionId>,
    /// The collection was dropped: its channels and shard routes go too.
    pub dropped: bool,
}

impl Proxy {
    /// The state of this front-end. Never fails and does not require the
    /// front-end to be healthy.
    pub fn get_component_states(&self) -> ComponentStates {
        let state = self.state.get();
        ComponentStates {
            node_id: self.node_id,
            role: "proxy".into(),
            state,
            subcomponents: vec![("scheduler".into(), state)],
        }
    }

    /// Asks every coordinator for its health, concurrently.
    pub async fn check_health(&self) -> HealthReport {
        if let Err(e) = self.state.check_healthy() {
            return HealthReport {
                is_healthy: false,
                reasons: vec![e.to_string()],
            };
        }
        let b = &self.backends;
        let (metadata, query, storage, index) = future::join4(
            b.metadata.check_health(),
            b.query.check_health(),
            b.storage.check_health(),
            b.index.check_health(),
        )
        .await;
        let mut reasons = Vec::new();
        for (service, res) in [
            ("metadata", metadata),
            ("query", query),
            ("storage", storage),
            ("index", index),
        ] {
            match res {
                Ok(report) => reasons.extend(
                    report
                        .reasons
                        .into_iter()
                        .map(|r| format!("{service}: {r}")),
                ),
                Err(e) => reasons.push(format!("{service}: {e}")),
            }
        }
        HealthReport {
            is_healthy: reasons.is_empty(),
            reasons,
        }
    }

    /// Drops cached metadata of a collection.
    pub async fn invalidate_collection_meta_cache(
        &self,
        req: CollectionInvalidation,
    ) -> Result<(), ProxyError> {
        self.run_direct("InvalidateCollectionMetaCache", async {
            let cache = &self.env.meta_cache;
            let mut id = req.collection_id;
            if let Some(name) = &req.collection_name {
                id = id.or_else(|| cache.cached_collection_id(name));
                cache.remove_collection_by_name(name);
            }
            if let Some(id) = id {
                cache.remove_collection_by_id(id);
                if req.dropped {
                    self.env.channels.remove_channels(id).await;
                    self.env.shards.remove(id).await;
                }
            }
            info!(
                name = ?req.collection_name,
                id = ?id,
                dropped = req.dropped,
                "invalidated collection cache",
            );
            Ok(())
        })
        .await
    }

    pub async fn invalidate_credential_cache(&self, username: &str) -> Result<(), ProxyError> {
        self.run_direct("InvalidateCredentialCache", async {
            self.env.meta_cache.remove_credential(username);
            Ok(())
        })
        .await
    }

    pub async fn update_credential_cache(&self, credential: Credential) -> Result<(), ProxyError> {
        self.run_direct("UpdateCredentialCache", async {
            self.env.meta_cache.update_credential(credential);
            Ok(())
        })
        .await
    }

    pub async fn refresh_policy_info_cache(
        &self,
        refresh: PolicyRefresh,
    ) -> Result<(), ProxyError> {
        self.run_direct("RefreshPolicyInfoCache", async {
            self.env.meta_cache.refresh_policy(refresh);
            Ok(())
        })
        .await
    }

    pub async fn create_credential(&self, credential: Credential) -> Result<(), ProxyError> {
        self.run_direct("CreateCredential", async {
            if credential.username.is_empty() || credential.encrypted_password.is_empty() {
                return Err(ProxyError::InvalidRequest(
                    "username and password must be set".into(),
                ));
            }
            self.backends
                .metadata
                .create_credential(credential.clone())
                .await?;
            self.env.meta_cache.update_credential(credential);
            Ok(())
        })
        .await
    }

    pub async fn update_credential(&self, credential: Credential) -> Result<(), ProxyError> {
        self.run_direct("UpdateCredential", async {
            self.backends
                .metadata
                .update_credential(credential.clone())
                .await?;
            self.env.meta_cache.update_credential(credential);
            Ok(())
        })
        .await
    }

    pub async fn delete_credential(&self, username: &str) -> Result<(), ProxyError> {
        self.run_direct("DeleteCredential", async {
            self.backends.metadata.delete_credential(username).await?;
            self.env.meta_cache.remove_credential(username);
            Ok(())
        })
        .await
    }

    pub async fn list_cred_users(&self) -> Result<Vec<String>, ProxyError> {
        self.run_direct("ListCredUsers", async {
            Ok(self.backends.metadata.list_cred_users().await?)
        })
        .await
    }

    /// Loading progress of a collection, or of some of its partitions, in
    /// percent.
    pub async fn get_loading_progress(
        &self,
        collection_name: &str,
        partition_names: &[String],
    ) -> Result<u32, ProxyError> {
        self.run_direct("GetLoadingProgress", async {
            let ts = self.now_ts().await?;
            let cache = &self.env.meta_cache;
            let id = cache.collection_id(collection_name, ts).await?;
            let mut partitions = Vec::with_capacity(partition_names.len());
            for name in partition_names {
                partitions.push(cache.partition_id(collection_name, name, ts).await?);
            }
            Ok(self.backends.query.loading_progress(id, partitions).await?)
        })
        .await
    }

    /// Whether every one of `segments` is flushed.
    pub async fn get_flush_state(&self, segments: Vec<SegmentId>) -> Result<bool, ProxyError> {
        self.run_direct("GetFlushState", async {
            Ok(self.backends.storage.flush_state(segments).await?)
        })
        .await
    }

    /// The segments of a collection that are no longer growing.
    pub async fn get_persistent_segment_info(
        &self,
        collection_name: &str,
    ) -> Result<Vec<SegmentInfo>, ProxyError> {
        self.run_direct("GetPersistentSegmentInfo", async {
            let ts = self.now_ts().await?;
            let id = self.env.meta_cache.collection_id(collection_name, ts).await?;
            let segments = self.backends.storage.segments(id).await?;
            Ok(segments
                .into_iter()
                .filter(|s| s.state != SegmentState::Growing)
                .collect())
        })
        .await
    }

    /// The segments of a loaded collection as the query cluster holds them.
    pub async fn get_query_segment_info(
        &self,
        collection_name: &str,
    ) -> Result<Vec<QuerySegmentInfo>, ProxyError> {
        self.run_direct("GetQuerySegmentInfo", async {
            let ts = self.now_ts().await?;
            let id = self.env.meta_cache.collection_id(collection_name, ts).await?;
            Ok(self.backends.query.segment_info(id).await?)
        })
        .await
    }

    pub async fn get_replicas(
        &self,
        collection_name: &str,
    ) -> Result<Vec<ReplicaInfo>, ProxyError> {
        self.run_direct("GetReplicas", async {
            let ts = self.now_ts().await?;
            let id = self.env.meta_cache.collection_id(collection_name, ts).await?;
            Ok(self.backends.query.replicas(id).await?)
        })
        .await
    }

    /// Starts compacting a collection, returning the compaction id.
    pub async fn manual_compaction(&self, collection_name: &str) -> Result<i64, ProxyError> {
        self.run_direct("ManualCompaction", async {
            self.limiter.admit(RateType::DdlCompaction, 1.0)?;
            let ts = self.now_ts().await?;
            let id = self.env.meta_cache.collection_id(collection_name, ts).await?;
            let compaction = self.backends.storage.manual_compaction(id, ts).await?;
            info!(collection = %collection_name, compaction, %ts, "manual compaction started");
            Ok(compaction)
        })
        .await
    }

    pub async fn get_compaction_state(
        &self,
        compaction_id: i64,
    ) -> Result<CompactionState, ProxyError> {
        self.run_direct("GetCompactionState", async {
            Ok(self.backends.storage.compaction_state(compaction_id).await?)
        })
        .await
    }

    /// Replaces the limits of the given operation classes.
    pub async fn set_rates(&self, rates: &[(RateType, f64)]) -> Result<(), ProxyError> {
        self.run_direct("SetRates", async { self.limiter.set_rates(rates) })
            .await
    }

    /// Applies a batch of runtime config updates. Updates to unknown
    /// configs are logged and skipped.
    pub async fn update_configs(&self, updates: &ConfigUpdates) -> Result<(), ProxyError> {
        self.run_direct("UpdateConfigs", async {
            updates.apply(&self.configs);
            info!(updates = updates.len(), "applied config updates");
            Ok(())
        })
        .await
    }

    /// Observed throughput and configured limits, as JSON. Unlimited
    /// classes report `null`.
    pub async fn get_proxy_metrics(&self) -> Result<serde_json::Value, ProxyError> {
        self.run_direct("GetProxyMetrics", async {
            let rates = self.collector.snapshot();
            for (metric, rate) in &rates {
                self.metrics
                    .collector_rate
                    .with_label_values(&[metric.as_str()])
                    .set(*rate);
            }
            let rates: serde_json::Map<_, _> = rates
                .into_iter()
                .map(|(metric, rate)| (metric.as_str().to_owned(), json!(rate)))
                .collect();
            let limits: serde_json::Map<_, _> = self
                .limiter
                .limits()
                .into_iter()
                .map(|(rt, limit)| (rt.as_str().to_owned(), json!(limit)))
                .collect();
            Ok(json!({
                "node_id": self.node_id,
                "pending_mutations": u64::cast_from(self.scheduler.dml_queue().pending_count()),
                "rates": rates,
                "limits": limits,
            }))
        })
        .await
    }
}
