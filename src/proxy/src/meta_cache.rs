// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A read-through cache of metadata owned by the metadata authority.
//!
//! Entries have no TTL. They are dropped when the authority (or a DDL
//! task of this front-end) says they changed. Every invalidation bumps a
//! generation counter, and a read-through fetch only populates the cache
//! if no invalidation happened while it was in flight.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;
use vdb_timestamp_oracle::Timestamp;

use crate::backend::MetadataAuthority;
use crate::error::{BackendError, ProxyError};
use crate::metrics::Metrics;
use crate::types::{
    CollectionId, CollectionInfo, Credential, PartitionId, PartitionInfo, PolicyRefresh,
};

#[derive(Debug)]
struct CachedCollection {
    info: Arc<CollectionInfo>,
    partitions: Option<Arc<BTreeMap<String, PartitionInfo>>>,
}

#[derive(Debug, Default)]
struct CacheState {
    /// Keyed by the name the collection was looked up by, which may be an
    /// alias.
    collections: BTreeMap<String, CachedCollection>,
    credentials: BTreeMap<String, Credential>,
    role_policies: BTreeMap<String, BTreeSet<String>>,
    user_roles: BTreeMap<String, BTreeSet<String>>,
}

impl CacheState {
    fn apply_policy(&mut self, refresh: PolicyRefresh) {
        match refresh {
            PolicyRefresh::Grant { role, policy } => {
                self.role_policies.entry(role).or_default().insert(policy);
            }
            PolicyRefresh::Revoke { role, policy } => {
                if let Some(policies) = self.role_policies.get_mut(&role) {
                    policies.remove(&policy);
                }
            }
            PolicyRefresh::AddUserToRole { user, role } => {
                self.user_roles.entry(user).or_default().insert(role);
            }
            PolicyRefresh::RemoveUserFromRole { user, role } => {
                if let Some(roles) = self.user_roles.get_mut(&user) {
                    roles.remove(&role);
                }
            }
            PolicyRefresh::DeleteRole { role } => {
                self.role_policies.remove(&role);
                for roles in self.user_roles.values_mut() {
                    roles.remove(&role);
                }
            }
        }
    }
}

/// Cached collection, partition, credential and policy metadata.
#[derive(Debug)]
pub struct MetaCache {
    metadata: Arc<dyn MetadataAuthority>,
    state: RwLock<CacheState>,
    generation: AtomicU64,
    metrics: Metrics,
}

impl MetaCache {
    pub fn new(metadata: Arc<dyn MetadataAuthority>, metrics: Metrics) -> Self {
        MetaCache {
            metadata,
            state: RwLock::new(CacheState::default()),
            generation: AtomicU64::new(0),
            metrics,
        }
    }

    fn record(&self, cache: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.metrics
            .meta_cache
            .with_label_values(&[cache, result])
            .inc();
    }

    /// Runs `f` on the cache state if no invalidation happened since
    /// `generation` was read. Call with the state's write lock free.
    fn populate(&self, generation: u64, f: impl FnOnce(&mut CacheState)) {
        let mut state = self.state.write().expect("lock poisoned");
        if self.generation.load(Ordering::SeqCst) == generation {
            f(&mut state);
        } else {
            debug!("skipping stale cache fill");
        }
    }

    fn invalidate(&self, f: impl FnOnce(&mut CacheState)) {
        let mut state = self.state.write().expect("lock poisoned");
        f(&mut state);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// The collection named `name`, or aliased as `name`.
    pub async fn collection(
        &self,
        name: &str,
        ts: Timestamp,
    ) -> Result<Arc<CollectionInfo>, ProxyError> {
        if let Some(cached) = self
            .state
            .read()
            .expect("lock poisoned")
            .collections
            .get(name)
        {
            self.record("collection", true);
            return Ok(Arc::clone(&cached.info));
        }
        self.record("collection", false);

        let generation = self.generation.load(Ordering::SeqCst);
        let info = match self.metadata.describe_collection(name, ts).await {
            Ok(info) => Arc::new(info),
            Err(BackendError::Rejected { .. }) => {
                return Err(ProxyError::CollectionMissing(name.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        self.populate(generation, |state| {
            state.collections.insert(
                name.to_owned(),
                CachedCollection {
                    info: Arc::clone(&info),
                    partitions: None,
                },
            );
        });
        Ok(info)
    }

    pub async fn collection_id(
        &self,
        name: &str,
        ts: Timestamp,
    ) -> Result<CollectionId, ProxyError> {
        Ok(self.collection(name, ts).await?.id)
    }

    /// The partitions of `collection`, by name.
    pub async fn partitions(
        &self,
        collection: &str,
        ts: Timestamp,
    ) -> Result<Arc<BTreeMap<String, PartitionInfo>>, ProxyError> {
        let info = self.collection(collection, ts).await?;
        let cached = self
            .state
            .read()
            .expect("lock poisoned")
            .collections
            .get(collection)
            .and_then(|c| c.partitions.as_ref().map(Arc::clone));
        if let Some(partitions) = cached {
            self.record("partition", true);
            return Ok(partitions);
        }
        self.record("partition", false);

        let generation = self.generation.load(Ordering::SeqCst);
        let partitions: Arc<BTreeMap<_, _>> = Arc::new(
            self.metadata
                .show_partitions(&info.name, ts)
                .await?
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        );
        self.populate(generation, |state| {
            if let Some(cached) = state.collections.get_mut(collection) {
                cached.partitions = Some(Arc::clone(&partitions));
            }
        });
        Ok(partitions)
    }

    /// The id of partition `partition` of `collection`.
    pub async fn partition_id(
        &self,
        collection: &str,
        partition: &str,
        ts: Timestamp,
    ) -> Result<PartitionId, ProxyError> {
        self.partitions(collection, ts)
            .await?
            .get(partition)
            .map(|p| p.id)
            .ok_or_else(|| ProxyError::PartitionMissing(partition.to_owned()))
    }

    /// The id of `name` if it is cached. Never fetches.
    pub fn cached_collection_id(&self, name: &str) -> Option<CollectionId> {
        self.state
            .read()
            .expect("lock poisoned")
            .collections
            .get(name)
            .map(|cached| cached.info.id)
    }

    /// Drops every entry of the collection named, or aliased, `name`.
    pub fn remove_collection_by_name(&self, name: &str) {
        self.invalidate(|state| {
            state.collections.retain(|key, cached| {
                key != name
                    && cached.info.name != name
                    && !cached.info.aliases.iter().any(|a| a == name)
            });
        });
    }

    /// Drops every entry of collection `id`.
    pub fn remove_collection_by_id(&self, id: CollectionId) {
        self.invalidate(|state| state.collections.retain(|_, cached| cached.info.id != id));
    }

    /// The credential of `username`.
    pub async fn credential(&self, username: &str) -> Result<Credential, ProxyError> {
        if let Some(credential) = self
            .state
            .read()
            .expect("lock poisoned")
            .credentials
            .get(username)
        {
            self.record("credential", true);
            return Ok(credential.clone());
        }
        self.record("credential", false);

        let generation = self.generation.load(Ordering::SeqCst);
        let credential = self.metadata.get_credential(username).await?;
        self.populate(generation, |state| {
            state
                .credentials
                .insert(username.to_owned(), credential.clone());
        });
        Ok(credential)
    }

    /// Replaces the cached credential of `credential.username`.
    pub fn update_credential(&self, credential: Credential) {
        self.invalidate(|state| {
            state
                .credentials
                .insert(credential.username.clone(), credential);
        });
    }

    pub fn remove_credential(&self, username: &str) {
        self.invalidate(|state| {
            state.credentials.remove(username);
        });
    }

    /// Replaces all policy state with the authority's.
    pub async fn init_policy(&self) -> Result<(), ProxyError> {
        let refreshes = self.metadata.list_policy().await?;
        self.invalidate(|state| {
            state.role_policies.clear();
            state.user_roles.clear();
            for refresh in refreshes {
                state.apply_policy(refresh);
            }
        });
        Ok(())
    }

    /// Applies one grant or membership change pushed by the authority.
    pub fn refresh_policy(&self, refresh: PolicyRefresh) {
        self.invalidate(|state| state.apply_policy(refresh));
    }

    /// The policies granted to `user` through its roles.
    pub fn user_policies(&self, user: &str) -> BTreeSet<String> {
        let state = self.state.read().expect("lock poisoned");
        state
            .user_roles
            .get(user)
            .into_iter()
            .flatten()
            .filter_map(|role| state.role_policies.get(role))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn user_roles(&self, user: &str) -> BTreeSet<String> {
        let state = self.state.read().expect("lock poisoned");
        state.user_roles.get(user).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use vdb_ore::metrics::MetricsRegistry;

    use super::*;
    use crate::testing::{collection_info, MemMetadata};

    fn cache() -> (Arc<MemMetadata>, MetaCache) {
        let metadata = Arc::new(MemMetadata::default());
        let metrics = Metrics::register_into(&MetricsRegistry::new());
        let cache = MetaCache::new(Arc::clone(&metadata) as Arc<dyn MetadataAuthority>, metrics);
        (metadata, cache)
    }

    #[tokio::test]
    async fn read_through_and_invalidate() {
        let (metadata, cache) = cache();
        metadata.insert_collection(collection_info(
            CollectionId(1),
            "books",
            2,
            Timestamp::from(1),
        ));

        let ts = Timestamp::from(10);
        assert_eq!(cache.collection_id("books", ts).await.expect("found"), CollectionId(1));
        assert_eq!(cache.collection_id("books", ts).await.expect("found"), CollectionId(1));
        assert_eq!(metadata.describe_calls(), 1);

        cache.remove_collection_by_id(CollectionId(1));
        cache.collection("books", ts).await.expect("found");
        assert_eq!(metadata.describe_calls(), 2);

        cache.remove_collection_by_name("books");
        metadata.remove_collection("books");
        assert!(matches!(
            cache.collection("books", ts).await,
            Err(ProxyError::CollectionMissing(name)) if name == "books"
        ));
    }

    #[tokio::test]
    async fn partitions_are_cached_with_their_collection() {
        let (metadata, cache) = cache();
        metadata.insert_collection(collection_info(
            CollectionId(1),
            "books",
            1,
            Timestamp::from(1),
        ));
        let ts = Timestamp::from(10);
        let default = cache
            .partition_id("books", "_default", ts)
            .await
            .expect("default partition");
        assert!(matches!(
            cache.partition_id("books", "nope", ts).await,
            Err(ProxyError::PartitionMissing(_))
        ));

        metadata
            .create_partition("books", "p1", ts)
            .await
            .expect("created");
        // Still cached until invalidated.
        assert!(cache.partition_id("books", "p1", ts).await.is_err());
        cache.remove_collection_by_name("books");
        let p1 = cache.partition_id("books", "p1", ts).await.expect("p1");
        assert_ne!(p1, default);
    }

    #[tokio::test]
    async fn stale_fill_is_discarded() {
        let (_metadata, cache) = cache();
        let generation = cache.generation.load(Ordering::SeqCst);
        cache.remove_credential("alice");
        cache.populate(generation, |state| {
            state.credentials.insert(
                "alice".into(),
                Credential {
                    username: "alice".into(),
                    encrypted_password: "stale".into(),
                },
            );
        });
        assert!(cache
            .state
            .read()
            .expect("lock poisoned")
            .credentials
            .is_empty());
    }

    #[tokio::test]
    async fn policies() {
        let (_metadata, cache) = cache();
        for refresh in [
            PolicyRefresh::Grant {
                role: "reader".into(),
                policy: "search".into(),
            },
            PolicyRefresh::Grant {
                role: "writer".into(),
                policy: "insert".into(),
            },
            PolicyRefresh::AddUserToRole {
                user: "alice".into(),
                role: "reader".into(),
            },
            PolicyRefresh::AddUserToRole {
                user: "alice".into(),
                role: "writer".into(),
            },
        ] {
            cache.refresh_policy(refresh);
        }
        assert_eq!(
            cache.user_policies("alice"),
            BTreeSet::from(["insert".to_owned(), "search".to_owned()])
        );
        cache.refresh_policy(PolicyRefresh::DeleteRole {
            role: "writer".into(),
        });
        assert_eq!(cache.user_roles("alice"), BTreeSet::from(["reader".to_owned()]));
        assert_eq!(cache.user_policies("alice"), BTreeSet::from(["search".to_owned()]));
    }
}
