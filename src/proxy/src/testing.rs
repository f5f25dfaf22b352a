// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory backends, for tests.
//!
//! Each backend keeps its state behind a mutex and exposes a few knobs to
//! inject faults. [`TestCluster`] wires them together: the workers answer
//! searches and queries by scanning what was published to the
//! [`MemStream`], so a full [`crate::Proxy`] can run end to end.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use vdb_ore::cast::CastFrom;
use vdb_ore::metrics::MetricsRegistry;
use vdb_ore::now::{NowFn, SYSTEM_TIME};
use vdb_timestamp_oracle::memory::{MemIdAllocator, MemTimestampOracle};
use vdb_timestamp_oracle::metrics::Metrics as OracleMetrics;
use vdb_timestamp_oracle::Timestamp;

use crate::backend::{
    Backends, IndexCoordinator, InsertMessage, MessageStream, MetadataAuthority,
    QueryCoordinator, StorageCoordinator, StreamMessage, WorkerClients,
};
use crate::config::{self, ProxyConfig, DEFAULT_PARTITION_NAME};
use crate::error::BackendError;
use crate::types::{
    CollectionId, CollectionInfo, CollectionSchema, ColumnData, CompactionState,
    ConsistencyLevel, CreateCollectionRequest, Credential, DataType, FieldColumn, FieldSchema,
    Grant, GrantObject, HealthReport, IndexBuildProgress, IndexDescription, MetricType, NodeId,
    PartitionId, PartitionInfo, PolicyRefresh, PrimaryKey, PrivilegeOp, QuerySegmentInfo,
    ReplicaId, ReplicaInfo, RetrieveResults, RoleResult, SearchResultData, SegmentId,
    SegmentInfo, SegmentState, ShardId, ShardLeaders, ShardQueryRequest, ShardSearchRequest,
    UserResult, UserRoleOp, DEFAULT_ROLES,
};

/// The name of channel `shard` of a collection.
pub fn channel_name(collection: CollectionId, shard: u32) -> String {
    format!("dml_{}_{shard}", collection.0)
}

/// A collection with an `Int64` primary key `id` and a 2-dimensional vector
/// field `v`.
pub fn collection_info(
    id: CollectionId,
    name: &str,
    shards_num: u32,
    created_ts: Timestamp,
) -> CollectionInfo {
    CollectionInfo {
        id,
        name: name.to_owned(),
        schema: schema(name),
        shards_num,
        consistency_level: ConsistencyLevel::default(),
        created_ts,
        aliases: Vec::new(),
        channels: (0..shards_num).map(|s| channel_name(id, s)).collect(),
    }
}

/// The schema of [`collection_info`].
pub fn schema(name: &str) -> CollectionSchema {
    CollectionSchema {
        name: name.to_owned(),
        description: String::new(),
        fields: vec![
            FieldSchema::new("id", DataType::Int64).primary_key(false),
            FieldSchema::new("v", DataType::FloatVector { dim: 2 }),
        ],
    }
}

/// A request creating a collection with [`schema`].
pub fn create_request(name: &str, shards_num: u32) -> CreateCollectionRequest {
    CreateCollectionRequest {
        schema: schema(name),
        shards_num,
        consistency_level: ConsistencyLevel::Strong,
    }
}

/// A [`ProxyConfig`] with timings short enough for tests.
pub fn proxy_config(node_id: NodeId) -> ProxyConfig {
    let config = ProxyConfig::new(node_id);
    config::TIME_TICK_INTERVAL.set(&config.configs, Duration::from_millis(5));
    config::SHARD_ROUTE_REFRESH_INTERVAL.set(&config.configs, Duration::from_millis(50));
    config::TASK_TIMEOUT.set(&config.configs, Duration::from_secs(10));
    config
}

fn not_found(service: &'static str, what: &str, name: impl std::fmt::Display) -> BackendError {
    BackendError::rejected(service, format!("{what} not found: {name}"))
}

fn not_loaded(collection: CollectionId) -> BackendError {
    BackendError::rejected("query", format!("collection not loaded: {collection}"))
}

/// Reasons a backend reports itself unhealthy.
#[derive(Debug, Default)]
pub struct HealthSwitch(Mutex<Vec<String>>);

impl HealthSwitch {
    pub fn set_unhealthy(&self, reason: &str) {
        self.0.lock().expect("lock poisoned").push(reason.to_owned());
    }

    pub fn set_healthy(&self) {
        self.0.lock().expect("lock poisoned").clear();
    }

    fn report(&self) -> HealthReport {
        let reasons = self.0.lock().expect("lock poisoned").clone();
        HealthReport {
            is_healthy: reasons.is_empty(),
            reasons,
        }
    }
}

#[derive(Debug, Default)]
struct MetadataState {
    next_id: i64,
    collections: BTreeMap<String, CollectionInfo>,
    partitions: BTreeMap<CollectionId, Vec<PartitionInfo>>,
    /// Alias to collection name.
    aliases: BTreeMap<String, String>,
    credentials: BTreeMap<String, Credential>,
    policy: Vec<PolicyRefresh>,
    /// Created roles. The default roles always exist.
    roles: BTreeSet<String>,
    user_roles: BTreeMap<String, BTreeSet<String>>,
    grants: BTreeSet<Grant>,
}

impl MetadataState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn resolve(&self, name: &str) -> Option<&CollectionInfo> {
        self.collections.get(name).or_else(|| {
            self.aliases
                .get(name)
                .and_then(|target| self.collections.get(target))
        })
    }

    fn resolve_id(&self, name: &str) -> Result<CollectionId, BackendError> {
        self.resolve(name)
            .map(|info| info.id)
            .ok_or_else(|| not_found("metadata", "collection", name))
    }

    fn insert(&mut self, info: CollectionInfo) {
        let partition = PartitionInfo {
            id: PartitionId(self.next_id()),
            name: DEFAULT_PARTITION_NAME.to_owned(),
            created_ts: info.created_ts,
        };
        self.partitions.insert(info.id, vec![partition]);
        self.collections.insert(info.name.clone(), info);
    }

    fn has_role(&self, role: &str) -> bool {
        DEFAULT_ROLES.contains(&role) || self.roles.contains(role)
    }

    fn check_role(&self, role: &str) -> Result<(), BackendError> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(not_found("metadata", "role", role))
        }
    }

    fn members(&self, role: &str) -> Vec<String> {
        self.user_roles
            .iter()
            .filter(|(_, roles)| roles.contains(role))
            .map(|(user, _)| user.clone())
            .collect()
    }

    fn set_aliases(&mut self) {
        for info in self.collections.values_mut() {
            info.aliases = self
                .aliases
                .iter()
                .filter(|(_, target)| **target == info.name)
                .map(|(alias, _)| alias.clone())
                .collect();
        }
    }
}

/// An in-memory [`MetadataAuthority`].
#[derive(Debug, Default)]
pub struct MemMetadata {
    state: Mutex<MetadataState>,
    describe_calls: AtomicU64,
    health: HealthSwitch,
}

impl MemMetadata {
    /// Adds `info` with its default partition, bypassing validation.
    pub fn insert_collection(&self, info: CollectionInfo) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.next_id = state.next_id.max(info.id.0);
        state.insert(info);
    }

    pub fn remove_collection(&self, name: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(info) = state.collections.remove(name) {
            state.partitions.remove(&info.id);
            state.aliases.retain(|_, target| target != name);
        }
    }

    pub fn collection_by_id(&self, id: CollectionId) -> Option<CollectionInfo> {
        let state = self.state.lock().expect("lock poisoned");
        state.collections.values().find(|info| info.id == id).cloned()
    }

    /// Number of `describe_collection` calls served.
    pub fn describe_calls(&self) -> u64 {
        self.describe_calls.load(Ordering::SeqCst)
    }

    /// Adds a grant or membership to the state `list_policy` returns.
    pub fn add_policy(&self, refresh: PolicyRefresh) {
        self.state.lock().expect("lock poisoned").policy.push(refresh);
    }

    pub fn health(&self) -> &HealthSwitch {
        &self.health
    }
}

#[async_trait]
impl MetadataAuthority for MemMetadata {
    async fn create_collection(
        &self,
        req: CreateCollectionRequest,
        ts: Timestamp,
    ) -> Result<CollectionId, BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let name = req.schema.name.clone();
        if state.resolve(&name).is_some() {
            return Err(BackendError::rejected(
                "metadata",
                format!("collection already exists: {name}"),
            ));
        }
        let id = CollectionId(state.next_id());
        let info = CollectionInfo {
            id,
            name,
            schema: req.schema,
            shards_num: req.shards_num,
            consistency_level: req.consistency_level,
            created_ts: ts,
            aliases: Vec::new(),
            channels: (0..req.shards_num).map(|s| channel_name(id, s)).collect(),
        };
        state.insert(info);
        Ok(id)
    }

    async fn drop_collection(&self, name: &str, _ts: Timestamp) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let id = state.resolve_id(name)?;
        state.collections.retain(|_, info| info.id != id);
        state.partitions.remove(&id);
        let MetadataState {
            collections,
            aliases,
            ..
        } = &mut *state;
        aliases.retain(|_, target| collections.contains_key(target));
        Ok(())
    }

    async fn has_collection(&self, name: &str, _ts: Timestamp) -> Result<bool, BackendError> {
        Ok(self.state.lock().expect("lock poisoned").resolve(name).is_some())
    }

    async fn describe_collection(
        &self,
        name: &str,
        _ts: Timestamp,
    ) -> Result<CollectionInfo, BackendError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .expect("lock poisoned")
            .resolve(name)
            .cloned()
            .ok_or_else(|| not_found("metadata", "collection", name))
    }

    async fn show_collections(&self, _ts: Timestamp) -> Result<Vec<CollectionInfo>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.collections.values().cloned().collect())
    }

    async fn create_partition(
        &self,
        collection: &str,
        partition: &str,
        ts: Timestamp,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let id = state.resolve_id(collection)?;
        let partition_id = PartitionId(state.next_id());
        let partitions = state.partitions.entry(id).or_default();
        if partitions.iter().any(|p| p.name == partition) {
            return Err(BackendError::rejected(
                "metadata",
                format!("partition already exists: {partition}"),
            ));
        }
        partitions.push(PartitionInfo {
            id: partition_id,
            name: partition.to_owned(),
            created_ts: ts,
        });
        Ok(())
    }

    async fn drop_partition(
        &self,
        collection: &str,
        partition: &str,
        _ts: Timestamp,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let id = state.resolve_id(collection)?;
        let partitions = state.partitions.entry(id).or_default();
        let before = partitions.len();
        partitions.retain(|p| p.name != partition);
        if partitions.len() == before {
            return Err(not_found("metadata", "partition", partition));
        }
        Ok(())
    }

    async fn show_partitions(
        &self,
        collection: &str,
        _ts: Timestamp,
    ) -> Result<Vec<PartitionInfo>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        let id = state.resolve_id(collection)?;
        Ok(state.partitions.get(&id).cloned().unwrap_or_default())
    }

    async fn create_alias(
        &self,
        alias: &str,
        collection: &str,
        _ts: Timestamp,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.resolve(alias).is_some() {
            return Err(BackendError::rejected(
                "metadata",
                format!("alias already in use: {alias}"),
            ));
        }
        if !state.collections.contains_key(collection) {
            return Err(not_found("metadata", "collection", collection));
        }
        state.aliases.insert(alias.to_owned(), collection.to_owned());
        state.set_aliases();
        Ok(())
    }

    async fn drop_alias(&self, alias: &str, _ts: Timestamp) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.aliases.remove(alias).is_none() {
            return Err(not_found("metadata", "alias", alias));
        }
        state.set_aliases();
        Ok(())
    }

    async fn alter_alias(
        &self,
        alias: &str,
        collection: &str,
        _ts: Timestamp,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.aliases.contains_key(alias) {
            return Err(not_found("metadata", "alias", alias));
        }
        if !state.collections.contains_key(collection) {
            return Err(not_found("metadata", "collection", collection));
        }
        state.aliases.insert(alias.to_owned(), collection.to_owned());
        state.set_aliases();
        Ok(())
    }

    async fn create_credential(&self, credential: Credential) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.credentials.contains_key(&credential.username) {
            return Err(BackendError::rejected(
                "metadata",
                format!("user already exists: {}", credential.username),
            ));
        }
        state
            .credentials
            .insert(credential.username.clone(), credential);
        Ok(())
    }

    async fn update_credential(&self, credential: Credential) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        match state.credentials.get_mut(&credential.username) {
            Some(existing) => {
                *existing = credential;
                Ok(())
            }
            None => Err(not_found("metadata", "user", &credential.username)),
        }
    }

    async fn delete_credential(&self, username: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        match state.credentials.remove(username) {
            Some(_) => {
                state.user_roles.remove(username);
                Ok(())
            }
            None => Err(not_found("metadata", "user", username)),
        }
    }

    async fn get_credential(&self, username: &str) -> Result<Credential, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .credentials
            .get(username)
            .cloned()
            .ok_or_else(|| not_found("metadata", "user", username))
    }

    async fn list_cred_users(&self) -> Result<Vec<String>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.credentials.keys().cloned().collect())
    }

    async fn list_policy(&self) -> Result<Vec<PolicyRefresh>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        let grants = state.grants.iter().map(|g| PolicyRefresh::Grant {
            role: g.role.clone(),
            policy: g.policy(),
        });
        let members = state.user_roles.iter().flat_map(|(user, roles)| {
            roles.iter().map(move |role| PolicyRefresh::AddUserToRole {
                user: user.clone(),
                role: role.clone(),
            })
        });
        Ok(state
            .policy
            .iter()
            .cloned()
            .chain(grants)
            .chain(members)
            .collect())
    }

    async fn create_role(&self, role: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.has_role(role) {
            return Err(BackendError::rejected(
                "metadata",
                format!("role already exists: {role}"),
            ));
        }
        state.roles.insert(role.to_owned());
        Ok(())
    }

    async fn drop_role(&self, role: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.roles.remove(role) {
            return Err(not_found("metadata", "role", role));
        }
        state.grants.retain(|g| g.role != role);
        for roles in state.user_roles.values_mut() {
            roles.remove(role);
        }
        Ok(())
    }

    async fn operate_user_role(
        &self,
        user: &str,
        role: &str,
        op: UserRoleOp,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.credentials.contains_key(user) {
            return Err(not_found("metadata", "user", user));
        }
        state.check_role(role)?;
        match op {
            UserRoleOp::AddUserToRole => {
                let roles = state.user_roles.entry(user.to_owned()).or_default();
                if !roles.insert(role.to_owned()) {
                    return Err(BackendError::rejected(
                        "metadata",
                        format!("user {user} already has role {role}"),
                    ));
                }
            }
            UserRoleOp::RemoveUserFromRole => {
                let removed = state
                    .user_roles
                    .get_mut(user)
                    .is_some_and(|roles| roles.remove(role));
                if !removed {
                    return Err(not_found("metadata", "membership", format!("{user}/{role}")));
                }
            }
        }
        Ok(())
    }

    async fn select_role(
        &self,
        role: Option<&str>,
        include_users: bool,
    ) -> Result<Vec<RoleResult>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        let roles: Vec<String> = match role {
            Some(role) if state.has_role(role) => vec![role.to_owned()],
            Some(_) => Vec::new(),
            None => DEFAULT_ROLES
                .iter()
                .map(|r| (*r).to_owned())
                .chain(state.roles.iter().cloned())
                .collect(),
        };
        Ok(roles
            .into_iter()
            .map(|role| RoleResult {
                users: if include_users {
                    state.members(&role)
                } else {
                    Vec::new()
                },
                role,
            })
            .collect())
    }

    async fn select_user(
        &self,
        user: Option<&str>,
        include_roles: bool,
    ) -> Result<Vec<UserResult>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        let users: Vec<&String> = state
            .credentials
            .keys()
            .filter(|u| user.map_or(true, |user| u.as_str() == user))
            .collect();
        Ok(users
            .into_iter()
            .map(|user| UserResult {
                user: user.clone(),
                roles: match state.user_roles.get(user) {
                    Some(roles) if include_roles => roles.iter().cloned().collect(),
                    _ => Vec::new(),
                },
            })
            .collect())
    }

    async fn operate_privilege(&self, grant: Grant, op: PrivilegeOp) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.check_role(&grant.role)?;
        match op {
            PrivilegeOp::Grant => {
                state.grants.insert(grant);
            }
            PrivilegeOp::Revoke => {
                let before = state.grants.len();
                state.grants.retain(|g| {
                    g.role != grant.role
                        || g.object != grant.object
                        || g.privilege != grant.privilege
                });
                if state.grants.len() == before {
                    return Err(not_found("metadata", "grant", grant.policy()));
                }
            }
        }
        Ok(())
    }

    async fn select_grant(
        &self,
        role: &str,
        object: Option<&GrantObject>,
    ) -> Result<Vec<Grant>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        state.check_role(role)?;
        Ok(state
            .grants
            .iter()
            .filter(|g| g.role == role && object.map_or(true, |o| &g.object == o))
            .cloned()
            .collect())
    }

    async fn check_health(&self) -> Result<HealthReport, BackendError> {
        Ok(self.health.report())
    }
}

#[derive(Debug, Default)]
struct QueryState {
    leaders: BTreeMap<CollectionId, Vec<ShardLeaders>>,
    partitions: BTreeMap<CollectionId, BTreeSet<PartitionId>>,
    segments: BTreeMap<CollectionId, Vec<QuerySegmentInfo>>,
}

/// An in-memory [`QueryCoordinator`].
///
/// When built with [`MemQueryCoordinator::new`], loading a collection
/// places `replica_number` replicas of each of its shards on the given
/// nodes. A default coordinator only serves leaders set by
/// [`MemQueryCoordinator::set_shard_leaders`].
#[derive(Debug, Default)]
pub struct MemQueryCoordinator {
    metadata: Option<Arc<MemMetadata>>,
    nodes: Vec<NodeId>,
    state: Mutex<QueryState>,
    health: HealthSwitch,
}

impl MemQueryCoordinator {
    pub fn new(metadata: Arc<MemMetadata>, nodes: Vec<NodeId>) -> Self {
        MemQueryCoordinator {
            metadata: Some(metadata),
            nodes,
            ..Default::default()
        }
    }

    pub fn set_shard_leaders(&self, collection: CollectionId, leaders: Vec<ShardLeaders>) {
        self.state
            .lock()
            .expect("lock poisoned")
            .leaders
            .insert(collection, leaders);
    }

    /// Sets the segments `segment_info` reports for a collection.
    pub fn set_segments(&self, collection: CollectionId, segments: Vec<QuerySegmentInfo>) {
        self.state
            .lock()
            .expect("lock poisoned")
            .segments
            .insert(collection, segments);
    }

    pub fn is_loaded(&self, collection: CollectionId) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .leaders
            .contains_key(&collection)
    }

    pub fn health(&self) -> &HealthSwitch {
        &self.health
    }

    fn place(
        &self,
        collection: CollectionId,
        replica_number: u32,
    ) -> Result<Vec<ShardLeaders>, BackendError> {
        let info = self
            .metadata
            .as_ref()
            .and_then(|m| m.collection_by_id(collection))
            .ok_or_else(|| not_found("query", "collection", collection))?;
        let replicas = usize::cast_from(replica_number);
        if replicas == 0 || replicas > self.nodes.len() {
            return Err(BackendError::rejected(
                "query",
                format!(
                    "cannot place {replica_number} replicas on {} nodes",
                    self.nodes.len()
                ),
            ));
        }
        Ok(info
            .channels
            .iter()
            .enumerate()
            .map(|(i, channel)| ShardLeaders {
                shard: ShardId(u32::try_from(i).unwrap_or(u32::MAX)),
                channel: channel.clone(),
                replicas: (0..replicas)
                    .map(|r| self.nodes[(i + r) % self.nodes.len()])
                    .collect(),
            })
            .collect())
    }
}

#[async_trait]
impl QueryCoordinator for MemQueryCoordinator {
    async fn load_collection(
        &self,
        collection: CollectionId,
        replica_number: u32,
    ) -> Result<(), BackendError> {
        let leaders = self.place(collection, replica_number)?;
        self.set_shard_leaders(collection, leaders);
        Ok(())
    }

    async fn release_collection(&self, collection: CollectionId) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.leaders.remove(&collection);
        state.partitions.remove(&collection);
        state.segments.remove(&collection);
        Ok(())
    }

    async fn load_partitions(
        &self,
        collection: CollectionId,
        partitions: Vec<PartitionId>,
    ) -> Result<(), BackendError> {
        if !self.is_loaded(collection) {
            let leaders = self.place(collection, 1)?;
            self.set_shard_leaders(collection, leaders);
        }
        self.state
            .lock()
            .expect("lock poisoned")
            .partitions
            .entry(collection)
            .or_default()
            .extend(partitions);
        Ok(())
    }

    async fn release_partitions(
        &self,
        collection: CollectionId,
        partitions: Vec<PartitionId>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(loaded) = state.partitions.get_mut(&collection) {
            for p in &partitions {
                loaded.remove(p);
            }
        }
        Ok(())
    }

    async fn shard_leaders(
        &self,
        collection: CollectionId,
    ) -> Result<Vec<ShardLeaders>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.leaders.get(&collection).cloned().unwrap_or_default())
    }

    async fn loading_progress(
        &self,
        collection: CollectionId,
        partitions: Vec<PartitionId>,
    ) -> Result<u32, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        let loaded = match partitions.as_slice() {
            [] => state.leaders.contains_key(&collection),
            partitions => state
                .partitions
                .get(&collection)
                .is_some_and(|loaded| partitions.iter().all(|p| loaded.contains(p))),
        };
        Ok(if loaded { 100 } else { 0 })
    }

    async fn segment_info(
        &self,
        collection: CollectionId,
    ) -> Result<Vec<QuerySegmentInfo>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        if !state.leaders.contains_key(&collection) {
            return Err(not_loaded(collection));
        }
        Ok(state.segments.get(&collection).cloned().unwrap_or_default())
    }

    /// Replica `r` is made of the `r`th replica of every shard.
    async fn replicas(&self, collection: CollectionId) -> Result<Vec<ReplicaInfo>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        let leaders = state
            .leaders
            .get(&collection)
            .ok_or_else(|| not_loaded(collection))?;
        let count = leaders.iter().map(|l| l.replicas.len()).max().unwrap_or(0);
        Ok((0..count)
            .map(|r| {
                let shard_leaders: Vec<_> = leaders
                    .iter()
                    .filter_map(|l| l.replicas.get(r).map(|node| (l.shard, *node)))
                    .collect();
                let node_ids: BTreeSet<_> = shard_leaders.iter().map(|(_, node)| *node).collect();
                ReplicaInfo {
                    replica_id: ReplicaId(i64::try_from(r).unwrap_or(i64::MAX)),
                    collection_id: collection,
                    shard_leaders,
                    node_ids: node_ids.into_iter().collect(),
                }
            })
            .collect())
    }

    async fn check_health(&self) -> Result<HealthReport, BackendError> {
        Ok(self.health.report())
    }
}

#[derive(Debug, Default)]
struct StorageState {
    segments: BTreeMap<SegmentId, SegmentInfo>,
    compactions: BTreeMap<i64, CompactionState>,
}

/// An in-memory [`StorageCoordinator`].
///
/// Flushing seals growing segments; they only become flushed, and
/// compactions only complete, when a test says so.
#[derive(Debug, Default)]
pub struct MemStorage {
    state: Mutex<StorageState>,
    next_compaction: AtomicI64,
    health: HealthSwitch,
}

impl MemStorage {
    pub fn add_segment(&self, segment: SegmentInfo) {
        self.state
            .lock()
            .expect("lock poisoned")
            .segments
            .insert(segment.segment_id, segment);
    }

    /// Moves every sealed segment to flushed.
    pub fn complete_flushes(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        for segment in state.segments.values_mut() {
            if segment.state == SegmentState::Sealed {
                segment.state = SegmentState::Flushed;
            }
        }
    }

    pub fn complete_compactions(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        for compaction in state.compactions.values_mut() {
            *compaction = CompactionState::Completed;
        }
    }

    pub fn health(&self) -> &HealthSwitch {
        &self.health
    }
}

#[async_trait]
impl StorageCoordinator for MemStorage {
    async fn flush(&self, collection: CollectionId) -> Result<Vec<SegmentId>, BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let mut sealed = Vec::new();
        for segment in state.segments.values_mut() {
            if segment.collection_id == collection && segment.state == SegmentState::Growing {
                segment.state = SegmentState::Sealed;
                sealed.push(segment.segment_id);
            }
        }
        Ok(sealed)
    }

    async fn flush_state(&self, segments: Vec<SegmentId>) -> Result<bool, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(segments.iter().all(|id| {
            state
                .segments
                .get(id)
                .is_some_and(|s| s.state == SegmentState::Flushed)
        }))
    }

    async fn segments(&self, collection: CollectionId) -> Result<Vec<SegmentInfo>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .segments
            .values()
            .filter(|s| s.collection_id == collection)
            .cloned()
            .collect())
    }

    async fn manual_compaction(
        &self,
        _collection: CollectionId,
        _ts: Timestamp,
    ) -> Result<i64, BackendError> {
        let id = self.next_compaction.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .lock()
            .expect("lock poisoned")
            .compactions
            .insert(id, CompactionState::Executing);
        Ok(id)
    }

    async fn compaction_state(&self, compaction_id: i64) -> Result<CompactionState, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .compactions
            .get(&compaction_id)
            .copied()
            .ok_or_else(|| not_found("storage", "compaction", compaction_id))
    }

    async fn check_health(&self) -> Result<HealthReport, BackendError> {
        Ok(self.health.report())
    }
}

#[derive(Debug, Default)]
struct IndexState {
    indexes: BTreeMap<CollectionId, Vec<IndexDescription>>,
    progress: BTreeMap<(CollectionId, String), IndexBuildProgress>,
}

/// An in-memory [`IndexCoordinator`]. Builds make no progress until
/// [`MemIndex::set_progress`].
#[derive(Debug, Default)]
pub struct MemIndex {
    state: Mutex<IndexState>,
    health: HealthSwitch,
}

impl MemIndex {
    pub fn set_progress(
        &self,
        collection: CollectionId,
        index_name: &str,
        progress: IndexBuildProgress,
    ) {
        self.state
            .lock()
            .expect("lock poisoned")
            .progress
            .insert((collection, index_name.to_owned()), progress);
    }

    pub fn health(&self) -> &HealthSwitch {
        &self.health
    }
}

#[async_trait]
impl IndexCoordinator for MemIndex {
    async fn create_index(
        &self,
        collection: CollectionId,
        index: IndexDescription,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let indexes = state.indexes.entry(collection).or_default();
        if indexes.iter().any(|i| i.index_name == index.index_name) {
            return Err(BackendError::rejected(
                "index",
                format!("index already exists: {}", index.index_name),
            ));
        }
        let name = index.index_name.clone();
        indexes.push(index);
        state.progress.insert(
            (collection, name),
            IndexBuildProgress {
                indexed_rows: 0,
                total_rows: 0,
            },
        );
        Ok(())
    }

    async fn describe_index(
        &self,
        collection: CollectionId,
        index_name: &str,
    ) -> Result<Vec<IndexDescription>, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        let indexes = state.indexes.get(&collection).cloned().unwrap_or_default();
        if index_name.is_empty() {
            return Ok(indexes);
        }
        let named: Vec<_> = indexes
            .into_iter()
            .filter(|i| i.index_name == index_name)
            .collect();
        if named.is_empty() {
            return Err(not_found("index", "index", index_name));
        }
        Ok(named)
    }

    async fn drop_index(
        &self,
        collection: CollectionId,
        index_name: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let indexes = state.indexes.entry(collection).or_default();
        let before = indexes.len();
        indexes.retain(|i| i.index_name != index_name);
        if indexes.len() == before {
            return Err(not_found("index", "index", index_name));
        }
        state.progress.remove(&(collection, index_name.to_owned()));
        Ok(())
    }

    async fn index_build_progress(
        &self,
        collection: CollectionId,
        index_name: &str,
    ) -> Result<IndexBuildProgress, BackendError> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .progress
            .get(&(collection, index_name.to_owned()))
            .copied()
            .ok_or_else(|| not_found("index", "index", index_name))
    }

    async fn check_health(&self) -> Result<HealthReport, BackendError> {
        Ok(self.health.report())
    }
}

/// An in-memory [`MessageStream`] recording every message.
#[derive(Debug, Default)]
pub struct MemStream {
    channels: Mutex<BTreeMap<String, Vec<StreamMessage>>>,
    failing: Mutex<BTreeSet<String>>,
    published: Notify,
}

impl MemStream {
    /// Everything published to `channel`, in order.
    pub fn messages(&self, channel: &str) -> Vec<StreamMessage> {
        let channels = self.channels.lock().expect("lock poisoned");
        channels.get(channel).cloned().unwrap_or_default()
    }

    /// The time ticks published to `channel`, in order.
    pub fn ticks(&self, channel: &str) -> Vec<Timestamp> {
        self.messages(channel)
            .into_iter()
            .filter_map(|m| match m {
                StreamMessage::TimeTick(ts) => Some(ts),
                _ => None,
            })
            .collect()
    }

    /// Makes publishing to `channel` fail, or succeed again.
    pub fn set_failing(&self, channel: &str, failing: bool) {
        let mut set = self.failing.lock().expect("lock poisoned");
        if failing {
            set.insert(channel.to_owned());
        } else {
            set.remove(channel);
        }
    }

    /// The timestamp up to which `channel` is complete: its last tick.
    /// A channel nothing was published to is complete at every timestamp.
    pub fn served_ts(&self, channel: &str) -> Timestamp {
        let channels = self.channels.lock().expect("lock poisoned");
        match channels.get(channel) {
            None => Timestamp::MAX,
            Some(messages) => messages
                .iter()
                .filter_map(|m| match m {
                    StreamMessage::TimeTick(ts) => Some(*ts),
                    _ => None,
                })
                .max()
                .unwrap_or(Timestamp::MIN),
        }
    }

    /// Waits until `channel` is complete up to `ts`.
    async fn wait_served(&self, channel: &str, ts: Timestamp) {
        loop {
            let published = self.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();
            if self.served_ts(channel) >= ts {
                return;
            }
            published.await;
        }
    }
}

#[async_trait]
impl MessageStream for MemStream {
    async fn publish(
        &self,
        channel: &str,
        messages: Vec<StreamMessage>,
    ) -> Result<(), BackendError> {
        if self.failing.lock().expect("lock poisoned").contains(channel) {
            return Err(BackendError::unreachable("stream", format!("{channel} is down")));
        }
        self.channels
            .lock()
            .expect("lock poisoned")
            .entry(channel.to_owned())
            .or_default()
            .extend(messages);
        self.published.notify_waiters();
        Ok(())
    }
}

/// The latest visible version of a row.
#[derive(Debug)]
struct Row {
    key: PrimaryKey,
    ts: Timestamp,
    partition: PartitionId,
    /// Single-row columns.
    fields: Vec<FieldColumn>,
}

impl Row {
    fn vector(&self, field: &str) -> Option<&[f32]> {
        self.fields
            .iter()
            .find(|f| f.field_name == field)
            .and_then(|f| match &f.data {
                ColumnData::FloatVector { data, .. } => Some(data.as_slice()),
                _ => None,
            })
    }
}

fn score(metric: MetricType, a: &[f32], b: &[f32]) -> f32 {
    let dot = || a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    match metric {
        MetricType::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        MetricType::Ip => dot(),
        MetricType::Cosine => {
            let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
            let denom = norm(a) * norm(b);
            if denom == 0.0 {
                0.0
            } else {
                dot() / denom
            }
        }
    }
}

/// Builds the output columns of `rows`.
fn output_columns(rows: &[&Row], output_fields: &[String]) -> Vec<FieldColumn> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    output_fields
        .iter()
        .filter_map(|name| {
            let template = first.fields.iter().find(|f| &f.field_name == name)?;
            let mut data = template.data.empty_like();
            for row in rows {
                if let Some(column) = row.fields.iter().find(|f| &f.field_name == name) {
                    data.push_from(&column.data, 0);
                }
            }
            Some(FieldColumn {
                field_name: name.clone(),
                data,
            })
        })
        .collect()
}

/// In-memory worker nodes.
///
/// A shard replica serves the rows published to the shard's channel. Reads
/// wait until the channel is ticked up to their guarantee timestamp, then
/// see the latest version of each row at or below their snapshot.
#[derive(Debug)]
pub struct MemWorkers {
    metadata: Arc<MemMetadata>,
    stream: Arc<MemStream>,
    unreachable: Mutex<BTreeSet<NodeId>>,
    calls: Mutex<Vec<(NodeId, ShardId)>>,
    /// While set, each accepted request takes a permit before reading rows.
    gate: Mutex<Option<Arc<Semaphore>>>,
    wait_limit: Duration,
}

impl MemWorkers {
    pub fn new(metadata: Arc<MemMetadata>, stream: Arc<MemStream>) -> Self {
        MemWorkers {
            metadata,
            stream,
            unreachable: Mutex::default(),
            calls: Mutex::default(),
            gate: Mutex::default(),
            wait_limit: Duration::from_secs(5),
        }
    }

    /// Holds accepted requests until [`MemWorkers::release`] lets them
    /// through.
    pub fn hold(&self) {
        let mut gate = self.gate.lock().expect("lock poisoned");
        if let Some(old) = gate.replace(Arc::new(Semaphore::new(0))) {
            old.close();
        }
    }

    /// Lets `n` held requests through, in the order they arrived.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &*self.gate.lock().expect("lock poisoned") {
            gate.add_permits(n);
        }
    }

    /// Stops holding requests and lets every held one through.
    pub fn unhold(&self) {
        if let Some(gate) = self.gate.lock().expect("lock poisoned").take() {
            gate.close();
        }
    }

    /// Makes `node` fail every request, or serve again.
    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        let mut set = self.unreachable.lock().expect("lock poisoned");
        if unreachable {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    /// Every request served or refused, in arrival order.
    pub fn calls(&self) -> Vec<(NodeId, ShardId)> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    fn accept(&self, node: NodeId, shard: ShardId) -> Result<(), BackendError> {
        self.calls.lock().expect("lock poisoned").push((node, shard));
        if self.unreachable.lock().expect("lock poisoned").contains(&node) {
            return Err(BackendError::unreachable("worker", format!("{node} is down")));
        }
        Ok(())
    }

    async fn rows(
        &self,
        collection: CollectionId,
        shard: ShardId,
        partitions: &[PartitionId],
        guarantee_ts: Timestamp,
        snapshot_ts: Timestamp,
    ) -> Result<Vec<Row>, BackendError> {
        let info = self
            .metadata
            .collection_by_id(collection)
            .ok_or_else(|| not_found("worker", "collection", collection))?;
        let channel = info
            .channels
            .get(usize::cast_from(shard.0))
            .ok_or_else(|| not_found("worker", "shard", shard))?;
        let gate = self.gate.lock().expect("lock poisoned").clone();
        if let Some(gate) = gate {
            // A closed gate lets everything through.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        tokio::time::timeout(self.wait_limit, self.stream.wait_served(channel, guarantee_ts))
            .await
            .map_err(|_| {
                BackendError::unreachable(
                    "worker",
                    format!("{channel} not served up to {guarantee_ts}"),
                )
            })?;

        let key_field = info
            .schema
            .primary_key()
            .map(|f| f.name.clone())
            .unwrap_or_default();
        let mut messages = self.stream.messages(channel);
        messages.retain(|m| m.timestamp() <= snapshot_ts);
        messages.sort_by_key(|m| m.timestamp());
        let mut rows: BTreeMap<PrimaryKey, Row> = BTreeMap::new();
        for message in messages {
            match message {
                StreamMessage::Insert(insert) => apply_insert(&mut rows, &key_field, &insert),
                StreamMessage::Delete(delete) => rows.retain(|key, row| {
                    let deleted = delete.primary_keys.iter().any(|k| &k == key)
                        && row.ts < delete.timestamp
                        && delete.partition_id.map_or(true, |p| p == row.partition);
                    !deleted
                }),
                StreamMessage::TimeTick(_) => {}
            }
        }
        Ok(rows
            .into_values()
            .filter(|row| partitions.is_empty() || partitions.contains(&row.partition))
            .collect())
    }
}

fn apply_insert(rows: &mut BTreeMap<PrimaryKey, Row>, key_field: &str, insert: &InsertMessage) {
    for (idx, key) in insert.primary_keys.iter().enumerate() {
        if rows.get(&key).is_some_and(|row| row.ts > insert.timestamp) {
            continue;
        }
        let mut fields: Vec<FieldColumn> = insert
            .fields
            .iter()
            .map(|f| FieldColumn {
                field_name: f.field_name.clone(),
                data: f.data.take(&[idx]),
            })
            .collect();
        fields.retain(|f| f.field_name != key_field);
        fields.push(key_column(key_field, &key));
        rows.insert(
            key.clone(),
            Row {
                key,
                ts: insert.timestamp,
                partition: insert.partition_id,
                fields,
            },
        );
    }
}

/// Assigned primary keys are not among an insert's columns, so rows carry
/// their key as a column of its own.
fn key_column(key_field: &str, key: &PrimaryKey) -> FieldColumn {
    let data = match key {
        PrimaryKey::Int64(v) => ColumnData::Int64(vec![*v]),
        PrimaryKey::VarChar(v) => ColumnData::VarChar(vec![v.clone()]),
    };
    FieldColumn {
        field_name: key_field.to_owned(),
        data,
    }
}

#[async_trait]
impl WorkerClients for MemWorkers {
    async fn search(
        &self,
        node: NodeId,
        req: ShardSearchRequest,
    ) -> Result<SearchResultData, BackendError> {
        self.accept(node, req.shard)?;
        let rows = self
            .rows(
                req.collection_id,
                req.shard,
                &req.partition_ids,
                req.read_point.guarantee_ts,
                req.read_point.snapshot_ts,
            )
            .await?;
        let nq = usize::cast_from(req.nq);
        if nq == 0 || req.vectors.is_empty() || req.vectors.len() % nq != 0 {
            return Err(BackendError::rejected("worker", "malformed query vectors"));
        }
        let dim = req.vectors.len() / nq;
        let topk = usize::cast_from(req.topk);

        let mut result = SearchResultData::empty(req.nq, req.topk);
        let mut hits = Vec::new();
        for (q, query) in req.vectors.chunks(dim).enumerate() {
            let mut scored: Vec<(f32, &Row)> = rows
                .iter()
                .filter_map(|row| {
                    let vector = row.vector(&req.anns_field)?;
                    Some((score(req.metric_type, query, vector), row))
                })
                .collect();
            scored.sort_by(|(a, ra), (b, rb)| {
                let by_score = if req.metric_type.larger_is_closer() {
                    b.total_cmp(a)
                } else {
                    a.total_cmp(b)
                };
                by_score.then_with(|| ra.key.cmp(&rb.key))
            });
            scored.truncate(topk);
            result.topks[q] = u32::try_from(scored.len()).unwrap_or(u32::MAX);
            for (score, row) in scored {
                result.ids.push(row.key.clone());
                result.scores.push(score);
                hits.push(row);
            }
        }
        result.fields = output_columns(&hits, &req.output_fields);
        Ok(result)
    }

    async fn query(
        &self,
        node: NodeId,
        req: ShardQueryRequest,
    ) -> Result<RetrieveResults, BackendError> {
        self.accept(node, req.shard)?;
        let rows = self
            .rows(
                req.collection_id,
                req.shard,
                &req.partition_ids,
                req.read_point.guarantee_ts,
                req.read_point.snapshot_ts,
            )
            .await?;
        let wanted: BTreeSet<PrimaryKey> = req.primary_keys.iter().collect();
        let rows: Vec<&Row> = rows
            .iter()
            .filter(|row| wanted.is_empty() || wanted.contains(&row.key))
            .collect();
        Ok(RetrieveResults {
            ids: rows.iter().map(|row| row.key.clone()).collect(),
            timestamps: rows.iter().map(|row| row.ts).collect(),
            fields: output_columns(&rows, &req.output_fields),
        })
    }
}

/// A full set of in-memory backends wired together.
#[derive(Debug, Clone)]
pub struct TestCluster {
    pub metadata: Arc<MemMetadata>,
    pub query: Arc<MemQueryCoordinator>,
    pub storage: Arc<MemStorage>,
    pub index: Arc<MemIndex>,
    pub stream: Arc<MemStream>,
    pub workers: Arc<MemWorkers>,
    pub oracle: Arc<MemTimestampOracle>,
    pub ids: Arc<MemIdAllocator>,
}

impl TestCluster {
    /// A cluster of `nodes` worker nodes, numbered from 1, with a clock
    /// reading the system time.
    pub fn new(nodes: i64) -> Self {
        Self::with_clock(nodes, SYSTEM_TIME.clone())
    }

    pub fn with_clock(nodes: i64, now: NowFn) -> Self {
        let registry = MetricsRegistry::new();
        let oracle_metrics = Arc::new(OracleMetrics::new(&registry));
        let metadata = Arc::new(MemMetadata::default());
        let stream = Arc::new(MemStream::default());
        TestCluster {
            query: Arc::new(MemQueryCoordinator::new(
                Arc::clone(&metadata),
                (1..=nodes).map(NodeId).collect(),
            )),
            storage: Arc::new(MemStorage::default()),
            index: Arc::new(MemIndex::default()),
            workers: Arc::new(MemWorkers::new(Arc::clone(&metadata), Arc::clone(&stream))),
            oracle: Arc::new(MemTimestampOracle::new(now, Arc::clone(&oracle_metrics))),
            ids: Arc::new(MemIdAllocator::new(1, oracle_metrics)),
            metadata,
            stream,
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            metadata: Arc::clone(&self.metadata) as Arc<dyn MetadataAuthority>,
            query: Arc::clone(&self.query) as Arc<dyn QueryCoordinator>,
            storage: Arc::clone(&self.storage) as Arc<dyn StorageCoordinator>,
            index: Arc::clone(&self.index) as Arc<dyn IndexCoordinator>,
            stream: Arc::clone(&self.stream) as Arc<dyn MessageStream>,
            workers: Arc::clone(&self.workers) as Arc<dyn WorkerClients>,
            oracle: Arc::clone(&self.oracle) as _,
            ids: Arc::clone(&self.ids) as _,
        }
    }
}
