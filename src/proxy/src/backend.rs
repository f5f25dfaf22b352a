// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Contracts of the services the front-end drives.
//!
//! The front-end owns none of these. It only needs the calls below; how a
//! deployment implements them (RPC clients, in-process fakes) is up to the
//! embedder. [`crate::testing`] has in-memory implementations.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use vdb_timestamp_oracle::{IdAllocator, Timestamp, TimestampOracle};

use crate::error::BackendError;
use crate::types::{
    CollectionId, CollectionInfo, CompactionState, CreateCollectionRequest, Credential,
    FieldColumn, Grant, GrantObject, HealthReport, IndexBuildProgress, IndexDescription, NodeId,
    PartitionId, PartitionInfo, PolicyRefresh, PrimaryKeys, PrivilegeOp, QuerySegmentInfo,
    ReplicaInfo, RetrieveResults, RoleResult, SearchResultData, SegmentId, SegmentInfo,
    ShardLeaders, ShardQueryRequest, ShardSearchRequest, UserResult, UserRoleOp,
};

/// The owner of schema, partition, alias, credential and policy metadata.
#[async_trait]
pub trait MetadataAuthority: Debug + Send + Sync {
    async fn create_collection(
        &self,
        req: CreateCollectionRequest,
        ts: Timestamp,
    ) -> Result<CollectionId, BackendError>;
    async fn drop_collection(&self, name: &str, ts: Timestamp) -> Result<(), BackendError>;
    async fn has_collection(&self, name: &str, ts: Timestamp) -> Result<bool, BackendError>;
    /// Resolves `name` as a collection name or alias.
    async fn describe_collection(
        &self,
        name: &str,
        ts: Timestamp,
    ) -> Result<CollectionInfo, BackendError>;
    async fn show_collections(&self, ts: Timestamp) -> Result<Vec<CollectionInfo>, BackendError>;

    async fn create_partition(
        &self,
        collection: &str,
        partition: &str,
        ts: Timestamp,
    ) -> Result<(), BackendError>;
    async fn drop_partition(
        &self,
        collection: &str,
        partition: &str,
        ts: Timestamp,
    ) -> Result<(), BackendError>;
    async fn show_partitions(
        &self,
        collection: &str,
        ts: Timestamp,
    ) -> Result<Vec<PartitionInfo>, BackendError>;

    async fn create_alias(
        &self,
        alias: &str,
        collection: &str,
        ts: Timestamp,
    ) -> Result<(), BackendError>;
    async fn drop_alias(&self, alias: &str, ts: Timestamp) -> Result<(), BackendError>;
    async fn alter_alias(
        &self,
        alias: &str,
        collection: &str,
        ts: Timestamp,
    ) -> Result<(), BackendError>;

    async fn create_credential(&self, credential: Credential) -> Result<(), BackendError>;
    async fn update_credential(&self, credential: Credential) -> Result<(), BackendError>;
    async fn delete_credential(&self, username: &str) -> Result<(), BackendError>;
    async fn get_credential(&self, username: &str) -> Result<Credential, BackendError>;
    async fn list_cred_users(&self) -> Result<Vec<String>, BackendError>;
    /// The full grant and membership state, as a list of refreshes that
    /// rebuild it from nothing.
    async fn list_policy(&self) -> Result<Vec<PolicyRefresh>, BackendError>;

    async fn create_role(&self, role: &str) -> Result<(), BackendError>;
    /// Drops a role along with its grants and memberships.
    async fn drop_role(&self, role: &str) -> Result<(), BackendError>;
    async fn operate_user_role(
        &self,
        user: &str,
        role: &str,
        op: UserRoleOp,
    ) -> Result<(), BackendError>;
    /// Lists `role`, or every role when `None`. Members are only filled in
    /// when `include_users` is set.
    async fn select_role(
        &self,
        role: Option<&str>,
        include_users: bool,
    ) -> Result<Vec<RoleResult>, BackendError>;
    /// Lists `user`, or every user when `None`. Roles are only filled in
    /// when `include_roles` is set.
    async fn select_user(
        &self,
        user: Option<&str>,
        include_roles: bool,
    ) -> Result<Vec<UserResult>, BackendError>;
    async fn operate_privilege(&self, grant: Grant, op: PrivilegeOp) -> Result<(), BackendError>;
    /// The grants of `role`, optionally only those on `object`.
    async fn select_grant(
        &self,
        role: &str,
        object: Option<&GrantObject>,
    ) -> Result<Vec<Grant>, BackendError>;

    async fn check_health(&self) -> Result<HealthReport, BackendError>;
}

/// The coordinator of the query cluster.
#[async_trait]
pub trait QueryCoordinator: Debug + Send + Sync {
    async fn load_collection(
        &self,
        collection: CollectionId,
        replica_number: u32,
    ) -> Result<(), BackendError>;
    async fn release_collection(&self, collection: CollectionId) -> Result<(), BackendError>;
    async fn load_partitions(
        &self,
        collection: CollectionId,
        partitions: Vec<PartitionId>,
    ) -> Result<(), BackendError>;
    async fn release_partitions(
        &self,
        collection: CollectionId,
        partitions: Vec<PartitionId>,
    ) -> Result<(), BackendError>;
    /// The replicas serving each shard of a loaded collection.
    async fn shard_leaders(
        &self,
        collection: CollectionId,
    ) -> Result<Vec<ShardLeaders>, BackendError>;
    /// Loading progress in percent. Empty `partitions` means the whole
    /// collection.
    async fn loading_progress(
        &self,
        collection: CollectionId,
        partitions: Vec<PartitionId>,
    ) -> Result<u32, BackendError>;
    /// The segments of a loaded collection and the nodes holding them.
    async fn segment_info(
        &self,
        collection: CollectionId,
    ) -> Result<Vec<QuerySegmentInfo>, BackendError>;
    async fn replicas(&self, collection: CollectionId) -> Result<Vec<ReplicaInfo>, BackendError>;

    async fn check_health(&self) -> Result<HealthReport, BackendError>;
}

/// The coordinator of storage segments.
#[async_trait]
pub trait StorageCoordinator: Debug + Send + Sync {
    /// Seals the collection's growing segments, returning them.
    async fn flush(&self, collection: CollectionId) -> Result<Vec<SegmentId>, BackendError>;
    /// Whether every one of `segments` is flushed.
    async fn flush_state(&self, segments: Vec<SegmentId>) -> Result<bool, BackendError>;
    async fn segments(&self, collection: CollectionId) -> Result<Vec<SegmentInfo>, BackendError>;
    async fn manual_compaction(
        &self,
        collection: CollectionId,
        ts: Timestamp,
    ) -> Result<i64, BackendError>;
    async fn compaction_state(&self, compaction_id: i64)
        -> Result<CompactionState, BackendError>;

    async fn check_health(&self) -> Result<HealthReport, BackendError>;
}

/// The coordinator of index builds.
#[async_trait]
pub trait IndexCoordinator: Debug + Send + Sync {
    async fn create_index(
        &self,
        collection: CollectionId,
        index: IndexDescription,
    ) -> Result<(), BackendError>;
    /// Describes the named index, or every index when `index_name` is empty.
    async fn describe_index(
        &self,
        collection: CollectionId,
        index_name: &str,
    ) -> Result<Vec<IndexDescription>, BackendError>;
    async fn drop_index(&self, collection: CollectionId, index_name: &str)
        -> Result<(), BackendError>;
    async fn index_build_progress(
        &self,
        collection: CollectionId,
        index_name: &str,
    ) -> Result<IndexBuildProgress, BackendError>;

    async fn check_health(&self) -> Result<HealthReport, BackendError>;
}

/// Rows of an insert routed to one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct InsertMessage {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub timestamp: Timestamp,
    pub row_ids: Vec<i64>,
    pub primary_keys: PrimaryKeys,
    pub fields: Vec<FieldColumn>,
}

/// Keys of a delete routed to one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct DeleteMessage {
    pub collection_id: CollectionId,
    pub partition_id: Option<PartitionId>,
    pub timestamp: Timestamp,
    pub primary_keys: PrimaryKeys,
}

/// A message on a write-ahead channel.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage {
    Insert(InsertMessage),
    Delete(DeleteMessage),
    /// No mutation with a timestamp at or below this one will follow.
    TimeTick(Timestamp),
}

impl StreamMessage {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            StreamMessage::Insert(m) => m.timestamp,
            StreamMessage::Delete(m) => m.timestamp,
            StreamMessage::TimeTick(ts) => *ts,
        }
    }
}

/// The write-ahead log mutations are published to.
#[async_trait]
pub trait MessageStream: Debug + Send + Sync {
    /// Appends `messages` to `channel`, in order.
    async fn publish(&self, channel: &str, messages: Vec<StreamMessage>)
        -> Result<(), BackendError>;
}

/// Clients of the worker nodes serving shard replicas.
#[async_trait]
pub trait WorkerClients: Debug + Send + Sync {
    async fn search(
        &self,
        node: NodeId,
        req: ShardSearchRequest,
    ) -> Result<SearchResultData, BackendError>;
    async fn query(
        &self,
        node: NodeId,
        req: ShardQueryRequest,
    ) -> Result<RetrieveResults, BackendError>;
}

/// Everything the front-end talks to, bundled for construction.
#[derive(Debug, Clone)]
pub struct Backends {
    pub metadata: Arc<dyn MetadataAuthority>,
    pub query: Arc<dyn QueryCoordinator>,
    pub storage: Arc<dyn StorageCoordinator>,
    pub index: Arc<dyn IndexCoordinator>,
    pub stream: Arc<dyn MessageStream>,
    pub workers: Arc<dyn WorkerClients>,
    pub oracle: Arc<dyn TimestampOracle>,
    pub ids: Arc<dyn IdAllocator>,
}
