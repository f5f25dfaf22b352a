// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Request and result types of the front-end.
//!
//! These are the shapes handlers accept and return. Their wire encoding is
//! owned by the RPC layer embedding the front-end and is not modeled here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use vdb_ore::cast::CastFrom;
use vdb_timestamp_oracle::Timestamp;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $inner:ty, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a collection, assigned by the metadata authority.
    CollectionId,
    i64,
    "c"
);
id_type!(
    /// Identifies a partition of a collection.
    PartitionId,
    i64,
    "p"
);
id_type!(
    /// Identifies a shard of a collection. Shard `i` serves channel `i`.
    ShardId,
    u32,
    "s"
);
id_type!(
    /// Identifies a worker node serving shard replicas.
    NodeId,
    i64,
    "n"
);
id_type!(
    /// Identifies a storage segment.
    SegmentId,
    i64,
    "seg"
);
id_type!(
    /// Identifies a replica of a loaded collection.
    ReplicaId,
    i64,
    "r"
);

/// A primary key value.
///
/// Keys of one collection are all of the same variant; the ordering across
/// variants only exists so keys can live in ordered collections.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrimaryKey {
    /// An integer key.
    Int64(i64),
    /// A string key.
    VarChar(String),
}

impl PrimaryKey {
    /// The hash used to route a row to a channel.
    pub fn channel_hash(&self) -> u64 {
        match self {
            PrimaryKey::Int64(v) => seahash::hash(&v.to_le_bytes()),
            PrimaryKey::VarChar(v) => seahash::hash(v.as_bytes()),
        }
    }

    fn encoded_size(&self) -> usize {
        match self {
            PrimaryKey::Int64(_) => 8,
            PrimaryKey::VarChar(v) => v.len(),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int64(v) => write!(f, "{v}"),
            PrimaryKey::VarChar(v) => write!(f, "{v:?}"),
        }
    }
}

/// The type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int64,
    Float,
    Double,
    VarChar,
    /// A dense vector of `dim` 32-bit floats.
    FloatVector { dim: usize },
}

/// Schema of a single field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub data_type: DataType,
    pub is_primary_key: bool,
    /// Primary key values are assigned by the front-end on insert.
    pub auto_id: bool,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        FieldSchema {
            name: name.into(),
            data_type,
            is_primary_key: false,
            auto_id: false,
        }
    }

    pub fn primary_key(mut self, auto_id: bool) -> Self {
        self.is_primary_key = true;
        self.auto_id = auto_id;
        self
    }
}

/// Schema of a collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub description: String,
    pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
    /// The primary key field, if the schema declares one.
    pub fn primary_key(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.is_primary_key)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// The columnar values of one field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Bool(Vec<bool>),
    Int64(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    VarChar(Vec<String>),
    FloatVector { dim: usize, data: Vec<f32> },
}

impl ColumnData {
    /// Number of rows in this column.
    pub fn num_rows(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Double(v) => v.len(),
            ColumnData::VarChar(v) => v.len(),
            ColumnData::FloatVector { dim, data } => {
                if *dim == 0 {
                    0
                } else {
                    data.len() / dim
                }
            }
        }
    }

    /// Approximate in-memory size, used for throughput accounting.
    pub fn encoded_size(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::Int64(v) => v.len() * 8,
            ColumnData::Float(v) => v.len() * 4,
            ColumnData::Double(v) => v.len() * 8,
            ColumnData::VarChar(v) => v.iter().map(|s| s.len()).sum(),
            ColumnData::FloatVector { data, .. } => data.len() * 4,
        }
    }

    /// Whether this column can hold values of `data_type`.
    pub fn matches(&self, data_type: DataType) -> bool {
        match (self, data_type) {
            (ColumnData::Bool(_), DataType::Bool)
            | (ColumnData::Int64(_), DataType::Int64)
            | (ColumnData::Float(_), DataType::Float)
            | (ColumnData::Double(_), DataType::Double)
            | (ColumnData::VarChar(_), DataType::VarChar) => true,
            (ColumnData::FloatVector { dim, .. }, DataType::FloatVector { dim: want }) => {
                *dim == want
            }
            _ => false,
        }
    }

    /// The rows at `indices`, in that order.
    ///
    /// # Panics
    ///
    /// Panics if an index is out of bounds.
    pub fn take(&self, indices: &[usize]) -> ColumnData {
        match self {
            ColumnData::Bool(v) => ColumnData::Bool(indices.iter().map(|i| v[*i]).collect()),
            ColumnData::Int64(v) => ColumnData::Int64(indices.iter().map(|i| v[*i]).collect()),
            ColumnData::Float(v) => ColumnData::Float(indices.iter().map(|i| v[*i]).collect()),
            ColumnData::Double(v) => ColumnData::Double(indices.iter().map(|i| v[*i]).collect()),
            ColumnData::VarChar(v) => {
                ColumnData::VarChar(indices.iter().map(|i| v[*i].clone()).collect())
            }
            ColumnData::FloatVector { dim, data } => ColumnData::FloatVector {
                dim: *dim,
                data: indices
                    .iter()
                    .flat_map(|i| data[i * dim..(i + 1) * dim].iter().copied())
                    .collect(),
            },
        }
    }

    /// An empty column of the same type.
    pub fn empty_like(&self) -> ColumnData {
        self.take(&[])
    }

    /// Appends row `idx` of `other`, which must have the same type.
    ///
    /// Returns false if the types differ.
    pub fn push_from(&mut self, other: &ColumnData, idx: usize) -> bool {
        match (self, other) {
            (ColumnData::Bool(a), ColumnData::Bool(b)) => a.push(b[idx]),
            (ColumnData::Int64(a), ColumnData::Int64(b)) => a.push(b[idx]),
            (ColumnData::Float(a), ColumnData::Float(b)) => a.push(b[idx]),
            (ColumnData::Double(a), ColumnData::Double(b)) => a.push(b[idx]),
            (ColumnData::VarChar(a), ColumnData::VarChar(b)) => a.push(b[idx].clone()),
            (
                ColumnData::FloatVector { dim, data: a },
                ColumnData::FloatVector { dim: d2, data: b },
            ) if dim == d2 => a.extend_from_slice(&b[idx * *dim..(idx + 1) * *dim]),
            _ => return false,
        }
        true
    }

    /// Reads row `idx` as a primary key, for key-typed columns.
    pub fn primary_key(&self, idx: usize) -> Option<PrimaryKey> {
        match self {
            ColumnData::Int64(v) => v.get(idx).copied().map(PrimaryKey::Int64),
            ColumnData::VarChar(v) => v.get(idx).cloned().map(PrimaryKey::VarChar),
            _ => None,
        }
    }
}

/// A named column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldColumn {
    pub field_name: String,
    pub data: ColumnData,
}

/// A column of primary keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PrimaryKeys {
    Int64(Vec<i64>),
    VarChar(Vec<String>),
}

impl Default for PrimaryKeys {
    fn default() -> Self {
        PrimaryKeys::Int64(Vec::new())
    }
}

impl PrimaryKeys {
    pub fn len(&self) -> usize {
        match self {
            PrimaryKeys::Int64(v) => v.len(),
            PrimaryKeys::VarChar(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<PrimaryKey> {
        match self {
            PrimaryKeys::Int64(v) => v.get(idx).copied().map(PrimaryKey::Int64),
            PrimaryKeys::VarChar(v) => v.get(idx).cloned().map(PrimaryKey::VarChar),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = PrimaryKey> + '_ {
        (0..self.len()).filter_map(|i| self.get(i))
    }

    /// Builds a key column from keys of a single variant.
    ///
    /// Returns `None` when variants are mixed.
    pub fn from_keys(keys: impl IntoIterator<Item = PrimaryKey>) -> Option<PrimaryKeys> {
        let mut keys = keys.into_iter().peekable();
        match keys.peek() {
            None | Some(PrimaryKey::Int64(_)) => keys
                .map(|k| match k {
                    PrimaryKey::Int64(v) => Some(v),
                    PrimaryKey::VarChar(_) => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(PrimaryKeys::Int64),
            Some(PrimaryKey::VarChar(_)) => keys
                .map(|k| match k {
                    PrimaryKey::VarChar(v) => Some(v),
                    PrimaryKey::Int64(_) => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(PrimaryKeys::VarChar),
        }
    }

    fn encoded_size(&self) -> usize {
        self.iter().map(|k| k.encoded_size()).sum()
    }
}

/// Read consistency requested by a search or query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Observe every mutation acknowledged before the request.
    Strong,
    /// Observe mutations older than the configured staleness bound.
    #[default]
    Bounded,
    /// Observe the caller's own prior mutations.
    Session,
    /// No freshness guarantee.
    Eventually,
    /// The caller supplies the guarantee timestamp.
    Customized,
}

/// The distance metric a vector index is built with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    /// Euclidean distance; smaller is closer.
    #[default]
    L2,
    /// Inner product; larger is closer.
    Ip,
    /// Cosine similarity; larger is closer.
    Cosine,
}

impl MetricType {
    /// Whether larger scores rank first.
    pub fn larger_is_closer(&self) -> bool {
        match self {
            MetricType::L2 => false,
            MetricType::Ip | MetricType::Cosine => true,
        }
    }
}

/// Health of a component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateCode {
    Initializing,
    Healthy,
    Abnormal,
    Stopping,
}

impl fmt::Display for StateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateCode::Initializing => "initializing",
            StateCode::Healthy => "healthy",
            StateCode::Abnormal => "abnormal",
            StateCode::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// What the metadata authority knows about a collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: CollectionId,
    pub name: String,
    pub schema: CollectionSchema,
    pub shards_num: u32,
    pub consistency_level: ConsistencyLevel,
    pub created_ts: Timestamp,
    pub aliases: Vec<String>,
    /// The write-ahead channels of the collection, one per shard.
    pub channels: Vec<String>,
}

/// A partition of a collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: PartitionId,
    pub name: String,
    pub created_ts: Timestamp,
}

/// Description of a vector or scalar index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescription {
    pub index_name: String,
    pub field_name: String,
    pub params: BTreeMap<String, String>,
}

/// Build progress of an index, in rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBuildProgress {
    pub indexed_rows: u64,
    pub total_rows: u64,
}

/// A sealed segment as reported by the storage coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub num_rows: u64,
    pub state: SegmentState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Growing,
    Sealed,
    Flushed,
}

/// State of a compaction job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionState {
    Executing,
    Completed,
}

/// Row counts of a collection or one of its partitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub row_count: u64,
}

/// Whether an index has caught up with its collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    InProgress,
    Finished,
}

impl From<IndexBuildProgress> for IndexState {
    fn from(progress: IndexBuildProgress) -> Self {
        if progress.indexed_rows >= progress.total_rows {
            IndexState::Finished
        } else {
            IndexState::InProgress
        }
    }
}

/// A segment as loaded on the query cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySegmentInfo {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub num_rows: u64,
    /// The nodes holding a copy of the segment.
    pub node_ids: Vec<NodeId>,
}

/// One full copy of a loaded collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub replica_id: ReplicaId,
    pub collection_id: CollectionId,
    /// The node leading each shard of this replica.
    pub shard_leaders: Vec<(ShardId, NodeId)>,
    pub node_ids: Vec<NodeId>,
}

/// One shard and the replicas that can serve it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLeaders {
    pub shard: ShardId,
    pub channel: String,
    pub replicas: Vec<NodeId>,
}

/// The operations accepted by [`crate::Proxy::create_collection`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateCollectionRequest {
    pub schema: CollectionSchema,
    pub shards_num: u32,
    pub consistency_level: ConsistencyLevel,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateIndexRequest {
    pub collection_name: String,
    pub field_name: String,
    pub index_name: String,
    pub params: BTreeMap<String, String>,
}

/// A batch of rows to insert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsertRequest {
    pub collection_name: String,
    /// Empty selects the default partition.
    pub partition_name: String,
    pub fields: Vec<FieldColumn>,
    pub num_rows: u32,
}

impl InsertRequest {
    /// Approximate payload size, used for admission and throughput.
    pub fn encoded_size(&self) -> usize {
        self.fields.iter().map(|f| f.data.encoded_size()).sum()
    }
}

/// Deletes rows by primary key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub collection_name: String,
    pub partition_name: String,
    pub primary_keys: PrimaryKeys,
}

impl DeleteRequest {
    pub fn encoded_size(&self) -> usize {
        self.primary_keys.encoded_size()
    }
}

/// The outcome of an insert or delete.
///
/// On failure `err_index` lists every row: a batch either commits as a
/// whole or not at all.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub ids: PrimaryKeys,
    pub insert_cnt: u64,
    pub delete_cnt: u64,
    pub err_index: Vec<u32>,
    /// The commit timestamp. Zero for failed mutations.
    pub timestamp: Timestamp,
    /// Set when the mutation failed.
    pub reason: Option<String>,
}

impl MutationResult {
    /// A result marking all `num_rows` rows as failed.
    pub fn failed_insert(num_rows: u32, reason: String) -> Self {
        MutationResult {
            insert_cnt: u64::from(num_rows),
            err_index: (0..num_rows).collect(),
            reason: Some(reason),
            ..Default::default()
        }
    }

    /// A result marking all `num_rows` delete keys as failed.
    pub fn failed_delete(num_rows: u32, reason: String) -> Self {
        MutationResult {
            delete_cnt: u64::from(num_rows),
            err_index: (0..num_rows).collect(),
            reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.reason.is_none()
    }
}

/// A nearest neighbor search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub collection_name: String,
    /// Empty searches every partition.
    pub partition_names: Vec<String>,
    pub anns_field: String,
    /// `nq` query vectors of the field's dimension, concatenated.
    pub vectors: Vec<f32>,
    pub nq: u32,
    pub topk: u32,
    pub offset: u32,
    pub metric_type: MetricType,
    pub output_fields: Vec<String>,
    pub consistency_level: Option<ConsistencyLevel>,
    pub guarantee_ts: Option<Timestamp>,
    pub travel_ts: Option<Timestamp>,
}

/// A scalar retrieval by primary key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub collection_name: String,
    pub partition_names: Vec<String>,
    /// Keys to retrieve.
    pub primary_keys: PrimaryKeys,
    pub output_fields: Vec<String>,
    pub limit: Option<u32>,
    pub consistency_level: Option<ConsistencyLevel>,
    pub guarantee_ts: Option<Timestamp>,
    pub travel_ts: Option<Timestamp>,
}

/// The read point resolved for a search or query at enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPoint {
    /// Workers wait until they have consumed mutations up to here.
    pub guarantee_ts: Timestamp,
    /// The snapshot the read observes.
    pub snapshot_ts: Timestamp,
}

/// The per-shard request sent to a worker for a search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardSearchRequest {
    pub collection_id: CollectionId,
    pub shard: ShardId,
    pub partition_ids: Vec<PartitionId>,
    pub anns_field: String,
    pub vectors: Vec<f32>,
    pub nq: u32,
    /// `topk + offset`: each shard must return enough to page.
    pub topk: u32,
    pub metric_type: MetricType,
    pub output_fields: Vec<String>,
    pub read_point: ReadPoint,
}

/// The per-shard request sent to a worker for a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardQueryRequest {
    pub collection_id: CollectionId,
    pub shard: ShardId,
    pub partition_ids: Vec<PartitionId>,
    pub primary_keys: PrimaryKeys,
    pub output_fields: Vec<String>,
    pub read_point: ReadPoint,
}

/// Hits of one or more search queries.
///
/// Query `i` owns hits `topks[..i].sum() .. topks[..=i].sum()`; within a
/// query, hits are ordered best first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResultData {
    pub nq: u32,
    pub topk: u32,
    pub ids: Vec<PrimaryKey>,
    pub scores: Vec<f32>,
    pub topks: Vec<u32>,
    pub fields: Vec<FieldColumn>,
}

impl SearchResultData {
    /// An empty result for `nq` queries.
    pub fn empty(nq: u32, topk: u32) -> Self {
        SearchResultData {
            nq,
            topk,
            topks: vec![0; usize::cast_from(nq)],
            ..Default::default()
        }
    }

    pub fn encoded_size(&self) -> usize {
        self.ids.iter().map(|k| k.encoded_size()).sum::<usize>()
            + self.scores.len() * 4
            + self.fields.iter().map(|f| f.data.encoded_size()).sum::<usize>()
    }
}

/// Rows returned by one shard for a query, or the merged result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrieveResults {
    pub ids: Vec<PrimaryKey>,
    /// The commit timestamp of each row's latest version.
    pub timestamps: Vec<Timestamp>,
    pub fields: Vec<FieldColumn>,
}

impl RetrieveResults {
    pub fn encoded_size(&self) -> usize {
        self.ids.iter().map(|k| k.encoded_size()).sum::<usize>()
            + self.timestamps.len() * 8
            + self.fields.iter().map(|f| f.data.encoded_size()).sum::<usize>()
    }
}

/// The states reported by `get_component_states`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStates {
    pub node_id: NodeId,
    pub role: String,
    pub state: StateCode,
    pub subcomponents: Vec<(String, StateCode)>,
}

/// The outcome of a cluster health check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub is_healthy: bool,
    pub reasons: Vec<String>,
}

/// An opaque, pre-hashed credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub encrypted_password: String,
}

/// A change to a role's grants or membership, pushed by the metadata
/// authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyRefresh {
    Grant { role: String, policy: String },
    Revoke { role: String, policy: String },
    AddUserToRole { user: String, role: String },
    RemoveUserFromRole { user: String, role: String },
    DeleteRole { role: String },
}

/// Roles every deployment has. They cannot be dropped.
pub const DEFAULT_ROLES: [&str; 2] = ["admin", "public"];

/// The kinds of objects privileges are granted on.
pub const OBJECT_TYPES: [&str; 3] = ["Global", "Collection", "User"];

/// Whether a user gains or loses a role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRoleOp {
    AddUserToRole,
    RemoveUserFromRole,
}

/// Whether a privilege is granted or revoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivilegeOp {
    Grant,
    Revoke,
}

/// The object a privilege applies to. `object_name` may be `*`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrantObject {
    pub object_type: String,
    pub object_name: String,
}

/// A privilege held by a role on an object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Grant {
    pub role: String,
    pub object: GrantObject,
    pub privilege: String,
    /// The user who granted it.
    pub grantor: String,
}

impl Grant {
    /// The policy key this grant adds to a role in the metadata cache.
    pub fn policy(&self) -> String {
        format!(
            "{}-{}-{}",
            self.object.object_type, self.object.object_name, self.privilege
        )
    }
}

/// A role and, when asked for, its members.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleResult {
    pub role: String,
    pub users: Vec<String>,
}

/// A user and, when asked for, its roles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResult {
    pub user: String,
    pub roles: Vec<String>,
}
