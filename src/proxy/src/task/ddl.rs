// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Schema and metadata operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use vdb_dyncfg::ConfigSet;

use crate::config::DEFAULT_PARTITION_NAME;
use crate::error::{BackendError, ProxyError};
use crate::rate::RateType;
use crate::scheduler::{TaskQueue, TaskScheduler};
use crate::task::{QueuedTask, TaskContext, TaskEnv, TaskKind, TaskStamp};
use crate::types::{
    CollectionInfo, CreateCollectionRequest, CreateIndexRequest, DataType, IndexBuildProgress,
    IndexDescription, IndexState, PartitionInfo, SegmentId, Statistics,
};

const MAX_NAME_LEN: usize = 255;

/// Checks that `name` is usable as a collection, partition, alias, field or
/// index name.
pub(crate) fn validate_name(what: &str, name: &str) -> Result<(), ProxyError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name.len() <= MAX_NAME_LEN
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ProxyError::InvalidRequest(format!(
            "invalid {what} name: {name:?}"
        )))
    }
}

fn validate_create_collection(req: &CreateCollectionRequest) -> Result<(), ProxyError> {
    let schema = &req.schema;
    validate_name("collection", &schema.name)?;
    let mut names = BTreeSet::new();
    for field in &schema.fields {
        validate_name("field", &field.name)?;
        if !names.insert(field.name.as_str()) {
            return Err(ProxyError::InvalidRequest(format!(
                "duplicate field name: {}",
                field.name
            )));
        }
        if let DataType::FloatVector { dim: 0 } = field.data_type {
            return Err(ProxyError::InvalidRequest(format!(
                "vector field {} has dimension 0",
                field.name
            )));
        }
    }
    let primary_keys: Vec<_> = schema.fields.iter().filter(|f| f.is_primary_key).collect();
    match primary_keys.as_slice() {
        [pk] if matches!(pk.data_type, DataType::Int64 | DataType::VarChar) => {}
        [pk] => {
            return Err(ProxyError::InvalidRequest(format!(
                "primary key {} must be Int64 or VarChar",
                pk.name
            )))
        }
        _ => {
            return Err(ProxyError::InvalidRequest(
                "schema must have exactly one primary key field".into(),
            ))
        }
    }
    if !schema
        .fields
        .iter()
        .any(|f| matches!(f.data_type, DataType::FloatVector { .. }))
    {
        return Err(ProxyError::InvalidRequest(
            "schema must have a vector field".into(),
        ));
    }
    Ok(())
}

/// A DDL operation.
#[derive(Clone, Debug)]
pub enum DdlTask {
    CreateCollection(CreateCollectionRequest),
    DropCollection {
        collection_name: String,
    },
    HasCollection {
        collection_name: String,
    },
    DescribeCollection {
        collection_name: String,
    },
    ShowCollections,
    CreatePartition {
        collection_name: String,
        partition_name: String,
    },
    DropPartition {
        collection_name: String,
        partition_name: String,
    },
    HasPartition {
        collection_name: String,
        partition_name: String,
    },
    ShowPartitions {
        collection_name: String,
    },
    LoadCollection {
        collection_name: String,
        replica_number: u32,
    },
    ReleaseCollection {
        collection_name: String,
    },
    LoadPartitions {
        collection_name: String,
        partition_names: Vec<String>,
    },
    ReleasePartitions {
        collection_name: String,
        partition_names: Vec<String>,
    },
    CreateIndex(CreateIndexRequest),
    /// An empty `index_name` describes every index of the collection.
    DescribeIndex {
        collection_name: String,
        index_name: String,
    },
    DropIndex {
        collection_name: String,
        index_name: String,
    },
    GetIndexBuildProgress {
        collection_name: String,
        index_name: String,
    },
    GetIndexState {
        collection_name: String,
        index_name: String,
    },
    GetCollectionStatistics {
        collection_name: String,
    },
    GetPartitionStatistics {
        collection_name: String,
        partition_name: String,
    },
    Flush {
        collection_names: Vec<String>,
    },
    CreateAlias {
        alias: String,
        collection_name: String,
    },
    DropAlias {
        alias: String,
    },
    AlterAlias {
        alias: String,
        collection_name: String,
    },
}

/// The result of a [`DdlTask`].
#[derive(Clone, Debug, PartialEq)]
pub enum DdlOutput {
    Done,
    Bool(bool),
    Collection(CollectionInfo),
    Collections(Vec<CollectionInfo>),
    Partitions(Vec<PartitionInfo>),
    Indexes(Vec<IndexDescription>),
    IndexProgress(IndexBuildProgress),
    IndexState(IndexState),
    Statistics(Statistics),
    /// Segments sealed by a flush, per collection.
    Flushed(BTreeMap<String, Vec<SegmentId>>),
}

#[async_trait]
impl QueuedTask for DdlTask {
    type Output = DdlOutput;
    const KIND: TaskKind = TaskKind::Ddl;

    fn name(&self) -> &'static str {
        match self {
            DdlTask::CreateCollection(_) => "CreateCollection",
            DdlTask::DropCollection { .. } => "DropCollection",
            DdlTask::HasCollection { .. } => "HasCollection",
            DdlTask::DescribeCollection { .. } => "DescribeCollection",
            DdlTask::ShowCollections => "ShowCollections",
            DdlTask::CreatePartition { .. } => "CreatePartition",
            DdlTask::DropPartition { .. } => "DropPartition",
            DdlTask::HasPartition { .. } => "HasPartition",
            DdlTask::ShowPartitions { .. } => "ShowPartitions",
            DdlTask::LoadCollection { .. } => "LoadCollection",
            DdlTask::ReleaseCollection { .. } => "ReleaseCollection",
            DdlTask::LoadPartitions { .. } => "LoadPartitions",
            DdlTask::ReleasePartitions { .. } => "ReleasePartitions",
            DdlTask::CreateIndex(_) => "CreateIndex",
            DdlTask::DescribeIndex { .. } => "DescribeIndex",
            DdlTask::DropIndex { .. } => "DropIndex",
            DdlTask::GetIndexBuildProgress { .. } => "GetIndexBuildProgress",
            DdlTask::GetIndexState { .. } => "GetIndexState",
            DdlTask::GetCollectionStatistics { .. } => "GetCollectionStatistics",
            DdlTask::GetPartitionStatistics { .. } => "GetPartitionStatistics",
            DdlTask::Flush { .. } => "Flush",
            DdlTask::CreateAlias { .. } => "CreateAlias",
            DdlTask::DropAlias { .. } => "DropAlias",
            DdlTask::AlterAlias { .. } => "AlterAlias",
        }
    }

    fn validate(&self, _configs: &ConfigSet) -> Result<(), ProxyError> {
        match self {
            DdlTask::CreateCollection(req) => validate_create_collection(req),
            DdlTask::CreatePartition {
                collection_name,
                partition_name,
            } => {
                validate_name("collection", collection_name)?;
                validate_name("partition", partition_name)
            }
            DdlTask::DropPartition {
                collection_name,
                partition_name,
            } => {
                validate_name("collection", collection_name)?;
                validate_name("partition", partition_name)?;
                if partition_name == DEFAULT_PARTITION_NAME {
                    return Err(ProxyError::InvalidRequest(
                        "the default partition cannot be dropped".into(),
                    ));
                }
                Ok(())
            }
            DdlTask::LoadPartitions {
                partition_names, ..
            }
            | DdlTask::ReleasePartitions {
                partition_names, ..
            } if partition_names.is_empty() => Err(ProxyError::InvalidRequest(
                "no partitions named".into(),
            )),
            DdlTask::CreateIndex(req) => {
                validate_name("collection", &req.collection_name)?;
                validate_name("field", &req.field_name)?;
                if !req.index_name.is_empty() {
                    validate_name("index", &req.index_name)?;
                }
                Ok(())
            }
            DdlTask::Flush { collection_names } if collection_names.is_empty() => Err(
                ProxyError::InvalidRequest("no collections named".into()),
            ),
            DdlTask::CreateAlias {
                alias,
                collection_name,
            }
            | DdlTask::AlterAlias {
                alias,
                collection_name,
            } => {
                validate_name("alias", alias)?;
                validate_name("collection", collection_name)
            }
            DdlTask::DropAlias { alias } => validate_name("alias", alias),
            DdlTask::GetIndexState { index_name, .. } => validate_name("index", index_name),
            _ => Ok(()),
        }
    }

    fn admission(&self) -> Option<(RateType, f64)> {
        let rate_type = match self {
            DdlTask::CreateCollection(_)
            | DdlTask::DropCollection { .. }
            | DdlTask::LoadCollection { .. }
            | DdlTask::ReleaseCollection { .. }
            | DdlTask::CreateAlias { .. }
            | DdlTask::DropAlias { .. }
            | DdlTask::AlterAlias { .. } => RateType::DdlCollection,
            DdlTask::CreatePartition { .. }
            | DdlTask::DropPartition { .. }
            | DdlTask::LoadPartitions { .. }
            | DdlTask::ReleasePartitions { .. } => RateType::DdlPartition,
            DdlTask::CreateIndex(_) | DdlTask::DropIndex { .. } => RateType::DdlIndex,
            DdlTask::Flush { .. } => RateType::DdlFlush,
            DdlTask::HasCollection { .. }
            | DdlTask::DescribeCollection { .. }
            | DdlTask::ShowCollections
            | DdlTask::HasPartition { .. }
            | DdlTask::ShowPartitions { .. }
            | DdlTask::DescribeIndex { .. }
            | DdlTask::GetIndexBuildProgress { .. }
            | DdlTask::GetIndexState { .. }
            | DdlTask::GetCollectionStatistics { .. }
            | DdlTask::GetPartitionStatistics { .. } => return None,
        };
        Some((rate_type, 1.0))
    }

    async fn execute(
        self,
        env: &TaskEnv,
        stamp: &TaskStamp,
        _ctx: &TaskContext,
    ) -> Result<DdlOutput, ProxyError> {
        let ts = stamp.begin_ts;
        let backends = &env.backends;
        match self {
            DdlTask::CreateCollection(mut req) => {
                if req.shards_num == 0 {
                    req.shards_num = 1;
                }
                let name = req.schema.name.clone();
                let id = backends.metadata.create_collection(req, ts).await?;
                env.meta_cache.remove_collection_by_name(&name);
                info!(collection = %name, %id, %ts, "created collection");
                Ok(DdlOutput::Done)
            }
            DdlTask::DropCollection { collection_name } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                backends.metadata.drop_collection(&collection_name, ts).await?;
                env.meta_cache.remove_collection_by_name(&collection_name);
                env.meta_cache.remove_collection_by_id(id);
                env.channels.remove_channels(id).await;
                env.shards.remove(id).await;
                info!(collection = %collection_name, %id, %ts, "dropped collection");
                Ok(DdlOutput::Done)
            }
            DdlTask::HasCollection { collection_name } => Ok(DdlOutput::Bool(
                backends.metadata.has_collection(&collection_name, ts).await?,
            )),
            DdlTask::DescribeCollection { collection_name } => {
                match backends
                    .metadata
                    .describe_collection(&collection_name, ts)
                    .await
                {
                    Ok(info) => Ok(DdlOutput::Collection(info)),
                    Err(BackendError::Rejected { .. }) => {
                        Err(ProxyError::CollectionMissing(collection_name))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            DdlTask::ShowCollections => Ok(DdlOutput::Collections(
                backends.metadata.show_collections(ts).await?,
            )),
            DdlTask::CreatePartition {
                collection_name,
                partition_name,
            } => {
                env.meta_cache.collection(&collection_name, ts).await?;
                backends
                    .metadata
                    .create_partition(&collection_name, &partition_name, ts)
                    .await?;
                env.meta_cache.remove_collection_by_name(&collection_name);
                info!(
                    collection = %collection_name,
                    partition = %partition_name,
                    "created partition"
                );
                Ok(DdlOutput::Done)
            }
            DdlTask::DropPartition {
                collection_name,
                partition_name,
            } => {
                env.meta_cache
                    .partition_id(&collection_name, &partition_name, ts)
                    .await?;
                backends
                    .metadata
                    .drop_partition(&collection_name, &partition_name, ts)
                    .await?;
                env.meta_cache.remove_collection_by_name(&collection_name);
                info!(
                    collection = %collection_name,
                    partition = %partition_name,
                    "dropped partition"
                );
                Ok(DdlOutput::Done)
            }
            DdlTask::HasPartition {
                collection_name,
                partition_name,
            } => {
                let info = env.meta_cache.collection(&collection_name, ts).await?;
                let partitions = backends.metadata.show_partitions(&info.name, ts).await?;
                Ok(DdlOutput::Bool(
                    partitions.iter().any(|p| p.name == partition_name),
                ))
            }
            DdlTask::ShowPartitions { collection_name } => {
                let info = env.meta_cache.collection(&collection_name, ts).await?;
                Ok(DdlOutput::Partitions(
                    backends.metadata.show_partitions(&info.name, ts).await?,
                ))
            }
            DdlTask::LoadCollection {
                collection_name,
                replica_number,
            } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                backends
                    .query
                    .load_collection(id, replica_number.max(1))
                    .await?;
                Ok(DdlOutput::Done)
            }
            DdlTask::ReleaseCollection { collection_name } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                backends.query.release_collection(id).await?;
                env.shards.remove(id).await;
                Ok(DdlOutput::Done)
            }
            DdlTask::LoadPartitions {
                collection_name,
                partition_names,
            } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                let mut partitions = Vec::with_capacity(partition_names.len());
                for name in &partition_names {
                    partitions.push(
                        env.meta_cache
                            .partition_id(&collection_name, name, ts)
                            .await?,
                    );
                }
                backends.query.load_partitions(id, partitions).await?;
                Ok(DdlOutput::Done)
            }
            DdlTask::ReleasePartitions {
                collection_name,
                partition_names,
            } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                let mut partitions = Vec::with_capacity(partition_names.len());
                for name in &partition_names {
                    partitions.push(
                        env.meta_cache
                            .partition_id(&collection_name, name, ts)
                            .await?,
                    );
                }
                backends.query.release_partitions(id, partitions).await?;
                env.shards.remove(id).await;
                Ok(DdlOutput::Done)
            }
            DdlTask::CreateIndex(req) => {
                let info = env.meta_cache.collection(&req.collection_name, ts).await?;
                if info.schema.field(&req.field_name).is_none() {
                    return Err(ProxyError::InvalidRequest(format!(
                        "collection {} has no field {}",
                        req.collection_name, req.field_name
                    )));
                }
                let index_name = if req.index_name.is_empty() {
                    req.field_name.clone()
                } else {
                    req.index_name
                };
                backends
                    .index
                    .create_index(
                        info.id,
                        IndexDescription {
                            index_name,
                            field_name: req.field_name,
                            params: req.params,
                        },
                    )
                    .await?;
                Ok(DdlOutput::Done)
            }
            DdlTask::DescribeIndex {
                collection_name,
                index_name,
            } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                Ok(DdlOutput::Indexes(
                    backends.index.describe_index(id, &index_name).await?,
                ))
            }
            DdlTask::DropIndex {
                collection_name,
                index_name,
            } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                backends.index.drop_index(id, &index_name).await?;
                Ok(DdlOutput::Done)
            }
            DdlTask::GetIndexBuildProgress {
                collection_name,
                index_name,
            } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                Ok(DdlOutput::IndexProgress(
                    backends.index.index_build_progress(id, &index_name).await?,
                ))
            }
            DdlTask::GetIndexState {
                collection_name,
                index_name,
            } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                let progress = backends.index.index_build_progress(id, &index_name).await?;
                Ok(DdlOutput::IndexState(progress.into()))
            }
            DdlTask::GetCollectionStatistics { collection_name } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                let segments = backends.storage.segments(id).await?;
                Ok(DdlOutput::Statistics(Statistics {
                    row_count: segments.iter().map(|s| s.num_rows).sum(),
                }))
            }
            DdlTask::GetPartitionStatistics {
                collection_name,
                partition_name,
            } => {
                let id = env.meta_cache.collection_id(&collection_name, ts).await?;
                let partition = env
                    .meta_cache
                    .partition_id(&collection_name, &partition_name, ts)
                    .await?;
                let segments = backends.storage.segments(id).await?;
                Ok(DdlOutput::Statistics(Statistics {
                    row_count: segments
                        .iter()
                        .filter(|s| s.partition_id == partition)
                        .map(|s| s.num_rows)
                        .sum(),
                }))
            }
            DdlTask::Flush { collection_names } => {
                let mut flushed = BTreeMap::new();
                for name in collection_names {
                    let id = env.meta_cache.collection_id(&name, ts).await?;
                    let segments = backends.storage.flush(id).await?;
                    flushed.insert(name, segments);
                }
                Ok(DdlOutput::Flushed(flushed))
            }
            DdlTask::CreateAlias {
                alias,
                collection_name,
            } => {
                backends
                    .metadata
                    .create_alias(&alias, &collection_name, ts)
                    .await?;
                env.meta_cache.remove_collection_by_name(&collection_name);
                Ok(DdlOutput::Done)
            }
            DdlTask::DropAlias { alias } => {
                backends.metadata.drop_alias(&alias, ts).await?;
                env.meta_cache.remove_collection_by_name(&alias);
                Ok(DdlOutput::Done)
            }
            DdlTask::AlterAlias {
                alias,
                collection_name,
            } => {
                backends
                    .metadata
                    .alter_alias(&alias, &collection_name, ts)
                    .await?;
                env.meta_cache.remove_collection_by_name(&alias);
                env.meta_cache.remove_collection_by_name(&collection_name);
                Ok(DdlOutput::Done)
            }
        }
    }

    fn queue(scheduler: &TaskScheduler) -> &Arc<TaskQueue<Self>> {
        scheduler.ddl_queue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectionSchema, ConsistencyLevel, FieldSchema};

    fn request(fields: Vec<FieldSchema>) -> CreateCollectionRequest {
        CreateCollectionRequest {
            schema: CollectionSchema {
                name: "books".into(),
                description: String::new(),
                fields,
            },
            shards_num: 2,
            consistency_level: ConsistencyLevel::Strong,
        }
    }

    #[test]
    fn names() {
        assert!(validate_name("collection", "books_2").is_ok());
        assert!(validate_name("collection", "_x").is_ok());
        assert!(validate_name("collection", "").is_err());
        assert!(validate_name("collection", "2books").is_err());
        assert!(validate_name("collection", "bo-oks").is_err());
        assert!(validate_name("collection", &"x".repeat(256)).is_err());
    }

    #[test]
    fn create_collection_schema() {
        let pk = FieldSchema::new("id", DataType::Int64).primary_key(true);
        let vector = FieldSchema::new("v", DataType::FloatVector { dim: 4 });
        assert!(validate_create_collection(&request(vec![pk.clone(), vector.clone()])).is_ok());
        assert!(validate_create_collection(&request(vec![vector.clone()])).is_err());
        assert!(validate_create_collection(&request(vec![pk.clone()])).is_err());
        assert!(
            validate_create_collection(&request(vec![pk.clone(), pk.clone(), vector.clone()]))
                .is_err()
        );
        let float_pk = FieldSchema::new("f", DataType::Float).primary_key(false);
        assert!(validate_create_collection(&request(vec![float_pk, vector])).is_err());
        let flat = FieldSchema::new("w", DataType::FloatVector { dim: 0 });
        assert!(validate_create_collection(&request(vec![pk, flat])).is_err());
    }

    #[test]
    fn admission_classes() {
        let configs = crate::config::all_dyncfgs(ConfigSet::default());
        let drop_default = DdlTask::DropPartition {
            collection_name: "books".into(),
            partition_name: DEFAULT_PARTITION_NAME.into(),
        };
        assert!(drop_default.validate(&configs).is_err());
        assert_eq!(
            drop_default.admission(),
            Some((RateType::DdlPartition, 1.0))
        );
        assert_eq!(DdlTask::ShowCollections.admission(), None);
        assert_eq!(
            DdlTask::Flush {
                collection_names: vec!["books".into()]
            }
            .admission(),
            Some((RateType::DdlFlush, 1.0))
        );
    }
}
