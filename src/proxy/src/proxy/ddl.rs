// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Handlers of schema and metadata operations.

use std::collections::BTreeMap;

use tracing::info;

use crate::error::ProxyError;
use crate::proxy::{unexpected_output, Proxy};
use crate::task::{DdlOutput, DdlTask};
use crate::types::{
    CollectionInfo, CreateCollectionRequest, CreateIndexRequest, IndexBuildProgress,
    IndexDescription, IndexState, PartitionInfo, SegmentId, Statistics,
};

impl Proxy {
    async fn run_ddl(&self, method: &'static str, task: DdlTask) -> Result<DdlOutput, ProxyError> {
        self.run_task(method, task).await
    }

    async fn run_ddl_done(&self, method: &'static str, task: DdlTask) -> Result<(), ProxyError> {
        match self.run_ddl(method, task).await? {
            DdlOutput::Done => Ok(()),
            other => Err(unexpected_output(method, other)),
        }
    }

    async fn run_ddl_bool(&self, method: &'static str, task: DdlTask) -> Result<bool, ProxyError> {
        match self.run_ddl(method, task).await? {
            DdlOutput::Bool(b) => Ok(b),
            other => Err(unexpected_output(method, other)),
        }
    }

    async fn run_ddl_statistics(
        &self,
        method: &'static str,
        task: DdlTask,
    ) -> Result<Statistics, ProxyError> {
        match self.run_ddl(method, task).await? {
            DdlOutput::Statistics(stats) => Ok(stats),
            other => Err(unexpected_output(method, other)),
        }
    }

    pub async fn create_collection(&self, req: CreateCollectionRequest) -> Result<(), ProxyError> {
        let name = req.schema.name.clone();
        self.run_ddl_done("CreateCollection", DdlTask::CreateCollection(req))
            .await?;
        info!(collection = %name, "create collection done");
        Ok(())
    }

    pub async fn drop_collection(&self, collection_name: &str) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "DropCollection",
            DdlTask::DropCollection {
                collection_name: collection_name.to_owned(),
            },
        )
        .await
    }

    pub async fn has_collection(&self, collection_name: &str) -> Result<bool, ProxyError> {
        self.run_ddl_bool(
            "HasCollection",
            DdlTask::HasCollection {
                collection_name: collection_name.to_owned(),
            },
        )
        .await
    }

    /// Describes a collection by name or alias.
    pub async fn describe_collection(
        &self,
        collection_name: &str,
    ) -> Result<CollectionInfo, ProxyError> {
        let task = DdlTask::DescribeCollection {
            collection_name: collection_name.to_owned(),
        };
        match self.run_ddl("DescribeCollection", task).await? {
            DdlOutput::Collection(info) => Ok(info),
            other => Err(unexpected_output("DescribeCollection", other)),
        }
    }

    pub async fn show_collections(&self) -> Result<Vec<CollectionInfo>, ProxyError> {
        match self
            .run_ddl("ShowCollections", DdlTask::ShowCollections)
            .await?
        {
            DdlOutput::Collections(infos) => Ok(infos),
            other => Err(unexpected_output("ShowCollections", other)),
        }
    }

    pub async fn create_partition(
        &self,
        collection_name: &str,
        partition_name: &str,
    ) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "CreatePartition",
            DdlTask::CreatePartition {
                collection_name: collection_name.to_owned(),
                partition_name: partition_name.to_owned(),
            },
        )
        .await
    }

    pub async fn drop_partition(
        &self,
        collection_name: &str,
        partition_name: &str,
    ) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "DropPartition",
            DdlTask::DropPartition {
                collection_name: collection_name.to_owned(),
                partition_name: partition_name.to_owned(),
            },
        )
        .await
    }

    pub async fn has_partition(
        &self,
        collection_name: &str,
        partition_name: &str,
    ) -> Result<bool, ProxyError> {
        self.run_ddl_bool(
            "HasPartition",
            DdlTask::HasPartition {
                collection_name: collection_name.to_owned(),
                partition_name: partition_name.to_owned(),
            },
        )
        .await
    }

    pub async fn show_partitions(
        &self,
        collection_name: &str,
    ) -> Result<Vec<PartitionInfo>, ProxyError> {
        let task = DdlTask::ShowPartitions {
            collection_name: collection_name.to_owned(),
        };
        match self.run_ddl("ShowPartitions", task).await? {
            DdlOutput::Partitions(partitions) => Ok(partitions),
            other => Err(unexpected_output("ShowPartitions", other)),
        }
    }

    pub async fn load_collection(
        &self,
        collection_name: &str,
        replica_number: u32,
    ) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "LoadCollection",
            DdlTask::LoadCollection {
                collection_name: collection_name.to_owned(),
                replica_number,
            },
        )
        .await
    }

    pub async fn release_collection(&self, collection_name: &str) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "ReleaseCollection",
            DdlTask::ReleaseCollection {
                collection_name: collection_name.to_owned(),
            },
        )
        .await
    }

    pub async fn load_partitions(
        &self,
        collection_name: &str,
        partition_names: Vec<String>,
    ) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "LoadPartitions",
            DdlTask::LoadPartitions {
                collection_name: collection_name.to_owned(),
                partition_names,
            },
        )
        .await
    }

    pub async fn release_partitions(
        &self,
        collection_name: &str,
        partition_names: Vec<String>,
    ) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "ReleasePartitions",
            DdlTask::ReleasePartitions {
                collection_name: collection_name.to_owned(),
                partition_names,
            },
        )
        .await
    }

    pub async fn create_index(&self, req: CreateIndexRequest) -> Result<(), ProxyError> {
        self.run_ddl_done("CreateIndex", DdlTask::CreateIndex(req))
            .await
    }

    /// Describes the named index, or every index of the collection when
    /// `index_name` is empty.
    pub async fn describe_index(
        &self,
        collection_name: &str,
        index_name: &str,
    ) -> Result<Vec<IndexDescription>, ProxyError> {
        let task = DdlTask::DescribeIndex {
            collection_name: collection_name.to_owned(),
            index_name: index_name.to_owned(),
        };
        match self.run_ddl("DescribeIndex", task).await? {
            DdlOutput::Indexes(indexes) => Ok(indexes),
            other => Err(unexpected_output("DescribeIndex", other)),
        }
    }

    pub async fn drop_index(
        &self,
        collection_name: &str,
        index_name: &str,
    ) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "DropIndex",
            DdlTask::DropIndex {
                collection_name: collection_name.to_owned(),
                index_name: index_name.to_owned(),
            },
        )
        .await
    }

    pub async fn get_index_build_progress(
        &self,
        collection_name: &str,
        index_name: &str,
    ) -> Result<IndexBuildProgress, ProxyError> {
        let task = DdlTask::GetIndexBuildProgress {
            collection_name: collection_name.to_owned(),
            index_name: index_name.to_owned(),
        };
        match self.run_ddl("GetIndexBuildProgress", task).await? {
            DdlOutput::IndexProgress(progress) => Ok(progress),
            other => Err(unexpected_output("GetIndexBuildProgress", other)),
        }
    }

    /// Whether the named index has caught up with its collection.
    pub async fn get_index_state(
        &self,
        collection_name: &str,
        index_name: &str,
    ) -> Result<IndexState, ProxyError> {
        let task = DdlTask::GetIndexState {
            collection_name: collection_name.to_owned(),
            index_name: index_name.to_owned(),
        };
        match self.run_ddl("GetIndexState", task).await? {
            DdlOutput::IndexState(state) => Ok(state),
            other => Err(unexpected_output("GetIndexState", other)),
        }
    }

    /// Row count over every segment of the collection.
    pub async fn get_collection_statistics(
        &self,
        collection_name: &str,
    ) -> Result<Statistics, ProxyError> {
        let task = DdlTask::GetCollectionStatistics {
            collection_name: collection_name.to_owned(),
        };
        self.run_ddl_statistics("GetCollectionStatistics", task)
            .await
    }

    pub async fn get_partition_statistics(
        &self,
        collection_name: &str,
        partition_name: &str,
    ) -> Result<Statistics, ProxyError> {
        let task = DdlTask::GetPartitionStatistics {
            collection_name: collection_name.to_owned(),
            partition_name: partition_name.to_owned(),
        };
        self.run_ddl_statistics("GetPartitionStatistics", task)
            .await
    }

    /// Seals the growing segments of each collection, returning the sealed
    /// segment ids per collection.
    pub async fn flush(
        &self,
        collection_names: Vec<String>,
    ) -> Result<BTreeMap<String, Vec<SegmentId>>, ProxyError> {
        match self
            .run_ddl("Flush", DdlTask::Flush { collection_names })
            .await?
        {
            DdlOutput::Flushed(segments) => Ok(segments),
            other => Err(unexpected_output("Flush", other)),
        }
    }

    pub async fn create_alias(&self, alias: &str, collection_name: &str) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "CreateAlias",
            DdlTask::CreateAlias {
                alias: alias.to_owned(),
                collection_name: collection_name.to_owned(),
            },
        )
        .await
    }

    pub async fn drop_alias(&self, alias: &str) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "DropAlias",
            DdlTask::DropAlias {
                alias: alias.to_owned(),
            },
        )
        .await
    }

    pub async fn alter_alias(&self, alias: &str, collection_name: &str) -> Result<(), ProxyError> {
        self.run_ddl_done(
            "AlterAlias",
            DdlTask::AlterAlias {
                alias: alias.to_owned(),
                collection_name: collection_name.to_owned(),
            },
        )
        .await
    }
}
