// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Searches and queries.
//!
//! A read's end timestamp is the larger of its begin timestamp and the
//! guarantee timestamp the caller supplied. From those and the read's
//! consistency level the task derives its [`ReadPoint`]:
//!
//! * the guarantee timestamp workers must have consumed up to: for
//!   `Strong` the end timestamp; otherwise the supplied guarantee if any,
//!   else `Bounded` lags the begin timestamp by the configured staleness,
//!   `Eventually` uses the minimum timestamp, and `Session` and
//!   `Customized` use the end timestamp;
//! * the snapshot the read observes: the time-travel timestamp if
//!   supplied, which may not exceed the end timestamp, else the end
//!   timestamp.
//!
//! The guarantee never exceeds the snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;
use vdb_dyncfg::ConfigSet;
use vdb_ore::cast::{CastFrom, CastLossy};
use vdb_timestamp_oracle::Timestamp;

use crate::config;
use crate::error::ProxyError;
use crate::merge::{merge_retrieve_results, reduce_search_results};
use crate::rate::{RateType, Throughput};
use crate::scheduler::{TaskQueue, TaskScheduler};
use crate::task::ddl::validate_name;
use crate::task::{QueuedTask, TaskContext, TaskEnv, TaskKind, TaskStamp};
use crate::types::{
    CollectionInfo, ConsistencyLevel, DataType, PartitionId, QueryRequest, ReadPoint,
    RetrieveResults, SearchRequest, SearchResultData, ShardId, ShardQueryRequest,
    ShardSearchRequest,
};

/// A data query.
#[derive(Clone, Debug)]
pub enum DqlTask {
    Search(SearchRequest),
    Query(QueryRequest),
}

/// The merged result of a search.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResults {
    pub collection_name: String,
    pub data: SearchResultData,
    /// Shards left out of the merge because none of their replicas
    /// answered.
    pub unanswered_shards: Vec<ShardId>,
}

/// The merged result of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResults {
    pub collection_name: String,
    pub data: RetrieveResults,
    /// Shards left out of the merge because none of their replicas
    /// answered.
    pub unanswered_shards: Vec<ShardId>,
}

/// The result of a [`DqlTask`].
#[derive(Clone, Debug, PartialEq)]
pub enum DqlOutput {
    Search(SearchResults),
    Query(QueryResults),
}

/// Derives the read point of a read stamped with `stamp`.
pub fn resolve_read_point(
    level: ConsistencyLevel,
    guarantee_ts: Option<Timestamp>,
    travel_ts: Option<Timestamp>,
    stamp: &TaskStamp,
    staleness: Duration,
) -> ReadPoint {
    let guarantee = match (level, guarantee_ts) {
        (ConsistencyLevel::Strong, _) => stamp.end_ts,
        (_, Some(supplied)) => supplied,
        (ConsistencyLevel::Bounded, None) => {
            let millis = u64::try_from(staleness.as_millis()).unwrap_or(u64::MAX);
            stamp.begin_ts.saturating_sub_millis(millis)
        }
        (ConsistencyLevel::Eventually, None) => Timestamp::from(1),
        (ConsistencyLevel::Session | ConsistencyLevel::Customized, None) => stamp.end_ts,
    };
    let snapshot = travel_ts.unwrap_or(stamp.end_ts);
    ReadPoint {
        guarantee_ts: guarantee.min(snapshot),
        snapshot_ts: snapshot,
    }
}

fn check_output_fields(info: &CollectionInfo, output_fields: &[String]) -> Result<(), ProxyError> {
    match output_fields
        .iter()
        .find(|name| info.schema.field(name).is_none())
    {
        Some(name) => Err(ProxyError::InvalidRequest(format!(
            "collection {} has no field {name}",
            info.name
        ))),
        None => Ok(()),
    }
}

async fn resolve_partitions(
    env: &TaskEnv,
    collection: &str,
    names: &[String],
    ts: Timestamp,
) -> Result<Vec<PartitionId>, ProxyError> {
    let mut ids = Vec::with_capacity(names.len());
    for name in names {
        ids.push(env.meta_cache.partition_id(collection, name, ts).await?);
    }
    Ok(ids)
}

impl DqlTask {
    fn requested_ts(&self) -> (Option<Timestamp>, Option<Timestamp>) {
        match self {
            DqlTask::Search(req) => (req.guarantee_ts, req.travel_ts),
            DqlTask::Query(req) => (req.guarantee_ts, req.travel_ts),
        }
    }

    fn record_result(env: &TaskEnv, query_type: &str, size: usize) {
        env.collector
            .add(Throughput::ReadResultBytes, u64::cast_from(size));
        env.metrics
            .read_result_bytes
            .with_label_values(&[query_type])
            .inc_by(u64::cast_from(size));
        env.metrics
            .read_result_size_bytes
            .with_label_values(&[query_type])
            .observe(f64::cast_lossy(size));
    }

    async fn search(
        req: SearchRequest,
        env: &TaskEnv,
        stamp: &TaskStamp,
    ) -> Result<SearchResults, ProxyError> {
        let ts = stamp.begin_ts;
        let info = env.meta_cache.collection(&req.collection_name, ts).await?;
        match info.schema.field(&req.anns_field).map(|f| f.data_type) {
            Some(DataType::FloatVector { dim })
                if req.vectors.len() == dim * usize::cast_from(req.nq) => {}
            Some(DataType::FloatVector { dim }) => {
                return Err(ProxyError::InvalidRequest(format!(
                    "expected {} query vectors of dimension {dim}",
                    req.nq
                )))
            }
            _ => {
                return Err(ProxyError::InvalidRequest(format!(
                    "{} is not a vector field of {}",
                    req.anns_field, req.collection_name
                )))
            }
        }
        check_output_fields(&info, &req.output_fields)?;
        let partition_ids =
            resolve_partitions(env, &req.collection_name, &req.partition_names, ts).await?;
        let level = req.consistency_level.unwrap_or(info.consistency_level);
        let read_point = resolve_read_point(
            level,
            req.guarantee_ts,
            req.travel_ts,
            stamp,
            config::BOUNDED_STALENESS.get(&env.configs),
        );
        debug!(collection = %info.id, ?level, ?read_point, nq = req.nq, "dispatching search");

        let started = Instant::now();
        let outcome = env
            .shards
            .dispatch(info.id, "search", |node, shard| {
                let shard_req = ShardSearchRequest {
                    collection_id: info.id,
                    shard,
                    partition_ids: partition_ids.clone(),
                    anns_field: req.anns_field.clone(),
                    vectors: req.vectors.clone(),
                    nq: req.nq,
                    topk: req.topk + req.offset,
                    metric_type: req.metric_type,
                    output_fields: req.output_fields.clone(),
                    read_point,
                };
                async move { env.backends.workers.search(node, shard_req).await }
            })
            .await?;
        env.metrics
            .sq_wait_result_latency_seconds
            .with_label_values(&["search"])
            .observe(started.elapsed().as_secs_f64());

        let started = Instant::now();
        let partials: Vec<_> = outcome.partials.into_iter().map(|(_, p)| p).collect();
        let data = reduce_search_results(&partials, req.nq, req.topk, req.offset, req.metric_type)?;
        env.metrics
            .sq_reduce_result_latency_seconds
            .with_label_values(&["search"])
            .observe(started.elapsed().as_secs_f64());

        Self::record_result(env, "search", data.encoded_size());
        env.metrics.search_vectors.inc_by(u64::from(req.nq));
        Ok(SearchResults {
            collection_name: req.collection_name,
            data,
            unanswered_shards: outcome.unanswered,
        })
    }

    async fn query(
        req: QueryRequest,
        env: &TaskEnv,
        stamp: &TaskStamp,
    ) -> Result<QueryResults, ProxyError> {
        let ts = stamp.begin_ts;
        let info = env.meta_cache.collection(&req.collection_name, ts).await?;
        check_output_fields(&info, &req.output_fields)?;
        let partition_ids =
            resolve_partitions(env, &req.collection_name, &req.partition_names, ts).await?;
        let level = req.consistency_level.unwrap_or(info.consistency_level);
        let read_point = resolve_read_point(
            level,
            req.guarantee_ts,
            req.travel_ts,
            stamp,
            config::BOUNDED_STALENESS.get(&env.configs),
        );
        debug!(
            collection = %info.id,
            ?level,
            ?read_point,
            keys = req.primary_keys.len(),
            "dispatching query"
        );

        let started = Instant::now();
        let outcome = env
            .shards
            .dispatch(info.id, "query", |node, shard| {
                let shard_req = ShardQueryRequest {
                    collection_id: info.id,
                    shard,
                    partition_ids: partition_ids.clone(),
                    primary_keys: req.primary_keys.clone(),
                    output_fields: req.output_fields.clone(),
                    read_point,
                };
                async move { env.backends.workers.query(node, shard_req).await }
            })
            .await?;
        env.metrics
            .sq_wait_result_latency_seconds
            .with_label_values(&["query"])
            .observe(started.elapsed().as_secs_f64());

        let started = Instant::now();
        let partials: Vec<_> = outcome.partials.into_iter().map(|(_, p)| p).collect();
        let data = merge_retrieve_results(&partials, req.limit)?;
        env.metrics
            .sq_reduce_result_latency_seconds
            .with_label_values(&["query"])
            .observe(started.elapsed().as_secs_f64());

        Self::record_result(env, "query", data.encoded_size());
        Ok(QueryResults {
            collection_name: req.collection_name,
            data,
            unanswered_shards: outcome.unanswered,
        })
    }
}

#[async_trait]
impl QueuedTask for DqlTask {
    type Output = DqlOutput;
    const KIND: TaskKind = TaskKind::Dql;

    fn name(&self) -> &'static str {
        match self {
            DqlTask::Search(_) => "Search",
            DqlTask::Query(_) => "Query",
        }
    }

    fn validate(&self, configs: &ConfigSet) -> Result<(), ProxyError> {
        match self {
            DqlTask::Search(req) => {
                validate_name("collection", &req.collection_name)?;
                if req.nq == 0 {
                    return Err(ProxyError::InvalidRequest("nq must be positive".into()));
                }
                let max_topk = config::MAX_TOPK.get(configs);
                if req.topk == 0 || req.topk.saturating_add(req.offset) > max_topk {
                    return Err(ProxyError::InvalidRequest(format!(
                        "topk {} with offset {} must be in (0, {max_topk}]",
                        req.topk, req.offset
                    )));
                }
                Ok(())
            }
            DqlTask::Query(req) => {
                validate_name("collection", &req.collection_name)?;
                if req.primary_keys.is_empty() && req.limit.is_none() {
                    return Err(ProxyError::InvalidRequest(
                        "query needs primary keys or a limit".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn admission(&self) -> Option<(RateType, f64)> {
        match self {
            DqlTask::Search(req) => Some((RateType::DqlSearch, f64::from(req.nq))),
            DqlTask::Query(_) => Some((RateType::DqlQuery, 1.0)),
        }
    }

    fn assign_timestamps(&mut self, begin_ts: Timestamp) -> Result<Timestamp, ProxyError> {
        let (guarantee_ts, travel_ts) = self.requested_ts();
        let end_ts = guarantee_ts.map_or(begin_ts, |g| g.max(begin_ts));
        if let Some(travel_ts) = travel_ts {
            if travel_ts > end_ts {
                return Err(ProxyError::InvalidRequest(format!(
                    "travel timestamp {travel_ts} is after the read's end timestamp {end_ts}"
                )));
            }
        }
        Ok(end_ts)
    }

    async fn execute(
        self,
        env: &TaskEnv,
        stamp: &TaskStamp,
        _ctx: &TaskContext,
    ) -> Result<DqlOutput, ProxyError> {
        match self {
            DqlTask::Search(req) => Ok(DqlOutput::Search(Self::search(req, env, stamp).await?)),
            DqlTask::Query(req) => Ok(DqlOutput::Query(Self::query(req, env, stamp).await?)),
        }
    }

    fn queue(scheduler: &TaskScheduler) -> &Arc<TaskQueue<Self>> {
        scheduler.dql_queue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;
    use crate::types::{MetricType, PrimaryKeys};

    fn stamp(begin: u64, end: u64) -> TaskStamp {
        TaskStamp {
            id: TaskId(1),
            kind: TaskKind::Dql,
            begin_ts: Timestamp::from(begin),
            end_ts: Timestamp::from(end),
        }
    }

    fn search(guarantee_ts: Option<u64>, travel_ts: Option<u64>) -> DqlTask {
        DqlTask::Search(SearchRequest {
            collection_name: "books".into(),
            partition_names: Vec::new(),
            anns_field: "v".into(),
            vectors: vec![0.0; 4],
            nq: 2,
            topk: 10,
            offset: 0,
            metric_type: MetricType::L2,
            output_fields: Vec::new(),
            consistency_level: None,
            guarantee_ts: guarantee_ts.map(Timestamp::from),
            travel_ts: travel_ts.map(Timestamp::from),
        })
    }

    #[test]
    fn end_timestamp_precedence() {
        let begin = Timestamp::compose(1_000, 0);
        let later = Timestamp::compose(2_000, 0);
        assert_eq!(search(None, None).assign_timestamps(begin).unwrap(), begin);
        assert_eq!(
            search(Some(later.as_u64()), None)
                .assign_timestamps(begin)
                .unwrap(),
            later
        );
        assert_eq!(
            search(Some(5), Some(begin.as_u64()))
                .assign_timestamps(begin)
                .unwrap(),
            begin
        );
        assert!(matches!(
            search(None, Some(later.as_u64())).assign_timestamps(begin),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn read_points() {
        let begin = Timestamp::compose(10_000, 0);
        let read = TaskStamp {
            begin_ts: begin,
            end_ts: begin,
            ..stamp(0, 0)
        };
        let staleness = Duration::from_secs(5);
        let point = |level, guarantee, travel| {
            resolve_read_point(level, guarantee, travel, &read, staleness)
        };

        let strong = point(ConsistencyLevel::Strong, Some(Timestamp::from(3)), None);
        assert_eq!(strong.guarantee_ts, begin);
        assert_eq!(strong.snapshot_ts, begin);

        let bounded = point(ConsistencyLevel::Bounded, None, None);
        assert_eq!(bounded.guarantee_ts, Timestamp::compose(5_000, 0));

        let eventually = point(ConsistencyLevel::Eventually, None, None);
        assert_eq!(eventually.guarantee_ts, Timestamp::from(1));

        let session = point(ConsistencyLevel::Session, Some(Timestamp::from(42)), None);
        assert_eq!(session.guarantee_ts, Timestamp::from(42));

        let travel = Timestamp::compose(1_000, 0);
        let traveled = point(ConsistencyLevel::Strong, None, Some(travel));
        assert_eq!(traveled.snapshot_ts, travel);
        assert_eq!(traveled.guarantee_ts, travel);

        let explicit = resolve_read_point(
            ConsistencyLevel::Customized,
            None,
            None,
            &stamp(7, 9),
            staleness,
        );
        assert_eq!(explicit.guarantee_ts, Timestamp::from(9));
    }

    #[test]
    fn validation() {
        let configs = config::all_dyncfgs(ConfigSet::default());
        search(None, None).validate(&configs).expect("valid");
        let DqlTask::Search(mut req) = search(None, None) else {
            unreachable!()
        };
        req.topk = 0;
        assert!(DqlTask::Search(req.clone()).validate(&configs).is_err());
        req.topk = 10;
        req.offset = config::MAX_TOPK.get(&configs);
        assert!(DqlTask::Search(req.clone()).validate(&configs).is_err());
        req.offset = 0;
        req.nq = 0;
        assert!(DqlTask::Search(req).validate(&configs).is_err());

        let query = DqlTask::Query(QueryRequest {
            collection_name: "books".into(),
            partition_names: Vec::new(),
            primary_keys: PrimaryKeys::Int64(Vec::new()),
            output_fields: Vec::new(),
            limit: None,
            consistency_level: None,
            guarantee_ts: None,
            travel_ts: None,
        });
        assert!(query.validate(&configs).is_err());
        assert_eq!(query.admission(), Some((RateType::DqlQuery, 1.0)));
        assert_eq!(
            search(None, None).admission(),
            Some((RateType::DqlSearch, 2.0))
        );
    }
}
