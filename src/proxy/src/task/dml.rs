// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Inserts and deletes.
//!
//! Every row of a mutation commits at the task's begin timestamp. Rows are
//! routed to channels by the hash of their primary key, so a delete lands
//! on the channel its insert did.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use vdb_dyncfg::ConfigSet;
use vdb_ore::cast::{CastFrom, CastLossy};

use crate::backend::{DeleteMessage, InsertMessage, StreamMessage};
use crate::channels::CollectionChannels;
use crate::config;
use crate::error::ProxyError;
use crate::rate::RateType;
use crate::scheduler::{TaskQueue, TaskScheduler};
use crate::task::ddl::validate_name;
use crate::task::{QueuedTask, TaskContext, TaskEnv, TaskKind, TaskStamp};
use crate::types::{
    CollectionSchema, ColumnData, DataType, DeleteRequest, FieldColumn, InsertRequest,
    MutationResult, PrimaryKeys,
};

/// A data mutation.
#[derive(Clone, Debug)]
pub enum DmlTask {
    Insert(InsertRequest),
    Delete(DeleteRequest),
}

impl DmlTask {
    /// Rows (or keys) in the request.
    pub fn num_rows(&self) -> u32 {
        match self {
            DmlTask::Insert(req) => req.num_rows,
            DmlTask::Delete(req) => u32::try_from(req.primary_keys.len()).unwrap_or(u32::MAX),
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            DmlTask::Insert(req) => req.encoded_size(),
            DmlTask::Delete(req) => req.encoded_size(),
        }
    }
}

/// The keys at `rows`, in that order.
fn take_keys(keys: &PrimaryKeys, rows: &[usize]) -> PrimaryKeys {
    match keys {
        PrimaryKeys::Int64(v) => PrimaryKeys::Int64(rows.iter().map(|r| v[*r]).collect()),
        PrimaryKeys::VarChar(v) => {
            PrimaryKeys::VarChar(rows.iter().map(|r| v[*r].clone()).collect())
        }
    }
}

/// Groups row indexes by the channel their key routes to.
fn route_rows(channels: &CollectionChannels, keys: &PrimaryKeys) -> Vec<(usize, Vec<usize>)> {
    let mut rows = vec![Vec::new(); channels.len()];
    for (row, key) in keys.iter().enumerate() {
        rows[channels.route(&key)].push(row);
    }
    rows.into_iter()
        .enumerate()
        .filter(|(_, rows)| !rows.is_empty())
        .collect()
}

/// Checks the columns of an insert against the collection's schema and
/// returns its primary keys, unless they are to be assigned.
fn check_insert_columns(
    schema: &CollectionSchema,
    req: &InsertRequest,
) -> Result<Option<PrimaryKeys>, ProxyError> {
    for column in &req.fields {
        if schema.field(&column.field_name).is_none() {
            return Err(ProxyError::InvalidRequest(format!(
                "collection {} has no field {}",
                schema.name, column.field_name
            )));
        }
    }
    let mut keys = None;
    for field in &schema.fields {
        let column = req.fields.iter().find(|c| c.field_name == field.name);
        match column {
            Some(_) if field.is_primary_key && field.auto_id => {
                return Err(ProxyError::InvalidRequest(format!(
                    "primary key {} is assigned automatically",
                    field.name
                )))
            }
            Some(column) if !column.data.matches(field.data_type) => {
                return Err(ProxyError::InvalidRequest(format!(
                    "field {} expects {:?}",
                    field.name, field.data_type
                )))
            }
            Some(column) if field.is_primary_key => {
                keys = match &column.data {
                    ColumnData::Int64(v) => Some(PrimaryKeys::Int64(v.clone())),
                    ColumnData::VarChar(v) => Some(PrimaryKeys::VarChar(v.clone())),
                    _ => None,
                };
            }
            Some(_) => {}
            None if field.is_primary_key && field.auto_id => {}
            None => {
                return Err(ProxyError::InvalidRequest(format!(
                    "missing field {}",
                    field.name
                )))
            }
        }
    }
    Ok(keys)
}

#[async_trait]
impl QueuedTask for DmlTask {
    type Output = MutationResult;
    const KIND: TaskKind = TaskKind::Dml;

    fn name(&self) -> &'static str {
        match self {
            DmlTask::Insert(_) => "Insert",
            DmlTask::Delete(_) => "Delete",
        }
    }

    fn validate(&self, configs: &ConfigSet) -> Result<(), ProxyError> {
        match self {
            DmlTask::Insert(req) => {
                validate_name("collection", &req.collection_name)?;
                if req.num_rows == 0 {
                    return Err(ProxyError::InvalidRequest("insert has no rows".into()));
                }
                let num_rows = usize::cast_from(req.num_rows);
                if let Some(column) = req.fields.iter().find(|c| c.data.num_rows() != num_rows) {
                    return Err(ProxyError::InvalidRequest(format!(
                        "field {} has {} rows, expected {}",
                        column.field_name,
                        column.data.num_rows(),
                        req.num_rows
                    )));
                }
                let max_size = config::MAX_INSERT_SIZE.get(configs);
                if req.encoded_size() > max_size {
                    return Err(ProxyError::InvalidRequest(format!(
                        "insert of {} bytes exceeds the limit of {max_size}",
                        req.encoded_size()
                    )));
                }
                Ok(())
            }
            DmlTask::Delete(req) => {
                validate_name("collection", &req.collection_name)?;
                if req.primary_keys.is_empty() {
                    return Err(ProxyError::InvalidRequest("delete names no keys".into()));
                }
                Ok(())
            }
        }
    }

    fn admission(&self) -> Option<(RateType, f64)> {
        let rate_type = match self {
            DmlTask::Insert(_) => RateType::DmlInsert,
            DmlTask::Delete(_) => RateType::DmlDelete,
        };
        Some((rate_type, f64::cast_lossy(self.encoded_size())))
    }

    async fn execute(
        self,
        env: &TaskEnv,
        stamp: &TaskStamp,
        _ctx: &TaskContext,
    ) -> Result<MutationResult, ProxyError> {
        let ts = stamp.begin_ts;
        match self {
            DmlTask::Insert(req) => {
                let info = env.meta_cache.collection(&req.collection_name, ts).await?;
                let provided_keys = check_insert_columns(&info.schema, &req)?;
                let partition_name = if req.partition_name.is_empty() {
                    env.default_partition_name.as_str()
                } else {
                    req.partition_name.as_str()
                };
                let partition_id = env
                    .meta_cache
                    .partition_id(&req.collection_name, partition_name, ts)
                    .await?;

                let row_ids: Vec<i64> = env
                    .backends
                    .ids
                    .alloc_id_range(req.num_rows)
                    .await?
                    .collect();
                let keys = match provided_keys {
                    Some(keys) => keys,
                    None => PrimaryKeys::Int64(row_ids.clone()),
                };

                let channels = env.channels.ensure_channels(&info).await?;
                let batches = route_rows(&channels, &keys)
                    .into_iter()
                    .map(|(idx, rows)| {
                        let message = InsertMessage {
                            collection_id: info.id,
                            partition_id,
                            timestamp: ts,
                            row_ids: rows.iter().map(|r| row_ids[*r]).collect(),
                            primary_keys: take_keys(&keys, &rows),
                            fields: req
                                .fields
                                .iter()
                                .map(|f| FieldColumn {
                                    field_name: f.field_name.clone(),
                                    data: f.data.take(&rows),
                                })
                                .collect(),
                        };
                        (idx, vec![StreamMessage::Insert(message)])
                    })
                    .collect::<Vec<_>>();
                debug!(
                    collection = %info.id,
                    rows = req.num_rows,
                    channels = batches.len(),
                    %ts,
                    "publishing insert",
                );
                env.channels.publish(&channels, batches).await?;
                env.metrics.insert_vectors.inc_by(u64::from(req.num_rows));

                Ok(MutationResult {
                    ids: keys,
                    insert_cnt: u64::from(req.num_rows),
                    timestamp: ts,
                    ..Default::default()
                })
            }
            DmlTask::Delete(req) => {
                let info = env.meta_cache.collection(&req.collection_name, ts).await?;
                let key_type = info.schema.primary_key().map(|f| f.data_type);
                match (&req.primary_keys, key_type) {
                    (PrimaryKeys::Int64(_), Some(DataType::Int64))
                    | (PrimaryKeys::VarChar(_), Some(DataType::VarChar)) => {}
                    _ => {
                        return Err(ProxyError::InvalidRequest(format!(
                            "keys do not match the primary key of {}",
                            req.collection_name
                        )))
                    }
                }
                let partition_id = if req.partition_name.is_empty() {
                    None
                } else {
                    Some(
                        env.meta_cache
                            .partition_id(&req.collection_name, &req.partition_name, ts)
                            .await?,
                    )
                };

                let channels = env.channels.ensure_channels(&info).await?;
                let batches = route_rows(&channels, &req.primary_keys)
                    .into_iter()
                    .map(|(idx, rows)| {
                        let message = DeleteMessage {
                            collection_id: info.id,
                            partition_id,
                            timestamp: ts,
                            primary_keys: take_keys(&req.primary_keys, &rows),
                        };
                        (idx, vec![StreamMessage::Delete(message)])
                    })
                    .collect::<Vec<_>>();
                env.channels.publish(&channels, batches).await?;

                Ok(MutationResult {
                    delete_cnt: u64::cast_from(req.primary_keys.len()),
                    ids: req.primary_keys,
                    timestamp: ts,
                    ..Default::default()
                })
            }
        }
    }

    fn queue(scheduler: &TaskScheduler) -> &Arc<TaskQueue<Self>> {
        scheduler.dml_queue()
    }
}
