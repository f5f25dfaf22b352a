// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Handlers of data mutations.
//!
//! A mutation rejected before it is queued fails the call. Once queued, a
//! failure is reported in the [`MutationResult`] instead, with every row
//! listed in `err_index`.

use std::time::Instant;

use tracing::{info, warn};
use vdb_ore::cast::CastFrom;

use crate::error::ProxyError;
use crate::proxy::Proxy;
use crate::rate::Throughput;
use crate::task::DmlTask;
use crate::types::{DeleteRequest, InsertRequest, MutationResult};

impl Proxy {
    /// Inserts a batch of rows.
    pub async fn insert(&self, req: InsertRequest) -> Result<MutationResult, ProxyError> {
        info!(
            collection = %req.collection_name,
            partition = %req.partition_name,
            rows = req.num_rows,
            "insert received",
        );
        self.mutate("Insert", Throughput::InsertBytes, DmlTask::Insert(req))
            .await
    }

    /// Deletes rows by primary key.
    pub async fn delete(&self, req: DeleteRequest) -> Result<MutationResult, ProxyError> {
        info!(
            collection = %req.collection_name,
            partition = %req.partition_name,
            keys = req.primary_keys.len(),
            "delete received",
        );
        self.mutate("Delete", Throughput::DeleteBytes, DmlTask::Delete(req))
            .await
    }

    async fn mutate(
        &self,
        method: &'static str,
        throughput: Throughput,
        task: DmlTask,
    ) -> Result<MutationResult, ProxyError> {
        let started = Instant::now();
        let size = u64::cast_from(task.encoded_size());
        let num_rows = task.num_rows();
        let is_insert = matches!(task, DmlTask::Insert(_));
        let handle = self.enqueue(method, task).await?;

        // Rejected mutations never count towards ingress.
        self.collector.add(throughput, size);
        self.metrics
            .received_bytes
            .with_label_values(&[method])
            .inc_by(size);

        match self.wait(method, started, handle).await {
            Ok(result) => {
                self.metrics
                    .mutation_latency_seconds
                    .with_label_values(&[method])
                    .observe(started.elapsed().as_secs_f64());
                Ok(result)
            }
            Err(e) => {
                warn!(method, rows = num_rows, error = %e, "mutation failed");
                let reason = e.to_string();
                Ok(if is_insert {
                    MutationResult::failed_insert(num_rows, reason)
                } else {
                    MutationResult::failed_delete(num_rows, reason)
                })
            }
        }
    }
}
