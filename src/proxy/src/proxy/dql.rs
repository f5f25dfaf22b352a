// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Handlers of searches and queries.

use std::time::Instant;

use tracing::info;

use crate::error::ProxyError;
use crate::proxy::{unexpected_output, Proxy};
use crate::rate::Throughput;
use crate::task::{DqlOutput, DqlTask, QueryResults, SearchResults};
use crate::types::{QueryRequest, SearchRequest};

impl Proxy {
    /// Searches for the nearest neighbors of each query vector.
    pub async fn search(&self, req: SearchRequest) -> Result<SearchResults, ProxyError> {
        info!(
            collection = %req.collection_name,
            nq = req.nq,
            topk = req.topk,
            "search received",
        );
        let started = Instant::now();
        self.collector
            .add(Throughput::SearchVectors, u64::from(req.nq));
        match self.run_task("Search", DqlTask::Search(req)).await? {
            DqlOutput::Search(results) => {
                self.record_read_latency("search", started);
                Ok(results)
            }
            other => Err(unexpected_output("Search", other)),
        }
    }

    /// Retrieves rows by primary key.
    pub async fn query(&self, req: QueryRequest) -> Result<QueryResults, ProxyError> {
        info!(
            collection = %req.collection_name,
            keys = req.primary_keys.len(),
            limit = ?req.limit,
            "query received",
        );
        let started = Instant::now();
        self.collector.add(Throughput::QueryRequests, 1);
        match self.run_task("Query", DqlTask::Query(req)).await? {
            DqlOutput::Query(results) => {
                self.record_read_latency("query", started);
                Ok(results)
            }
            other => Err(unexpected_output("Query", other)),
        }
    }

    fn record_read_latency(&self, query_type: &str, started: Instant) {
        self.metrics
            .sq_latency_seconds
            .with_label_values(&[query_type])
            .observe(started.elapsed().as_secs_f64());
    }
}
