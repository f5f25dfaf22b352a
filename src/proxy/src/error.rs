// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors returned by the front-end.
//!
//! Each seam has its own error type: [`BackendError`] for calls to the
//! coordinators, workers and message stream, [`MergeError`] for combining
//! shard results, and [`vdb_timestamp_oracle::OracleError`] for the clock.
//! Everything a handler can surface to its caller is a [`ProxyError`].

use std::time::Duration;

use thiserror::Error;
use vdb_timestamp_oracle::OracleError;

use crate::rate::RateType;
use crate::types::{CollectionId, NodeId, ShardId, StateCode};

/// Errors from a backend coordinator, worker node or the message stream.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("{service} unreachable: {reason}")]
    Unreachable {
        /// Which backend.
        service: &'static str,
        /// Transport failure detail.
        reason: String,
    },
    /// The backend processed the request and rejected it.
    #[error("{service} rejected request: {reason}")]
    Rejected {
        /// Which backend.
        service: &'static str,
        /// The backend's reason.
        reason: String,
    },
    /// A worker does not serve the requested shard.
    #[error("node {node} does not serve shard {shard}")]
    NotServing {
        /// The worker.
        node: NodeId,
        /// The shard.
        shard: ShardId,
    },
    /// The named message channel does not exist.
    #[error("channel does not exist: {0}")]
    ChannelMissing(String),
}

impl BackendError {
    /// Shorthand for [`BackendError::Rejected`].
    pub fn rejected(service: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Rejected {
            service,
            reason: reason.into(),
        }
    }

    /// Shorthand for [`BackendError::Unreachable`].
    pub fn unreachable(service: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unreachable {
            service,
            reason: reason.into(),
        }
    }
}

/// Errors arising while merging shard results.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Partial results disagree on the number of queries.
    #[error("shard results disagree on nq: expected {expected}, got {got}")]
    NqMismatch {
        /// The request's nq.
        expected: u32,
        /// What a shard returned.
        got: u32,
    },
    /// A partial result's columns are inconsistent with its ids.
    #[error("malformed shard result: {0}")]
    Malformed(String),
}

/// Every error a handler can return.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The front-end is not in a state to serve.
    #[error("proxy is not healthy: {0}")]
    Unhealthy(StateCode),
    /// The rate budget of the operation class is exhausted. The caller
    /// should back off and retry.
    #[error("rate limit exceeded for {0}")]
    AdmissionDenied(RateType),
    /// The scheduler refused the task.
    #[error("failed to enqueue task: {0}")]
    EnqueueFailed(String),
    /// The task was accepted but failed while executing.
    #[error("task execution failed: {0}")]
    ExecutionFailed(String),
    /// No shard of a query answered.
    #[error("all {shards} shards failed: {last_error}")]
    AllShardsFailed {
        /// Number of shards queried.
        shards: usize,
        /// The error of the last failing shard.
        last_error: BackendError,
    },
    /// A shard could not be served while partial results are disallowed.
    #[error("no replica of shard {0} is reachable")]
    ShardUnavailable(ShardId),
    /// The caller gave up waiting.
    #[error("request canceled")]
    Canceled,
    /// The task did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    TimedOut(Duration),
    /// The named collection does not exist.
    #[error("collection not found: {0}")]
    CollectionMissing(String),
    /// The named partition does not exist.
    #[error("partition not found: {0}")]
    PartitionMissing(String),
    /// The collection's channels were torn down while a mutation was in
    /// flight.
    #[error("channels of collection {0} were removed")]
    ChannelsRemoved(CollectionId),
    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// Shard results could not be merged.
    #[error(transparent)]
    Merge(#[from] MergeError),
    /// The clock or id allocator failed.
    #[error(transparent)]
    Oracle(#[from] OracleError),
}

impl ProxyError {
    /// A stable, low cardinality label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ProxyError::Unhealthy(_) => "unhealthy",
            ProxyError::AdmissionDenied(_) => "admission_denied",
            ProxyError::EnqueueFailed(_) => "enqueue_failed",
            ProxyError::ExecutionFailed(_) => "execution_failed",
            ProxyError::AllShardsFailed { .. } => "all_shards_failed",
            ProxyError::ShardUnavailable(_) => "shard_unavailable",
            ProxyError::Canceled => "canceled",
            ProxyError::TimedOut(_) => "timed_out",
            ProxyError::CollectionMissing(_) => "collection_missing",
            ProxyError::PartitionMissing(_) => "partition_missing",
            ProxyError::ChannelsRemoved(_) => "channels_removed",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::Backend(_) => "backend",
            ProxyError::Merge(_) => "merge",
            ProxyError::Oracle(_) => "oracle",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::AdmissionDenied(_)
                | ProxyError::Unhealthy(_)
                | ProxyError::TimedOut(_)
                | ProxyError::AllShardsFailed { .. }
                | ProxyError::ShardUnavailable(_)
                | ProxyError::Backend(BackendError::Unreachable { .. })
        )
    }

    /// Folds an error raised while executing an accepted task into the
    /// failure it is reported as.
    ///
    /// Request-shaped errors keep their identity; backend and clock errors
    /// become [`ProxyError::ExecutionFailed`].
    pub(crate) fn into_execution_failure(self) -> ProxyError {
        match self {
            ProxyError::Backend(e) => ProxyError::ExecutionFailed(e.to_string()),
            ProxyError::Oracle(e) => ProxyError::ExecutionFailed(e.to_string()),
            ProxyError::Merge(e) => ProxyError::ExecutionFailed(e.to_string()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_failures() {
        let err = ProxyError::from(BackendError::rejected("storage", "disk full"));
        assert_eq!(err.label(), "backend");
        let err = err.into_execution_failure();
        assert_eq!(err.label(), "execution_failed");
        assert_eq!(
            err.to_string(),
            "task execution failed: storage rejected request: disk full"
        );

        let err = ProxyError::CollectionMissing("c".into()).into_execution_failure();
        assert_eq!(err.label(), "collection_missing");
    }

    #[test]
    fn retryable() {
        assert!(ProxyError::AdmissionDenied(RateType::DqlSearch).is_retryable());
        assert!(!ProxyError::InvalidRequest("topk".into()).is_retryable());
    }
}
