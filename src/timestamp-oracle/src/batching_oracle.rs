// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A timestamp oracle that wraps another [`TimestampOracle`] and batches
//! single timestamp requests to it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use vdb_ore::cast::CastFrom;

use crate::metrics::Metrics;
use crate::{OracleError, Timestamp, TimestampOracle};

/// A batching [`TimestampOracle`].
///
/// Concurrent `alloc_timestamp` calls that arrive while a request to the
/// inner oracle is in flight are coalesced into a single
/// `alloc_timestamps(n)` call, and the returned block is handed out in the
/// order the calls arrived. Every caller still gets a timestamp allocated
/// during its own call, so the sequence stays strictly increasing.
///
/// Block requests are passed straight through to the inner oracle.
pub struct BatchingTimestampOracle {
    inner: Arc<dyn TimestampOracle>,
    command_tx: UnboundedSender<Command>,
}

/// A command on the internal batching command stream.
enum Command {
    AllocTimestamp(oneshot::Sender<Result<Timestamp, OracleError>>),
}

impl std::fmt::Debug for BatchingTimestampOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingTimestampOracle")
            .field("inner", &self.inner)
            .finish()
    }
}

impl BatchingTimestampOracle {
    /// Creates a [`BatchingTimestampOracle`] that uses the given inner oracle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(metrics: Arc<Metrics>, oracle: Arc<dyn TimestampOracle>) -> Self {
        let (command_tx, mut command_rx) = tokio::sync::mpsc::unbounded_channel();

        let task_oracle = Arc::clone(&oracle);

        vdb_ore::task::spawn(|| "BatchingTimestampOracle Worker Task", async move {
            let batch_metrics = &metrics.batching.alloc_timestamp;

            while let Some(cmd) = command_rx.recv().await {
                let mut pending_cmds = vec![cmd];
                while let Ok(cmd) = command_rx.try_recv() {
                    pending_cmds.push(cmd);
                }

                batch_metrics
                    .ops_count
                    .inc_by(u64::cast_from(pending_cmds.len()));
                batch_metrics.batches_count.inc();

                let count = u32::try_from(pending_cmds.len()).unwrap_or(u32::MAX);
                let res = task_oracle.alloc_timestamps(count).await;
                let mut next = res.clone();
                for cmd in pending_cmds {
                    match cmd {
                        Command::AllocTimestamp(response_tx) => {
                            // It's okay if the receiver drops, just means
                            // they're not interested anymore.
                            let _ = response_tx.send(next.clone());
                        }
                    }
                    next = next.and_then(|ts| ts.step_forward().ok_or(OracleError::Exhausted));
                }
            }

            tracing::debug!("shutting down BatchingTimestampOracle task");
        });

        Self {
            inner: oracle,
            command_tx,
        }
    }
}

#[async_trait]
impl TimestampOracle for BatchingTimestampOracle {
    async fn alloc_timestamps(&self, count: u32) -> Result<Timestamp, OracleError> {
        if count == 1 {
            return self.alloc_timestamp().await;
        }
        self.inner.alloc_timestamps(count).await
    }

    #[tracing::instrument(name = "oracle::alloc_timestamp", level = "trace", skip_all)]
    async fn alloc_timestamp(&self) -> Result<Timestamp, OracleError> {
        let (tx, rx) = oneshot::channel();
        let stopped = || OracleError::Unavailable("batching worker stopped".into());
        self.command_tx
            .send(Command::AllocTimestamp(tx))
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

#[cfg(test)]
mod tests {
    use vdb_ore::metrics::MetricsRegistry;

    use crate::memory::MemTimestampOracle;

    use super::*;

    #[tokio::test]
    async fn test_batching_timestamp_oracle() -> Result<(), anyhow::Error> {
        vdb_ore::test::init_logging();
        let metrics = Arc::new(Metrics::new(&MetricsRegistry::new()));

        crate::tests::timestamp_oracle_impl_test(|now| {
            let inner: Arc<dyn TimestampOracle> =
                Arc::new(MemTimestampOracle::new(now, Arc::clone(&metrics)));
            let oracle: Arc<dyn TimestampOracle> =
                Arc::new(BatchingTimestampOracle::new(Arc::clone(&metrics), inner));
            std::future::ready(oracle)
        })
        .await?;

        let batching = &metrics.batching.alloc_timestamp;
        assert!(batching.ops_count.get() >= batching.batches_count.get());
        assert!(batching.batches_count.get() > 0);
        Ok(())
    }
}
