// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Units of work flowing through the scheduler.
//!
//! A task is one client request in one of three classes. Each class is an
//! enum over the operations it carries ([`DdlTask`], [`DmlTask`],
//! [`DqlTask`]) with its own output type, and all three run on the same
//! generic queue engine through [`QueuedTask`].
//!
//! A task is single use: it is stamped when the scheduler accepts it,
//! executed once, and its result is delivered exactly once to the
//! [`TaskHandle`] returned at enqueue.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use vdb_dyncfg::ConfigSet;
use vdb_timestamp_oracle::Timestamp;

use crate::backend::Backends;
use crate::channels::ChannelManager;
use crate::error::ProxyError;
use crate::meta_cache::MetaCache;
use crate::metrics::Metrics;
use crate::rate::{RateCollector, RateType};
use crate::scheduler::{TaskQueue, TaskScheduler};
use crate::shard::ShardManager;

mod ddl;
mod dml;
mod dql;

pub use ddl::{DdlOutput, DdlTask};
pub(crate) use ddl::validate_name;
pub use dml::DmlTask;
pub use dql::{DqlOutput, DqlTask, QueryResults, SearchResults};

/// The class of a task. Each class has its own queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    /// Schema and metadata mutations.
    Ddl,
    /// Data mutations.
    Dml,
    /// Data queries.
    Dql,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Ddl => "ddl",
            TaskKind::Dml => "dml",
            TaskKind::Dql => "dql",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a task. Unique and increasing within a process, across all
/// classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        TaskId(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Identity and timestamps assigned to a task when it was accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskStamp {
    pub id: TaskId,
    pub kind: TaskKind,
    /// For mutations, the commit timestamp of every row of the task.
    pub begin_ts: Timestamp,
    /// For reads, the upper bound of the snapshot. `begin_ts <= end_ts`.
    pub end_ts: Timestamp,
}

/// The services a task executes against.
#[derive(Debug)]
pub struct TaskEnv {
    pub backends: Backends,
    pub meta_cache: Arc<MetaCache>,
    pub channels: Arc<ChannelManager>,
    pub shards: Arc<ShardManager>,
    pub collector: Arc<RateCollector>,
    pub configs: ConfigSet,
    pub metrics: Metrics,
    pub default_partition_name: String,
}

/// The cancellation scope and deadline of an executing task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    cancel: CancellationToken,
    deadline: Instant,
    timeout: Duration,
}

impl TaskContext {
    pub(crate) fn new(timeout: Duration) -> Self {
        TaskContext {
            cancel: CancellationToken::new(),
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    /// Whether the task's waiter gave up on it.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs `fut` bound to this context: it is abandoned, and an error
    /// returned, when the task is cancelled or its deadline passes.
    ///
    /// Work the future already handed to a backend is not retracted.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, ProxyError>
    where
        F: Future<Output = Result<T, ProxyError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(ProxyError::Canceled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::Canceled),
            res = tokio::time::timeout_at(self.deadline, fut) => {
                res.unwrap_or(Err(ProxyError::TimedOut(self.timeout)))
            }
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// The caller's side of an accepted task.
///
/// Dropping the handle cancels the task: if it has not started executing it
/// is skipped, and any remaining backend calls bound to its context are
/// abandoned.
#[derive(Debug)]
pub struct TaskHandle<O> {
    stamp: TaskStamp,
    rx: oneshot::Receiver<Result<O, ProxyError>>,
    deadline: Instant,
    timeout: Duration,
    cancel: DropGuard,
}

impl<O> TaskHandle<O> {
    pub(crate) fn new(
        stamp: TaskStamp,
        rx: oneshot::Receiver<Result<O, ProxyError>>,
        ctx: &TaskContext,
    ) -> Self {
        TaskHandle {
            stamp,
            rx,
            deadline: ctx.deadline,
            timeout: ctx.timeout,
            cancel: ctx.token().drop_guard(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.stamp.id
    }

    pub fn begin_ts(&self) -> Timestamp {
        self.stamp.begin_ts
    }

    pub fn end_ts(&self) -> Timestamp {
        self.stamp.end_ts
    }

    pub fn stamp(&self) -> &TaskStamp {
        &self.stamp
    }

    /// Waits for the task's result, up to the task's deadline.
    ///
    /// On timeout the task is cancelled; backend work already in flight
    /// may still complete.
    pub async fn wait_for_completion(mut self) -> Result<O, ProxyError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(ProxyError::ExecutionFailed(format!(
                "task {} dropped without a result",
                self.stamp.id
            ))),
            Err(_) => Err(ProxyError::TimedOut(self.timeout)),
        }
    }

    /// Like [`Self::wait_for_completion`], but also gives up with
    /// [`ProxyError::Canceled`] when `caller` is cancelled.
    pub async fn wait_cancelable(self, caller: &CancellationToken) -> Result<O, ProxyError> {
        tokio::select! {
            biased;
            _ = caller.cancelled() => Err(ProxyError::Canceled),
            res = self.wait_for_completion() => res,
        }
    }
}

/// A task class runnable on a [`TaskQueue`].
#[async_trait]
pub trait QueuedTask: fmt::Debug + Send + Sized + 'static {
    /// The typed result delivered to the task's handle.
    type Output: Send + 'static;

    /// The class, and so the queue, of this task.
    const KIND: TaskKind;

    /// The operation name, for logs and metrics.
    fn name(&self) -> &'static str;

    /// Checks the request before anything is allocated for it.
    fn validate(&self, _configs: &ConfigSet) -> Result<(), ProxyError> {
        Ok(())
    }

    /// The rate budget this task draws from, and its cost. `None` skips
    /// admission control.
    fn admission(&self) -> Option<(RateType, f64)>;

    /// Called once with the task's begin timestamp; returns its end
    /// timestamp.
    fn assign_timestamps(&mut self, begin_ts: Timestamp) -> Result<Timestamp, ProxyError> {
        Ok(begin_ts)
    }

    /// Executes the task. Errors are delivered to the waiter.
    async fn execute(
        self,
        env: &TaskEnv,
        stamp: &TaskStamp,
        ctx: &TaskContext,
    ) -> Result<Self::Output, ProxyError>;

    /// The queue of this task class.
    fn queue(scheduler: &TaskScheduler) -> &Arc<TaskQueue<Self>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp() -> TaskStamp {
        TaskStamp {
            id: TaskId(1),
            kind: TaskKind::Ddl,
            begin_ts: Timestamp::from(5),
            end_ts: Timestamp::from(5),
        }
    }

    #[tokio::test]
    async fn handle_delivers_result() {
        let ctx = TaskContext::new(Duration::from_secs(5));
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle::<u32>::new(stamp(), rx, &ctx);
        assert_eq!(handle.id(), TaskId(1));
        assert_eq!(handle.begin_ts(), handle.end_ts());
        tx.send(Ok(7)).expect("receiver alive");
        assert_eq!(handle.wait_for_completion().await.expect("completed"), 7);
    }

    #[tokio::test]
    async fn dropped_sender_is_an_execution_failure() {
        let ctx = TaskContext::new(Duration::from_secs(5));
        let (tx, rx) = oneshot::channel::<Result<u32, ProxyError>>();
        let handle = TaskHandle::new(stamp(), rx, &ctx);
        drop(tx);
        assert!(matches!(
            handle.wait_for_completion().await,
            Err(ProxyError::ExecutionFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let ctx = TaskContext::new(Duration::from_millis(100));
        let (_tx, rx) = oneshot::channel::<Result<u32, ProxyError>>();
        let handle = TaskHandle::new(stamp(), rx, &ctx);
        assert!(matches!(
            handle.wait_for_completion().await,
            Err(ProxyError::TimedOut(_))
        ));
        // The abandoned handle cancelled the task's context.
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn caller_cancellation() {
        let ctx = TaskContext::new(Duration::from_secs(5));
        let (_tx, rx) = oneshot::channel::<Result<u32, ProxyError>>();
        let handle = TaskHandle::new(stamp(), rx, &ctx);
        let caller = CancellationToken::new();
        caller.cancel();
        assert!(matches!(
            handle.wait_cancelable(&caller).await,
            Err(ProxyError::Canceled)
        ));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn context_bounds_work() {
        let ctx = TaskContext::new(Duration::from_millis(50));
        let res: Result<(), _> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(ProxyError::TimedOut(_))));

        let ctx = TaskContext::new(Duration::from_secs(5));
        ctx.token().cancel();
        let res = ctx.run(async { Ok(1) }).await;
        assert!(matches!(res, Err(ProxyError::Canceled)));
    }
}
