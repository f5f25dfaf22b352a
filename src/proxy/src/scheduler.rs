// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The task scheduler.
//!
//! There is one [`TaskQueue`] per [`TaskKind`](crate::task::TaskKind). A
//! queue stamps each task with its id and begin timestamp while holding the
//! queue's enqueue lock, so within a queue timestamp order, id order and
//! delivery order agree.
//! Each queue has its own dispatcher and concurrency ceiling: a stalled
//! DQL queue never holds up DDL or DML.
//!
//! Enqueue never blocks on queue space. A full queue fails the enqueue.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use derivative::Derivative;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vdb_dyncfg::{Config, ConfigSet};
use vdb_ore::id_gen::AtomicGen;
use vdb_timestamp_oracle::{OracleError, Timestamp, TimestampOracle};

use crate::config;
use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::rate::MultiRateLimiter;
use crate::task::{
    DdlTask, DmlTask, DqlTask, QueuedTask, TaskContext, TaskEnv, TaskHandle, TaskId, TaskStamp,
};
use crate::types::StateCode;

const SHUT_DOWN: &str = "scheduler shut down";

/// The serving state of the front-end, shared by the scheduler and the
/// handlers.
#[derive(Debug)]
pub struct ServiceState(AtomicU8);

impl ServiceState {
    pub fn new(state: StateCode) -> Self {
        ServiceState(AtomicU8::new(Self::encode(state)))
    }

    fn encode(state: StateCode) -> u8 {
        match state {
            StateCode::Initializing => 0,
            StateCode::Healthy => 1,
            StateCode::Abnormal => 2,
            StateCode::Stopping => 3,
        }
    }

    pub fn get(&self) -> StateCode {
        match self.0.load(Ordering::SeqCst) {
            0 => StateCode::Initializing,
            1 => StateCode::Healthy,
            2 => StateCode::Abnormal,
            _ => StateCode::Stopping,
        }
    }

    pub fn set(&self, state: StateCode) {
        self.0.store(Self::encode(state), Ordering::SeqCst);
    }

    /// Fails with [`ProxyError::Unhealthy`] unless the state is healthy.
    pub fn check_healthy(&self) -> Result<(), ProxyError> {
        match self.get() {
            StateCode::Healthy => Ok(()),
            state => Err(ProxyError::Unhealthy(state)),
        }
    }
}

/// Begin timestamps of tasks accepted but not yet finished, with counts.
type PendingSet = Arc<Mutex<BTreeMap<Timestamp, usize>>>;

/// Keeps a begin timestamp in its queue's pending set until dropped.
#[derive(Debug)]
struct PendingTs {
    pending: PendingSet,
    ts: Timestamp,
}

impl PendingTs {
    fn register(pending: &PendingSet, ts: Timestamp) -> Self {
        *pending
            .lock()
            .expect("lock poisoned")
            .entry(ts)
            .or_default() += 1;
        PendingTs {
            pending: Arc::clone(pending),
            ts,
        }
    }
}

impl Drop for PendingTs {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().expect("lock poisoned");
        if let Some(count) = pending.get_mut(&self.ts) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&self.ts);
            }
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct QueueEntry<T: QueuedTask> {
    task: T,
    stamp: TaskStamp,
    ctx: TaskContext,
    enqueued_at: Instant,
    pending: PendingTs,
    #[derivative(Debug = "ignore")]
    tx: oneshot::Sender<Result<T::Output, ProxyError>>,
}

/// A FIFO queue of tasks of one kind, with a concurrency ceiling.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TaskQueue<T: QueuedTask> {
    /// Serializes stamping, so that stamps are handed out in delivery order.
    enqueue_lock: tokio::sync::Mutex<()>,
    tx: mpsc::Sender<QueueEntry<T>>,
    /// Taken by the dispatcher when it starts.
    rx: Mutex<Option<mpsc::Receiver<QueueEntry<T>>>>,
    ids: Arc<AtomicGen<TaskId>>,
    pending: PendingSet,
    #[derivative(Debug = "ignore")]
    oracle: Arc<dyn TimestampOracle>,
    configs: ConfigSet,
    concurrency: &'static Config<usize>,
    metrics: Metrics,
}

impl<T: QueuedTask> TaskQueue<T> {
    fn new(
        configs: &ConfigSet,
        concurrency: &'static Config<usize>,
        ids: Arc<AtomicGen<TaskId>>,
        oracle: Arc<dyn TimestampOracle>,
        metrics: Metrics,
    ) -> Self {
        let capacity = config::QUEUE_CAPACITY.get(configs).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        TaskQueue {
            enqueue_lock: tokio::sync::Mutex::new(()),
            tx,
            rx: Mutex::new(Some(rx)),
            ids,
            pending: Arc::default(),
            oracle,
            configs: configs.clone(),
            concurrency,
            metrics,
        }
    }

    /// Stamps `task` and appends it to the queue.
    ///
    /// Fails without allocating a timestamp if the queue is full or shut
    /// down.
    async fn enqueue(&self, mut task: T) -> Result<TaskHandle<T::Output>, ProxyError> {
        let _guard = self.enqueue_lock.lock().await;
        let permit = self.tx.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => {
                ProxyError::EnqueueFailed(format!("{} queue is full", T::KIND))
            }
            TrySendError::Closed(()) => ProxyError::EnqueueFailed(SHUT_DOWN.into()),
        })?;
        let begin_ts = self
            .oracle
            .alloc_timestamp()
            .await
            .map_err(|e| ProxyError::EnqueueFailed(format!("allocating timestamp: {e}")))?;
        let end_ts = task.assign_timestamps(begin_ts)?;
        let stamp = TaskStamp {
            id: self.ids.allocate_id(),
            kind: T::KIND,
            begin_ts,
            end_ts,
        };
        let ctx = TaskContext::new(config::TASK_TIMEOUT.get(&self.configs));
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle::new(stamp, rx, &ctx);
        debug!(task = task.name(), id = %stamp.id, %begin_ts, %end_ts, "enqueued");
        permit.send(QueueEntry {
            task,
            stamp,
            ctx,
            enqueued_at: Instant::now(),
            pending: PendingTs::register(&self.pending, begin_ts),
            tx,
        });
        self.metrics
            .queue_depth
            .with_label_values(&[T::KIND.as_str()])
            .inc();
        Ok(handle)
    }

    /// A timestamp below the begin timestamp of every unfinished task of
    /// this queue, and of every task it will accept from now on.
    pub async fn safe_watermark(&self) -> Result<Timestamp, OracleError> {
        let _guard = self.enqueue_lock.lock().await;
        let now = self.oracle.alloc_timestamp().await?;
        let pending = self.pending.lock().expect("lock poisoned");
        let watermark = match pending.keys().next() {
            Some(min) => min.step_back().unwrap_or(Timestamp::MIN).min(now),
            None => now,
        };
        Ok(watermark)
    }

    /// The number of unfinished tasks.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("lock poisoned").values().sum()
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<QueueEntry<T>>> {
        self.rx.lock().expect("lock poisoned").take()
    }

    /// Executes queued tasks until `shutdown` fires, then fails what is
    /// still queued and waits for executing tasks to finish.
    async fn run(self: Arc<Self>, env: Arc<TaskEnv>, shutdown: CancellationToken) {
        let Some(mut rx) = self.take_receiver() else {
            warn!(queue = %T::KIND, "dispatcher already started");
            return;
        };
        let mut running = JoinSet::new();
        loop {
            // Read each time so the ceiling can be tuned at runtime.
            let limit = self.concurrency.get(&self.configs).max(1);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(res) = running.join_next(), if !running.is_empty() => {
                    self.reap(res);
                }
                entry = rx.recv(), if running.len() < limit => match entry {
                    Some(entry) => self.dispatch(&mut running, &env, entry),
                    None => break,
                },
            }
        }
        self.drain(rx).await;
        while let Some(res) = running.join_next().await {
            self.reap(res);
        }
        info!(queue = %T::KIND, "dispatcher stopped");
    }

    fn dispatch(
        self: &Arc<Self>,
        running: &mut JoinSet<()>,
        env: &Arc<TaskEnv>,
        entry: QueueEntry<T>,
    ) {
        let kind = T::KIND.as_str();
        self.metrics.queue_depth.with_label_values(&[kind]).dec();
        self.metrics
            .queue_wait_seconds
            .with_label_values(&[kind])
            .observe(entry.enqueued_at.elapsed().as_secs_f64());
        if entry.tx.is_closed() || entry.ctx.is_cancelled() {
            debug!(id = %entry.stamp.id, "skipping abandoned task");
            return;
        }

        let queue = Arc::clone(self);
        let env = Arc::clone(env);
        running.spawn(async move {
            let QueueEntry {
                task,
                stamp,
                ctx,
                pending,
                tx,
                ..
            } = entry;
            let in_flight = queue.metrics.queue_in_flight.with_label_values(&[kind]);
            in_flight.inc();
            let name = task.name();
            let res = ctx
                .run(task.execute(&env, &stamp, &ctx))
                .await
                .map_err(ProxyError::into_execution_failure);
            if let Err(e) = &res {
                debug!(task = name, id = %stamp.id, error = %e, "task failed");
            }
            in_flight.dec();
            drop(pending);
            // The waiter may have gone away; its result is discarded.
            let _ = tx.send(res);
        });
    }

    fn reap(&self, res: Result<(), JoinError>) {
        if let Err(e) = res {
            warn!(queue = %T::KIND, error = %e, "task panicked");
        }
    }

    /// Fails every task still queued in `rx`.
    async fn drain(&self, mut rx: mpsc::Receiver<QueueEntry<T>>) {
        rx.close();
        let mut failed = 0;
        while let Some(entry) = rx.recv().await {
            self.metrics
                .queue_depth
                .with_label_values(&[T::KIND.as_str()])
                .dec();
            let _ = entry.tx.send(Err(ProxyError::EnqueueFailed(SHUT_DOWN.into())));
            failed += 1;
        }
        if failed > 0 {
            info!(queue = %T::KIND, failed, "failed queued tasks at shutdown");
        }
    }

    /// Closes a queue whose dispatcher never started.
    async fn close_unstarted(&self) {
        if let Some(rx) = self.take_receiver() {
            self.drain(rx).await;
        }
    }
}

/// The three task queues, and the admission checks in front of them.
#[derive(Debug)]
pub struct TaskScheduler {
    ddl: Arc<TaskQueue<DdlTask>>,
    dml: Arc<TaskQueue<DmlTask>>,
    dql: Arc<TaskQueue<DqlTask>>,
    limiter: Arc<MultiRateLimiter>,
    state: Arc<ServiceState>,
    configs: ConfigSet,
    shutdown: CancellationToken,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(
        configs: &ConfigSet,
        oracle: Arc<dyn TimestampOracle>,
        limiter: Arc<MultiRateLimiter>,
        state: Arc<ServiceState>,
        metrics: &Metrics,
    ) -> Self {
        let ids = Arc::new(AtomicGen::default());
        TaskScheduler {
            ddl: Arc::new(TaskQueue::new(
                configs,
                &config::DDL_CONCURRENCY,
                Arc::clone(&ids),
                Arc::clone(&oracle),
                metrics.clone(),
            )),
            dml: Arc::new(TaskQueue::new(
                configs,
                &config::DML_CONCURRENCY,
                Arc::clone(&ids),
                Arc::clone(&oracle),
                metrics.clone(),
            )),
            dql: Arc::new(TaskQueue::new(
                configs,
                &config::DQL_CONCURRENCY,
                ids,
                oracle,
                metrics.clone(),
            )),
            limiter,
            state,
            configs: configs.clone(),
            shutdown: CancellationToken::new(),
            dispatchers: Mutex::new(Vec::new()),
        }
    }

    pub fn ddl_queue(&self) -> &Arc<TaskQueue<DdlTask>> {
        &self.ddl
    }

    pub fn dml_queue(&self) -> &Arc<TaskQueue<DmlTask>> {
        &self.dml
    }

    pub fn dql_queue(&self) -> &Arc<TaskQueue<DqlTask>> {
        &self.dql
    }

    /// Accepts `task` into its queue.
    ///
    /// Fails fast, without touching the queue, if the front-end is not
    /// healthy, the request is invalid or its rate budget is exhausted.
    pub async fn enqueue<T: QueuedTask>(
        &self,
        task: T,
    ) -> Result<TaskHandle<T::Output>, ProxyError> {
        self.state.check_healthy()?;
        task.validate(&self.configs)?;
        let admission = task.admission();
        if let Some((rate_type, cost)) = admission {
            self.limiter.admit(rate_type, cost)?;
        }
        let res = T::queue(self).enqueue(task).await;
        if let (Err(_), Some((rate_type, cost))) = (&res, admission) {
            self.limiter.refund(rate_type, cost);
        }
        res
    }

    /// Starts the dispatchers of all three queues.
    pub fn start(&self, env: Arc<TaskEnv>) {
        let mut dispatchers = self.dispatchers.lock().expect("lock poisoned");
        dispatchers.push(vdb_ore::task::spawn(
            || "ddl_dispatcher",
            Arc::clone(&self.ddl).run(Arc::clone(&env), self.shutdown.clone()),
        ));
        dispatchers.push(vdb_ore::task::spawn(
            || "dml_dispatcher",
            Arc::clone(&self.dml).run(Arc::clone(&env), self.shutdown.clone()),
        ));
        dispatchers.push(vdb_ore::task::spawn(
            || "dql_dispatcher",
            Arc::clone(&self.dql).run(env, self.shutdown.clone()),
        ));
    }

    /// Stops the dispatchers. Queued tasks fail with
    /// [`ProxyError::EnqueueFailed`]; executing tasks run to completion.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let dispatchers = std::mem::take(&mut *self.dispatchers.lock().expect("lock poisoned"));
        for dispatcher in dispatchers {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "dispatcher panicked");
            }
        }
        self.ddl.close_unstarted().await;
        self.dml.close_unstarted().await;
        self.dql.close_unstarted().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vdb_ore::metrics::MetricsRegistry;
    use vdb_ore::now::ManualClock;
    use vdb_timestamp_oracle::memory::MemTimestampOracle;

    use super::*;
    use crate::rate::RateType;
    use crate::task::TaskKind;
    use crate::testing::create_request;

    struct Harness {
        scheduler: TaskScheduler,
        configs: ConfigSet,
    }

    fn harness(configure: impl FnOnce(&ConfigSet)) -> Harness {
        let configs = config::all_dyncfgs(ConfigSet::default());
        configure(&configs);
        let registry = MetricsRegistry::new();
        let metrics = Metrics::register_into(&registry);
        let clock = ManualClock::new(1_000);
        let oracle = Arc::new(MemTimestampOracle::new(
            clock.now_fn(),
            Arc::new(vdb_timestamp_oracle::metrics::Metrics::new(&registry)),
        ));
        let limiter = Arc::new(MultiRateLimiter::new(
            &configs,
            clock.now_fn(),
            metrics.limiter_rate.clone(),
        ));
        let scheduler = TaskScheduler::new(
            &configs,
            oracle,
            limiter,
            Arc::new(ServiceState::new(StateCode::Healthy)),
            &metrics,
        );
        Harness { scheduler, configs }
    }

    fn create(name: &str) -> DdlTask {
        DdlTask::CreateCollection(create_request(name, 1))
    }

    #[tokio::test]
    async fn invalid_requests_never_enter_the_queue() {
        let h = harness(|_| {});
        let mut req = create_request("a", 1);
        req.schema.fields.clear();
        let err = h
            .scheduler
            .enqueue(DdlTask::CreateCollection(req))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)), "{err}");
        assert_eq!(h.scheduler.ddl_queue().pending_count(), 0);
    }

    #[tokio::test]
    async fn stamps_follow_enqueue_order() {
        let h = harness(|_| {});
        let mut last: Option<TaskStamp> = None;
        for i in 0..10 {
            let handle = h
                .scheduler
                .enqueue(create(&format!("c{i}")))
                .await
                .expect("enqueued");
            let stamp = *handle.stamp();
            assert_eq!(stamp.kind, TaskKind::Ddl);
            if let Some(last) = last {
                assert!(last.begin_ts < stamp.begin_ts);
                assert!(last.id < stamp.id);
            }
            last = Some(stamp);
        }
        assert_eq!(h.scheduler.ddl_queue().pending_count(), 10);
    }

    #[tokio::test]
    async fn full_queue_fails_fast() {
        let h = harness(|configs| config::QUEUE_CAPACITY.set(configs, 2));
        let _a = h.scheduler.enqueue(create("a")).await.expect("room");
        let _b = h.scheduler.enqueue(create("b")).await.expect("room");
        let err = h.scheduler.enqueue(create("c")).await.unwrap_err();
        assert!(matches!(err, ProxyError::EnqueueFailed(_)), "{err}");
        assert_eq!(config::QUEUE_CAPACITY.get(&h.configs), 2);
    }

    #[tokio::test]
    async fn unhealthy_and_denied_requests_are_rejected() {
        let h = harness(|_| {});
        h.scheduler.state.set(StateCode::Initializing);
        assert!(matches!(
            h.scheduler.enqueue(create("a")).await,
            Err(ProxyError::Unhealthy(StateCode::Initializing))
        ));
        h.scheduler.state.set(StateCode::Healthy);

        h.scheduler
            .limiter
            .set_rates(&[(RateType::DdlCollection, 0.0)])
            .expect("valid");
        assert!(matches!(
            h.scheduler.enqueue(create("a")).await,
            Err(ProxyError::AdmissionDenied(RateType::DdlCollection))
        ));
        assert_eq!(h.scheduler.ddl_queue().pending_count(), 0);
    }

    #[tokio::test]
    async fn watermark_stays_below_pending() {
        let h = harness(|_| {});
        let queue = h.scheduler.ddl_queue();
        let before = queue.safe_watermark().await.expect("watermark");
        let handle = h.scheduler.enqueue(create("a")).await.expect("enqueued");
        let watermark = queue.safe_watermark().await.expect("watermark");
        assert!(watermark < handle.begin_ts());
        assert!(before <= watermark);

        drop(handle);
        h.scheduler.shutdown().await;
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.safe_watermark().await.expect("watermark") > watermark);
    }

    #[tokio::test]
    async fn shutdown_fails_queued_tasks() {
        let h = harness(|_| {});
        let handle = h.scheduler.enqueue(create("a")).await.expect("enqueued");
        h.scheduler.shutdown().await;
        let err = handle.wait_for_completion().await.unwrap_err();
        assert_eq!(err.to_string(), "failed to enqueue task: scheduler shut down");
        let err = h.scheduler.enqueue(create("b")).await.unwrap_err();
        assert!(matches!(err, ProxyError::EnqueueFailed(_)));
        tokio::time::timeout(Duration::from_secs(1), h.scheduler.shutdown())
            .await
            .expect("idempotent shutdown");
    }
}
