// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Write-ahead channels of collections, and their time ticks.
//!
//! A collection's channels are resolved on its first mutation and cached
//! until the collection is dropped. Publishing holds the channel map for
//! read, and removal takes it for write, so a mutation racing with a drop
//! either publishes entirely before the channels go away or fails with
//! [`ProxyError::ChannelsRemoved`].
//!
//! The time-tick loop publishes, per channel, a timestamp below which no
//! further mutation will arrive. Ticks never regress.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vdb_dyncfg::ConfigSet;
use vdb_timestamp_oracle::Timestamp;

use crate::backend::{MessageStream, StreamMessage};
use crate::config;
use crate::error::{BackendError, ProxyError};
use crate::metrics::Metrics;
use crate::scheduler::TaskQueue;
use crate::task::DmlTask;
use crate::types::{CollectionId, CollectionInfo, PrimaryKey};

/// The channels of one collection and their last published ticks.
#[derive(Debug)]
pub struct CollectionChannels {
    collection: CollectionId,
    channels: Vec<String>,
    ticks: Vec<AtomicU64>,
}

impl CollectionChannels {
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    pub fn names(&self) -> &[String] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// The index of the channel `key` is routed to.
    pub fn route(&self, key: &PrimaryKey) -> usize {
        let n = u64::try_from(self.channels.len()).unwrap_or(u64::MAX).max(1);
        usize::try_from(key.channel_hash() % n).unwrap_or(0)
    }

    /// The last tick published to channel `idx`.
    pub fn last_tick(&self, idx: usize) -> Option<Timestamp> {
        self.ticks
            .get(idx)
            .map(|t| Timestamp::from(t.load(Ordering::SeqCst)))
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    collections: BTreeMap<CollectionId, Arc<CollectionChannels>>,
    /// Collections whose channels were torn down. Collection ids are never
    /// reused, so these are never registered again.
    removed: BTreeSet<CollectionId>,
}

/// Channel assignments of every collection mutated through this front-end.
#[derive(Debug)]
pub struct ChannelManager {
    stream: Arc<dyn MessageStream>,
    state: RwLock<ChannelState>,
    /// Serializes tick rounds.
    tick_lock: Mutex<()>,
    metrics: Metrics,
}

impl ChannelManager {
    pub fn new(stream: Arc<dyn MessageStream>, metrics: Metrics) -> Self {
        ChannelManager {
            stream,
            state: RwLock::new(ChannelState::default()),
            tick_lock: Mutex::new(()),
            metrics,
        }
    }

    /// Returns the channels of `info`'s collection, registering them on
    /// first use with ticks starting at the collection's creation.
    ///
    /// Fails with [`ProxyError::ChannelsRemoved`] once the collection's
    /// channels were torn down.
    pub async fn ensure_channels(
        &self,
        info: &CollectionInfo,
    ) -> Result<Arc<CollectionChannels>, ProxyError> {
        if let Some(channels) = self.state.read().await.collections.get(&info.id) {
            return Ok(Arc::clone(channels));
        }
        if info.channels.is_empty() {
            return Err(BackendError::ChannelMissing(format!(
                "collection {} has no channels",
                info.id
            ))
            .into());
        }
        let mut state = self.state.write().await;
        if state.removed.contains(&info.id) {
            return Err(ProxyError::ChannelsRemoved(info.id));
        }
        let channels = state.collections.entry(info.id).or_insert_with(|| {
            info!(collection = %info.id, channels = ?info.channels, "registered channels");
            Arc::new(CollectionChannels {
                collection: info.id,
                channels: info.channels.clone(),
                ticks: info
                    .channels
                    .iter()
                    .map(|_| AtomicU64::new(info.created_ts.as_u64()))
                    .collect(),
            })
        });
        Ok(Arc::clone(channels))
    }

    /// Tears down the channels of `collection`. Waits for in-flight
    /// publishes to it to finish.
    pub async fn remove_channels(&self, collection: CollectionId) {
        let mut state = self.state.write().await;
        state.removed.insert(collection);
        if let Some(channels) = state.collections.remove(&collection) {
            for name in &channels.channels {
                let _ = self
                    .metrics
                    .time_tick_physical_ms
                    .remove_label_values(&[name.as_str()]);
            }
            info!(%collection, "removed channels");
        }
    }

    /// The channels of `collection`, if registered.
    pub async fn channels(&self, collection: CollectionId) -> Option<Arc<CollectionChannels>> {
        self.state
            .read()
            .await
            .collections
            .get(&collection)
            .map(Arc::clone)
    }

    /// Publishes each batch to the channel of `channels` at its index.
    ///
    /// Fails with [`ProxyError::ChannelsRemoved`] if the collection's
    /// channels were removed, or replaced, since `channels` was resolved.
    pub async fn publish(
        &self,
        channels: &CollectionChannels,
        batches: Vec<(usize, Vec<StreamMessage>)>,
    ) -> Result<(), ProxyError> {
        let state = self.state.read().await;
        match state.collections.get(&channels.collection) {
            Some(current) if current.channels == channels.channels => {}
            _ => return Err(ProxyError::ChannelsRemoved(channels.collection)),
        }
        let publishes = batches.into_iter().map(|(idx, messages)| async move {
            let name = channels
                .channels
                .get(idx)
                .ok_or_else(|| BackendError::ChannelMissing(format!("index {idx}")))?;
            self.stream.publish(name, messages).await
        });
        try_join_all(publishes).await?;
        Ok(())
    }

    /// Publishes `watermark` as a tick to every channel whose last tick is
    /// older. Returns the number of ticks published.
    pub async fn tick_once(&self, watermark: Timestamp) -> usize {
        let _round = self.tick_lock.lock().await;
        let state = self.state.read().await;
        let mut published = 0;
        for channels in state.collections.values() {
            for (name, last) in channels.channels.iter().zip(&channels.ticks) {
                if watermark.as_u64() <= last.load(Ordering::SeqCst) {
                    continue;
                }
                match self
                    .stream
                    .publish(name, vec![StreamMessage::TimeTick(watermark)])
                    .await
                {
                    Ok(()) => {
                        last.store(watermark.as_u64(), Ordering::SeqCst);
                        self.metrics
                            .time_tick_physical_ms
                            .with_label_values(&[name.as_str()])
                            .set(i64::try_from(watermark.physical()).unwrap_or(i64::MAX));
                        published += 1;
                    }
                    Err(e) => warn!(channel = %name, error = %e, "failed to publish time tick"),
                }
            }
        }
        published
    }

    /// Publishes ticks every [`config::TIME_TICK_INTERVAL`] until
    /// `shutdown` fires.
    pub async fn run_ticker(
        self: Arc<Self>,
        dml: Arc<TaskQueue<DmlTask>>,
        configs: ConfigSet,
        shutdown: CancellationToken,
    ) {
        loop {
            let interval = config::TIME_TICK_INTERVAL.get(&configs);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match dml.safe_watermark().await {
                Ok(watermark) => {
                    let published = self.tick_once(watermark).await;
                    debug!(%watermark, published, "time tick");
                }
                Err(e) => warn!(error = %e, "failed to allocate time tick"),
            }
        }
        info!("time ticker stopped");
    }
}

#[cfg(test)]
mod tests {
    use vdb_ore::metrics::MetricsRegistry;

    use super::*;
    use crate::testing::{collection_info, MemStream};

    fn manager() -> (Arc<MemStream>, ChannelManager) {
        let stream = Arc::new(MemStream::default());
        let metrics = Metrics::register_into(&MetricsRegistry::new());
        let manager = ChannelManager::new(Arc::clone(&stream) as Arc<dyn MessageStream>, metrics);
        (stream, manager)
    }

    #[tokio::test]
    async fn ticks_never_regress() {
        let (stream, manager) = manager();
        let info = collection_info(CollectionId(1), "c", 2, Timestamp::from(100));
        let channels = manager.ensure_channels(&info).await.expect("channels");
        assert_eq!(channels.last_tick(0), Some(Timestamp::from(100)));

        // At or below the creation timestamp nothing is published.
        assert_eq!(manager.tick_once(Timestamp::from(100)).await, 0);
        assert_eq!(manager.tick_once(Timestamp::from(150)).await, 2);
        assert_eq!(manager.tick_once(Timestamp::from(120)).await, 0);
        assert_eq!(manager.tick_once(Timestamp::from(200)).await, 2);

        for name in channels.names() {
            let ticks = stream.ticks(name);
            assert_eq!(ticks, vec![Timestamp::from(150), Timestamp::from(200)]);
        }
    }

    #[tokio::test]
    async fn cached_until_removed() {
        let (_stream, manager) = manager();
        let info = collection_info(CollectionId(1), "c", 2, Timestamp::from(1));
        let first = manager.ensure_channels(&info).await.expect("channels");
        let second = manager.ensure_channels(&info).await.expect("channels");
        assert!(Arc::ptr_eq(&first, &second));

        manager.remove_channels(CollectionId(1)).await;
        assert!(manager.channels(CollectionId(1)).await.is_none());
        let err = manager
            .publish(&first, vec![(0, Vec::new())])
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ChannelsRemoved(CollectionId(1))));
        let err = manager.ensure_channels(&info).await.unwrap_err();
        assert!(matches!(err, ProxyError::ChannelsRemoved(CollectionId(1))));
    }

    #[tokio::test]
    async fn routing_is_stable() {
        let (_stream, manager) = manager();
        let info = collection_info(CollectionId(1), "c", 4, Timestamp::from(1));
        let channels = manager.ensure_channels(&info).await.expect("channels");
        for i in 0..100 {
            let key = PrimaryKey::Int64(i);
            let idx = channels.route(&key);
            assert!(idx < 4);
            assert_eq!(idx, channels.route(&key));
        }
    }
}
