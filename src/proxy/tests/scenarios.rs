// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end behavior of the front-end over in-memory backends.

use std::collections::BTreeSet;

use futures::future;
use vdb_dyncfg::{ConfigUpdates, ConfigValue};
use vdb_ore::now::ManualClock;
use vdb_proxy::error::ProxyError;
use vdb_proxy::rate::RateType;
use vdb_proxy::testing::{create_request, proxy_config, TestCluster};
use vdb_proxy::task::QueryResults;
use vdb_proxy::types::{
    ColumnData, ConsistencyLevel, DeleteRequest, FieldColumn, InsertRequest, MetricType, NodeId,
    PrimaryKey, PrimaryKeys, QueryRequest, SearchRequest, ShardId,
};
use vdb_proxy::Proxy;
use vdb_timestamp_oracle::Timestamp;

async fn start(cluster: &TestCluster) -> Proxy {
    vdb_ore::test::init_logging();
    let proxy = Proxy::new(proxy_config(NodeId(100)), cluster.backends());
    proxy.start().await.expect("started");
    proxy
}

fn coord(key: i64) -> f32 {
    f32::from(i16::try_from(key).expect("small key"))
}

/// Rows `keys`, each with vector `[key, 0]`.
fn rows(collection: &str, keys: impl IntoIterator<Item = i64>) -> InsertRequest {
    let keys: Vec<i64> = keys.into_iter().collect();
    let num_rows = u32::try_from(keys.len()).expect("few rows");
    InsertRequest {
        collection_name: collection.into(),
        partition_name: String::new(),
        fields: vec![
            FieldColumn {
                field_name: "v".into(),
                data: ColumnData::FloatVector {
                    dim: 2,
                    data: keys.iter().flat_map(|k| [coord(*k), 0.0]).collect(),
                },
            },
            FieldColumn {
                field_name: "id".into(),
                data: ColumnData::Int64(keys),
            },
        ],
        num_rows,
    }
}

fn search(collection: &str, queries: &[f32], topk: u32) -> SearchRequest {
    SearchRequest {
        collection_name: collection.into(),
        partition_names: Vec::new(),
        anns_field: "v".into(),
        vectors: queries.iter().flat_map(|q| [*q, 0.0]).collect(),
        nq: u32::try_from(queries.len()).expect("few queries"),
        topk,
        offset: 0,
        metric_type: MetricType::L2,
        output_fields: vec!["id".into()],
        consistency_level: Some(ConsistencyLevel::Strong),
        guarantee_ts: None,
        travel_ts: None,
    }
}

#[tokio::test]
async fn rejected_batch_fails_every_row() {
    let cluster = TestCluster::new(2);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 2))
        .await
        .expect("created");
    let info = proxy.describe_collection("books").await.expect("described");
    for channel in &info.channels {
        cluster.stream.set_failing(channel, true);
    }

    let result = proxy.insert(rows("books", 0..100)).await.expect("accepted");
    assert!(!result.succeeded());
    assert_eq!(result.insert_cnt, 100);
    assert_eq!(result.err_index.len(), 100);
    assert_eq!(result.err_index, (0..100).collect::<Vec<u32>>());
    assert!(result
        .reason
        .as_deref()
        .is_some_and(|r| r.contains("stream unreachable")));

    for channel in &info.channels {
        cluster.stream.set_failing(channel, false);
    }
    let result = proxy.insert(rows("books", 0..100)).await.expect("accepted");
    assert!(result.succeeded(), "{:?}", result.reason);
    assert!(result.err_index.is_empty());
    proxy.shutdown().await;
}

#[tokio::test]
async fn search_merges_the_shards_that_answer() {
    let cluster = TestCluster::new(4);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 4))
        .await
        .expect("created");
    proxy.load_collection("books", 1).await.expect("loaded");
    let inserted = proxy.insert(rows("books", 0..200)).await.expect("accepted");
    assert!(inserted.succeeded(), "{:?}", inserted.reason);

    // Shard i is served by node i + 1.
    cluster.workers.set_unreachable(NodeId(4), true);
    let results = proxy
        .search(search("books", &[0.0, 50.0], 5))
        .await
        .expect("partial results");
    assert_eq!(results.unanswered_shards, vec![ShardId(3)]);

    let visible: Vec<i64> = (0..200)
        .filter(|k| PrimaryKey::Int64(*k).channel_hash() % 4 != 3)
        .collect();
    let nearest = |q: i64| {
        let mut keys = visible.clone();
        keys.sort_by_key(|k| ((k - q).abs(), *k));
        keys.truncate(5);
        keys
    };
    let expected: Vec<PrimaryKey> = nearest(0)
        .into_iter()
        .chain(nearest(50))
        .map(PrimaryKey::Int64)
        .collect();
    assert_eq!(results.data.topks, vec![5, 5]);
    assert_eq!(results.data.ids, expected);
    assert!(results
        .data
        .ids
        .iter()
        .all(|k| k.channel_hash() % 4 != 3));

    // With no shard answering the search fails as a whole.
    for node in 1..=4 {
        cluster.workers.set_unreachable(NodeId(node), true);
    }
    let err = proxy
        .search(search("books", &[0.0], 5))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::AllShardsFailed { shards: 4, .. }), "{err}");
    proxy.shutdown().await;
}

#[tokio::test]
async fn set_rates_limits_concurrent_searches() {
    vdb_ore::test::init_logging();
    let cluster = TestCluster::new(1);
    let clock = ManualClock::new(1_000_000);
    let mut config = proxy_config(NodeId(100));
    config.now = clock.now_fn();
    let proxy = Proxy::new(config, cluster.backends());
    proxy.start().await.expect("started");
    proxy
        .create_collection(create_request("books", 1))
        .await
        .expect("created");
    proxy.load_collection("books", 1).await.expect("loaded");

    proxy
        .set_rates(&[(RateType::DqlSearch, 1.0)])
        .await
        .expect("rates set");
    let results = future::join_all((0..10).map(|_| proxy.search(search("books", &[1.0], 3)))).await;
    let denied = results
        .iter()
        .filter(|r| matches!(r, Err(ProxyError::AdmissionDenied(RateType::DqlSearch))))
        .count();
    let admitted: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(denied, 9);
    assert_eq!(admitted.len(), 1);

    // Other classes keep their limits.
    proxy
        .insert(rows("books", 0..10))
        .await
        .expect("inserts are unlimited");

    clock.advance(1_000);
    proxy
        .search(search("books", &[1.0], 3))
        .await
        .expect("budget refilled");

    let err = proxy
        .set_rates(&[(RateType::DqlQuery, -1.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::InvalidRequest(_)));
    proxy.shutdown().await;
}

#[tokio::test]
async fn strong_reads_observe_prior_mutations() {
    let cluster = TestCluster::new(2);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 2))
        .await
        .expect("created");
    proxy.load_collection("books", 2).await.expect("loaded");
    proxy.insert(rows("books", 0..10)).await.expect("accepted");

    let query = |keys: Vec<i64>| QueryRequest {
        collection_name: "books".into(),
        partition_names: Vec::new(),
        primary_keys: PrimaryKeys::Int64(keys),
        output_fields: vec!["v".into()],
        limit: None,
        consistency_level: Some(ConsistencyLevel::Strong),
        guarantee_ts: None,
        travel_ts: None,
    };
    let found = proxy.query(query(vec![1, 2, 42])).await.expect("queried");
    assert_eq!(
        found.data.ids,
        vec![PrimaryKey::Int64(1), PrimaryKey::Int64(2)]
    );
    assert!(found.unanswered_shards.is_empty());

    let deleted = proxy
        .delete(DeleteRequest {
            collection_name: "books".into(),
            partition_name: String::new(),
            primary_keys: PrimaryKeys::Int64(vec![1]),
        })
        .await
        .expect("accepted");
    assert!(deleted.succeeded(), "{:?}", deleted.reason);
    assert_eq!(deleted.delete_cnt, 1);
    assert!(deleted.timestamp > found_ts(&found));

    let found = proxy.query(query(vec![1, 2])).await.expect("queried");
    assert_eq!(found.data.ids, vec![PrimaryKey::Int64(2)]);

    let searched = proxy
        .search(search("books", &[1.0], 3))
        .await
        .expect("searched");
    let keys: BTreeSet<_> = searched.data.ids.iter().cloned().collect();
    assert_eq!(
        keys,
        BTreeSet::from([0, 2, 3].map(PrimaryKey::Int64)),
        "deleted key 1 is gone"
    );
    proxy.shutdown().await;
}

fn found_ts(found: &QueryResults) -> Timestamp {
    found.data.timestamps.iter().copied().max().unwrap_or_default()
}

#[tokio::test]
async fn config_updates_apply_at_runtime() {
    let cluster = TestCluster::new(1);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 1))
        .await
        .expect("created");
    proxy.load_collection("books", 1).await.expect("loaded");
    let inserted = proxy.insert(rows("books", 0..10)).await.expect("accepted");
    assert!(inserted.succeeded(), "{:?}", inserted.reason);
    proxy.search(search("books", &[0.0], 5)).await.expect("searched");

    let mut updates = ConfigUpdates::default();
    updates.add_dynamic(vdb_proxy::config::MAX_TOPK.name(), ConfigValue::U32(3));
    updates.add_dynamic("proxy_no_such_config", ConfigValue::Bool(true));
    proxy.update_configs(&updates).await.expect("applied");

    let err = proxy.search(search("books", &[0.0], 5)).await.unwrap_err();
    assert!(matches!(err, ProxyError::InvalidRequest(_)), "{err}");
    proxy.search(search("books", &[0.0], 3)).await.expect("searched");
    proxy.shutdown().await;
}

#[tokio::test]
async fn denied_inserts_do_not_count_as_ingress() {
    let cluster = TestCluster::new(1);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 1))
        .await
        .expect("created");
    let insert_rate = |metrics: &serde_json::Value| metrics["rates"]["insert_bytes"].as_f64();

    proxy
        .set_rates(&[(RateType::DmlInsert, 0.0)])
        .await
        .expect("rates set");
    let err = proxy.insert(rows("books", 0..10)).await.unwrap_err();
    assert!(
        matches!(err, ProxyError::AdmissionDenied(RateType::DmlInsert)),
        "{err}"
    );
    let metrics = proxy.get_proxy_metrics().await.expect("metrics");
    assert_eq!(insert_rate(&metrics), Some(0.0));

    proxy
        .set_rates(&[(RateType::DmlInsert, f64::INFINITY)])
        .await
        .expect("rates set");
    let result = proxy.insert(rows("books", 0..10)).await.expect("accepted");
    assert!(result.succeeded(), "{:?}", result.reason);
    let metrics = proxy.get_proxy_metrics().await.expect("metrics");
    assert!(insert_rate(&metrics).is_some_and(|rate| rate > 0.0), "{metrics}");
    proxy.shutdown().await;
}
