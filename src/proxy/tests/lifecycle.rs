// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Ordering, time ticks and the lifecycle of the front-end.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use vdb_proxy::backend::StreamMessage;
use vdb_proxy::error::ProxyError;
use vdb_proxy::rate::RateType;
use vdb_proxy::task::DdlTask;
use vdb_proxy::testing::{create_request, proxy_config, TestCluster};
use vdb_proxy::types::{
    ColumnData, CompactionState, ConsistencyLevel, CreateIndexRequest, Credential, FieldColumn,
    Grant, GrantObject, IndexBuildProgress, IndexState, InsertRequest, MetricType, NodeId,
    PrivilegeOp, QuerySegmentInfo, RoleResult, SearchRequest, SegmentId, SegmentInfo,
    SegmentState, StateCode, UserRoleOp,
};
use vdb_proxy::{CollectionInvalidation, Proxy};

async fn start(cluster: &TestCluster) -> Proxy {
    vdb_ore::test::init_logging();
    let proxy = Proxy::new(proxy_config(NodeId(100)), cluster.backends());
    proxy.start().await.expect("started");
    proxy
}

fn rows(collection: &str, first: i64, n: i64) -> InsertRequest {
    InsertRequest {
        collection_name: collection.into(),
        partition_name: String::new(),
        fields: vec![
            FieldColumn {
                field_name: "id".into(),
                data: ColumnData::Int64((first..first + n).collect()),
            },
            FieldColumn {
                field_name: "v".into(),
                data: ColumnData::FloatVector {
                    dim: 2,
                    data: vec![0.25; usize::try_from(n * 2).expect("positive")],
                },
            },
        ],
        num_rows: u32::try_from(n).expect("few rows"),
    }
}

#[tokio::test]
async fn tasks_are_stamped_in_enqueue_order() {
    let cluster = TestCluster::new(1);
    let proxy = start(&cluster).await;
    let mut handles = Vec::new();
    for _ in 0..50 {
        handles.push(
            proxy
                .scheduler()
                .enqueue(DdlTask::ShowCollections)
                .await
                .expect("enqueued"),
        );
    }
    for pair in handles.windows(2) {
        assert!(pair[0].begin_ts() < pair[1].begin_ts());
        assert!(pair[0].id() < pair[1].id());
    }
    for handle in handles {
        handle.wait_for_completion().await.expect("completed");
    }
    proxy.shutdown().await;
}

fn search(collection: &str) -> SearchRequest {
    SearchRequest {
        collection_name: collection.into(),
        partition_names: Vec::new(),
        anns_field: "v".into(),
        vectors: vec![0.0, 0.0],
        nq: 1,
        topk: 1,
        offset: 0,
        metric_type: MetricType::L2,
        output_fields: Vec::new(),
        consistency_level: Some(ConsistencyLevel::Strong),
        guarantee_ts: None,
        travel_ts: None,
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let wait = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), wait).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

#[tokio::test]
async fn stalled_searches_wait_in_order_without_blocking_writes() {
    vdb_ore::test::init_logging();
    let cluster = TestCluster::new(1);
    let config = proxy_config(NodeId(100));
    vdb_proxy::config::DQL_CONCURRENCY.set(&config.configs, 1);
    let proxy = Arc::new(Proxy::new(config, cluster.backends()));
    proxy.start().await.expect("started");
    proxy
        .create_collection(create_request("books", 1))
        .await
        .expect("created");
    proxy.load_collection("books", 1).await.expect("loaded");
    assert!(proxy.insert(rows("books", 0, 10)).await.expect("accepted").succeeded());

    cluster.workers.hold();
    let spawn_search = || {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.search(search("books")).await })
    };
    let dql = proxy.scheduler().dql_queue();
    let first = spawn_search();
    eventually("the first search to execute", || cluster.workers.calls().len() == 1).await;
    let second = spawn_search();
    eventually("the second search to queue", || dql.pending_count() == 2).await;
    let third = spawn_search();
    eventually("the third search to queue", || dql.pending_count() == 3).await;

    tokio::time::timeout(Duration::from_secs(1), async {
        proxy
            .create_collection(create_request("other", 1))
            .await
            .expect("created");
        let inserted = proxy.insert(rows("books", 10, 10)).await.expect("accepted");
        assert!(inserted.succeeded(), "{:?}", inserted.reason);
    })
    .await
    .expect("ddl and dml run while searches are stalled");
    assert_eq!(cluster.workers.calls().len(), 1);

    cluster.workers.release(1);
    first.await.expect("joined").expect("searched");
    eventually("the second search to execute", || cluster.workers.calls().len() == 2).await;
    assert!(!third.is_finished());
    assert_eq!(dql.pending_count(), 2);

    cluster.workers.release(1);
    second.await.expect("joined").expect("searched");
    eventually("the third search to execute", || cluster.workers.calls().len() == 3).await;
    cluster.workers.unhold();
    third.await.expect("joined").expect("searched");
    assert_eq!(dql.pending_count(), 0);
    proxy.shutdown().await;
}

#[tokio::test]
async fn ticks_advance_past_every_mutation() {
    let cluster = TestCluster::new(1);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 3))
        .await
        .expect("created");
    let info = proxy.describe_collection("books").await.expect("described");

    let inserts = (0..20).map(|i| proxy.insert(rows("books", i * 10, 10)));
    for result in future::join_all(inserts).await {
        assert!(result.expect("accepted").succeeded());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    for channel in &info.channels {
        let messages = cluster.stream.messages(channel);
        let ticks = cluster.stream.ticks(channel);
        assert!(!ticks.is_empty(), "{channel} was ticked");
        assert!(ticks.windows(2).all(|w| w[0] < w[1]), "{channel}: {ticks:?}");

        // A mutation published after a tick is above it.
        let mut last_tick = None;
        for message in messages {
            match message {
                StreamMessage::TimeTick(ts) => last_tick = Some(ts),
                other => {
                    if let Some(tick) = last_tick {
                        assert!(other.timestamp() > tick, "{channel}: mutation below tick");
                    }
                }
            }
        }
    }
    assert_eq!(proxy.scheduler().dml_queue().pending_count(), 0);
    proxy.shutdown().await;
}

#[tokio::test]
async fn dropping_a_collection_under_writes() {
    let cluster = TestCluster::new(1);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 2))
        .await
        .expect("created");
    let id = proxy.describe_collection("books").await.expect("described").id;

    let writes = future::join_all((0..10).map(|i| proxy.insert(rows("books", i * 5, 5))));
    let (writes, dropped) = future::join(writes, proxy.drop_collection("books")).await;
    dropped.expect("dropped");
    for result in writes {
        // Each write either landed before the drop or failed as a whole.
        let result = result.expect("accepted");
        if !result.succeeded() {
            assert_eq!(result.err_index.len(), 5);
        }
    }
    assert!(proxy.env().channels.channels(id).await.is_none());
    assert!(!proxy.has_collection("books").await.expect("checked"));

    let err = proxy.insert(rows("books", 0, 1)).await.expect("accepted");
    assert!(err.reason.is_some_and(|r| r.contains("collection not found")));

    proxy
        .create_collection(create_request("books", 2))
        .await
        .expect("recreated");
    let result = proxy.insert(rows("books", 0, 5)).await.expect("accepted");
    assert!(result.succeeded(), "{:?}", result.reason);
    proxy.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_serving() {
    let cluster = TestCluster::new(1);
    let proxy = Proxy::new(proxy_config(NodeId(100)), cluster.backends());
    assert_eq!(proxy.state(), StateCode::Initializing);
    let err = proxy.has_collection("books").await.unwrap_err();
    assert!(matches!(err, ProxyError::Unhealthy(StateCode::Initializing)));

    proxy.start().await.expect("started");
    assert_eq!(proxy.state(), StateCode::Healthy);
    assert_eq!(proxy.get_component_states().state, StateCode::Healthy);
    proxy.shutdown().await;
    assert_eq!(proxy.state(), StateCode::Stopping);

    let err = proxy.insert(rows("books", 0, 1)).await.unwrap_err();
    assert!(matches!(err, ProxyError::Unhealthy(StateCode::Stopping)));
    assert!(!proxy.check_health().await.is_healthy);
}

#[tokio::test]
async fn health_aggregates_every_coordinator() {
    let cluster = TestCluster::new(1);
    let proxy = start(&cluster).await;
    assert!(proxy.check_health().await.is_healthy);

    cluster.query.health().set_unhealthy("no query nodes");
    cluster.index.health().set_unhealthy("builder stalled");
    let report = proxy.check_health().await;
    assert!(!report.is_healthy);
    assert_eq!(
        report.reasons,
        vec![
            "query: no query nodes".to_owned(),
            "index: builder stalled".to_owned()
        ]
    );
    proxy.shutdown().await;
}

#[tokio::test]
async fn invalidating_a_dropped_collection() {
    let cluster = TestCluster::new(1);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 2))
        .await
        .expect("created");
    proxy.load_collection("books", 1).await.expect("loaded");
    let info = proxy.describe_collection("books").await.expect("described");
    assert!(proxy.insert(rows("books", 0, 4)).await.expect("accepted").succeeded());
    assert!(proxy.env().channels.channels(info.id).await.is_some());

    // The authority dropped the collection behind this front-end's back.
    cluster.metadata.remove_collection("books");
    proxy
        .invalidate_collection_meta_cache(CollectionInvalidation {
            collection_name: Some("books".into()),
            collection_id: None,
            dropped: true,
        })
        .await
        .expect("invalidated");
    assert!(proxy.env().channels.channels(info.id).await.is_none());
    let result = proxy.insert(rows("books", 0, 1)).await.expect("accepted");
    assert!(!result.succeeded());
    proxy.shutdown().await;
}

#[tokio::test]
async fn aliases_partitions_and_indexes() {
    let cluster = TestCluster::new(1);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 1))
        .await
        .expect("created");
    proxy.create_alias("library", "books").await.expect("aliased");
    let info = proxy.describe_collection("library").await.expect("described");
    assert_eq!(info.name, "books");
    assert_eq!(info.aliases, vec!["library".to_owned()]);

    proxy.create_partition("books", "p1").await.expect("created");
    assert!(proxy.has_partition("books", "p1").await.expect("checked"));
    let partitions = proxy.show_partitions("books").await.expect("shown");
    assert_eq!(partitions.len(), 2);
    let err = proxy.drop_partition("books", "_default").await.unwrap_err();
    assert!(matches!(err, ProxyError::InvalidRequest(_)));
    proxy.drop_partition("books", "p1").await.expect("dropped");

    proxy
        .create_index(CreateIndexRequest {
            collection_name: "books".into(),
            field_name: "v".into(),
            index_name: String::new(),
            params: [("index_type".to_owned(), "FLAT".to_owned())].into(),
        })
        .await
        .expect("index created");
    let indexes = proxy.describe_index("books", "").await.expect("described");
    assert_eq!(indexes.len(), 1);
    assert_eq!(indexes[0].index_name, "v");
    proxy.drop_index("books", "v").await.expect("dropped");

    proxy.drop_alias("library").await.expect("alias dropped");
    let err = proxy.describe_collection("library").await.unwrap_err();
    assert!(matches!(err, ProxyError::CollectionMissing(_)), "{err}");
    proxy.shutdown().await;
}

#[tokio::test]
async fn storage_and_credentials() {
    let cluster = TestCluster::new(1);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 1))
        .await
        .expect("created");
    let id = proxy.describe_collection("books").await.expect("described").id;
    for (segment, state) in [(1, SegmentState::Growing), (2, SegmentState::Flushed)] {
        cluster.storage.add_segment(SegmentInfo {
            segment_id: SegmentId(segment),
            collection_id: id,
            partition_id: vdb_proxy::types::PartitionId(0),
            num_rows: 10,
            state,
        });
    }
    let persistent = proxy.get_persistent_segment_info("books").await.expect("listed");
    assert_eq!(persistent.len(), 1);

    let flushed = proxy.flush(vec!["books".into()]).await.expect("flushed");
    assert_eq!(flushed["books"], vec![SegmentId(1)]);
    assert!(!proxy.get_flush_state(vec![SegmentId(1)]).await.expect("state"));
    cluster.storage.complete_flushes();
    assert!(proxy.get_flush_state(vec![SegmentId(1), SegmentId(2)]).await.expect("state"));

    let compaction = proxy.manual_compaction("books").await.expect("started");
    assert_eq!(
        proxy.get_compaction_state(compaction).await.expect("state"),
        CompactionState::Executing
    );
    proxy
        .set_rates(&[(RateType::DdlCompaction, 0.0)])
        .await
        .expect("rates set");
    let err = proxy.manual_compaction("books").await.unwrap_err();
    assert!(matches!(err, ProxyError::AdmissionDenied(RateType::DdlCompaction)));

    let alice = Credential {
        username: "alice".into(),
        encrypted_password: "hash".into(),
    };
    proxy.create_credential(alice.clone()).await.expect("created");
    assert_eq!(proxy.list_cred_users().await.expect("listed"), vec!["alice".to_owned()]);
    assert!(proxy.create_credential(alice).await.is_err());
    proxy.delete_credential("alice").await.expect("deleted");
    assert!(proxy.list_cred_users().await.expect("listed").is_empty());

    let metrics = proxy.get_proxy_metrics().await.expect("metrics");
    assert_eq!(metrics["limits"]["ddl_compaction"], 0.0);
    assert!(metrics["limits"]["dql_search"].is_null());
    assert!(metrics["rates"]["insert_bytes"].is_number());
    proxy.shutdown().await;
}

#[tokio::test]
async fn statistics_index_state_and_replicas() {
    let cluster = TestCluster::new(2);
    let proxy = start(&cluster).await;
    proxy
        .create_collection(create_request("books", 2))
        .await
        .expect("created");
    proxy.create_partition("books", "p1").await.expect("created");
    let id = proxy.describe_collection("books").await.expect("described").id;
    let partitions = proxy.show_partitions("books").await.expect("shown");
    let partition = |name: &str| {
        partitions
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.id)
            .expect("partition exists")
    };
    for (segment, partition, num_rows) in [
        (1, partition("_default"), 10),
        (2, partition("_default"), 5),
        (3, partition("p1"), 7),
    ] {
        cluster.storage.add_segment(SegmentInfo {
            segment_id: SegmentId(segment),
            collection_id: id,
            partition_id: partition,
            num_rows,
            state: SegmentState::Flushed,
        });
    }
    let stats = proxy.get_collection_statistics("books").await.expect("stats");
    assert_eq!(stats.row_count, 22);
    let stats = proxy
        .get_partition_statistics("books", "p1")
        .await
        .expect("stats");
    assert_eq!(stats.row_count, 7);
    let err = proxy
        .get_partition_statistics("books", "p2")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::PartitionMissing(_)), "{err}");

    proxy
        .create_index(CreateIndexRequest {
            collection_name: "books".into(),
            field_name: "v".into(),
            index_name: String::new(),
            params: [("index_type".to_owned(), "FLAT".to_owned())].into(),
        })
        .await
        .expect("index created");
    cluster.index.set_progress(
        id,
        "v",
        IndexBuildProgress {
            indexed_rows: 5,
            total_rows: 22,
        },
    );
    let state = proxy.get_index_state("books", "v").await.expect("state");
    assert_eq!(state, IndexState::InProgress);
    cluster.index.set_progress(
        id,
        "v",
        IndexBuildProgress {
            indexed_rows: 22,
            total_rows: 22,
        },
    );
    let state = proxy.get_index_state("books", "v").await.expect("state");
    assert_eq!(state, IndexState::Finished);
    let err = proxy.get_index_state("books", "").await.unwrap_err();
    assert!(matches!(err, ProxyError::InvalidRequest(_)), "{err}");

    let err = proxy.get_replicas("books").await.unwrap_err();
    assert!(matches!(err, ProxyError::Backend(_)), "{err}");
    proxy.load_collection("books", 2).await.expect("loaded");
    let replicas = proxy.get_replicas("books").await.expect("replicas");
    assert_eq!(replicas.len(), 2);
    for replica in &replicas {
        assert_eq!(replica.collection_id, id);
        assert_eq!(replica.shard_leaders.len(), 2);
        assert_eq!(replica.node_ids, vec![NodeId(1), NodeId(2)]);
    }
    assert_ne!(
        replicas[0].shard_leaders[0].1,
        replicas[1].shard_leaders[0].1
    );

    let loaded = vec![QuerySegmentInfo {
        segment_id: SegmentId(1),
        collection_id: id,
        partition_id: partition("_default"),
        num_rows: 10,
        node_ids: vec![NodeId(1), NodeId(2)],
    }];
    cluster.query.set_segments(id, loaded.clone());
    let segments = proxy.get_query_segment_info("books").await.expect("segments");
    assert_eq!(segments, loaded);
    proxy.shutdown().await;
}

#[tokio::test]
async fn roles_memberships_and_grants() {
    let cluster = TestCluster::new(1);
    let proxy = start(&cluster).await;
    let cache = &proxy.env().meta_cache;
    proxy
        .create_credential(Credential {
            username: "alice".into(),
            encrypted_password: "hash".into(),
        })
        .await
        .expect("created");

    proxy.create_role("reader").await.expect("created");
    assert!(matches!(
        proxy.create_role("reader").await,
        Err(ProxyError::Backend(_))
    ));
    assert!(matches!(
        proxy.create_role("no spaces").await,
        Err(ProxyError::InvalidRequest(_))
    ));
    assert!(matches!(
        proxy.drop_role("admin").await,
        Err(ProxyError::InvalidRequest(_))
    ));

    proxy
        .operate_user_role("alice", "reader", UserRoleOp::AddUserToRole)
        .await
        .expect("added");
    assert!(cache.user_roles("alice").contains("reader"));
    let err = proxy
        .operate_user_role("bob", "reader", UserRoleOp::AddUserToRole)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Backend(_)), "{err}");
    assert_eq!(
        proxy.select_role(Some("reader"), true).await.expect("roles"),
        vec![RoleResult {
            role: "reader".into(),
            users: vec!["alice".into()],
        }]
    );
    assert_eq!(proxy.select_role(None, false).await.expect("roles").len(), 3);
    let users = proxy.select_user(Some("alice"), true).await.expect("users");
    assert_eq!(users[0].roles, vec!["reader".to_owned()]);

    let grant = Grant {
        role: "reader".into(),
        object: GrantObject {
            object_type: "Collection".into(),
            object_name: "books".into(),
        },
        privilege: "Search".into(),
        grantor: "root".into(),
    };
    proxy
        .operate_privilege(grant.clone(), PrivilegeOp::Grant)
        .await
        .expect("granted");
    assert!(cache.user_policies("alice").contains(&grant.policy()));
    assert_eq!(
        proxy.select_grant("reader", None).await.expect("grants"),
        vec![grant.clone()]
    );
    let database = GrantObject {
        object_type: "Database".into(),
        object_name: "books".into(),
    };
    assert!(matches!(
        proxy.select_grant("reader", Some(&database)).await,
        Err(ProxyError::InvalidRequest(_))
    ));
    let anonymous = Grant {
        grantor: String::new(),
        ..grant.clone()
    };
    assert!(matches!(
        proxy.operate_privilege(anonymous, PrivilegeOp::Grant).await,
        Err(ProxyError::InvalidRequest(_))
    ));

    proxy
        .operate_privilege(grant.clone(), PrivilegeOp::Revoke)
        .await
        .expect("revoked");
    assert!(cache.user_policies("alice").is_empty());
    assert!(proxy
        .operate_privilege(grant.clone(), PrivilegeOp::Revoke)
        .await
        .is_err());

    proxy
        .operate_privilege(grant, PrivilegeOp::Grant)
        .await
        .expect("granted");
    proxy.drop_role("reader").await.expect("dropped");
    assert!(cache.user_roles("alice").is_empty());
    assert!(cache.user_policies("alice").is_empty());
    let users = proxy.select_user(Some("alice"), true).await.expect("users");
    assert!(users[0].roles.is_empty());
    proxy.shutdown().await;
}
