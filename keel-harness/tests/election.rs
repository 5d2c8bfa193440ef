//! Three-node failover: a new leader emerges with a strictly higher term
//! and committed entries survive.

use keel_core::message::Consistency;
use keel_harness::{kv, query_at, TestCluster};
use std::time::Duration;

#[tokio::test]
async fn leader_failover_preserves_committed_entries() {
    let mut cluster = TestCluster::start(3).await;

    let (leader1, term1) = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("initial leader");

    let client = cluster.client().await;
    client
        .submit(kv::put("stable", "value"))
        .await
        .expect("command commits with all nodes up");

    cluster.stop_node(&leader1).await;

    let (leader2, term2) = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("replacement leader within the election window");
    assert_ne!(leader1, leader2);
    assert!(term2 > term1, "term did not grow: {term1} -> {term2}");

    // The committed entry survives the failover; the proxy re-routes to the
    // new leader transparently
    let got = client
        .query(kv::get("stable"), Consistency::Sequential)
        .await
        .expect("query against the new leader");
    assert_eq!(got, b"\"value\"".to_vec());
}

#[tokio::test]
async fn replicas_apply_identical_state() {
    let cluster = TestCluster::start(3).await;
    let (leader, _) = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("leader");

    let client = cluster.client().await;
    for i in 0..10 {
        client
            .submit(kv::put(&format!("key{i}"), i as i64))
            .await
            .expect("command");
    }

    let leader_info = cluster.metadata_of(&leader).await.expect("leader metadata");

    // Every replica converges to the leader's applied state
    for id in cluster.node_ids() {
        assert!(
            cluster
                .wait_for_applied(&id, leader_info.commit_index, Duration::from_secs(10))
                .await,
            "{id} never caught up to index {}",
            leader_info.commit_index
        );
        let addr = cluster.address_of(&id).expect("address");
        for i in [0, 4, 9] {
            let got = query_at(addr, kv::get(&format!("key{i}")))
                .await
                .expect("direct query");
            assert_eq!(got, format!("{i}").into_bytes(), "divergence at {id} key{i}");
        }
    }
}
