//! Single-node cluster: election, commit and both read paths.

use keel_core::message::Consistency;
use keel_harness::{kv, TestCluster};
use std::time::Duration;

#[tokio::test]
async fn single_node_commits_and_applies() {
    let cluster = TestCluster::start(1).await;

    let (leader, term) = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a single node elects itself");
    assert_eq!(leader, "n1");
    assert!(term >= 1);

    let client = cluster.client().await;
    let result = client.submit(kv::put("k", "v")).await.expect("command commits");
    assert_eq!(result, b"ok".to_vec());

    // The log holds at least initialize(1), open-session(2) and the
    // command(3), all applied
    let info = client.metadata().await.expect("metadata");
    assert!(info.applied_index >= 3);
    assert_eq!(info.commit_index, info.applied_index);
    assert_eq!(info.leader.as_deref(), Some("n1"));

    let got = client
        .query(kv::get("k"), Consistency::Sequential)
        .await
        .expect("sequential query");
    assert_eq!(got, b"\"v\"".to_vec());

    // The linearizable path routes through the log and agrees
    let got = client
        .query(kv::get("k"), Consistency::Linearizable)
        .await
        .expect("linearizable query");
    assert_eq!(got, b"\"v\"".to_vec());
}

#[tokio::test]
async fn single_node_state_survives_restart() {
    let mut cluster = TestCluster::start(1).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    {
        let client = cluster.client().await;
        client.submit(kv::put("persisted", 42)).await.expect("command");
    }

    cluster.stop_node("n1").await;
    cluster.start_node("n1").await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("re-elected after restart");

    let client = cluster.client().await;
    let got = client
        .query(kv::get("persisted"), Consistency::Sequential)
        .await
        .expect("query after restart");
    assert_eq!(got, b"42".to_vec());
}
