//! Membership changes through the log, surviving leader churn.

use keel_core::types::MemberType;
use keel_harness::{kv, TestCluster};
use std::collections::HashSet;
use std::time::{Duration, Instant};

#[tokio::test]
async fn join_survives_leader_churn() {
    let mut cluster = TestCluster::start(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("initial leader");

    let client = cluster.client().await;

    // A fresh node starts outside the configuration and joins through the
    // log
    let member = cluster.add_node("n4").await;
    let members = client.join(member.clone()).await.expect("join commits");
    assert_eq!(members.len(), 4);
    assert!(members.iter().any(|m| m.id == "n4"));

    // A second identical join is idempotent
    let members = client.join(member).await.expect("idempotent join");
    assert_eq!(members.len(), 4);

    // The joiner must hold the configuration before it is needed for quorum
    let info = client.metadata().await.expect("metadata");
    assert!(
        cluster
            .wait_for_applied("n4", info.commit_index, Duration::from_secs(10))
            .await,
        "n4 never caught up after joining"
    );

    // Churn leadership twice; the configuration must hold
    for _ in 0..2 {
        let killed = cluster
            .kill_leader(Duration::from_secs(10))
            .await
            .expect("a leader to kill");
        cluster
            .wait_for_leader(Duration::from_secs(10))
            .await
            .expect("replacement leader");
        cluster.start_node(&killed).await;
    }

    // The cluster still commits
    client.submit(kv::put("after-churn", 1)).await.expect("command");

    // Every replica converges on exactly {n1, n2, n3, n4}
    let expected: HashSet<String> = ["n1", "n2", "n3", "n4"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for id in ["n1", "n2", "n3", "n4"] {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(info) = cluster.metadata_of(id).await {
                let got: HashSet<String> =
                    info.members.iter().map(|m| m.id.clone()).collect();
                if got == expected {
                    break;
                }
            }
            assert!(
                Instant::now() < deadline,
                "{id} never converged on the four-member configuration"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[tokio::test]
async fn leave_shrinks_the_configuration() {
    let mut cluster = TestCluster::start(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("leader");

    let client = cluster.client().await;
    let members = client.leave("n3".to_string()).await.expect("leave commits");
    assert_eq!(members.len(), 2);
    assert!(!members.iter().any(|m| m.id == "n3"));

    // The removed node no longer counts toward the quorum: stopping it
    // leaves a functioning two-node cluster
    cluster.stop_node("n3").await;
    client.submit(kv::put("still-works", 1)).await.expect("command");
}

#[tokio::test]
async fn reserve_member_promotes_to_voter() {
    let mut cluster = TestCluster::start(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("leader");
    let client = cluster.client().await;

    let mut member = cluster.add_node("n4").await;
    member.member_type = MemberType::Reserve;
    let members = client.join(member).await.expect("join as reserve");
    assert!(members
        .iter()
        .any(|m| m.id == "n4" && m.member_type == MemberType::Reserve));

    let members = client
        .reconfigure("n4".to_string(), MemberType::Active)
        .await
        .expect("promotion commits");
    assert!(members
        .iter()
        .any(|m| m.id == "n4" && m.member_type == MemberType::Active));
}
