//! Session semantics over the wire: exactly-once commands, deterministic
//! expiration and event publication.

use keel_core::error::ErrorKind;
use keel_core::message::{ClientRequest, ClientResponse};
use keel_harness::{kv, query_at, request_at, TestCluster};
use std::time::Duration;

async fn open_session(addr: std::net::SocketAddr, timeout_ms: u64) -> u64 {
    let response = request_at(
        addr,
        ClientRequest::OpenSession {
            client: "raw-test".to_string(),
            timeout_ms,
        },
        Duration::from_secs(2),
    )
    .await
    .expect("open-session response");
    match response {
        ClientResponse::SessionOpened { session, .. } => session,
        other => panic!("unexpected open-session response: {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_command_applies_exactly_once() {
    let cluster = TestCluster::start(1).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");
    let addr = cluster.address_of("n1").expect("address");

    let session = open_session(addr, 60_000).await;

    // The same (session, sequence) pair delivered twice, as a network
    // retry would
    let command = ClientRequest::Command {
        session,
        sequence: 7,
        operation: kv::incr("counter"),
    };
    let first = request_at(addr, command.clone(), Duration::from_secs(2))
        .await
        .expect("first delivery");
    let second = request_at(addr, command, Duration::from_secs(2))
        .await
        .expect("second delivery");

    let (v1, v2) = match (first, second) {
        (
            ClientResponse::CommandResult { result: a, .. },
            ClientResponse::CommandResult { result: b, .. },
        ) => (a, b),
        other => panic!("unexpected responses: {other:?}"),
    };

    // Both replies carry the same result and the counter moved once
    assert_eq!(v1, b"1".to_vec());
    assert_eq!(v1, v2);
    let got = query_at(addr, kv::get("counter")).await.expect("query");
    assert_eq!(got, b"1".to_vec());
}

#[tokio::test]
async fn session_expires_without_keep_alives() {
    let cluster = TestCluster::start(1).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");
    let addr = cluster.address_of("n1").expect("address");

    // 1s lease, never renewed
    let session = open_session(addr, 1000).await;

    // Works while the lease is fresh
    let response = request_at(
        addr,
        ClientRequest::Command {
            session,
            sequence: 1,
            operation: kv::incr("x"),
        },
        Duration::from_secs(2),
    )
    .await
    .expect("command inside the lease");
    assert!(matches!(response, ClientResponse::CommandResult { .. }));

    tokio::time::sleep(Duration::from_millis(1300)).await;

    // A later entry carries a timestamp past the lease and expires the
    // session on every replica; its commands are rejected terminally
    open_session(addr, 60_000).await;

    let response = request_at(
        addr,
        ClientRequest::Command {
            session,
            sequence: 2,
            operation: kv::incr("x"),
        },
        Duration::from_secs(2),
    )
    .await
    .expect("command after expiry");
    match response {
        ClientResponse::Error { error } => assert_eq!(error.kind, ErrorKind::UnknownSession),
        other => panic!("expected an unknown-session rejection, got {other:?}"),
    }

    // The failed attempt did not touch the state machine
    let got = query_at(addr, kv::get("x")).await.expect("query");
    assert_eq!(got, b"1".to_vec());
}

#[tokio::test]
async fn published_events_reach_watching_sessions() {
    let cluster = TestCluster::start(1).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    let watcher = cluster.client().await;
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<(u64, Vec<u8>)>(8);
    watcher
        .on_event(move |index, payload| {
            let _ = event_tx.try_send((index, payload));
        })
        .await
        .expect("subscribe");
    watcher.submit(kv::watch()).await.expect("watch registers");

    let writer = cluster.client().await;
    writer.submit(kv::put("color", "blue")).await.expect("put");

    let (index, payload) = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("event arrives")
        .expect("channel open");
    assert_eq!(index, 1);
    let event: serde_json::Value = serde_json::from_slice(&payload).expect("event payload");
    assert_eq!(event["key"], "color");
    assert_eq!(event["value"], "blue");

    // Event indexes grow per session
    writer.submit(kv::put("color", "red")).await.expect("put");
    let (index, _) = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("second event")
        .expect("channel open");
    assert_eq!(index, 2);
}
