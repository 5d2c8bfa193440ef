//! Keel test harness.
//!
//! In-process clusters of real keel servers on loopback UDP, plus the
//! key-value state machine the end-to-end suites drive.

pub mod cluster;
pub mod kv;

pub use cluster::{init_tracing, query_at, request_at, TestCluster, TestNode};
pub use kv::KvMachine;
