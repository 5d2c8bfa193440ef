//! Keel client proxy.
//!
//! Opens a session against a keel cluster and submits linearizable commands
//! and consistency-tiered queries. Commands carry a per-session sequence
//! number so network retries apply exactly once; keep-alives renew the
//! session lease at a quarter of the timeout and acknowledge received
//! responses and events. Routing follows the configured communication
//! strategy with exponential backoff capped at the session timeout.

pub mod client;
pub mod config;

pub use client::{ClientError, ClusterInfo, KeelClient};
pub use config::{ClientConfig, Strategy};
