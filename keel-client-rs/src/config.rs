//! Client proxy configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Where requests may be routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Always contact the known leader
    LeaderOnly,
    /// Rotate across all known members
    Any,
    /// Prefer followers; used for eventual-consistency reads
    FollowersFirst,
}

/// Complete client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client identity recorded in the session
    pub client_id: String,

    /// Bootstrap server addresses; refreshed from membership responses
    pub servers: Vec<SocketAddr>,

    /// Requested session timeout
    pub session_timeout_ms: u64,

    /// Per-attempt response timeout
    pub request_timeout: Duration,

    /// Initial retry backoff
    pub backoff_initial: Duration,

    /// Backoff growth cap
    pub backoff_max: Duration,

    /// Routing strategy for eventual-consistency queries
    pub strategy: Strategy,
}

impl ClientConfig {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self {
            client_id: format!("client-{}", uuid::Uuid::new_v4()),
            servers,
            session_timeout_ms: 5000,
            request_timeout: Duration::from_millis(1000),
            backoff_initial: Duration::from_millis(25),
            backoff_max: Duration::from_millis(1000),
            strategy: Strategy::LeaderOnly,
        }
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    pub fn with_session_timeout(mut self, timeout_ms: u64) -> Self {
        self.session_timeout_ms = timeout_ms;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let addr: SocketAddr = "127.0.0.1:9990".parse().unwrap();
        let config = ClientConfig::new(vec![addr])
            .with_client_id("cli-1")
            .with_session_timeout(2000)
            .with_strategy(Strategy::Any);

        assert_eq!(config.client_id, "cli-1");
        assert_eq!(config.session_timeout_ms, 2000);
        assert_eq!(config.strategy, Strategy::Any);
        assert_eq!(config.servers, vec![addr]);
    }
}
