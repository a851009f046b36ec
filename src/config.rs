//! Connection and session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_NAMESPACE;

/// Configuration for a [`Connection`](crate::Connection).
///
/// All durations have defaults matching the reference deployment: a 10 second
/// heartbeat, a 30 minute lease TTL, and session lengths derived from the TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Redis server URLs (ignored when a store is injected directly)
    pub hosts: Vec<String>,

    /// Interval between heartbeats
    pub heartbeat_interval: Duration,

    /// Lease TTL for locks and per-resource counters
    pub ttl: Duration,

    /// Sleep between lock acquisition attempts
    pub retry_interval: Duration,

    /// Total time a blocking lock acquisition may wait
    pub blocking_timeout: Duration,

    /// Age after which a nodelist entry is considered expired.
    /// Defaults to half the TTL.
    pub session_length: Duration,

    /// Whether the heartbeat loop reclaims references from failed peers
    pub recover_failed_processes: bool,

    /// Namespace prefix for all shared-store keys
    pub namespace: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let ttl = Duration::from_secs(1800);
        Self {
            hosts: vec!["redis://localhost:6379".to_string()],
            heartbeat_interval: Duration::from_secs(10),
            ttl,
            retry_interval: Duration::from_millis(500),
            blocking_timeout: Duration::from_secs(500),
            session_length: ttl / 2,
            recover_failed_processes: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Threshold after which a peer with no heartbeat is considered failed.
    ///
    /// Three missed heartbeats. A node that beats again before reclamation
    /// cancels its failed state.
    pub fn failure_threshold(&self) -> Duration {
        self.heartbeat_interval * 3
    }

    /// Default soft session length for updates (TTL / 2).
    pub fn soft_session(&self) -> Duration {
        self.ttl / 2
    }

    /// Default hard session length for updates (the full TTL).
    pub fn hard_session(&self) -> Duration {
        self.ttl
    }
}
