//! Library configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration shared by hubs, pumps and pipes.
///
/// The host application owns loading; this crate only defines the shape
/// and the defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rpc: RpcConfig,
    pub raft: RaftConfig,
    pub limits: Limits,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// How long a correlated call waits for its reply before failing.
    pub call_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 60_000,
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Pause between election attempts while a candidate.
    pub election_interval_ms: u64,
    /// Pause between heartbeats while the leader.
    pub heartbeat_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_interval_ms: 5_000,
            heartbeat_interval_ms: 3_000,
        }
    }
}

impl RaftConfig {
    pub fn election_interval(&self) -> Duration {
        Duration::from_millis(self.election_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Registry caps enforced by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_pumps: usize,
    pub max_pipes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_pumps: 256,
            max_pipes: 1024,
        }
    }
}
