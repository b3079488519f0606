use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context};
use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;

use crate::raft::RaftConfig;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: u64,
    pub addr: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub id: u64,
    /// gRPC listen address for both the raft and kv services
    pub addr: String,
    pub metrics_addr: String,
    /// Directory of the durable raft record
    pub base_path: String,
    pub heartbeat_ms: u64,
    pub rpc_timeout_ms: u64,
    /// Snapshot once the raft record grows past this many bytes; 0 disables
    pub max_raft_state: u64,
    pub request_timeout_ms: u64,
    pub node_list: Vec<NodeConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            addr: "0.0.0.0:4001".to_string(),
            metrics_addr: "0.0.0.0:4011".to_string(),
            base_path: "./data".to_string(),
            heartbeat_ms: 100,
            rpc_timeout_ms: 200,
            max_raft_state: 1 << 20,
            request_timeout_ms: 2000,
            node_list: vec![NodeConfig {
                id: 1,
                addr: "127.0.0.1:4001".to_string(),
            }],
        }
    }

    /// Load `path` and install it as the process-wide instance.
    ///
    /// A missing file falls back to the defaults; a file that does not parse
    /// or validate is an error.
    pub fn from_toml(path: &str) -> anyhow::Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents)
                .with_context(|| format!("invalid runtime config file {}", path))?,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file {}, using defaults, {:?}",
                    path, e
                );
                RuntimeConfig::new()
            }
        };
        config.validate()?;
        *instance()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config.clone();
        Ok(config)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_ms == 0 {
            bail!("heartbeat_ms must be positive");
        }
        let mut seen = HashSet::new();
        for node in &self.node_list {
            if node.id == 0 {
                bail!("node id 0 is reserved");
            }
            if !seen.insert(node.id) {
                bail!("node id {} listed twice", node.id);
            }
        }
        if !seen.contains(&self.id) {
            bail!("node id {} is missing from node_list", self.id);
        }
        Ok(())
    }

    pub fn raft_config(&self) -> RaftConfig {
        let mut config = RaftConfig::from_heartbeat(Duration::from_millis(self.heartbeat_ms));
        if self.rpc_timeout_ms > 0 {
            config.rpc_timeout = Duration::from_millis(self.rpc_timeout_ms);
        }
        config
    }

    pub fn peer_ids(&self) -> Vec<u64> {
        self.node_list.iter().map(|n| n.id).collect()
    }

    /// Addresses of every other node
    pub fn peer_addrs(&self) -> HashMap<u64, String> {
        self.node_list
            .iter()
            .filter(|n| n.id != self.id)
            .map(|n| (n.id, n.addr.clone()))
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_NODES: &str = r#"
        id = 2
        addr = "0.0.0.0:4002"
        metrics_addr = "0.0.0.0:4012"
        base_path = "/tmp/kvraft-2"
        heartbeat_ms = 50
        max_raft_state = 4096

        [[node_list]]
        id = 1
        addr = "127.0.0.1:4001"

        [[node_list]]
        id = 2
        addr = "127.0.0.1:4002"

        [[node_list]]
        id = 3
        addr = "127.0.0.1:4003"
    "#;

    #[test]
    fn test_parse_fills_defaults() {
        let config = RuntimeConfig::parse(THREE_NODES).unwrap();
        config.validate().unwrap();
        assert_eq!(config.id, 2);
        assert_eq!(config.max_raft_state, 4096);
        assert_eq!(config.request_timeout_ms, 2000);
        assert_eq!(config.peer_ids(), vec![1, 2, 3]);

        let addrs = config.peer_addrs();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[&3], "127.0.0.1:4003");

        let raft = config.raft_config();
        assert_eq!(raft.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(raft.election_timeout_min, Duration::from_millis(100));
        assert_eq!(raft.election_timeout_max, Duration::from_millis(200));
        assert_eq!(raft.rpc_timeout, Duration::from_millis(200));
    }

    #[test]
    fn test_validate_rejects_bad_membership() {
        let mut config = RuntimeConfig::parse(THREE_NODES).unwrap();
        config.id = 9;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::parse(THREE_NODES).unwrap();
        config.node_list.push(NodeConfig {
            id: 1,
            addr: "127.0.0.1:5001".to_string(),
        });
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::new();
        config.heartbeat_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = RuntimeConfig::from_toml("/nonexistent/kvraft.toml").unwrap();
        assert_eq!(config.id, 1);
        assert_eq!(instance().lock().unwrap().addr, config.addr);
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "id = \"not a number\"").unwrap();
        assert!(RuntimeConfig::from_toml(path.to_str().unwrap()).is_err());
    }
}
