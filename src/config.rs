//! Typed configuration surface: `clap`-derived flags that also accept
//! the environment variable names §6 names.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClusterMode {
    Dynamic,
    Static,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "ward-node", about = "Emergency-ward distributed coordination node")]
pub struct NodeConfig {
    /// Externally supplied node id. If omitted, the identity binder searches
    /// for a free candidate starting at 1.
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<u32>,

    #[arg(long, env = "CLUSTER_MODE", value_enum, default_value = "dynamic")]
    pub cluster_mode: ClusterMode,

    #[arg(long, env = "MULTICAST_GROUP", default_value = "224.0.0.100")]
    pub multicast_group: String,

    #[arg(long, env = "MULTICAST_PORT", default_value_t = 5005)]
    pub multicast_port: u16,

    #[arg(long, env = "DISCOVERY_ANNOUNCE_INTERVAL", default_value_t = 5)]
    pub discovery_announce_interval_secs: u64,

    #[arg(long, env = "DISCOVERY_NODE_TIMEOUT", default_value_t = 15)]
    pub discovery_node_timeout_secs: u64,

    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 5)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "NODE_TIMEOUT", default_value_t = 15)]
    pub node_timeout_secs: u64,

    #[arg(long, default_value_t = 5555)]
    pub base_tcp_port: u16,

    #[arg(long, default_value_t = 6000)]
    pub base_udp_port: u16,

    #[arg(long, default_value_t = 1)]
    pub identity_start_id: u32,

    #[arg(long, default_value_t = 100)]
    pub identity_max_attempts: u32,

    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl NodeConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_announce_interval_secs)
    }

    pub fn discovery_node_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_node_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn store_path(&self, node_id: u32) -> PathBuf {
        self.data_dir.join(format!("emergency_sala{node_id}.db"))
    }

    pub fn id_store_dir(&self) -> PathBuf {
        self.data_dir.join("node_ids")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_match_spec_environment_keys() {
        let config = NodeConfig::parse_from(["ward-node"]);
        assert_eq!(config.cluster_mode, ClusterMode::Dynamic);
        assert_eq!(config.multicast_group, "224.0.0.100");
        assert_eq!(config.multicast_port, 5005);
        assert_eq!(config.discovery_announce_interval_secs, 5);
        assert_eq!(config.discovery_node_timeout_secs, 15);
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.node_timeout_secs, 15);
        assert!(config.node_id.is_none());
    }

    #[test]
    fn derived_paths_are_scoped_by_node_id() {
        let config = NodeConfig::parse_from(["ward-node", "--data-dir", "/tmp/ward"]);
        assert_eq!(config.store_path(7), PathBuf::from("/tmp/ward/emergency_sala7.db"));
        assert_eq!(config.id_store_dir(), PathBuf::from("/tmp/ward/node_ids"));
    }

    #[test]
    fn node_id_env_override_is_parsed() {
        let config = NodeConfig::parse_from(["ward-node", "--node-id", "42"]);
        assert_eq!(config.node_id, Some(42));
    }
}
