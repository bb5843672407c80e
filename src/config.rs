// src/config.rs

//! Loads and validates the coordinator's TOML configuration: the
//! `[coordinator]` identity/paths section, the `[tunables]` timing section,
//! and the `[[nodes]]` seed node map.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::model::{NodeEntry, NodeFlags, NodeMap, Pnn};

fn default_recover_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_election_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_fast_start_election_timeout() -> Duration {
    Duration::from_millis(500)
}
fn default_recover_timeout() -> Duration {
    Duration::from_secs(20)
}
fn default_ban_period() -> Duration {
    Duration::from_secs(300)
}
fn default_rerecovery_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_grace_period() -> Duration {
    Duration::from_secs(60)
}
fn default_keepalive_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_takeover_disable_seconds() -> u64 {
    0
}
fn default_log_level() -> String {
    "info,recoverd::core=debug".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// This node's physical node number.
    pub pnn: Pnn,
    /// Path to the file enumerating every node in the cluster.
    pub nodes_file: PathBuf,
    /// Path to the shared recovery lock file. Omit for single-node or test
    /// deployments, where the null lock is used.
    #[serde(default)]
    pub recovery_lock_file: Option<PathBuf>,
    /// Directory for the coordinator's own working recovery database.
    pub state_dir: PathBuf,
    /// Path to the external recovery helper binary. Omit to always use the
    /// in-process pull/merge/push path, even when every node advertises
    /// `PARALLEL_RECOVERY`.
    #[serde(default)]
    pub recovery_helper_path: Option<PathBuf>,
    /// Address this node's Control RPC listener binds.
    pub listen_addr: SocketAddr,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunablesSection {
    #[serde(default = "default_recover_interval", with = "humantime_serde")]
    pub recover_interval: Duration,
    #[serde(default = "default_election_timeout", with = "humantime_serde")]
    pub election_timeout: Duration,
    #[serde(default = "default_fast_start_election_timeout", with = "humantime_serde")]
    pub fast_start_election_timeout: Duration,
    #[serde(default = "default_recover_timeout", with = "humantime_serde")]
    pub recover_timeout: Duration,
    #[serde(default = "default_ban_period", with = "humantime_serde")]
    pub ban_period: Duration,
    #[serde(default = "default_rerecovery_timeout", with = "humantime_serde")]
    pub rerecovery_timeout: Duration,
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
    #[serde(default = "default_keepalive_interval", with = "humantime_serde")]
    pub keepalive_interval: Duration,
    /// Whether persistent databases may use the highest-seqnum shortcut
    /// during recovery instead of a full pull/merge.
    #[serde(default = "default_true")]
    pub recover_by_seqnum: bool,
    #[serde(default = "default_takeover_disable_seconds")]
    pub takeover_disable_seconds: u64,
}

fn default_true() -> bool {
    true
}

impl Default for TunablesSection {
    fn default() -> Self {
        Self {
            recover_interval: default_recover_interval(),
            election_timeout: default_election_timeout(),
            fast_start_election_timeout: default_fast_start_election_timeout(),
            recover_timeout: default_recover_timeout(),
            ban_period: default_ban_period(),
            rerecovery_timeout: default_rerecovery_timeout(),
            grace_period: default_grace_period(),
            keepalive_interval: default_keepalive_interval(),
            recover_by_seqnum: true,
            takeover_disable_seconds: default_takeover_disable_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedNode {
    pub pnn: Pnn,
    pub address: SocketAddr,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub tunables: TunablesSection,
    #[serde(default, rename = "nodes")]
    pub seed_nodes: Vec<SeedNode>,
}

impl Config {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.seed_nodes.iter().all(|n| n.pnn != self.coordinator.pnn) {
            anyhow::bail!(
                "coordinator.pnn {} does not appear in the [[nodes]] seed list",
                self.coordinator.pnn
            );
        }
        Ok(())
    }

    /// Builds the initial node map from the seed node list. Seeds marked
    /// `deleted` carry the `DELETED` flag so they are never counted toward
    /// quorum or election eligibility.
    pub fn initial_node_map(&self) -> NodeMap {
        NodeMap {
            nodes: self
                .seed_nodes
                .iter()
                .map(|n| NodeEntry {
                    pnn: n.pnn,
                    flags: if n.deleted { NodeFlags::DELETED } else { NodeFlags::empty() },
                    address: n.address,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            [coordinator]
            pnn = 0
            nodes_file = "/etc/recoverd/nodes"
            state_dir = "/var/lib/recoverd"
            recovery_helper_path = "/usr/libexec/recoverd-helper"
            listen_addr = "127.0.0.1:4379"

            [[nodes]]
            pnn = 0
            address = "127.0.0.1:4379"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.coordinator.pnn, 0);
        assert_eq!(config.tunables.recover_interval, Duration::from_secs(1));
        assert!(config.tunables.recover_by_seqnum);
    }

    #[test]
    fn rejects_pnn_not_in_seed_list() {
        let toml = r#"
            [coordinator]
            pnn = 9
            nodes_file = "/etc/recoverd/nodes"
            state_dir = "/var/lib/recoverd"
            recovery_helper_path = "/usr/libexec/recoverd-helper"
            listen_addr = "127.0.0.1:4379"

            [[nodes]]
            pnn = 0
            address = "127.0.0.1:4379"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn deleted_seed_node_carries_deleted_flag() {
        let toml = r#"
            [coordinator]
            pnn = 0
            nodes_file = "/etc/recoverd/nodes"
            state_dir = "/var/lib/recoverd"
            recovery_helper_path = "/usr/libexec/recoverd-helper"
            listen_addr = "127.0.0.1:4379"

            [[nodes]]
            pnn = 0
            address = "127.0.0.1:4379"

            [[nodes]]
            pnn = 1
            address = "127.0.0.1:4380"
            deleted = true
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let map = config.initial_node_map();
        assert!(map.get(1).unwrap().flags.contains(NodeFlags::DELETED));
    }
}
