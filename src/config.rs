//! Configuration of a reconciliation node.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::{
    epoch::DEFAULT_PUBLISH_ATTEMPTS,
    keys::{NodeId, PeerId},
    rpc::RequestOpts,
    txn::PeerTrust,
    workers::PoolOpts,
};

/// Name of the optional config file in the config directory.
pub const CONFIG_FILE_NAME: &str = "recon.config.toml";

/// Prefix of environment variables overriding config values, e.g. `RECON_NODE_ID=3`.
pub const ENV_PREFIX: &str = "RECON";

/// Default port of the TCP transport.
pub const DEFAULT_PORT: u16 = 4919;

/// The configuration of a node.
#[derive(PartialEq, Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Substrate address of this node.
    pub node_id: u64,
    /// The peer this node reconciles for. Integers are numeric peer ids, anything else a
    /// named peer; `str:42` names the peer "42".
    pub peer: String,
    /// Address the TCP transport listens on.
    pub bind_addr: SocketAddr,
    /// Other members of the network.
    pub nodes: Vec<NodeAddr>,
    /// Directory of the persistent store. In memory if unset.
    pub data_dir: Option<PathBuf>,
    /// Upper bound on claim attempts when publishing one epoch.
    pub epoch_publish_attempts: usize,
    /// Request/reply settings.
    pub rpc: RpcConfig,
    /// Worker pool settings.
    pub workers: WorkersConfig,
    /// Trust conditions.
    pub trust: TrustConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            peer: "0".to_string(),
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            nodes: Vec::new(),
            data_dir: None,
            epoch_publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
            rpc: RpcConfig::default(),
            workers: WorkersConfig::default(),
            trust: TrustConfig::default(),
        }
    }
}

/// Address of another node.
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct NodeAddr {
    /// Its node id.
    pub id: u64,
    /// Where its TCP transport listens.
    pub addr: SocketAddr,
}

/// Request/reply settings, see [`RequestOpts`].
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
    /// Delay before resending a failed request, in milliseconds.
    pub retry_delay_ms: u64,
    /// Resends before giving up.
    pub max_retries: u32,
    /// Reply timeout per attempt, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        let opts = RequestOpts::default();
        Self {
            retry_delay_ms: opts.retry_delay.as_millis() as u64,
            max_retries: opts.max_retries,
            timeout_ms: opts.timeout.as_millis() as u64,
        }
    }
}

impl From<&RpcConfig> for RequestOpts {
    fn from(source: &RpcConfig) -> Self {
        Self {
            retry_delay: Duration::from_millis(source.retry_delay_ms),
            max_retries: source.max_retries,
            timeout: Duration::from_millis(source.timeout_ms),
            ..Default::default()
        }
    }
}

/// Worker pool settings, see [`PoolOpts`].
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersConfig {
    /// Workers started up front.
    pub initial: usize,
    /// Stall check interval, in milliseconds.
    pub stall_check_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let opts = PoolOpts::default();
        Self {
            initial: opts.initial_workers,
            stall_check_ms: opts.stall_check_interval.as_millis() as u64,
        }
    }
}

impl From<&WorkersConfig> for PoolOpts {
    fn from(source: &WorkersConfig) -> Self {
        Self {
            initial_workers: source.initial,
            stall_check_interval: Duration::from_millis(source.stall_check_ms),
        }
    }
}

/// Trust conditions, see [`PeerTrust`].
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct TrustConfig {
    /// Priority of peers without an entry.
    pub default_priority: i32,
    /// Per peer priorities.
    pub peers: Vec<PeerPriority>,
    /// Priority caps per relation.
    pub relations: Vec<RelationPriority>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            default_priority: 1,
            peers: Vec::new(),
            relations: Vec::new(),
        }
    }
}

/// Priority of one peer.
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PeerPriority {
    /// The peer.
    pub peer: String,
    /// Its priority.
    pub priority: i32,
}

/// Priority cap of one relation.
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RelationPriority {
    /// The relation.
    pub relation: String,
    /// The cap.
    pub priority: i32,
}

impl From<&TrustConfig> for PeerTrust {
    fn from(source: &TrustConfig) -> Self {
        let trust = source
            .peers
            .iter()
            .fold(PeerTrust::new(source.default_priority), |t, p| {
                t.with_peer(p.peer.parse::<PeerId>().unwrap_or_else(|e| match e {}), p.priority)
            });
        source
            .relations
            .iter()
            .fold(trust, |t, r| t.with_relation(r.relation.clone(), r.priority))
    }
}

impl NodeConfig {
    /// Load the config from `file`, applying `RECON_*` environment overrides.
    ///
    /// Without a file the defaults are used.
    pub async fn load(file: Option<&Path>) -> Result<NodeConfig> {
        let mut config = match file {
            Some(file) => {
                let source = tokio::fs::read_to_string(file)
                    .await
                    .with_context(|| format!("reading {}", file.display()))?;
                Self::load_toml(&source)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        debug!(?config, "loaded config");
        Ok(config)
    }

    fn load_toml(s: &str) -> Result<NodeConfig> {
        let config = toml::from_str(s)?;
        Ok(config)
    }

    /// Override fields from environment variables, looked up through `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let name = |field: &str| format!("{ENV_PREFIX}_{field}");
        if let Some(v) = var(&name("NODE_ID")) {
            self.node_id = v.parse().context("RECON_NODE_ID")?;
        }
        if let Some(v) = var(&name("PEER")) {
            self.peer = v;
        }
        if let Some(v) = var(&name("BIND_ADDR")) {
            self.bind_addr = v.parse().context("RECON_BIND_ADDR")?;
        }
        if let Some(v) = var(&name("DATA_DIR")) {
            self.data_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id)
    }

    /// The configured peer.
    pub fn peer_id(&self) -> PeerId {
        self.peer.parse().unwrap_or_else(|e| match e {})
    }

    /// Ids of all members, this node included.
    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<_> = self.nodes.iter().map(|n| NodeId(n.id)).collect();
        members.push(self.node_id());
        members.sort();
        members.dedup();
        members
    }
}

/// Paths of the `recon-node` binary.
#[cfg(feature = "cli")]
pub mod paths {
    use std::{env, path::PathBuf};

    use anyhow::{anyhow, Result};

    const ENV_CONFIG_DIR: &str = "RECON_CONFIG_DIR";
    const RECON_DIR: &str = "recon";

    /// The config directory: `$RECON_CONFIG_DIR` if set, else the platform config directory.
    pub fn config_root() -> Result<PathBuf> {
        if let Some(val) = env::var_os(ENV_CONFIG_DIR) {
            return Ok(PathBuf::from(val));
        }
        let cfg = dirs_next::config_dir().ok_or_else(|| {
            anyhow!("operating environment provides no directory for configuration")
        })?;
        Ok(cfg.join(RECON_DIR))
    }

    /// The default config file, if it exists.
    pub fn default_config_file() -> Result<Option<PathBuf>> {
        let path = config_root()?.join(super::CONFIG_FILE_NAME);
        Ok(path.exists().then_some(path))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::txn::{Transaction, TrustPolicy, Update};

    #[test]
    fn invalid_field() {
        let res = NodeConfig::load_toml("not_a_field = true");
        assert!(res.is_err());
    }

    #[test]
    fn full_config() -> Result<()> {
        let source = r#"
            node_id = 2
            peer = "hub"
            bind_addr = "0.0.0.0:5000"
            epoch_publish_attempts = 16

            [[nodes]]
            id = 1
            addr = "10.0.0.1:4919"

            [rpc]
            max_retries = 7

            [workers]
            initial = 2

            [trust]
            default_priority = 0
            peers = [{ peer = "7", priority = 5 }, { peer = "str:7", priority = 2 }]
            relations = [{ relation = "secret", priority = -1 }]
        "#;
        let config = NodeConfig::load_toml(source)?;
        assert_eq!(config.peer_id(), PeerId::from("hub"));
        assert_eq!(config.members(), vec![NodeId(1), NodeId(2)]);
        assert_eq!(config.epoch_publish_attempts, 16);

        let opts = RequestOpts::from(&config.rpc);
        assert_eq!(opts.max_retries, 7);
        assert_eq!(opts.timeout, RequestOpts::default().timeout);
        assert_eq!(PoolOpts::from(&config.workers).initial_workers, 2);

        let trust = PeerTrust::from(&config.trust);
        let txn = Transaction::new(
            crate::keys::TxnId::new(7, 0),
            vec![Update::put("r", "k", "v")],
        );
        assert_eq!(trust.priority(&txn), 5);
        let named = Transaction::new(
            crate::keys::TxnId::new("7", 0),
            vec![Update::put("r", "k", "v")],
        );
        assert_eq!(trust.priority(&named), 2);
        Ok(())
    }

    #[test]
    fn env_overrides() -> Result<()> {
        let env = HashMap::from([
            ("RECON_NODE_ID", "9"),
            ("RECON_BIND_ADDR", "127.0.0.1:1"),
        ]);
        let mut config = NodeConfig::default();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()))?;
        assert_eq!(config.node_id(), NodeId(9));
        assert_eq!(config.bind_addr.port(), 1);

        let bad = HashMap::from([("RECON_NODE_ID", "nine")]);
        assert!(config
            .apply_env(|name| bad.get(name).map(|v| v.to_string()))
            .is_err());
        Ok(())
    }
}
