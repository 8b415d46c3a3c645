//! In-process development cluster.
//!
//! Runs a full committee inside one process. Every node has its own chain
//! and in-memory consensus database; they reach each other through
//! [`MemoryNetwork`], which resolves `memory://<name>` node URLs and
//! connects handlers with channel-backed sessions.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use dposbft_config::{Config, GenesisConfig};
use dposbft_consensus::types::now_ms;
use dposbft_consensus::{ChannelSession, Handler, PeerServer, ProtocolError};
use dposbft_crypto::PrivateKey;
use dposbft_types::Address;

use crate::node::{Node, NodeOptions};

const URL_SCHEME: &str = "memory://";

/// Name of dev node `index` (1-based).
pub fn node_name(index: u8) -> String {
    format!("node{index}")
}

/// Deterministic key of dev node `index` (1-based).
pub fn dev_key(index: u8) -> Result<PrivateKey> {
    Ok(PrivateKey::from_bytes(&[index; 32])?)
}

/// Configuration of an `nodes`-member dev committee on top of `base`.
///
/// The committee size must be `3f + 1`; every member proposes, validates
/// and campaigns.
pub fn dev_config(base: &Config, nodes: u8) -> Result<Config> {
    if nodes == 0 || (nodes - 1) % 3 != 0 {
        bail!("a dev committee needs 3f + 1 members, got {nodes}");
    }

    let mut members = Vec::with_capacity(nodes as usize);
    let mut validator_nodes = std::collections::BTreeMap::new();
    for index in 1..=nodes {
        let address = dev_key(index)?.address();
        members.push(address);
        validator_nodes.insert(address, format!("{URL_SCHEME}{}", node_name(index)));
    }

    let mut config = base.clone();
    config.dpos.faulty_number = u64::from((nodes - 1) / 3);
    config.dpos.term_len = u64::from(nodes);
    config.dpos.low_rpt_seats = config.dpos.low_rpt_seats.min(nodes as usize);
    config.genesis = GenesisConfig {
        timestamp_ms: now_ms(),
        proposers: members.clone(),
        validators: members.clone(),
        candidates: members,
        ..base.genesis.clone()
    };
    config.network.validator_nodes = validator_nodes;
    config.validate()?;
    Ok(config)
}

/// Registry of the handlers in one process.
#[derive(Default)]
pub struct MemoryNetwork {
    handlers: RwLock<HashMap<String, Arc<Handler>>>,
    links: Mutex<HashSet<(String, String)>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `handler` reachable as `name`.
    pub fn register(&self, name: &str, handler: Arc<Handler>) {
        self.handlers.write().insert(name.to_string(), handler);
    }

    /// Peer server for the node registered as `name`.
    pub fn server(self: &Arc<Self>, name: &str) -> Arc<dyn PeerServer> {
        Arc::new(MemoryPeerServer {
            name: name.to_string(),
            network: self.clone(),
        })
    }

    fn link_key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    /// Connect `from` to `to` unless they are already linked.
    pub fn connect(self: &Arc<Self>, from: &str, to: &str) -> Result<(), ProtocolError> {
        let (local, remote) = {
            let handlers = self.handlers.read();
            match (handlers.get(from), handlers.get(to)) {
                (Some(local), Some(remote)) => (local.clone(), remote.clone()),
                _ => return Err(ProtocolError::Disconnected),
            }
        };

        let key = Self::link_key(from, to);
        if !self.links.lock().insert(key.clone()) {
            return Ok(());
        }
        debug!(from, to, "linking dev nodes");

        let (to_remote, to_local) = ChannelSession::pair(from, to);
        let network = self.clone();
        tokio::spawn(async move {
            let (a, b) = tokio::join!(
                local.serve_peer(Arc::new(to_remote)),
                remote.serve_peer(Arc::new(to_local)),
            );
            debug!(link = ?key, local = ?a.err(), remote = ?b.err(), "dev link closed");
            network.links.lock().remove(&key);
        });
        Ok(())
    }

    /// Forget the link between `a` and `b`.
    pub fn disconnect(&self, a: &str, b: &str) {
        self.links.lock().remove(&Self::link_key(a, b));
    }
}

struct MemoryPeerServer {
    name: String,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl PeerServer for MemoryPeerServer {
    async fn add_peer(&self, url: &str) -> Result<(), ProtocolError> {
        let remote = url.strip_prefix(URL_SCHEME).ok_or(ProtocolError::Disconnected)?;
        self.network.connect(&self.name, remote)
    }

    async fn remove_peer(&self, url: &str) {
        if let Some(remote) = url.strip_prefix(URL_SCHEME) {
            self.network.disconnect(&self.name, remote);
        }
    }
}

/// A dev committee running in one process.
pub struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    /// Build a committee of `size` nodes from `base`.
    pub fn new(base: &Config, size: u8) -> Result<Self> {
        let config = dev_config(base, size)?;
        let network = MemoryNetwork::new();

        let mut nodes = Vec::with_capacity(size as usize);
        for index in 1..=size {
            let node = Node::in_memory(
                config.clone(),
                NodeOptions {
                    key: Some(dev_key(index)?),
                    miner: true,
                    validator: true,
                },
            )?;
            let name = node_name(index);
            network.register(&name, node.handler().clone());
            node.set_peer_server(network.server(&name));
            nodes.push(node);
        }

        Ok(Self { nodes })
    }

    /// Member nodes, in key order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Committee member addresses.
    pub fn addresses(&self) -> Vec<Address> {
        self.nodes.iter().map(|n| n.dpos().coinbase()).collect()
    }

    /// Start every node.
    pub fn start(&mut self) {
        for node in &mut self.nodes {
            node.start();
        }
        info!(nodes = self.nodes.len(), "Dev cluster started");
    }

    /// Stop every node.
    pub async fn shutdown(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.shutdown().await?;
        }
        Ok(())
    }

    /// Run until Ctrl+C.
    pub async fn run(&mut self) -> Result<()> {
        self.start();
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, stopping dev cluster");
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast() -> Config {
        let mut config = Config::default();
        config.dpos.period_ms = 300;
        config.network.keep_connection_interval_ms = 50;
        config
    }

    #[test]
    fn test_dev_config_sizes() {
        assert!(dev_config(&Config::default(), 2).is_err());
        assert!(dev_config(&Config::default(), 0).is_err());

        let config = dev_config(&Config::default(), 4).unwrap();
        assert_eq!(config.dpos.faulty_number, 1);
        assert_eq!(config.genesis.validators.len(), 4);
        assert_eq!(
            config.network.validator_nodes.values().next().map(String::as_str),
            Some("memory://node1")
        );

        let solo = dev_config(&Config::default(), 1).unwrap();
        assert_eq!(solo.dpos.faulty_number, 0);
        assert_eq!(solo.dpos.term_len, 1);
    }

    #[tokio::test]
    async fn test_unknown_node_url() {
        let network = MemoryNetwork::new();
        let server = network.server("node1");
        assert!(server.add_peer("tcp://node2").await.is_err());
        assert!(server.add_peer("memory://node2").await.is_err());
    }

    #[tokio::test]
    async fn test_cluster_finalizes_blocks() {
        let mut cluster = Cluster::new(&fast(), 4).unwrap();
        cluster.start();

        let mut heads: Vec<_> = cluster
            .nodes()
            .iter()
            .map(|n| n.handler().subscribe_head())
            .collect();
        for head in &mut heads {
            tokio::time::timeout(Duration::from_secs(30), head.wait_for(|bi| bi.number >= 3))
                .await
                .expect("cluster makes progress")
                .unwrap();
        }

        let first = &cluster.nodes()[0];
        let block = first.dpos().get_block_from_chain(&first.head().hash(), first.head().number);
        assert!(block.is_some());
        // finality needs at least 2f remote validators on every node
        for node in cluster.nodes() {
            assert!(node.handler().peer_infos().len() >= 2);
        }

        cluster.shutdown().await.unwrap();
    }
}
