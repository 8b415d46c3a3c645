//! # DPoS-BFT Node
//!
//! The `Node` struct wires one consensus engine to its collaborators:
//! - the consensus database (RocksDB, or memory for the dev cluster)
//! - the local chain, seeded from the configured genesis
//! - the signing key and the miner/validator roles
//! - the protocol handler and its background loops
//! - the block producer loop
//!
//! Transaction execution belongs to the embedding client. The node only
//! credits block rewards when it finalizes its own blocks.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dposbft_config::Config;
use dposbft_consensus::types::stopped;
use dposbft_consensus::{
    ChainReader, Dpos, Handler, KeySigner, MemoryChain, MemoryState, PeerServer, RptCollector,
    StaticCandidates,
};
use dposbft_crypto::PrivateKey;
use dposbft_storage::{Database, DatabaseConfig, KeyValueStore, MemoryDatabase};
use dposbft_types::{Block, BlockIdentifier, Header};

/// How long shutdown waits for the block producer.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Node lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Components are being created
    Starting,
    /// Handler and producer are running
    Running,
    /// Shutdown in progress
    ShuttingDown,
    /// All components stopped
    Stopped,
}

/// Roles and identity of a node.
#[derive(Clone, Default)]
pub struct NodeOptions {
    /// Signing key; without one the node only follows the chain
    pub key: Option<PrivateKey>,
    /// Produce blocks in the proposer slots of this key
    pub miner: bool,
    /// Sign prepare and commit messages as a validator
    pub validator: bool,
}

/// A consensus node.
pub struct Node {
    status: Arc<RwLock<NodeStatus>>,
    database: Option<Arc<Database>>,
    chain: Arc<MemoryChain>,
    dpos: Arc<Dpos>,
    handler: Arc<Handler>,
    shutdown_tx: watch::Sender<bool>,
    producer: Option<JoinHandle<()>>,
}

impl Node {
    /// Create a node backed by the RocksDB database under `storage.data_dir`.
    pub fn new(config: Config, options: NodeOptions) -> Result<Self> {
        let database = Arc::new(Self::init_database(&config)?);
        let store: Arc<dyn KeyValueStore> = database.clone();
        Self::build(config, options, store, Some(database))
    }

    /// Create a node whose consensus records live in memory.
    pub fn in_memory(config: Config, options: NodeOptions) -> Result<Self> {
        Self::build(config, options, Arc::new(MemoryDatabase::new()), None)
    }

    fn init_database(config: &Config) -> Result<Database> {
        let path = Path::new(&config.storage.data_dir).join("consensus");
        info!(path = %path.display(), "Initializing consensus database");

        let db_config = DatabaseConfig {
            path: path.to_string_lossy().to_string(),
            enable_compression: config.storage.enable_compression,
            ..Default::default()
        };
        Database::open(db_config).map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))
    }

    fn build(
        config: Config,
        options: NodeOptions,
        store: Arc<dyn KeyValueStore>,
        database: Option<Arc<Database>>,
    ) -> Result<Self> {
        info!("Initializing DPoS-BFT node");

        let genesis = Block::with_header(config.genesis.header());
        info!(hash = %genesis.hash(), "Loaded genesis");
        let chain = Arc::new(MemoryChain::new(genesis));

        let candidates = Arc::new(StaticCandidates::new(config.genesis.candidates.clone()));
        let dpos = Dpos::new(&config, chain.clone(), store)
            .context("Failed to create consensus engine")?
            .with_candidate_service(candidates.clone())
            .with_rnode_service(candidates)
            .with_rpt_service(Arc::new(RptCollector::new(chain.clone())));
        let dpos = Arc::new(dpos);

        if let Some(key) = options.key {
            let signer = KeySigner::new(key);
            info!(coinbase = %signer.address(), "Loaded signing key");
            dpos.authorize(signer.address(), Arc::new(signer));
        } else if options.miner || options.validator {
            warn!("No signing key given, node will only follow the chain");
        }
        dpos.set_as_miner(options.miner);
        dpos.set_as_validator(options.validator);

        let handler = Handler::new(dpos.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            status: Arc::new(RwLock::new(NodeStatus::Starting)),
            database,
            chain,
            dpos,
            handler,
            shutdown_tx,
            producer: None,
        })
    }

    /// Consensus engine.
    pub fn dpos(&self) -> &Arc<Dpos> {
        &self.dpos
    }

    /// Protocol handler.
    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    /// Current lifecycle status.
    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    /// Head of the local chain.
    pub fn head(&self) -> Header {
        self.chain.current_header()
    }

    /// Transport used to dial remote validators.
    pub fn set_peer_server(&self, server: Arc<dyn PeerServer>) {
        self.handler.dialer().set_server(server);
    }

    /// Start the handler loops and the block producer.
    pub fn start(&mut self) {
        self.handler.start();

        if self.dpos.is_miner() {
            let producer = produce_blocks(
                self.dpos.clone(),
                self.handler.clone(),
                self.handler.subscribe_head(),
                self.shutdown_tx.subscribe(),
            );
            self.producer = Some(tokio::spawn(producer));
        }

        self.set_status(NodeStatus::Running);
        let head = self.head();
        info!(
            number = head.number,
            hash = %head.hash(),
            coinbase = %self.dpos.coinbase(),
            miner = self.dpos.is_miner(),
            validator = self.dpos.is_validator(),
            "Node started"
        );
    }

    /// Start, wait for Ctrl+C or a shutdown signal, then stop.
    pub async fn run(&mut self) -> Result<()> {
        self.start();
        self.wait_for_shutdown().await;
        self.shutdown().await
    }

    async fn wait_for_shutdown(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = stopped(&mut shutdown_rx) => {
                info!("Received shutdown signal");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, initiating shutdown");
            }
        }
    }

    /// Stop every component and flush the database.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown");
        self.set_status(NodeStatus::ShuttingDown);

        self.shutdown_tx.send_replace(true);
        self.handler.stop();

        if let Some(handle) = self.producer.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(_) => debug!("Block producer stopped"),
                Err(_) => warn!("Block producer shutdown timed out"),
            }
        }

        if let Some(database) = &self.database {
            database.flush_all()?;
        }

        self.set_status(NodeStatus::Stopped);
        info!("Node shutdown complete");
        Ok(())
    }

    fn set_status(&self, status: NodeStatus) {
        *self.status.write() = status;
    }
}

/// Assemble the child of `parent` with the local coinbase.
fn build_block(dpos: &Dpos, parent: &Header) -> dposbft_consensus::Result<Block> {
    let mut header = Header {
        parent_hash: parent.hash(),
        number: parent.number + 1,
        gas_limit: parent.gas_limit,
        coinbase: dpos.coinbase(),
        ..Default::default()
    };
    dpos.prepare_block(&mut header)?;
    dpos.finalize(header, &mut MemoryState::default(), Vec::new(), &[])
}

/// Seal a block whenever the head's successor is the local account's slot.
///
/// A head change while sealing abandons the block; an impeach block may have
/// taken the height.
async fn produce_blocks(
    dpos: Arc<Dpos>,
    handler: Arc<Handler>,
    mut head: watch::Receiver<BlockIdentifier>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let parent = dpos.chain().current_header();
        let coinbase = dpos.coinbase();

        if dpos.can_make_block(&coinbase, &parent) {
            match build_block(&dpos, &parent) {
                Ok(block) => {
                    tokio::select! {
                        sealed = dpos.seal(block, &mut stop) => match sealed {
                            Ok(Some(block)) => {
                                if let Err(e) = handler.receive_mined_pending_block(block) {
                                    warn!(number = parent.number + 1, error = %e, "Failed to queue mined block");
                                }
                            }
                            Ok(None) => return,
                            Err(e) => debug!(number = parent.number + 1, error = %e, "Not sealing block"),
                        },
                        changed = head.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            debug!(number = parent.number + 1, "Head moved while sealing");
                            continue;
                        }
                    }
                }
                Err(e) => warn!(number = parent.number + 1, error = %e, "Failed to build block"),
            }
        }

        tokio::select! {
            changed = head.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = stopped(&mut stop) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dposbft_config::GenesisConfig;
    use dposbft_consensus::types::now_ms;

    fn solo_config(key: &PrivateKey) -> Config {
        let mut config = Config::default();
        config.dpos.faulty_number = 0;
        config.dpos.term_len = 1;
        config.dpos.low_rpt_seats = 0;
        config.dpos.period_ms = 200;
        config.genesis = GenesisConfig {
            timestamp_ms: now_ms(),
            proposers: vec![key.address()],
            validators: vec![key.address()],
            candidates: vec![key.address()],
            ..Default::default()
        };
        config
    }

    #[tokio::test]
    async fn test_solo_validator_produces_blocks() {
        let key = PrivateKey::from_bytes(&[3u8; 32]).unwrap();
        let config = solo_config(&key);
        let mut node = Node::in_memory(
            config,
            NodeOptions {
                key: Some(key),
                miner: true,
                validator: true,
            },
        )
        .unwrap();
        assert_eq!(node.status(), NodeStatus::Starting);

        node.start();
        assert_eq!(node.status(), NodeStatus::Running);

        let mut head = node.handler().subscribe_head();
        tokio::time::timeout(Duration::from_secs(10), head.wait_for(|bi| bi.number >= 2))
            .await
            .expect("two blocks within the timeout")
            .unwrap();

        let tip = node.head();
        node.dpos().verify_sigs(&tip).await.unwrap();

        node.shutdown().await.unwrap();
        assert_eq!(node.status(), NodeStatus::Stopped);
    }

    #[tokio::test]
    async fn test_follower_does_not_produce() {
        let key = PrivateKey::from_bytes(&[3u8; 32]).unwrap();
        let config = solo_config(&key);
        let mut node = Node::in_memory(config, NodeOptions::default()).unwrap();
        node.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(node.head().number, 0);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rocksdb_backed_node() {
        let key = PrivateKey::from_bytes(&[3u8; 32]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut config = solo_config(&key);
        config.storage.data_dir = dir.path().to_string_lossy().to_string();

        let mut node = Node::new(config, NodeOptions::default()).unwrap();
        assert!(dir.path().join("consensus").exists());
        node.start();
        node.shutdown().await.unwrap();
    }
}
