//! DPoS engine context.
//!
//! [`Dpos`] owns everything the consensus core needs between calls:
//! configuration, chain access, the verification strategy, the snapshot
//! store, both signature caches, the signed-blocks record, the local signer
//! and the node's role flags. There is no global state; every component
//! reaches the engine through an `Arc<Dpos>`.
//!
//! ## Block production
//!
//! ```text
//! prepare_block ──▶ finalize ──▶ seal ──▶ Handler::receive_mined_pending_block
//!  proposers,        reward,      wait for
//!  empty sigs,       state root   timestamp,
//!  timestamp                      sign
//! ```
//!
//! ## Concurrent verification
//!
//! [`Dpos::verify_headers`] fans a batch of headers out to a worker pool and
//! returns results in input order through a bounded channel.

use crate::chain::{CandidateService, ChainReadWriter, RNodeService, Signer, StateWriter};
use crate::dialer::Dialer;
use crate::error::{DposError, Result};
use crate::rpt::RptService;
use crate::signatures::SignatureCache;
use crate::signed_blocks::SignedBlocksRecord;
use crate::snapshot::DposSnapshot;
use crate::types::{now_ms, stopped, LbftState};
use crate::verify::{sig_hash, Normal, VerifyStrategy};
use dposbft_config::{Config, DposConfig, NetworkConfig, RewardsConfig};
use dposbft_storage::{cf, KeyValueStore, WriteThroughCache};
use dposbft_types::{Address, Block, DposSignature, Header, RawTransaction, H256};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

/// Snapshots kept in memory.
pub const SNAPSHOT_CACHE_SIZE: usize = 100;

/// Length of the vanity prefix a proposer keeps in `extra`.
pub const EXTRA_VANITY: usize = 32;

struct SignerSlot {
    coinbase: Address,
    signer: Option<Arc<dyn Signer>>,
}

/// The DPoS engine.
pub struct Dpos {
    pub(crate) config: DposConfig,
    pub(crate) rewards: RewardsConfig,
    pub(crate) network: NetworkConfig,
    pub(crate) chain: Arc<dyn ChainReadWriter>,
    pub(crate) db: Arc<dyn KeyValueStore>,
    pub(crate) strategy: Arc<dyn VerifyStrategy>,

    pub(crate) snapshots: WriteThroughCache<H256, DposSnapshot>,
    current_snap: RwLock<Option<Arc<DposSnapshot>>>,

    pub(crate) final_sigs: SignatureCache,
    pub(crate) prepare_sigs: SignatureCache,
    pub(crate) signed_blocks: SignedBlocksRecord,

    signer: RwLock<SignerSlot>,
    is_miner: AtomicBool,
    is_validator: AtomicBool,
    state: RwLock<LbftState>,

    pub(crate) rpt: Option<Arc<dyn RptService>>,
    pub(crate) candidates: Option<Arc<dyn CandidateService>>,
    pub(crate) rnodes: Option<Arc<dyn RNodeService>>,
    dialer: RwLock<Weak<Dialer>>,
}

impl Dpos {
    /// Create an engine with the [`Normal`] verification strategy.
    pub fn new(
        config: &Config,
        chain: Arc<dyn ChainReadWriter>,
        db: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        config
            .dpos
            .validate()
            .map_err(|e| DposError::InvalidConfig(e.to_string()))?;

        info!(
            term_len = config.dpos.term_len,
            view_len = config.dpos.view_len,
            validators = config.dpos.validators_len(),
            period_ms = config.dpos.period_ms,
            "creating dpos engine"
        );

        Ok(Self {
            config: config.dpos.clone(),
            rewards: config.rewards.clone(),
            network: config.network.clone(),
            chain,
            snapshots: WriteThroughCache::new(db.clone(), cf::SNAPSHOTS, SNAPSHOT_CACHE_SIZE),
            current_snap: RwLock::new(None),
            final_sigs: SignatureCache::new(db.clone(), cf::SIGNATURES),
            prepare_sigs: SignatureCache::new(db.clone(), cf::PREPARE_SIGNATURES),
            signed_blocks: SignedBlocksRecord::new(db.clone()),
            db,
            strategy: Arc::new(Normal),
            signer: RwLock::new(SignerSlot {
                coinbase: Address::ZERO,
                signer: None,
            }),
            is_miner: AtomicBool::new(false),
            is_validator: AtomicBool::new(false),
            state: RwLock::new(LbftState::Idle),
            rpt: None,
            candidates: None,
            rnodes: None,
            dialer: RwLock::new(Weak::new()),
        })
    }

    /// Replace the verification strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn VerifyStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Use `rpt` for elections.
    pub fn with_rpt_service(mut self, rpt: Arc<dyn RptService>) -> Self {
        self.rpt = Some(rpt);
        self
    }

    /// Use `candidates` for elections.
    pub fn with_candidate_service(mut self, candidates: Arc<dyn CandidateService>) -> Self {
        self.candidates = Some(candidates);
        self
    }

    /// Use `rnodes` for RNode queries.
    pub fn with_rnode_service(mut self, rnodes: Arc<dyn RNodeService>) -> Self {
        self.rnodes = Some(rnodes);
        self
    }

    /// DPoS parameters.
    pub fn config(&self) -> &DposConfig {
        &self.config
    }

    /// Validator networking configuration.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// The chain this engine works on.
    pub fn chain(&self) -> &Arc<dyn ChainReadWriter> {
        &self.chain
    }

    /// Consensus database.
    pub fn db(&self) -> &Arc<dyn KeyValueStore> {
        &self.db
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Most recent snapshot built or sealed on.
    pub fn current_snap(&self) -> Option<Arc<DposSnapshot>> {
        self.current_snap.read().clone()
    }

    /// Replace the current snapshot unless it would move backwards.
    pub fn set_current_snap(&self, snap: Arc<DposSnapshot>) {
        let mut current = self.current_snap.write();
        if current.as_ref().map_or(true, |c| snap.number >= c.number) {
            *current = Some(snap);
        }
    }

    // -------------------------------------------------------------------------
    // Identity and roles
    // -------------------------------------------------------------------------

    /// Sign with `signer` as `coinbase` from now on.
    pub fn authorize(&self, coinbase: Address, signer: Arc<dyn Signer>) {
        let mut slot = self.signer.write();
        slot.coinbase = coinbase;
        slot.signer = Some(signer);
        info!(%coinbase, "authorized signer");
    }

    /// Local account.
    pub fn coinbase(&self) -> Address {
        self.signer.read().coinbase
    }

    /// Sign `digest` as the local account.
    pub fn sign_hash(&self, digest: &H256) -> Result<DposSignature> {
        let (coinbase, signer) = {
            let slot = self.signer.read();
            (slot.coinbase, slot.signer.clone())
        };
        let signer = signer.ok_or_else(|| DposError::SignerUnavailable(coinbase.to_string()))?;
        signer.sign(&coinbase, digest)
    }

    /// Whether this node produces blocks.
    pub fn is_miner(&self) -> bool {
        self.is_miner.load(Ordering::Acquire)
    }

    /// Mark this node as a block producer.
    pub fn set_as_miner(&self, is_miner: bool) {
        self.is_miner.store(is_miner, Ordering::Release);
    }

    /// Whether this node takes part in validation.
    pub fn is_validator(&self) -> bool {
        self.is_validator.load(Ordering::Acquire)
    }

    /// Mark this node as a validator.
    pub fn set_as_validator(&self, is_validator: bool) {
        self.is_validator.store(is_validator, Ordering::Release);
    }

    /// Current LBFT2 phase.
    pub fn state(&self) -> LbftState {
        *self.state.read()
    }

    /// Record the LBFT2 phase.
    pub fn set_state(&self, state: LbftState) {
        *self.state.write() = state;
    }

    pub(crate) fn set_dialer(&self, dialer: &Arc<Dialer>) {
        *self.dialer.write() = Arc::downgrade(dialer);
    }

    pub(crate) fn dialer(&self) -> Option<Arc<Dialer>> {
        self.dialer.read().upgrade()
    }

    // -------------------------------------------------------------------------
    // Consensus engine interface
    // -------------------------------------------------------------------------

    /// Address that sealed `header`.
    pub fn author(&self, header: &Header) -> Result<Address> {
        self.ec_recover_proposer(header)
    }

    /// Verify the proposer seal of a header whose parent is in the chain.
    pub async fn verify_seal(&self, header: &Header) -> Result<()> {
        self.verify_seal_with(header, &[]).await
    }

    /// Verify the validator signatures of a header whose parent is in the chain.
    pub async fn verify_sigs(&self, header: &Header) -> Result<()> {
        self.verify_signatures(header, &[]).await
    }

    /// Verify a contiguous batch of headers on `workers` concurrent tasks.
    ///
    /// Each header is verified with the headers before it as parents. Results
    /// arrive on the receiver in input order; aborting the handle stops the
    /// whole pool.
    pub fn verify_headers(
        self: &Arc<Self>,
        headers: Vec<Header>,
        verify_sigs: bool,
        workers: usize,
    ) -> (AbortHandle, mpsc::Receiver<Result<()>>) {
        let total = headers.len();
        let (out_tx, out_rx) = mpsc::channel(total.max(1));
        let dpos = self.clone();

        let supervisor = tokio::spawn(async move {
            let headers = Arc::new(headers);
            let (job_tx, job_rx) = mpsc::channel::<usize>(total.max(1));
            let job_rx = Arc::new(AsyncMutex::new(job_rx));
            let (done_tx, mut done_rx) = mpsc::channel::<(usize, Result<()>)>(total.max(1));

            let mut pool = JoinSet::new();
            for _ in 0..workers.clamp(1, total.max(1)) {
                let jobs = job_rx.clone();
                let done = done_tx.clone();
                let dpos = dpos.clone();
                let headers = headers.clone();
                pool.spawn(async move {
                    loop {
                        let next = jobs.lock().await.recv().await;
                        let Some(index) = next else { break };
                        let result = dpos
                            .verify_header(&headers[index], &headers[..index], verify_sigs, false)
                            .await;
                        if done.send((index, result)).await.is_err() {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);

            for index in 0..total {
                if job_tx.send(index).await.is_err() {
                    break;
                }
            }
            drop(job_tx);

            let mut pending = BTreeMap::new();
            let mut next = 0;
            while let Some((index, result)) = done_rx.recv().await {
                pending.insert(index, result);
                while let Some(result) = pending.remove(&next) {
                    if out_tx.send(result).await.is_err() {
                        pool.abort_all();
                        return;
                    }
                    next += 1;
                }
            }
        });

        (supervisor.abort_handle(), out_rx)
    }

    /// Fill the consensus fields of a new header on top of its parent.
    pub fn prepare_block(&self, header: &mut Header) -> Result<()> {
        let number = header.number;
        if number == 0 {
            return Err(DposError::UnknownBlock);
        }
        let snap = self.snapshot(number - 1, header.parent_hash, &[])?;

        header.extra.resize(EXTRA_VANITY, 0);
        header.dpos.proposers = snap.proposers_of(number);
        header.dpos.sigs = vec![DposSignature::EMPTY; self.config.validators_len()];

        let parent = self
            .chain
            .get_header(&header.parent_hash, number - 1)
            .ok_or(DposError::UnknownAncestor)?;
        header.timestamp = (parent.timestamp + self.config.period_ms).max(now_ms());
        Ok(())
    }

    /// Credit the block reward and assemble the block.
    pub fn finalize(
        &self,
        mut header: Header,
        state: &mut dyn StateWriter,
        transactions: Vec<RawTransaction>,
        receipts: &[Vec<u8>],
    ) -> Result<Block> {
        if !header.coinbase.is_zero() {
            let reward = self.rewards.block_reward(header.number);
            state.add_balance(&header.coinbase, reward);
            debug!(number = header.number, coinbase = %header.coinbase, reward, "credited block reward");
        }
        header.state_root = state.intermediate_root();
        Ok(Block::new(header, transactions, receipts))
    }

    /// Seal `block` as the local proposer once its timestamp arrives.
    ///
    /// Returns `Ok(None)` when `stop` fires first.
    pub async fn seal(&self, block: Block, stop: &mut watch::Receiver<bool>) -> Result<Option<Block>> {
        let Block {
            mut header,
            transactions,
        } = block;
        let number = header.number;
        if number == 0 {
            return Err(DposError::UnknownBlock);
        }
        if self.config.period_ms == 0 && transactions.is_empty() {
            return Err(DposError::WaitTransactions);
        }

        let snap = self.snapshot(number - 1, header.parent_hash, &[])?;
        let coinbase = self.coinbase();
        match snap.is_proposer_of(&coinbase, number) {
            Ok(true) => {}
            Ok(false) => return Err(DposError::Unauthorized),
            Err(DposError::ProposerNotInCommittee) => return Err(DposError::NotInProposerCommittee),
            Err(e) => return Err(e),
        }

        let delay = Duration::from_millis(header.timestamp.saturating_sub(now_ms()));
        debug!(number, delay_ms = delay.as_millis() as u64, "waiting for slot to seal");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(stop) => {
                debug!(number, "sealing aborted");
                return Ok(None);
            }
        }

        header.dpos.seal = self.sign_hash(&sig_hash(&header))?;
        header.dpos.sigs = vec![DposSignature::EMPTY; self.config.validators_len()];
        self.set_current_snap(snap);

        info!(number, hash = %header.hash(), "sealed block");
        Ok(Some(Block {
            header,
            transactions,
        }))
    }

    /// Whether `coinbase` proposes the block after `parent`.
    pub fn can_make_block(&self, coinbase: &Address, parent: &Header) -> bool {
        self.snapshot(parent.number, parent.hash(), &[])
            .and_then(|snap| snap.is_proposer_of(coinbase, parent.number + 1))
            .unwrap_or_else(|e| {
                warn!(number = parent.number + 1, error = %e, "cannot decide block producer");
                false
            })
    }
}
