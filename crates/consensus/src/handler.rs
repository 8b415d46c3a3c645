//! Peer protocol handler.
//!
//! The [`Handler`] sits between the transport and the LBFT2 state machine:
//! it admits remote signers, decodes their messages, feeds them to
//! [`Lbft2`] and carries out the resulting actions. It also runs the
//! background loops of a committee member:
//!
//! - dialing and re-dialing remote validators
//! - broadcasting blocks mined locally
//! - dispatching impeach blocks queued by the [`ImpeachTimer`]
//! - retrying blocks whose parent was unknown when they arrived
//!
//! All loops observe one shutdown signal. [`Handler::stop`] fires it and
//! arms a fresh one, so the handler can be started again.

use crate::chain::PeerSession;
use crate::dialer::{Dialer, PeerInfo};
use crate::engine::Dpos;
use crate::error::ProtocolError;
use crate::impeachment::{ImpeachTimer, ImpeachmentRecord};
use crate::lbft::{Action, Lbft2};
use crate::protocol::{Message, RawMessage, PROTOCOL_LENGTH, PROTOCOL_NAME, PROTOCOL_VERSION};
use crate::types::{now_ms, stopped, DposStatus};
use dposbft_storage::{cf, WriteThroughCache};
use dposbft_types::{Block, BlockIdentifier};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Semaphore};
use tracing::{debug, info, warn};

/// Mined blocks waiting to be broadcast.
pub const MAX_PENDING_BLOCKS: usize = 16;

/// Blocks with unknown ancestors kept for retry.
pub const RECENT_BLOCKS_CACHE_SIZE: usize = 100;

/// Inbound messages processed at the same time, across all sessions.
pub const MAX_CONCURRENT_MESSAGES: usize = 64;

/// Interval between unknown-ancestor retries.
pub const UNKNOWN_ANCESTOR_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Blocks kept by identifier, written through to the `recent_blocks` column.
pub type RecentBlocks = WriteThroughCache<BlockIdentifier, Block>;

type SharedReceiver = Arc<AsyncMutex<mpsc::Receiver<Block>>>;

/// The `dpos` protocol handler of one node.
pub struct Handler {
    pub(crate) dpos: Arc<Dpos>,
    pub(crate) dialer: Arc<Dialer>,
    lbft: Lbft2,
    unknown_ancestors: RecentBlocks,
    impeachment: ImpeachmentRecord,
    msg_permits: Arc<Semaphore>,

    pending_tx: mpsc::Sender<Block>,
    pending_rx: SharedReceiver,
    impeach_tx: mpsc::Sender<Block>,
    impeach_rx: SharedReceiver,
    head_tx: watch::Sender<BlockIdentifier>,
    stop: Mutex<watch::Sender<bool>>,
}

impl Handler {
    /// Create a handler for `dpos`.
    pub fn new(dpos: Arc<Dpos>) -> Arc<Self> {
        let (pending_tx, pending_rx) = mpsc::channel(MAX_PENDING_BLOCKS);
        let (impeach_tx, impeach_rx) = mpsc::channel(MAX_PENDING_BLOCKS);
        let head = dpos.chain().current_header().identifier();
        let (head_tx, _) = watch::channel(head);
        let (stop, _) = watch::channel(false);

        Arc::new(Self {
            dialer: Dialer::new(dpos.clone()),
            lbft: Lbft2::new(dpos.clone()),
            unknown_ancestors: WriteThroughCache::new(
                dpos.db().clone(),
                cf::RECENT_BLOCKS,
                RECENT_BLOCKS_CACHE_SIZE,
            ),
            impeachment: ImpeachmentRecord::new(),
            msg_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_MESSAGES)),
            pending_tx,
            pending_rx: Arc::new(AsyncMutex::new(pending_rx)),
            impeach_tx,
            impeach_rx: Arc::new(AsyncMutex::new(impeach_rx)),
            head_tx,
            stop: Mutex::new(stop),
            dpos,
        })
    }

    /// Connection manager.
    pub fn dialer(&self) -> &Arc<Dialer> {
        &self.dialer
    }

    /// State machine.
    pub fn lbft(&self) -> &Lbft2 {
        &self.lbft
    }

    /// Blocks waiting for their ancestors.
    pub fn unknown_ancestors(&self) -> &RecentBlocks {
        &self.unknown_ancestors
    }

    /// Follow the canonical head as blocks are inserted.
    pub fn subscribe_head(&self) -> watch::Receiver<BlockIdentifier> {
        self.head_tx.subscribe()
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.lock().subscribe()
    }

    /// Spawn the background loops.
    pub fn start(self: &Arc<Self>) {
        let head = self.dpos.chain().current_header().number;
        info!(head, coinbase = %self.dpos.coinbase(), "starting dpos handler");

        let dialer = self.dialer.clone();
        let term = self.dpos.term_of(head);
        tokio::spawn(async move {
            let dialed = dialer.dial_all_remote_validators(term).await;
            debug!(term, dialed, "initial dial finished");
        });

        tokio::spawn(self.dialer.clone().keep_connection(self.stop_signal()));
        tokio::spawn(self.clone().pending_block_broadcast_loop(self.stop_signal()));
        tokio::spawn(self.clone().pending_impeach_block_loop(self.stop_signal()));
        tokio::spawn(self.clone().unknown_ancestors_loop(self.stop_signal()));

        let timer = ImpeachTimer::new(
            self.dpos.clone(),
            self.head_tx.subscribe(),
            self.impeach_tx.clone(),
        );
        tokio::spawn(timer.run(self.stop_signal()));
    }

    /// Stop the background loops and arm a fresh shutdown signal.
    pub fn stop(&self) {
        let mut stop = self.stop.lock();
        let (fresh, _) = watch::channel(false);
        let old = std::mem::replace(&mut *stop, fresh);
        old.send_replace(true);
        info!("stopped dpos handler");
    }

    /// Protocol name.
    pub fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    /// Protocol version.
    pub fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    /// Number of message codes the protocol reserves.
    pub fn length(&self) -> u64 {
        PROTOCOL_LENGTH
    }

    /// Status reported to the transport.
    pub fn node_info(&self) -> DposStatus {
        self.dpos.status()
    }

    /// Connected remote signers.
    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.dialer.peer_infos()
    }

    /// Handshake with a new session.
    pub async fn add_peer(&self, session: Arc<dyn PeerSession>) -> Result<(), ProtocolError> {
        self.dialer.add_peer(session).await.map(|_| ())
    }

    /// Forget the session `id`.
    pub fn remove_peer(&self, id: &str) {
        debug!(peer = id, "removing dpos peer");
        self.dialer.remove_peer(id);
    }

    /// Handshake with `session`, then serve its messages until it fails or
    /// the handler stops.
    pub async fn serve_peer(self: &Arc<Self>, session: Arc<dyn PeerSession>) -> Result<(), ProtocolError> {
        let id = session.id();
        self.add_peer(session.clone()).await?;

        let mut stop = self.stop_signal();
        let result = loop {
            let raw = tokio::select! {
                raw = session.read_msg() => raw,
                _ = stopped(&mut stop) => break Ok(()),
            };
            let handled = match raw {
                Ok(raw) => self.handle_msg(&id, raw).await,
                Err(e) => Err(e),
            };
            if let Err(e) = handled {
                break Err(e);
            }
        };

        if let Err(e) = &result {
            debug!(peer = %id, error = %e, "dpos session ended");
        }
        self.remove_peer(&id);
        session.disconnect().await;
        result
    }

    /// Process one message from session `id`.
    ///
    /// Messages from sessions that never completed the handshake are ignored.
    /// Decoding happens inline; the state machine runs on its own task so a
    /// block waiting for its timestamp does not hold up the session.
    pub async fn handle_msg(self: &Arc<Self>, id: &str, raw: RawMessage) -> Result<(), ProtocolError> {
        let Some(signer) = self.dialer.signer_by_id(id) else {
            debug!(peer = id, code = raw.code, "ignoring message from unknown session");
            return Ok(());
        };

        let msg = Message::decode(&raw)?;
        if let Message::NewSigner(_) = msg {
            debug!(signer = %signer.address(), "received repeated status message");
            return Ok(());
        }

        let permit = self
            .msg_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::Disconnected)?;
        let h = self.clone();
        tokio::spawn(async move {
            let actions = h.lbft.fsm(msg).await;
            h.execute(actions);
            drop(permit);
        });
        Ok(())
    }

    /// Queue a block mined locally for broadcast.
    pub fn receive_mined_pending_block(&self, block: Block) -> Result<(), ProtocolError> {
        self.pending_tx
            .try_send(block)
            .map_err(|_| ProtocolError::PendingBlockQueueFull)
    }

    /// Queue an impeach block for dispatch.
    pub fn receive_impeach_block(&self, block: Block) -> Result<(), ProtocolError> {
        self.impeach_tx
            .try_send(block)
            .map_err(|_| ProtocolError::PendingBlockQueueFull)
    }

    fn execute(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::BroadcastPrepare(header) => {
                    let h = self.clone();
                    tokio::spawn(async move { h.broadcast_prepare_header(&header).await });
                }
                Action::BroadcastPrepareImpeach(header) => {
                    let h = self.clone();
                    tokio::spawn(async move { h.broadcast_prepare_impeach_header(&header).await });
                }
                Action::BroadcastCommit(header) => {
                    let h = self.clone();
                    tokio::spawn(async move { h.broadcast_commit_header(&header).await });
                }
                Action::BroadcastCommitImpeach(header) => {
                    let h = self.clone();
                    tokio::spawn(async move { h.broadcast_commit_impeach_header(&header).await });
                }
                Action::BroadcastValidate(block) => {
                    let h = self.clone();
                    tokio::spawn(async move { h.broadcast_validate_block(&block).await });
                }
                Action::BroadcastValidateImpeach(block) => {
                    let h = self.clone();
                    tokio::spawn(async move { h.broadcast_validate_impeach_block(&block).await });
                }
                Action::UnknownAncestor(block) => {
                    let bi = block.identifier();
                    debug!(number = bi.number, hash = %bi.hash, "parking block with unknown ancestor");
                    if let Err(e) = self.unknown_ancestors.insert(bi, block) {
                        warn!(number = bi.number, error = %e, "failed to park block");
                    }
                }
                Action::Inserted(bi) => {
                    if let Err(e) = self.unknown_ancestors.remove(&bi) {
                        debug!(number = bi.number, error = %e, "failed to drop parked block");
                    }
                    self.head_tx
                        .send_replace(self.dpos.chain().current_header().identifier());
                }
            }
        }
    }

    async fn next_block(rx: &SharedReceiver, stop: &mut watch::Receiver<bool>) -> Option<Block> {
        let mut rx = rx.lock().await;
        tokio::select! {
            block = rx.recv() => block,
            _ = stopped(stop) => None,
        }
    }

    async fn pending_block_broadcast_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        while let Some(block) = Self::next_block(&self.pending_rx, &mut stop).await {
            debug!(number = block.number(), hash = %block.hash(), "broadcasting mined block");
            let h = self.clone();
            tokio::spawn(async move {
                let local = h.lbft.fsm(Message::Preprepare(block.clone()));
                let (actions, _) = tokio::join!(local, h.broadcast_preprepare_block_as_proposer(&block));
                h.execute(actions);
            });
        }
    }

    async fn pending_impeach_block_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        while let Some(block) = Self::next_block(&self.impeach_rx, &mut stop).await {
            let bi = block.identifier();
            let coinbase = self.dpos.coinbase();
            let term = self.dpos.term_of(bi.number);
            let is_validator = match self.dpos.verify_validator_of(&coinbase, term) {
                Ok(v) => v,
                Err(e) => {
                    warn!(number = bi.number, error = %e, "cannot decide validator role for impeachment");
                    continue;
                }
            };
            if !is_validator || !self.impeachment.check_and_mark(&bi) {
                continue;
            }

            let h = self.clone();
            let mut stop = self.stop_signal();
            tokio::spawn(async move {
                // failback blocks carry a timestamp ahead of the local clock
                let early = block.header.timestamp.saturating_sub(now_ms());
                if early > 0 {
                    debug!(number = bi.number, wait_ms = early, "holding impeach block until its timestamp");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(early)) => {}
                        _ = stopped(&mut stop) => return,
                    }
                    if h.dpos.chain().current_header().number >= bi.number {
                        debug!(number = bi.number, hash = %bi.hash, "height settled while holding impeach block");
                        return;
                    }
                }

                info!(number = bi.number, hash = %bi.hash, "impeaching proposer");
                let local = h.lbft.fsm(Message::PreprepareImpeach(block.clone()));
                let (actions, _) = tokio::join!(local, h.broadcast_preprepare_impeach_block(&block));
                h.execute(actions);
            });
        }
    }

    async fn unknown_ancestors_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(UNKNOWN_ANCESTOR_RETRY_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped(&mut stop) => return,
            }

            for bi in self.unknown_ancestors.cached_keys() {
                let head = self.dpos.chain().current_header().number;
                if bi.number <= head {
                    debug!(number = bi.number, hash = %bi.hash, head, "dropping stale parked block");
                    if let Err(e) = self.unknown_ancestors.remove(&bi) {
                        debug!(number = bi.number, error = %e, "failed to drop parked block");
                    }
                    continue;
                }

                let Some(block) = self.unknown_ancestors.peek_cached(&bi) else {
                    continue;
                };
                let msg = if block.header.is_impeachment() {
                    Message::PreprepareImpeach(block)
                } else {
                    Message::Preprepare(block)
                };
                let actions = self.lbft.fsm(msg).await;
                self.execute(actions);
            }
        }
    }
}
