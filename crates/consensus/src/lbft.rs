//! LBFT2 agreement.
//!
//! A proposed block goes through two signature rounds among the validator
//! committee before it is inserted:
//!
//! ```text
//!            preprepare          prepare cert            commit cert
//!   Idle ─────────────▶ Prepare ─────────────▶ Commit ─────────────▶ Idle
//!          sign prepare           sign commit            insert, broadcast
//!                                                        validate
//! ```
//!
//! Impeach blocks take the same route through `ImpeachPrepare` and
//! `ImpeachCommit` with the smaller impeach certificate. Observers skip the
//! rounds and only accept finished (validate) blocks.
//!
//! [`Lbft2::fsm`] consumes one decoded [`Message`] and returns the
//! [`Action`]s the handler must carry out. Verification runs outside any
//! lock; only the bookkeeping of pending blocks is serialized.

use crate::engine::Dpos;
use crate::error::{DposError, Result};
use crate::protocol::Message;
use crate::types::{now_ms, LbftState};
use dposbft_types::{Address, Block, BlockIdentifier, Header, H256};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Blocks kept while their signature rounds run.
pub const PENDING_BLOCKS_CACHE_SIZE: usize = 64;

/// What the handler does after a message was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send the header with prepare signatures to the validators
    BroadcastPrepare(Header),
    /// Send the impeach header with prepare signatures to the validators
    BroadcastPrepareImpeach(Header),
    /// Send the header with commit signatures to the validators
    BroadcastCommit(Header),
    /// Send the impeach header with commit signatures to the validators
    BroadcastCommitImpeach(Header),
    /// Send the finished block to everyone
    BroadcastValidate(Block),
    /// Send the finished impeach block to everyone
    BroadcastValidateImpeach(Block),
    /// The block's parent is missing; retry later
    UnknownAncestor(Block),
    /// A block was inserted into the chain
    Inserted(BlockIdentifier),
}

#[derive(Debug, Clone)]
struct Pending {
    block: Block,
    commit_signed: bool,
}

/// The LBFT2 state machine of one node.
pub struct Lbft2 {
    dpos: Arc<Dpos>,
    pending: Mutex<LruCache<BlockIdentifier, Pending>>,
}

impl Lbft2 {
    /// Create a state machine driving `dpos`.
    pub fn new(dpos: Arc<Dpos>) -> Self {
        let cap = NonZeroUsize::new(PENDING_BLOCKS_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            dpos,
            pending: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Number of blocks whose rounds are in progress.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Process one message.
    ///
    /// Stale messages (at or below the head) and messages that fail
    /// verification produce no actions.
    pub async fn fsm(&self, msg: Message) -> Vec<Action> {
        let Some(bi) = msg.identifier() else {
            return Vec::new();
        };
        let head = self.dpos.chain().current_header().number;
        if bi.number <= head {
            debug!(number = bi.number, head, code = ?msg.code(), "dropping stale message");
            return Vec::new();
        }
        self.prune(head);

        let code = msg.code();
        let result = match msg {
            Message::NewSigner(_) => Ok(Vec::new()),
            Message::Preprepare(block) => self.on_preprepare(block, false).await,
            Message::PreprepareImpeach(block) => self.on_preprepare(block, true).await,
            Message::Prepare(header) => self.on_prepare(header, false),
            Message::PrepareImpeach(header) => self.on_prepare(header, true),
            Message::Commit(header) => self.on_commit(header, false),
            Message::CommitImpeach(header) => self.on_commit(header, true),
            Message::Validate(block) => self.on_validate(block, false).await,
            Message::ValidateImpeach(block) => self.on_validate(block, true).await,
        };

        match result {
            Ok(actions) => actions,
            Err(e) => {
                debug!(number = bi.number, hash = %bi.hash, ?code, error = %e, "message rejected");
                Vec::new()
            }
        }
    }

    async fn on_preprepare(&self, block: Block, impeach: bool) -> Result<Vec<Action>> {
        let bi = block.identifier();
        if block.header.is_impeachment() != impeach {
            return Err(DposError::InvalidImpeachExtra);
        }
        if self.pending.lock().contains(&bi) {
            return Ok(Vec::new());
        }

        if impeach && self.dpos.strategy.enforces_timing() && block.header.timestamp > now_ms() {
            debug!(number = bi.number, timestamp = block.header.timestamp, "impeach block before its deadline");
            return Ok(Vec::new());
        }

        match self.dpos.validate_block(&block, false, true).await {
            Ok(()) => {}
            Err(DposError::UnknownAncestor) => return Ok(vec![Action::UnknownAncestor(block)]),
            Err(e) => return Err(e),
        }

        let state = if impeach {
            LbftState::ImpeachPrepare
        } else {
            LbftState::Prepare
        };
        let mut header = block.header.clone();
        let signed = self.dpos.sign_header(&mut header, state);
        self.pending.lock().put(
            bi,
            Pending {
                block,
                commit_signed: false,
            },
        );

        let mut actions = Vec::new();
        match signed {
            Ok(()) => {
                self.dpos.set_state(state);
                info!(number = bi.number, hash = %bi.hash, %state, "prepare-signed block");
                actions.push(if impeach {
                    Action::BroadcastPrepareImpeach(header)
                } else {
                    Action::BroadcastPrepare(header)
                });
            }
            Err(DposError::ValidatorNotInCommittee) => {
                self.dpos.set_state(LbftState::Validate);
                debug!(number = bi.number, "not a validator of this block, tracking only");
            }
            Err(e) => return Err(e),
        }

        // signatures may have arrived ahead of the block
        actions.extend(self.try_commit_sign(&bi, impeach)?);
        actions.extend(self.try_insert(&bi, impeach)?);
        Ok(actions)
    }

    fn on_prepare(&self, header: Header, impeach: bool) -> Result<Vec<Action>> {
        if header.is_impeachment() != impeach {
            return Err(DposError::InvalidImpeachExtra);
        }
        let bi = header.identifier();
        let count = self.dpos.update_prepare_sigs_cache(&header)?;
        debug!(number = bi.number, hash = %bi.hash, count, "collected prepare signatures");
        self.try_commit_sign(&bi, impeach)
    }

    fn on_commit(&self, header: Header, impeach: bool) -> Result<Vec<Action>> {
        if header.is_impeachment() != impeach {
            return Err(DposError::InvalidImpeachExtra);
        }
        let bi = header.identifier();
        let count = self.dpos.update_final_sigs_cache(&header)?;
        debug!(number = bi.number, hash = %bi.hash, count, "collected commit signatures");
        self.try_insert(&bi, impeach)
    }

    async fn on_validate(&self, block: Block, impeach: bool) -> Result<Vec<Action>> {
        if block.header.is_impeachment() != impeach {
            return Err(DposError::InvalidImpeachExtra);
        }
        let bi = block.identifier();
        match self.dpos.validate_block(&block, true, true).await {
            Ok(()) => {}
            Err(DposError::UnknownAncestor) => return Ok(vec![Action::UnknownAncestor(block)]),
            Err(e) => return Err(e),
        }
        let validators = self.validators_of(&bi, block.parent_hash())?;
        self.dpos.insert_chain(block)?;
        self.pending.lock().pop(&bi);
        if !validators.contains(&self.dpos.coinbase()) {
            self.dpos.set_state(LbftState::Validate);
        }
        Ok(vec![Action::Inserted(bi)])
    }

    /// Commit-sign `bi` once it is known and its prepare certificate holds.
    fn try_commit_sign(&self, bi: &BlockIdentifier, impeach: bool) -> Result<Vec<Action>> {
        let Some(parent_hash) = self.pending_parent(bi) else {
            return Ok(Vec::new());
        };
        let validators = self.validators_of(bi, parent_hash)?;
        let count = self.dpos.prepare_sigs.count_signed_by(bi, &validators);
        if !self.certified(count, impeach) {
            return Ok(Vec::new());
        }

        let mut header = {
            let mut pending = self.pending.lock();
            let Some(entry) = pending.get_mut(bi) else {
                return Ok(Vec::new());
            };
            if entry.commit_signed {
                return Ok(Vec::new());
            }
            entry.commit_signed = true;
            entry.block.header.clone()
        };

        let state = if impeach {
            LbftState::ImpeachCommit
        } else {
            LbftState::Commit
        };
        match self.dpos.sign_header(&mut header, state) {
            Ok(()) => {}
            Err(DposError::ValidatorNotInCommittee) => return Ok(Vec::new()),
            Err(e) => {
                if let Some(entry) = self.pending.lock().get_mut(bi) {
                    entry.commit_signed = false;
                }
                return Err(e);
            }
        }
        self.dpos.set_state(state);
        info!(number = bi.number, hash = %bi.hash, %state, prepared = count, "commit-signed block");

        let mut actions = vec![if impeach {
            Action::BroadcastCommitImpeach(header)
        } else {
            Action::BroadcastCommit(header)
        }];
        actions.extend(self.try_insert(bi, impeach)?);
        Ok(actions)
    }

    /// Insert `bi` once it is known and its commit certificate holds.
    fn try_insert(&self, bi: &BlockIdentifier, impeach: bool) -> Result<Vec<Action>> {
        let Some(parent_hash) = self.pending_parent(bi) else {
            return Ok(Vec::new());
        };
        let validators = self.validators_of(bi, parent_hash)?;
        let count = self.dpos.final_sigs.count_signed_by(bi, &validators);
        if !self.certified(count, impeach) {
            return Ok(Vec::new());
        }
        let Some(entry) = self.pending.lock().pop(bi) else {
            return Ok(Vec::new());
        };

        let mut block = entry.block;
        let validators_len = self.dpos.config().validators_len();
        block.header.dpos.sigs = vec![Default::default(); validators_len];
        self.dpos
            .final_sigs
            .write_signatures_to_header(&validators, &mut block.header);
        block.header.dpos.sigs.truncate(validators_len);

        if let Err(e) = self.dpos.insert_chain(block.clone()) {
            warn!(number = bi.number, hash = %bi.hash, error = %e, "failed to insert certified block");
            return Err(e);
        }
        self.dpos.set_state(LbftState::Idle);
        info!(number = bi.number, hash = %bi.hash, signatures = count, impeach, "block finalized");

        Ok(vec![
            if impeach {
                Action::BroadcastValidateImpeach(block)
            } else {
                Action::BroadcastValidate(block)
            },
            Action::Inserted(*bi),
        ])
    }

    fn pending_parent(&self, bi: &BlockIdentifier) -> Option<H256> {
        self.pending.lock().peek(bi).map(|p| p.block.header.parent_hash)
    }

    fn validators_of(&self, bi: &BlockIdentifier, parent_hash: H256) -> Result<Vec<Address>> {
        Ok(self
            .dpos
            .snapshot(bi.number - 1, parent_hash, &[])?
            .validators_of(bi.number))
    }

    fn certified(&self, count: usize, impeach: bool) -> bool {
        if impeach {
            self.dpos.config().impeach_certificate(count)
        } else {
            self.dpos.config().certificate(count)
        }
    }

    fn prune(&self, head: u64) {
        let mut pending = self.pending.lock();
        let stale: Vec<BlockIdentifier> = pending
            .iter()
            .filter(|(bi, _)| bi.number <= head)
            .map(|(bi, _)| *bi)
            .collect();
        for bi in stale {
            pending.pop(&bi);
        }
    }
}
