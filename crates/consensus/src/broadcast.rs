//! Fan-out of LBFT2 messages to the remote validators.
//!
//! Each broadcast first waits, within a bounded number of tries, for enough
//! remote validators of the block's term to be connected, then enqueues the
//! message on every one of them.

use crate::dialer::{Dialer, RemoteSigner};
use crate::handler::Handler;
use crate::protocol::Message;
use crate::types::{now_ms, stopped};
use dposbft_types::{Block, Header};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Connection checks before a broadcast gives up.
pub const DEFAULT_WAIT_DIAL_TIMES: u32 = 20;

/// Poll interval while a proposer waits for validators.
pub const PREPREPARE_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl Handler {
    fn wait_step(&self) -> Duration {
        let config = self.dpos.config();
        (config.period() + config.impeach_timeout()) / DEFAULT_WAIT_DIAL_TIMES
    }

    /// Poll `enough` up to [`DEFAULT_WAIT_DIAL_TIMES`] times. Returns the
    /// connected validators of `term` once it holds or `deadline_ms` passes,
    /// and nothing if it never does or the handler stops.
    async fn wait_for(
        &self,
        term: u64,
        enough: fn(&Dialer, u64) -> bool,
        step: Duration,
        deadline_ms: Option<u64>,
    ) -> Vec<Arc<RemoteSigner>> {
        let mut stop = self.stop_signal();
        for _ in 0..DEFAULT_WAIT_DIAL_TIMES {
            if *stop.borrow() {
                return Vec::new();
            }
            let expired = deadline_ms.map_or(false, |d| now_ms() > d);
            if enough(&self.dialer, term) || expired {
                return self.dialer.validators_of_term(term);
            }
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = stopped(&mut stop) => return Vec::new(),
            }
        }
        debug!(term, "not enough validators connected");
        Vec::new()
    }

    /// Wait until `2f` remote validators of `term` are connected.
    pub async fn wait_for_enough_validators(&self, term: u64) -> Vec<Arc<RemoteSigner>> {
        self.wait_for(term, Dialer::enough_validators_of_term, self.wait_step(), None)
            .await
    }

    /// Wait until `f` remote validators of `term` are connected.
    pub async fn wait_for_enough_impeach_validators(&self, term: u64) -> Vec<Arc<RemoteSigner>> {
        self.wait_for(term, Dialer::enough_impeach_validators_of_term, self.wait_step(), None)
            .await
    }

    /// Wait until `f` remote validators of `term` are connected or
    /// `deadline_ms` passes.
    pub async fn wait_for_enough_preprepare_validators(
        &self,
        term: u64,
        deadline_ms: u64,
    ) -> Vec<Arc<RemoteSigner>> {
        self.wait_for(
            term,
            Dialer::enough_impeach_validators_of_term,
            PREPREPARE_POLL_INTERVAL,
            Some(deadline_ms),
        )
        .await
    }

    async fn fan_out(&self, peers: Vec<Arc<RemoteSigner>>, msg: Message) -> usize {
        let sends = peers.iter().map(|peer| {
            let msg = &msg;
            async move {
                let result = peer.send(msg).await;
                if let Err(e) = &result {
                    warn!(signer = %peer.address(), code = ?msg.code(), error = %e, "failed to send to remote signer");
                }
                result.is_ok()
            }
        });
        join_all(sends).await.into_iter().filter(|ok| *ok).count()
    }

    /// Send a block this node just mined to the validators of its term,
    /// giving up on waiting shortly before the block is due.
    pub async fn broadcast_preprepare_block_as_proposer(&self, block: &Block) -> usize {
        let number = block.number();
        let term = self.dpos.term_of(number);
        let deadline = (block.header.timestamp + self.dpos.config().block_delay_ms).saturating_sub(1_000);
        debug!(number, hash = %block.hash(), term, deadline, "broadcasting preprepare block");
        let peers = self.wait_for_enough_preprepare_validators(term, deadline).await;
        self.fan_out(peers, Message::Preprepare(block.clone())).await
    }

    /// Send a proposed block to the validators of its term.
    pub async fn broadcast_preprepare_block(&self, block: &Block) -> usize {
        let term = self.dpos.term_of(block.number());
        debug!(number = block.number(), hash = %block.hash(), "broadcasting preprepare block");
        let peers = self.wait_for_enough_validators(term).await;
        self.fan_out(peers, Message::Preprepare(block.clone())).await
    }

    /// Send an impeach block to the validators of its term.
    pub async fn broadcast_preprepare_impeach_block(&self, block: &Block) -> usize {
        let term = self.dpos.term_of(block.number());
        debug!(number = block.number(), hash = %block.hash(), "broadcasting preprepare impeach block");
        let peers = self.wait_for_enough_impeach_validators(term).await;
        self.fan_out(peers, Message::PreprepareImpeach(block.clone())).await
    }

    /// Send a prepare-signed header to the validators of its term.
    pub async fn broadcast_prepare_header(&self, header: &Header) -> usize {
        let term = self.dpos.term_of(header.number);
        debug!(number = header.number, hash = %header.hash(), "broadcasting prepare header");
        let peers = self.wait_for_enough_validators(term).await;
        self.fan_out(peers, Message::Prepare(header.clone())).await
    }

    /// Send a prepare-signed impeach header to the validators of its term.
    pub async fn broadcast_prepare_impeach_header(&self, header: &Header) -> usize {
        let term = self.dpos.term_of(header.number);
        debug!(number = header.number, hash = %header.hash(), "broadcasting prepare impeach header");
        let peers = self.wait_for_enough_impeach_validators(term).await;
        self.fan_out(peers, Message::PrepareImpeach(header.clone())).await
    }

    /// Send a commit-signed header to the validators of its term.
    pub async fn broadcast_commit_header(&self, header: &Header) -> usize {
        let term = self.dpos.term_of(header.number);
        debug!(number = header.number, hash = %header.hash(), "broadcasting commit header");
        let peers = self.wait_for_enough_validators(term).await;
        self.fan_out(peers, Message::Commit(header.clone())).await
    }

    /// Send a commit-signed impeach header to the validators of its term.
    pub async fn broadcast_commit_impeach_header(&self, header: &Header) -> usize {
        let term = self.dpos.term_of(header.number);
        debug!(number = header.number, hash = %header.hash(), "broadcasting commit impeach header");
        let peers = self.wait_for_enough_impeach_validators(term).await;
        self.fan_out(peers, Message::CommitImpeach(header.clone())).await
    }

    /// Send a finished block to the validators of its term.
    pub async fn broadcast_validate_block(&self, block: &Block) -> usize {
        let term = self.dpos.term_of(block.number());
        debug!(number = block.number(), hash = %block.hash(), "broadcasting validate block");
        let peers = self.wait_for_enough_validators(term).await;
        self.fan_out(peers, Message::Validate(block.clone())).await
    }

    /// Send a finished impeach block to the validators of its term.
    pub async fn broadcast_validate_impeach_block(&self, block: &Block) -> usize {
        let term = self.dpos.term_of(block.number());
        debug!(number = block.number(), hash = %block.hash(), "broadcasting validate impeach block");
        let peers = self.wait_for_enough_impeach_validators(term).await;
        self.fan_out(peers, Message::ValidateImpeach(block.clone())).await
    }
}
