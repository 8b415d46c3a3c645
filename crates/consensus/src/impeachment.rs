//! Impeachment of silent proposers.
//!
//! When the head does not advance within `period + impeach_timeout` of its
//! timestamp, every validator builds the same empty impeach block on the
//! head and runs it through the impeach path of LBFT2. [`ImpeachTimer`]
//! watches the head and queues those blocks; [`ImpeachmentRecord`] makes sure
//! each one is dispatched once.
//!
//! ## Failback
//!
//! A node that finds the head stale by more than one failback sample space
//! cannot know which deadline its peers used. It queues two impeach blocks
//! timestamped on the next two multiples of the sample space instead, so
//! nodes that drifted apart still converge on a common block.

use crate::engine::Dpos;
use crate::types::{now_ms, stopped};
use dposbft_types::{Block, BlockIdentifier, H256};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Impeach blocks remembered as dispatched.
pub const IMPEACHMENT_RECORD_SIZE: usize = 1024;

/// Impeach blocks this node already dispatched, by `(number, hash)`.
pub struct ImpeachmentRecord {
    seen: Mutex<LruCache<(u64, H256), ()>>,
}

impl Default for ImpeachmentRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl ImpeachmentRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(IMPEACHMENT_RECORD_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Mark `bi` as dispatched. Returns `false` if it already was.
    pub fn check_and_mark(&self, bi: &BlockIdentifier) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(&(bi.number, bi.hash)) {
            return false;
        }
        seen.put((bi.number, bi.hash), ());
        true
    }

    /// Whether `bi` was dispatched.
    pub fn contains(&self, bi: &BlockIdentifier) -> bool {
        self.seen.lock().contains(&(bi.number, bi.hash))
    }
}

/// Queues an impeach block whenever the head stalls.
pub struct ImpeachTimer {
    dpos: Arc<Dpos>,
    head: watch::Receiver<BlockIdentifier>,
    pending: mpsc::Sender<Block>,
}

impl ImpeachTimer {
    /// Create a timer fed by head changes on `head`, queueing to `pending`.
    pub fn new(
        dpos: Arc<Dpos>,
        head: watch::Receiver<BlockIdentifier>,
        pending: mpsc::Sender<Block>,
    ) -> Self {
        Self {
            dpos,
            head,
            pending,
        }
    }

    /// Run until `stop` fires or the head channel closes.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let config = self.dpos.config().clone();
        let retry = Duration::from_millis(config.impeach_timeout_ms.max(config.period_ms).max(1));

        loop {
            let head = self.dpos.chain().current_header();
            let deadline = head.timestamp + config.period_ms + config.impeach_timeout_ms;
            let wait = Duration::from_millis(deadline.saturating_sub(now_ms()));

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = self.head.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                _ = stopped(&mut stop) => return,
            }

            if self.dpos.chain().current_header().hash() != head.hash() {
                continue;
            }

            let blocks = if now_ms() > deadline + config.failback_timestamp_sample_space_ms {
                self.dpos
                    .create_failback_impeach_blocks()
                    .map(|(first, second)| vec![first, second])
            } else {
                self.dpos.create_impeach_block_at(&head).map(|block| vec![block])
            };
            match blocks {
                Ok(blocks) => {
                    for block in blocks {
                        info!(number = block.number(), timestamp = block.header.timestamp, "proposer timed out, queueing impeach block");
                        if self.pending.send(block).await.is_err() {
                            debug!("impeach queue closed");
                            return;
                        }
                    }
                }
                Err(e) => warn!(number = head.number + 1, error = %e, "failed to create impeach block"),
            }

            tokio::select! {
                changed = self.head.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(retry) => {}
                _ = stopped(&mut stop) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_marks_once() {
        let record = ImpeachmentRecord::new();
        let bi = BlockIdentifier::new(7, H256::keccak256(b"impeach"));
        assert!(!record.contains(&bi));
        assert!(record.check_and_mark(&bi));
        assert!(!record.check_and_mark(&bi));
        assert!(record.contains(&bi));
        assert!(record.check_and_mark(&BlockIdentifier::new(7, H256::keccak256(b"other"))));
    }

    #[test]
    fn test_record_evicts_oldest() {
        let record = ImpeachmentRecord::new();
        for n in 0..=IMPEACHMENT_RECORD_SIZE as u64 {
            record.check_and_mark(&BlockIdentifier::new(n, H256::ZERO));
        }
        assert!(!record.contains(&BlockIdentifier::new(0, H256::ZERO)));
        assert!(record.contains(&BlockIdentifier::new(1, H256::ZERO)));
    }
}
