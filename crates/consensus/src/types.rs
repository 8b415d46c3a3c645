//! Shared consensus types.

use dposbft_types::BlockIdentifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Phase of the LBFT2 state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LbftState {
    /// Waiting for a block
    #[default]
    Idle,
    /// Prepare-signed a block, collecting prepare signatures
    Prepare,
    /// Commit-signed a block, collecting commit signatures
    Commit,
    /// Prepare-signed an impeach block
    ImpeachPrepare,
    /// Commit-signed an impeach block
    ImpeachCommit,
    /// Observer: verifying finished blocks only
    Validate,
}

impl LbftState {
    /// Whether this is a phase of the impeach path.
    pub fn is_impeach(&self) -> bool {
        matches!(self, LbftState::ImpeachPrepare | LbftState::ImpeachCommit)
    }

    /// Whether signatures in this phase are final.
    pub fn is_commit(&self) -> bool {
        matches!(self, LbftState::Commit | LbftState::ImpeachCommit)
    }
}

impl fmt::Display for LbftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LbftState::Idle => "Idle",
            LbftState::Prepare => "Prepare",
            LbftState::Commit => "Commit",
            LbftState::ImpeachPrepare => "ImpeachPrepare",
            LbftState::ImpeachCommit => "ImpeachCommit",
            LbftState::Validate => "Validate",
        };
        f.write_str(s)
    }
}

/// Node status reported to peers and the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DposStatus {
    /// Current LBFT2 phase
    pub state: LbftState,
    /// Local chain head
    pub head: BlockIdentifier,
}

/// Wall-clock reading paired with the monotonic instant it was taken at.
static CLOCK_ANCHOR: OnceLock<(u64, std::time::Instant)> = OnceLock::new();

/// Current time in Unix milliseconds.
///
/// The wall clock is read once; after that the time advances with the tokio
/// clock, so deadlines and block timestamps follow a paused test runtime.
pub fn now_ms() -> u64 {
    let (wall_ms, anchor) = *CLOCK_ANCHOR.get_or_init(|| {
        (
            chrono::Utc::now().timestamp_millis().max(0) as u64,
            std::time::Instant::now(),
        )
    });
    let now = tokio::time::Instant::now().into_std();
    match now.checked_duration_since(anchor) {
        Some(ahead) => wall_ms + ahead.as_millis() as u64,
        None => wall_ms.saturating_sub(anchor.duration_since(now).as_millis() as u64),
    }
}

/// Resolves once `stop` carries `true`. A dropped sender never stops.
pub async fn stopped(stop: &mut tokio::sync::watch::Receiver<bool>) {
    if stop.wait_for(|s| *s).await.is_err() {
        std::future::pending::<()>().await;
    }
}
