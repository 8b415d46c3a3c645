//! # DPoS-BFT Consensus
//!
//! Delegated proof-of-stake block production with LBFT2 finality.
//!
//! Accounts earn a reputation score (RPT) from their balance, activity and
//! contribution. Every term a seeded, RPT-weighted election picks the proposer
//! committee of the term two terms ahead. Proposers take turns sealing blocks;
//! a committee of `3f + 1` validators finalizes each block in two signature
//! rounds and tolerates `f` faulty members.
//!
//! ## Block Flow
//!
//! ```text
//!  proposer                 validators (3f + 1)
//!  ────────                 ───────────────────
//!  prepare / finalize / seal
//!        │ preprepare
//!        ▼
//!        ├──────────────▶  verify, prepare-sign ──▶ prepare (2f + 1)
//!                                                        │
//!                           commit-sign  ◀───────────────┘
//!                                │ commit (2f + 1)
//!                                ▼
//!                           insert, validate ──▶ observers
//! ```
//!
//! When the proposer stays silent for `period + impeach_timeout`, every
//! validator builds the same deterministic impeach block, which needs only
//! `f + 1` signatures per round.
//!
//! ## Modules
//!
//! - [`rpt`]: reputation scores
//! - [`election`]: seeded weighted committee election
//! - [`snapshot`]: committee snapshots per block
//! - [`verify`]: header, seal and signature checks
//! - [`lbft`]: the LBFT2 state machine
//! - [`impeachment`]: proposer timeout and impeach blocks
//! - [`signatures`], [`signed_blocks`]: signature caches and double-sign guard
//! - [`dialer`], [`handler`]: committee connections and message routing
//! - [`api`]: read-only queries

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod api;
pub mod broadcast;
pub mod chain;
pub mod dialer;
pub mod election;
pub mod engine;
pub mod error;
pub mod handler;
pub mod impeachment;
pub mod lbft;
pub mod protocol;
pub mod rpt;
pub mod service;
pub mod signatures;
pub mod signed_blocks;
pub mod snapshot;
pub mod types;
pub mod verify;

pub use api::{BlockNumber, DposApi};
pub use chain::{
    CandidateService, ChainReadWriter, ChainReader, ChannelSession, ContributionSource, KeySigner,
    MemoryChain, MemoryState, NoContribution, PeerServer, PeerSession, RNodeService, RptBackend,
    RptCoefficients, RptParameters, Signer, StateWriter, StaticCandidates,
};
pub use dialer::{Dialer, PeerInfo, RemoteSigner};
pub use election::elect;
pub use engine::{Dpos, EXTRA_VANITY};
pub use error::{DposError, ErrorCode, ProtocolError, Result};
pub use handler::Handler;
pub use impeachment::{ImpeachTimer, ImpeachmentRecord};
pub use lbft::{Action, Lbft2};
pub use protocol::{Message, MsgCode, RawMessage, SignerStatus, PROTOCOL_NAME, PROTOCOL_VERSION};
pub use rpt::{Rpt, RptCollector, RptList, RptService};
pub use signatures::{SignatureCache, Signatures};
pub use signed_blocks::SignedBlocksRecord;
pub use snapshot::DposSnapshot;
pub use types::{DposStatus, LbftState};
pub use verify::{AlwaysFail, AlwaysPass, Delayed, Normal, VerifyStage, VerifyStrategy};
