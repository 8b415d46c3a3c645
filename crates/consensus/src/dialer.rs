//! Connections to the other committee members.
//!
//! The [`Dialer`] keeps one [`RemoteSigner`] per connected proposer or
//! validator, keyed by account address. Sessions are admitted through a
//! [`SignerStatus`] handshake; only accounts in the current or future
//! committees are kept.
//!
//! Outbound messages go through a bounded per-peer queue drained by a writer
//! task, so a slow peer backs up its own queue instead of the caller.

use crate::chain::{PeerServer, PeerSession};
use crate::engine::Dpos;
use crate::error::{ErrorCode, ProtocolError};
use crate::protocol::{validate_mac_sig, Message, RawMessage, SignerStatus, PROTOCOL_VERSION};
use crate::types::stopped;
use dposbft_config::TERM_DISTANCE_BETWEEN_ELECTION_AND_MINING;
use dposbft_types::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Outbound messages buffered per remote signer.
pub const REMOTE_SIGNER_QUEUE_SIZE: usize = 64;

/// A connected remote signer.
pub struct RemoteSigner {
    address: Address,
    session: Arc<dyn PeerSession>,
    queue: mpsc::Sender<RawMessage>,
}

impl RemoteSigner {
    /// Wrap `session` and start its writer task.
    pub fn new(address: Address, session: Arc<dyn PeerSession>) -> Arc<Self> {
        let (queue, mut outbound) = mpsc::channel::<RawMessage>(REMOTE_SIGNER_QUEUE_SIZE);
        let writer = session.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let code = msg.code;
                if let Err(e) = writer.write_msg(msg).await {
                    warn!(peer = %writer.id(), code, error = %e, "failed to write to remote signer");
                    writer.disconnect().await;
                    break;
                }
            }
        });
        Arc::new(Self {
            address,
            session,
            queue,
        })
    }

    /// Account of the remote signer.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Transport-level peer id.
    pub fn id(&self) -> String {
        self.session.id()
    }

    /// Remote socket address.
    pub fn remote_addr(&self) -> String {
        self.session.remote_addr()
    }

    /// Messages waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        REMOTE_SIGNER_QUEUE_SIZE - self.queue.capacity()
    }

    /// Enqueue `msg`, waiting while the queue is full.
    pub async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        self.queue
            .send(msg.encode())
            .await
            .map_err(|_| ProtocolError::Disconnected)
    }

    /// Enqueue `msg` unless the queue is full.
    pub fn try_send(&self, msg: &Message) -> Result<(), ProtocolError> {
        self.queue.try_send(msg.encode()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ProtocolError::new(ErrorCode::SuspendedPeer, format!("queue of {} is full", self.address))
            }
            mpsc::error::TrySendError::Closed(_) => ProtocolError::Disconnected,
        })
    }
}

/// Connection summary of a remote signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Account address
    pub address: Address,
    /// Transport-level peer id
    pub id: String,
    /// Remote socket address
    pub remote_addr: String,
    /// Member of a tracked proposer committee
    pub is_proposer: bool,
    /// Member of a tracked validator committee
    pub is_validator: bool,
    /// Messages waiting in the outbound queue
    pub queued: usize,
}

/// Remote proposers and validators of the local node.
pub struct Dialer {
    dpos: Arc<Dpos>,
    server: RwLock<Option<Arc<dyn PeerServer>>>,
    proposers: RwLock<HashMap<Address, Arc<RemoteSigner>>>,
    validators: RwLock<HashMap<Address, Arc<RemoteSigner>>>,
    ids: RwLock<HashMap<String, Address>>,
}

impl Dialer {
    /// Create a dialer for `dpos` and register it with the engine.
    pub fn new(dpos: Arc<Dpos>) -> Arc<Self> {
        let dialer = Arc::new(Self {
            dpos: dpos.clone(),
            server: RwLock::new(None),
            proposers: RwLock::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
            ids: RwLock::new(HashMap::new()),
        });
        dpos.set_dialer(&dialer);
        dialer
    }

    /// Peer server used to dial committee members.
    pub fn set_server(&self, server: Arc<dyn PeerServer>) {
        *self.server.write() = Some(server);
    }

    /// Handshake with a new session and keep it if the remote is a signer.
    pub async fn add_peer(&self, session: Arc<dyn PeerSession>) -> Result<Arc<RemoteSigner>, ProtocolError> {
        let (mac, sig) = self.dpos.get_mac()?;
        let status = SignerStatus {
            protocol_version: PROTOCOL_VERSION,
            mac,
            sig,
        };
        session.write_msg(Message::NewSigner(status).encode()).await?;

        let raw = session.read_msg().await?;
        let Message::NewSigner(remote) = Message::decode(&raw)? else {
            return Err(ProtocolError::new(
                ErrorCode::NoStatusMsg,
                format!("first message has code {:#x}", raw.code),
            ));
        };
        if remote.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::new(
                ErrorCode::ProtocolVersionMismatch,
                format!("{} (!= {})", remote.protocol_version, PROTOCOL_VERSION),
            ));
        }
        let address = validate_mac_sig(&remote.mac, &remote.sig, chrono::Utc::now())?;

        let head = self.dpos.chain().current_header().number;
        let (term, future_term) = (self.dpos.term_of(head), self.dpos.future_term_of(head));
        let mut is_proposer = false;
        let mut is_validator = false;
        for t in term..=future_term {
            is_proposer |= self.dpos.verify_proposer_of(&address, t)?;
            is_validator |= self.dpos.verify_validator_of(&address, t)?;
        }
        if !is_proposer && !is_validator {
            debug!(%address, peer = %session.id(), "rejecting peer outside the committees");
            return Err(ProtocolError::NotSigner);
        }

        let signer = RemoteSigner::new(address, session.clone());
        if is_proposer {
            self.proposers.write().insert(address, signer.clone());
        }
        if is_validator {
            self.validators.write().insert(address, signer.clone());
        }
        self.ids.write().insert(session.id(), address);

        info!(%address, peer = %session.id(), remote = %session.remote_addr(), is_proposer, is_validator, "added remote signer");
        Ok(signer)
    }

    /// Forget the session `id`. Returns the account it belonged to.
    pub fn remove_peer(&self, id: &str) -> Option<Address> {
        let address = self.ids.write().remove(id)?;
        self.proposers.write().remove(&address);
        self.validators.write().remove(&address);
        debug!(%address, peer = id, "removed remote signer");
        Some(address)
    }

    /// Remote signer behind session `id`.
    pub fn signer_by_id(&self, id: &str) -> Option<Arc<RemoteSigner>> {
        let address = *self.ids.read().get(id)?;
        self.validator(&address).or_else(|| self.proposer(&address))
    }

    /// Connected remote validator `address`.
    pub fn validator(&self, address: &Address) -> Option<Arc<RemoteSigner>> {
        self.validators.read().get(address).cloned()
    }

    /// Connected remote proposer `address`.
    pub fn proposer(&self, address: &Address) -> Option<Arc<RemoteSigner>> {
        self.proposers.read().get(address).cloned()
    }

    /// Every connected remote signer, each once.
    pub fn all_signers(&self) -> Vec<Arc<RemoteSigner>> {
        let mut seen = BTreeSet::new();
        let validators = self.validators.read();
        let proposers = self.proposers.read();
        validators
            .values()
            .chain(proposers.values())
            .filter(|s| seen.insert(s.address()))
            .cloned()
            .collect()
    }

    /// Connected validators of `term`, excluding the local account.
    pub fn validators_of_term(&self, term: u64) -> Vec<Arc<RemoteSigner>> {
        let Ok(committee) = self.dpos.validators_of_term(term) else {
            return Vec::new();
        };
        let coinbase = self.dpos.coinbase();
        let validators = self.validators.read();
        committee
            .iter()
            .filter(|a| **a != coinbase)
            .filter_map(|a| validators.get(a).cloned())
            .collect()
    }

    /// Whether at least `2f` remote validators of `term` are connected.
    pub fn enough_validators_of_term(&self, term: u64) -> bool {
        self.validators_of_term(term).len() as u64 >= 2 * self.dpos.config().faulty_number
    }

    /// Whether at least `f` remote validators of `term` are connected.
    pub fn enough_impeach_validators_of_term(&self, term: u64) -> bool {
        self.validators_of_term(term).len() as u64 >= self.dpos.config().faulty_number
    }

    /// Dial the configured node of every unconnected validator from `term`
    /// through its future term. Returns how many dials succeeded.
    pub async fn dial_all_remote_validators(&self, term: u64) -> usize {
        let Some(server) = self.server.read().clone() else {
            debug!(term, "no peer server, skipping dial");
            return 0;
        };
        let coinbase = self.dpos.coinbase();

        let mut targets = BTreeSet::new();
        for t in term..=term + TERM_DISTANCE_BETWEEN_ELECTION_AND_MINING {
            match self.dpos.validators_of_term(t) {
                Ok(list) => targets.extend(list),
                Err(e) => debug!(term = t, error = %e, "validators of term unavailable"),
            }
        }

        let mut dialed = 0;
        for address in targets {
            if address == coinbase || self.validator(&address).is_some() {
                continue;
            }
            let Some(url) = self.dpos.network().validator_nodes.get(&address) else {
                debug!(%address, "no node url for validator");
                continue;
            };
            match server.add_peer(url).await {
                Ok(()) => {
                    dialed += 1;
                    debug!(%address, %url, "dialed validator");
                }
                Err(e) => warn!(%address, %url, error = %e, "failed to dial validator"),
            }
        }
        dialed
    }

    /// Re-dial missing validators of the head's term until `stop` fires.
    pub async fn keep_connection(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let period = self
            .dpos
            .network()
            .keep_connection_interval()
            .max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let head = self.dpos.chain().current_header().number;
                    let term = self.dpos.term_of(head);
                    let dialed = self.dial_all_remote_validators(term).await;
                    if dialed > 0 {
                        info!(term, dialed, "reconnected validators");
                    }
                }
                _ = stopped(&mut stop) => return,
            }
        }
    }

    /// Summary of every connected remote signer.
    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        let signers = self.all_signers();
        let proposers = self.proposers.read();
        let validators = self.validators.read();
        let mut infos: Vec<PeerInfo> = signers
            .iter()
            .map(|s| PeerInfo {
                address: s.address(),
                id: s.id(),
                remote_addr: s.remote_addr(),
                is_proposer: proposers.contains_key(&s.address()),
                is_validator: validators.contains_key(&s.address()),
                queued: s.queued(),
            })
            .collect();
        infos.sort_by_key(|i| i.address);
        infos
    }
}
