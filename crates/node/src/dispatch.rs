//! Maps decoded gossip messages onto the validator and memory pool.
//!
//! The dispatcher owns no sockets: callers feed it decoded messages and act
//! on the returned [`Action`]s. Misbehaviour accumulates per peer; a peer
//! reaching the ban score is disconnected.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cinder_chainstate::state::{BlockOutcome, ChainState};
use cinder_chainstate::validation::{ErrorKind, ValidationFlags};
use cinder_consensus::constants::{
    ALERT_SAFE_MODE_PRIORITY, BAN_SCORE, MAX_ADDR_ENTRIES, MAX_INV_ENTRIES,
    MIN_PEER_PROTO_VERSION,
};
use cinder_consensus::{Hash256, ZERO_HASH};
use cinder_log::{log_debug, log_info, log_warn};
use cinder_primitives::encoding::from_bytes;
use cinder_primitives::hash::sha256d;
use cinder_script::secp::verify_hash_signature;

use crate::mempool::Mempool;
use crate::wire::{AlertPayload, InvKind, Inventory, NetMessage};

const GETBLOCKS_LIMIT: usize = 500;
const GETHEADERS_LIMIT: usize = 2_000;
/// Peers reporting a start height this far behind the tip are not relayed
/// fresh block inventory.
pub const RELAY_HEIGHT_SLACK: i32 = 2_000;

#[derive(Debug)]
pub struct Peer {
    pub id: u64,
    pub version: i32,
    pub services: u64,
    pub start_height: i32,
    pub misbehavior: u32,
    pub banned: bool,
    pub known_inventory: HashSet<Hash256>,
}

impl Peer {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            version: 0,
            services: 0,
            start_height: -1,
            misbehavior: 0,
            banned: false,
            known_inventory: HashSet::new(),
        }
    }

    pub fn has_handshaken(&self) -> bool {
        self.version != 0
    }

    /// Accumulates a misbehaviour score; returns true when the peer crosses
    /// the ban threshold.
    pub fn misbehaving(&mut self, score: u32) -> bool {
        self.misbehavior += score;
        if self.misbehavior >= BAN_SCORE && !self.banned {
            self.banned = true;
            log_warn!("peer {} banned (score {})", self.id, self.misbehavior);
        }
        self.banned
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Send a message back to the originating peer.
    Send(NetMessage),
    /// Announce inventory to every peer that is close enough to the tip.
    Relay(Inventory),
    /// Request inventory data from the originating peer.
    AskFor(Inventory),
    /// Ask the peer for blocks after our locator, up to `stop`.
    RequestBlocks { locator: Vec<Hash256>, stop: Hash256 },
    Disconnect,
}

pub struct Dispatcher {
    chain: Arc<ChainState>,
    mempool: Arc<Mempool>,
    flags: ValidationFlags,
    safe_mode: AtomicBool,
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Dispatcher {
    pub fn new(chain: Arc<ChainState>, mempool: Arc<Mempool>, flags: ValidationFlags) -> Self {
        Self {
            chain,
            mempool,
            flags,
            safe_mode: AtomicBool::new(false),
        }
    }

    /// True when either an authenticated alert or the chain state's own
    /// checkpoint monitoring has restricted the node.
    pub fn safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Relaxed) || self.chain.safe_mode_reason().is_some()
    }

    pub fn handle(&self, peer: &mut Peer, message: NetMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        if peer.banned {
            return vec![Action::Disconnect];
        }

        match message {
            NetMessage::Version(payload) => {
                if peer.has_handshaken() {
                    // A peer must not send version twice.
                    if peer.misbehaving(1) {
                        actions.push(Action::Disconnect);
                    }
                    return actions;
                }
                if payload.version < MIN_PEER_PROTO_VERSION {
                    log_debug!("peer {} too old ({})", peer.id, payload.version);
                    return vec![Action::Disconnect];
                }
                peer.version = payload.version;
                peer.services = payload.services;
                peer.start_height = payload.start_height;
                actions.push(Action::Send(NetMessage::Verack));
                // Start pulling their chain right away.
                actions.push(Action::RequestBlocks {
                    locator: self.chain.best_locator(),
                    stop: ZERO_HASH,
                });
            }
            message if !peer.has_handshaken() => {
                // Nothing else is allowed before version.
                log_debug!(
                    "peer {} sent {} before version",
                    peer.id,
                    message.command()
                );
                if peer.misbehaving(1) {
                    actions.push(Action::Disconnect);
                }
            }
            NetMessage::Verack => {}
            NetMessage::Addr(addrs) => {
                if addrs.len() > MAX_ADDR_ENTRIES && peer.misbehaving(20) {
                    actions.push(Action::Disconnect);
                }
                // Address book maintenance is the transport layer's concern.
            }
            NetMessage::Inv(entries) => {
                if entries.len() > MAX_INV_ENTRIES {
                    if peer.misbehaving(20) {
                        actions.push(Action::Disconnect);
                    }
                    return actions;
                }
                for inventory in entries {
                    peer.known_inventory.insert(inventory.hash);
                    let already_have = match inventory.kind() {
                        Some(InvKind::Transaction) => {
                            self.mempool.contains(&inventory.hash)
                                || self.mempool.has_orphan(&inventory.hash)
                                || self.chain.contains_tx(&inventory.hash).unwrap_or(false)
                        }
                        Some(InvKind::Block) => {
                            self.chain.contains_block(&inventory.hash)
                                || self.chain.is_orphan_block(&inventory.hash)
                        }
                        None => true,
                    };
                    if !already_have {
                        actions.push(Action::AskFor(inventory));
                    }
                }
            }
            NetMessage::GetData(entries) => {
                if entries.len() > MAX_INV_ENTRIES {
                    if peer.misbehaving(20) {
                        actions.push(Action::Disconnect);
                    }
                    return actions;
                }
                for inventory in entries {
                    match inventory.kind() {
                        Some(InvKind::Block) => {
                            if let Some(block) = self.chain.block_by_hash(&inventory.hash) {
                                actions.push(Action::Send(NetMessage::Block(block)));
                            }
                        }
                        Some(InvKind::Transaction) => {
                            if let Some(tx) = self.mempool.get(&inventory.hash) {
                                actions.push(Action::Send(NetMessage::Tx(tx)));
                            }
                        }
                        None => {}
                    }
                }
            }
            NetMessage::GetBlocks { locator, .. } => {
                let hashes = self.chain.hashes_after_locator(&locator, GETBLOCKS_LIMIT);
                if !hashes.is_empty() {
                    actions.push(Action::Send(NetMessage::Inv(
                        hashes.into_iter().map(Inventory::block).collect(),
                    )));
                }
            }
            NetMessage::GetHeaders { locator, .. } => {
                let headers = self
                    .chain
                    .headers_after_locator(&locator, GETHEADERS_LIMIT);
                actions.push(Action::Send(NetMessage::Headers(headers)));
            }
            NetMessage::Tx(tx) => {
                self.handle_tx(peer, tx, &mut actions);
            }
            NetMessage::Block(block) => {
                let hash = block.hash();
                peer.known_inventory.insert(hash);
                match self.chain.process_block(&block, &self.flags) {
                    Ok(BlockOutcome::Accepted { .. }) => {
                        actions.push(Action::Relay(Inventory::block(hash)));
                    }
                    Ok(BlockOutcome::Orphan { root, wanted }) => {
                        actions.push(Action::RequestBlocks {
                            locator: self.chain.best_locator(),
                            stop: root,
                        });
                        actions.push(Action::AskFor(Inventory::block(wanted)));
                    }
                    Err(err) => {
                        log_debug!("block {} rejected: {err}", cinder_consensus::hash256_to_hex(&hash));
                        if err.dos > 0 && peer.misbehaving(err.dos) {
                            actions.push(Action::Disconnect);
                        }
                    }
                }
            }
            NetMessage::Headers(_) => {
                // Header-first sync is driven by the sync layer outside the
                // consensus core.
            }
            NetMessage::Ping(nonce) => {
                actions.push(Action::Send(NetMessage::Pong(nonce)));
            }
            NetMessage::Pong(_) => {}
            NetMessage::Alert { payload, signature } => {
                self.handle_alert(peer, &payload, &signature, &mut actions);
            }
            NetMessage::Checkpoint { hash, signature } => {
                self.handle_checkpoint(peer, hash, &signature, &mut actions);
            }
        }

        actions
    }

    fn handle_tx(&self, peer: &mut Peer, tx: cinder_primitives::transaction::Transaction, actions: &mut Vec<Action>) {
        let txid = tx.txid();
        peer.known_inventory.insert(txid);
        let now = now_seconds();

        match self
            .mempool
            .accept(&self.chain, tx.clone(), true, false, now, &self.flags)
        {
            Ok(_) => {
                actions.push(Action::Relay(Inventory::transaction(txid)));
                self.chain.emit_tx_accepted(&txid);

                // Pull in any orphans that were waiting on this transaction.
                let mut queue = vec![txid];
                let mut cursor = 0usize;
                while cursor < queue.len() {
                    let parent = queue[cursor];
                    cursor += 1;
                    for child_txid in self.mempool.orphan_children(&parent) {
                        let Some(child) = self.mempool.take_orphan(&child_txid) else {
                            continue;
                        };
                        match self
                            .mempool
                            .accept(&self.chain, child, true, false, now, &self.flags)
                        {
                            Ok(_) => {
                                actions.push(Action::Relay(Inventory::transaction(child_txid)));
                                self.chain.emit_tx_accepted(&child_txid);
                                queue.push(child_txid);
                            }
                            Err(err) => {
                                log_debug!("orphan tx rejected: {err}");
                            }
                        }
                    }
                }
            }
            Err(err) if err.kind == ErrorKind::MissingInputs => {
                if self.mempool.store_orphan(tx) {
                    log_info!(
                        "stored orphan tx {} ({} pooled)",
                        cinder_consensus::hash256_to_hex(&txid),
                        self.mempool.orphan_count()
                    );
                }
            }
            Err(err) => {
                log_debug!("tx {} rejected: {err}", cinder_consensus::hash256_to_hex(&txid));
                if err.dos > 0 && peer.misbehaving(err.dos) {
                    actions.push(Action::Disconnect);
                }
            }
        }
    }

    /// Alerts must be signed by the network's alert key; a network without
    /// one ignores the channel entirely.
    fn handle_alert(
        &self,
        peer: &mut Peer,
        payload: &[u8],
        signature: &[u8],
        actions: &mut Vec<Action>,
    ) {
        let Some(pubkey) = self.chain.params().consensus.alert_pubkey.clone() else {
            return;
        };
        let digest = sha256d(payload);
        if verify_hash_signature(&pubkey, signature, &digest).is_err() {
            if peer.misbehaving(10) {
                actions.push(Action::Disconnect);
            }
            return;
        }
        let Ok(alert) = from_bytes::<AlertPayload>(payload) else {
            if peer.misbehaving(10) {
                actions.push(Action::Disconnect);
            }
            return;
        };
        if alert.priority >= ALERT_SAFE_MODE_PRIORITY {
            log_warn!("high-priority alert received: {}", alert.status_bar);
            self.safe_mode.store(true, Ordering::Relaxed);
        }
    }

    fn handle_checkpoint(
        &self,
        peer: &mut Peer,
        hash: Hash256,
        signature: &[u8],
        actions: &mut Vec<Action>,
    ) {
        let Some(pubkey) = self
            .chain
            .params()
            .consensus
            .checkpoint_pubkey
            .clone()
        else {
            return;
        };
        if verify_hash_signature(&pubkey, signature, &hash).is_err() {
            if peer.misbehaving(10) {
                actions.push(Action::Disconnect);
            }
            return;
        }
        if self.chain.contains_block(&hash) {
            if let Err(err) = self.chain.write_sync_checkpoint(&hash) {
                log_warn!("failed to persist sync checkpoint: {err}");
            } else {
                log_info!(
                    "sync checkpoint at {}",
                    cinder_consensus::hash256_to_hex(&hash)
                );
            }
        }
    }
}
