//! The consensus state machine: block acceptance, best-chain selection, and
//! reorganization over an arena-backed block index.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use cinder_burn::{burned_value_in_block, expected_effective_burn_coins, final_burn_hash, intermediate_burn_hash, BurnHashInput};
use cinder_consensus::constants::{
    DEFAULT_MAX_ORPHAN_BLOCKS, MAX_BLOCK_SIGOPS, SYNC_CHECKPOINT_MAX_AGE,
};
use cinder_consensus::money::{money_range, Amount, MIN_TX_FEE};
use cinder_consensus::{ChainParams, Hash256, ZERO_HASH};
use cinder_log::{log_debug, log_info, log_warn};
use cinder_pow::difficulty::{
    check_proof_of_burn_hash, compact_to_u256, compute_max_bits, last_of_kind,
    next_burn_target_required, next_target_required,
};
use cinder_pow::rewards::proof_of_stake_reward;
use cinder_primitives::block::Block;
use cinder_primitives::hash::hash160;
use cinder_primitives::merkle::merkle_root;
use cinder_primitives::outpoint::OutPoint;
use cinder_primitives::transaction::{Transaction, TxIn, TxOut};
use cinder_script::standard::{classify, p2sh_sig_op_count, sig_op_count, ScriptType};
use cinder_script::ScriptVerifier;
use cinder_storage::{meta, Column, KeyValueStore, WriteBatch};
use primitive_types::U256;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::blockfiles::{BlockFilePos, BlockFileStore};
use crate::blockindex::BlockIndexRecord;
use crate::index::ChainIndex;
use crate::kernel::{check_stake_kernel, next_stake_modifier, stake_modifier_checksum};
use crate::notify::ChainNotifier;
use crate::trust::block_trust;
use crate::txindex::{read_tx_index, TxIndexEntry, TxIndexOverlay, TxPos};
use crate::validation::{check_block, ValidationError, ValidationFlags};

/// Source of loose transactions consulted after the store; the memory pool
/// implements this.
pub trait TxSource {
    fn loose_tx(&self, txid: &Hash256) -> Option<Transaction>;
}

/// An empty transaction source for contexts with no memory pool.
pub struct NoTxSource;

impl TxSource for NoTxSource {
    fn loose_tx(&self, _txid: &Hash256) -> Option<Transaction> {
        None
    }
}

#[derive(Clone, Debug)]
pub struct FetchedInput {
    pub entry: TxIndexEntry,
    pub tx: Transaction,
}

pub type FetchedInputs = HashMap<Hash256, FetchedInput>;

/// Prev output referenced by an input, with explicit failure instead of
/// panicking on out-of-range access.
pub fn output_for<'a>(
    inputs: &'a FetchedInputs,
    input: &TxIn,
) -> Result<&'a TxOut, ValidationError> {
    let fetched = inputs
        .get(&input.prevout.hash)
        .ok_or_else(|| ValidationError::malformed("prevout not fetched", 100))?;
    fetched
        .tx
        .vout
        .get(input.prevout.index as usize)
        .ok_or_else(|| ValidationError::malformed("prevout index out of range", 100))
}

pub fn value_in(tx: &Transaction, inputs: &FetchedInputs) -> Result<Amount, ValidationError> {
    if tx.is_coinbase() {
        return Ok(0);
    }
    let mut total: Amount = 0;
    for input in &tx.vin {
        total = total.saturating_add(output_for(inputs, input)?.value);
    }
    Ok(total)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockOutcome {
    Accepted { new_best: bool },
    /// Parent unknown; held in the orphan pool. `root` is the deepest known
    /// orphan ancestor, `wanted` the missing block to request.
    Orphan { root: Hash256, wanted: Hash256 },
}

struct SigCheck {
    tx_index: usize,
    input_index: usize,
    prev_script: Vec<u8>,
}

struct OrphanBlockPool {
    by_hash: HashMap<Hash256, Block>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    capacity: usize,
}

impl OrphanBlockPool {
    fn new(capacity: usize) -> Self {
        Self {
            by_hash: HashMap::new(),
            by_prev: HashMap::new(),
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.by_hash.len()
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    fn has_dependent(&self, hash: &Hash256) -> bool {
        self.by_prev.contains_key(hash)
    }

    fn children(&self, hash: &Hash256) -> Vec<Hash256> {
        self.by_prev.get(hash).cloned().unwrap_or_default()
    }

    fn insert(&mut self, hash: Hash256, block: Block) {
        self.by_prev
            .entry(block.header.prev_block)
            .or_default()
            .push(hash);
        self.by_hash.insert(hash, block);
    }

    fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let block = self.by_hash.remove(hash)?;
        if let Some(siblings) = self.by_prev.get_mut(&block.header.prev_block) {
            siblings.retain(|sibling| sibling != hash);
            if siblings.is_empty() {
                self.by_prev.remove(&block.header.prev_block);
            }
        }
        Some(block)
    }

    /// Deepest known ancestor still in the pool.
    fn root_of(&self, hash: &Hash256) -> Hash256 {
        let mut cursor = *hash;
        while let Some(block) = self.by_hash.get(&cursor) {
            if !self.by_hash.contains_key(&block.header.prev_block) {
                return cursor;
            }
            cursor = block.header.prev_block;
        }
        cursor
    }

    /// The missing block the orphan chain ultimately builds on.
    fn wanted_by(&self, hash: &Hash256) -> Hash256 {
        let root = self.root_of(hash);
        self.by_hash
            .get(&root)
            .map(|block| block.header.prev_block)
            .unwrap_or(root)
    }

    /// Evicts a random orphan, descending into dependents first so no entry
    /// is left referencing an evicted parent.
    fn prune(&mut self) {
        while self.len() >= self.capacity {
            let keys: Vec<Hash256> = self.by_hash.keys().copied().collect();
            let Some(mut victim) = keys.choose(&mut rand::thread_rng()).copied() else {
                return;
            };
            while let Some(children) = self.by_prev.get(&victim) {
                let Some(child) = children.first().copied() else {
                    break;
                };
                victim = child;
            }
            self.remove(&victim);
            log_debug!("pruned orphan block {}", cinder_consensus::hash256_to_hex(&victim));
        }
    }
}

struct ChainInner {
    index: ChainIndex,
    orphans: OrphanBlockPool,
    proof_of_stake_hashes: HashMap<Hash256, Hash256>,
    stake_seen: HashSet<(OutPoint, u32)>,
    burn_seen: HashSet<(Hash256, Hash256)>,
    stake_seen_orphan: HashSet<(OutPoint, u32)>,
    burn_seen_orphan: HashSet<Hash256>,
    best_invalid_trust: U256,
}

pub struct ChainState {
    store: Arc<dyn KeyValueStore>,
    files: BlockFileStore,
    params: ChainParams,
    verifier: Arc<dyn ScriptVerifier>,
    notifiers: RwLock<Vec<Arc<dyn ChainNotifier>>>,
    inner: Mutex<ChainInner>,
    shutdown: AtomicBool,
    safe_mode_reason: RwLock<Option<String>>,
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// The deterministic chain root derived from the network's genesis seed.
pub fn build_genesis(params: &ChainParams) -> Block {
    let seed = &params.consensus.genesis;
    let mut script_sig = Vec::with_capacity(seed.coinbase_tag.len() + 1);
    script_sig.push(seed.coinbase_tag.len() as u8);
    script_sig.extend_from_slice(seed.coinbase_tag.as_bytes());
    let coinbase = Transaction {
        version: Transaction::CURRENT_VERSION,
        time: seed.time,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::empty()],
        lock_time: 0,
    };
    let merkle = merkle_root(&[coinbase.txid()]);
    Block {
        header: cinder_primitives::block::BlockHeader {
            version: seed.version,
            prev_block: ZERO_HASH,
            merkle_root: merkle,
            time: seed.time,
            bits: seed.bits,
            burn_bits: seed.burn_bits,
            nonce: seed.nonce,
        },
        transactions: vec![coinbase],
        signature: Vec::new(),
        pob: None,
        effective_burn_coins: 0,
    }
}

impl ChainState {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        files: BlockFileStore,
        params: ChainParams,
        verifier: Arc<dyn ScriptVerifier>,
    ) -> Result<Self, ValidationError> {
        let mut records: Vec<(Hash256, BlockIndexRecord)> = Vec::new();
        for (key, value) in store.scan_prefix(Column::BlockIndex, &[])? {
            let hash: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| ValidationError::transient("corrupt block index key"))?;
            let record = BlockIndexRecord::decode(&value)
                .map_err(|_| ValidationError::transient("corrupt block index entry"))?;
            records.push((hash, record));
        }
        records.sort_by_key(|(_, record)| record.height);

        let mut index = ChainIndex::new();
        let mut stake_seen = HashSet::new();
        let mut burn_seen = HashSet::new();
        for (hash, record) in records {
            if let Some(kernel) = record.stake_kernel {
                stake_seen.insert(kernel);
            }
            if let Some(kernel) = record.burn_kernel {
                burn_seen.insert(kernel);
            }
            index.insert(hash, record);
        }
        for slot in 0..index.len() as u32 {
            if let Some(next_hash) = index.entry(slot).record.next_hash {
                let next_slot = index.lookup(&next_hash);
                index.entry_mut(slot).next = next_slot;
            }
        }

        if let Some(best_bytes) = store.get(Column::Meta, meta::BEST_CHAIN)? {
            let best_hash: Hash256 = best_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ValidationError::transient("corrupt best chain hash"))?;
            index.set_best(index.lookup(&best_hash));
        }

        let best_invalid_trust = match store.get(Column::Meta, meta::BEST_INVALID_TRUST)? {
            Some(bytes) if bytes.len() == 32 => U256::from_little_endian(&bytes),
            _ => U256::zero(),
        };

        Ok(Self {
            store,
            files,
            params,
            verifier,
            notifiers: RwLock::new(Vec::new()),
            inner: Mutex::new(ChainInner {
                index,
                orphans: OrphanBlockPool::new(DEFAULT_MAX_ORPHAN_BLOCKS),
                proof_of_stake_hashes: HashMap::new(),
                stake_seen,
                burn_seen,
                stake_seen_orphan: HashSet::new(),
                burn_seen_orphan: HashSet::new(),
                best_invalid_trust,
            }),
            shutdown: AtomicBool::new(false),
            safe_mode_reason: RwLock::new(None),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn register_notifier(&self, notifier: Arc<dyn ChainNotifier>) {
        self.notifiers.write().expect("notifier lock").push(notifier);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Why the node is in safe mode, if it is. Outer services restrict their
    /// surface while this is set.
    pub fn safe_mode_reason(&self) -> Option<String> {
        self.safe_mode_reason
            .read()
            .expect("safe mode lock")
            .clone()
    }

    pub fn enter_safe_mode(&self, reason: &str) {
        {
            let mut guard = self.safe_mode_reason.write().expect("safe mode lock");
            if guard.is_some() {
                return;
            }
            *guard = Some(reason.to_string());
        }
        log_warn!("entering safe mode: {reason}");
        self.each_notifier(|notifier| notifier.safe_mode_entered(reason));
    }

    fn each_notifier(&self, mut visit: impl FnMut(&dyn ChainNotifier)) {
        for notifier in self.notifiers.read().expect("notifier lock").iter() {
            visit(notifier.as_ref());
        }
    }

    pub fn emit_tx_accepted(&self, txid: &Hash256) {
        self.each_notifier(|notifier| notifier.tx_accepted(txid));
    }

    pub fn emit_tx_removed(&self, txid: &Hash256) {
        self.each_notifier(|notifier| notifier.tx_removed(txid));
    }

    pub fn emit_transaction_updated(&self, txid: &Hash256) {
        self.each_notifier(|notifier| notifier.transaction_updated(txid));
    }

    pub fn best_hash(&self) -> Option<Hash256> {
        let inner = self.inner.lock().expect("main lock");
        inner.index.best().map(|slot| inner.index.entry(slot).hash)
    }

    pub fn best_height(&self) -> i64 {
        self.inner.lock().expect("main lock").index.best_height()
    }

    /// The committed best-chain hash as the store sees it.
    pub fn read_best_chain_hash(&self) -> Result<Option<Hash256>, ValidationError> {
        Ok(self
            .store
            .get(Column::Meta, meta::BEST_CHAIN)?
            .and_then(|bytes| bytes.as_slice().try_into().ok()))
    }

    pub fn read_sync_checkpoint(&self) -> Result<Option<Hash256>, ValidationError> {
        Ok(self
            .store
            .get(Column::Meta, meta::SYNC_CHECKPOINT)?
            .and_then(|bytes| bytes.as_slice().try_into().ok()))
    }

    pub fn write_sync_checkpoint(&self, hash: &Hash256) -> Result<(), ValidationError> {
        self.store.put(Column::Meta, meta::SYNC_CHECKPOINT, hash)?;
        Ok(())
    }

    pub fn contains_block(&self, hash: &Hash256) -> bool {
        self.inner.lock().expect("main lock").index.contains(hash)
    }

    pub fn is_orphan_block(&self, hash: &Hash256) -> bool {
        self.inner.lock().expect("main lock").orphans.contains(hash)
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<i64> {
        let inner = self.inner.lock().expect("main lock");
        inner
            .index
            .lookup(hash)
            .map(|slot| inner.index.entry(slot).record.height)
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Option<Block> {
        let pos = {
            let inner = self.inner.lock().expect("main lock");
            let slot = inner.index.lookup(hash)?;
            inner.index.entry(slot).record.pos
        };
        self.read_block(pos).ok()
    }

    /// Main-chain block hashes from `locator` onward, for `getblocks`.
    pub fn hashes_after_locator(&self, locator: &[Hash256], limit: usize) -> Vec<Hash256> {
        let inner = self.inner.lock().expect("main lock");
        let mut start_height = 0i64;
        for hash in locator {
            if let Some(slot) = inner.index.lookup(hash) {
                if inner.index.is_main_chain(slot) {
                    start_height = inner.index.entry(slot).record.height + 1;
                    break;
                }
            }
        }
        let mut out = Vec::new();
        let best_height = inner.index.best_height();
        let mut height = start_height;
        while height <= best_height && out.len() < limit {
            if let Some(slot) = inner.index.main_ancestor_at(height) {
                out.push(inner.index.entry(slot).hash);
            }
            height += 1;
        }
        out
    }

    /// Main-chain headers from `locator` onward, for `getheaders`.
    pub fn headers_after_locator(
        &self,
        locator: &[Hash256],
        limit: usize,
    ) -> Vec<cinder_primitives::block::BlockHeader> {
        let inner = self.inner.lock().expect("main lock");
        let mut start_height = 0i64;
        for hash in locator {
            if let Some(slot) = inner.index.lookup(hash) {
                if inner.index.is_main_chain(slot) {
                    start_height = inner.index.entry(slot).record.height + 1;
                    break;
                }
            }
        }
        let mut out = Vec::new();
        let best_height = inner.index.best_height();
        let mut height = start_height;
        while height <= best_height && out.len() < limit {
            if let Some(slot) = inner.index.main_ancestor_at(height) {
                out.push(inner.index.entry(slot).record.header.clone());
            }
            height += 1;
        }
        out
    }

    /// A block locator for the current best chain: dense near the tip,
    /// exponentially sparse toward genesis.
    pub fn best_locator(&self) -> Vec<Hash256> {
        let inner = self.inner.lock().expect("main lock");
        let mut out = Vec::new();
        let Some(best) = inner.index.best() else {
            return out;
        };
        let mut height = inner.index.entry(best).record.height;
        let mut step = 1i64;
        while height > 0 {
            if let Some(slot) = inner.index.main_ancestor_at(height) {
                out.push(inner.index.entry(slot).hash);
            }
            if out.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        if let Some(genesis) = inner.index.genesis() {
            out.push(inner.index.entry(genesis).hash);
        }
        out
    }

    pub fn is_in_main_chain(&self, hash: &Hash256) -> bool {
        let inner = self.inner.lock().expect("main lock");
        inner
            .index
            .lookup(hash)
            .map(|slot| inner.index.is_main_chain(slot))
            .unwrap_or(false)
    }

    pub fn next_in_main_chain(&self, hash: &Hash256) -> Option<Hash256> {
        let inner = self.inner.lock().expect("main lock");
        let slot = inner.index.lookup(hash)?;
        inner
            .index
            .entry(slot)
            .next
            .map(|next| inner.index.entry(next).hash)
    }

    /// `(bits, burn_bits)` a block extending `prev` must carry.
    pub fn next_targets(
        &self,
        prev: &Hash256,
        proof_of_stake: bool,
    ) -> Result<(u32, u32), ValidationError> {
        let inner = self.inner.lock().expect("main lock");
        let slot = inner.index.lookup(prev);
        let bits = next_target_required(&inner.index, slot, proof_of_stake, &self.params.consensus)?;
        let burn_bits = next_burn_target_required(&inner.index, slot, &self.params.consensus)?;
        Ok((bits, burn_bits))
    }

    /// Effective burn coins a block extending `prev` must declare.
    pub fn expected_effective_coins(
        &self,
        prev: &Hash256,
        block_is_pow: bool,
        burned: Amount,
    ) -> Option<i64> {
        let inner = self.inner.lock().expect("main lock");
        let slot = inner.index.lookup(prev)?;
        let prev_effective = inner.index.entry(slot).record.effective_burn_coins;
        Some(expected_effective_burn_coins(
            prev_effective,
            burned,
            block_is_pow,
            &self.params.consensus,
        ))
    }

    pub fn contains_tx(&self, txid: &Hash256) -> Result<bool, ValidationError> {
        Ok(read_tx_index(self.store.as_ref(), txid)?.is_some())
    }

    pub fn main_chain_tx(&self, txid: &Hash256) -> Option<Transaction> {
        let entry = read_tx_index(self.store.as_ref(), txid).ok()??;
        if entry.pos.is_mempool() {
            return None;
        }
        self.read_tx_at(entry.pos).ok()
    }

    fn read_block(&self, pos: BlockFilePos) -> Result<Block, ValidationError> {
        let bytes = self
            .files
            .read(pos)
            .map_err(|_| ValidationError::transient("block file read failed"))?;
        Block::from_wire_bytes(&bytes)
            .map_err(|_| ValidationError::transient("stored block is corrupt"))
    }

    fn read_tx_at(&self, pos: TxPos) -> Result<Transaction, ValidationError> {
        let block = self.read_block(BlockFilePos {
            file: pos.file,
            offset: pos.offset,
        })?;
        block
            .transactions
            .get(pos.index as usize)
            .cloned()
            .ok_or_else(|| ValidationError::transient("tx position out of range"))
    }

    /// Creates and commits the genesis block when the index is empty.
    pub fn init_genesis(&self) -> Result<Hash256, ValidationError> {
        let mut inner = self.inner.lock().expect("main lock");
        if let Some(slot) = inner.index.genesis() {
            return Ok(inner.index.entry(slot).hash);
        }

        let block = build_genesis(&self.params);
        let hash = block.hash();
        let body = block.to_wire_bytes();
        let pos = self
            .files
            .append(&body)
            .map_err(|_| ValidationError::transient("block file write failed"))?;

        let trust = block_trust(
            &inner.index,
            None,
            block.kind(),
            block.header.time,
            block.header.bits,
            block.header.burn_bits,
            &self.params.consensus,
        );
        let modifier = next_stake_modifier(0, &hash);
        let record = BlockIndexRecord {
            header: block.header.clone(),
            next_hash: None,
            height: 0,
            pos,
            kind: block.kind(),
            chain_trust: trust.to_little_endian(),
            mint: 0,
            money_supply: 0,
            effective_burn_coins: 0,
            stake_modifier: modifier,
            stake_modifier_checksum: stake_modifier_checksum(0, modifier, None),
            proof_of_stake_hash: None,
            stake_kernel: None,
            burn_kernel: None,
        };

        let mut batch = WriteBatch::new();
        batch.put(Column::BlockIndex, hash, record.encode());
        batch.put(Column::Meta, meta::BEST_CHAIN, hash);
        self.store.write_batch(&batch)?;

        let slot = inner.index.insert(hash, record);
        inner.index.set_best(Some(slot));
        log_info!(
            "initialized chain at genesis {}",
            cinder_consensus::hash256_to_hex(&hash)
        );
        self.each_notifier(|notifier| notifier.best_chain_updated(&hash, 0));
        Ok(hash)
    }

    /// Entry point for gossiped and mined blocks.
    pub fn process_block(
        &self,
        block: &Block,
        flags: &ValidationFlags,
    ) -> Result<BlockOutcome, ValidationError> {
        let mut inner = self.inner.lock().expect("main lock");
        self.process_block_locked(&mut inner, block, flags)
    }

    fn process_block_locked(
        &self,
        inner: &mut ChainInner,
        block: &Block,
        flags: &ValidationFlags,
    ) -> Result<BlockOutcome, ValidationError> {
        self.check_sync_checkpoint_age(inner);

        let hash = block.hash();
        if inner.index.contains(&hash) {
            return Err(ValidationError::stale("already have block"));
        }
        if inner.orphans.contains(&hash) {
            return Err(ValidationError::stale("already have block (orphan)"));
        }

        // Limited duplicity on stake and burn kernels: a duplicate is only
        // tolerated when an orphan child already builds on this block.
        if let Some(kernel) = block.stake_kernel() {
            if inner.stake_seen.contains(&kernel) && !inner.orphans.has_dependent(&hash) {
                return Err(ValidationError::duplicate_stake());
            }
        }
        if let Some(kernel) = block.burn_kernel() {
            if inner.burn_seen.contains(&kernel) && !inner.orphans.has_dependent(&hash) {
                return Err(ValidationError::duplicate_burn());
            }
        }

        check_block(block, &self.params.consensus, now_seconds(), flags)?;

        if block.is_proof_of_stake() && flags.check_kernel {
            match self.check_proof_of_stake(inner, block) {
                Ok(pos_hash) => {
                    inner.proof_of_stake_hashes.insert(hash, pos_hash);
                }
                Err(err) => {
                    log_warn!(
                        "proof-of-stake check failed for {}: {err}",
                        cinder_consensus::hash256_to_hex(&hash)
                    );
                    return Err(ValidationError::consensus("check proof-of-stake failed", 0));
                }
            }
        }

        if block.is_proof_of_burn() {
            if let Err(err) = self.check_proof_of_burn(inner, block) {
                log_warn!(
                    "proof-of-burn check failed for {}: {err}",
                    cinder_consensus::hash256_to_hex(&hash)
                );
                // A lone failing PoB block is dropped; one already wanted by
                // an orphan child is kept for the orphan path.
                if !inner.orphans.has_dependent(&hash) {
                    return Err(err);
                }
            }
        }

        self.check_min_work_since_checkpoint(inner, block)?;

        if !inner.index.contains(&block.header.prev_block) {
            inner.orphans.prune();

            if let Some(kernel) = block.stake_kernel() {
                if inner.stake_seen_orphan.contains(&kernel)
                    && !inner.orphans.has_dependent(&hash)
                {
                    return Err(ValidationError::duplicate_stake());
                }
                inner.stake_seen_orphan.insert(kernel);
            } else if block.is_proof_of_burn() {
                if inner.burn_seen_orphan.contains(&hash) && !inner.orphans.has_dependent(&hash) {
                    return Err(ValidationError::duplicate_burn());
                }
                inner.burn_seen_orphan.insert(hash);
            }

            inner.orphans.insert(hash, block.clone());
            let root = inner.orphans.root_of(&hash);
            let wanted = inner.orphans.wanted_by(&hash);
            log_info!(
                "orphan block {}, missing parent {}",
                cinder_consensus::hash256_to_hex(&hash),
                cinder_consensus::hash256_to_hex(&wanted)
            );
            return Ok(BlockOutcome::Orphan { root, wanted });
        }

        let (_, mut new_best) = self.accept_block(inner, block, flags)?;

        // Recursively admit orphans that were waiting on this block.
        let mut queue = vec![hash];
        let mut cursor = 0usize;
        while cursor < queue.len() {
            if self.is_shutdown() {
                break;
            }
            let parent = queue[cursor];
            cursor += 1;
            for child_hash in inner.orphans.children(&parent) {
                let Some(child) = inner.orphans.remove(&child_hash) else {
                    continue;
                };
                if let Some(kernel) = child.stake_kernel() {
                    inner.stake_seen_orphan.remove(&kernel);
                }
                inner.burn_seen_orphan.remove(&child_hash);
                match self.accept_block(inner, &child, flags) {
                    Ok((_, best)) => {
                        new_best |= best;
                        queue.push(child_hash);
                    }
                    Err(err) => {
                        log_debug!(
                            "orphan {} rejected: {err}",
                            cinder_consensus::hash256_to_hex(&child_hash)
                        );
                    }
                }
            }
        }

        Ok(BlockOutcome::Accepted { new_best })
    }

    /// Context-dependent acceptance: attaches the block to the index and
    /// switches chains when it wins on trust.
    fn accept_block(
        &self,
        inner: &mut ChainInner,
        block: &Block,
        flags: &ValidationFlags,
    ) -> Result<(u32, bool), ValidationError> {
        let hash = block.hash();
        if inner.index.contains(&hash) {
            return Err(ValidationError::stale("block already in index"));
        }
        let Some(prev_slot) = inner.index.lookup(&block.header.prev_block) else {
            return Err(ValidationError::lite("prev block not found", 10));
        };
        let consensus = &self.params.consensus;

        let burned = burned_value_in_block(block, consensus);
        let prev_effective = inner.index.entry(prev_slot).record.effective_burn_coins;
        let expected = expected_effective_burn_coins(
            prev_effective,
            burned,
            block.is_proof_of_work(),
            consensus,
        );
        if block.effective_burn_coins != expected {
            return Err(ValidationError::consensus("effective burn coins mismatch", 50));
        }

        let expected_bits = next_target_required(
            &inner.index,
            Some(prev_slot),
            block.is_proof_of_stake(),
            consensus,
        )?;
        if block.header.bits != expected_bits {
            return Err(ValidationError::consensus("incorrect proof target", 100));
        }
        let expected_burn_bits = next_burn_target_required(&inner.index, Some(prev_slot), consensus)?;
        if block.header.burn_bits != expected_burn_bits {
            return Err(ValidationError::consensus("incorrect burn target", 100));
        }

        let prev_entry = inner.index.entry(prev_slot);
        let height = prev_entry.record.height + 1;
        let block_time = block.header.time as i64;
        if block_time <= inner.index.median_time_past(prev_slot) {
            return Err(ValidationError::consensus("block timestamp too early", 0));
        }
        if (block_time + consensus.max_clock_drift as i64)
            < inner.index.entry(prev_slot).record.header.time as i64
        {
            return Err(ValidationError::consensus("block timestamp too early", 0));
        }

        for tx in &block.transactions {
            if !tx.is_final(height, block_time) {
                return Err(ValidationError::lite("contains non-final transaction", 10));
            }
        }

        if !consensus.check_hardened(height, &hash) {
            return Err(ValidationError::consensus("rejected by hardened checkpoint", 100));
        }
        self.check_sync_checkpoint(inner, prev_slot, height)?;

        let body = block.to_wire_bytes();
        // 15MB of slack keeps the store's own log writes safe.
        if let Ok(available) = fs2::available_space(self.files.dir()) {
            if available < 15_000_000 + body.len() as u64 {
                log_warn!("warning: disk space is low, shutting down");
                self.request_shutdown();
                return Err(ValidationError::transient("out of disk space"));
            }
        }
        let pos = self
            .files
            .append(&body)
            .map_err(|_| ValidationError::transient("block file write failed"))?;

        self.add_to_block_index(inner, block, pos, flags)
    }

    fn add_to_block_index(
        &self,
        inner: &mut ChainInner,
        block: &Block,
        pos: BlockFilePos,
        flags: &ValidationFlags,
    ) -> Result<(u32, bool), ValidationError> {
        let hash = block.hash();
        let consensus = &self.params.consensus;
        let prev_slot = inner.index.lookup(&block.header.prev_block);
        let (height, prev_trust, prev_modifier, prev_checksum) = match prev_slot {
            Some(slot) => {
                let entry = inner.index.entry(slot);
                (
                    entry.record.height + 1,
                    entry.chain_trust(),
                    entry.record.stake_modifier,
                    entry.record.stake_modifier_checksum,
                )
            }
            None => (0, U256::zero(), 0, 0),
        };

        let contribution = block_trust(
            &inner.index,
            prev_slot,
            block.kind(),
            block.header.time,
            block.header.bits,
            block.header.burn_bits,
            consensus,
        );
        let chain_trust = prev_trust.saturating_add(contribution);

        let proof_of_stake_hash = inner.proof_of_stake_hashes.get(&hash).copied();
        let modifier = next_stake_modifier(prev_modifier, &hash);
        let checksum =
            stake_modifier_checksum(prev_checksum, modifier, proof_of_stake_hash.as_ref());

        let record = BlockIndexRecord {
            header: block.header.clone(),
            next_hash: None,
            height,
            pos,
            kind: block.kind(),
            chain_trust: chain_trust.to_little_endian(),
            mint: 0,
            money_supply: 0,
            effective_burn_coins: block.effective_burn_coins,
            stake_modifier: modifier,
            stake_modifier_checksum: checksum,
            proof_of_stake_hash,
            stake_kernel: block.stake_kernel(),
            burn_kernel: block.burn_kernel(),
        };

        let mut batch = WriteBatch::new();
        batch.put(Column::BlockIndex, hash, record.encode());
        self.store.write_batch(&batch)?;

        let slot = inner.index.insert(hash, record);
        if let Some(kernel) = block.stake_kernel() {
            inner.stake_seen.insert(kernel);
        }
        if let Some(kernel) = block.burn_kernel() {
            inner.burn_seen.insert(kernel);
        }

        let new_best = chain_trust > inner.index.best_trust();
        if new_best {
            self.set_best_chain(inner, slot, block, flags)?;
        }
        Ok((slot, new_best))
    }

    fn set_best_chain(
        &self,
        inner: &mut ChainInner,
        new_slot: u32,
        block: &Block,
        flags: &ValidationFlags,
    ) -> Result<(), ValidationError> {
        let hash = inner.index.entry(new_slot).hash;
        let best = inner.index.best();

        if best.is_none() {
            // Chain root.
            let mut batch = WriteBatch::new();
            batch.put(Column::Meta, meta::BEST_CHAIN, hash);
            self.store.write_batch(&batch)?;
            inner.index.set_best(Some(new_slot));
        } else if Some(block.header.prev_block) == best.map(|slot| inner.index.entry(slot).hash) {
            self.extend_best_chain(inner, new_slot, block, flags)?;
        } else {
            // The fork wins: reorganize to the first ancestor whose trust
            // already beats the current tip, then connect the rest one
            // transaction batch at a time.
            let mut intermediate = new_slot;
            let mut secondary = Vec::new();
            let best_trust = inner.index.best_trust();
            while let Some(prev) = inner.index.parent(intermediate) {
                if inner.index.entry(prev).chain_trust() <= best_trust {
                    break;
                }
                secondary.push(intermediate);
                intermediate = prev;
            }
            if !secondary.is_empty() {
                log_info!("postponing {} reconnects", secondary.len());
            }

            self.reorganize(inner, intermediate, flags)?;

            for slot in secondary.into_iter().rev() {
                if self.is_shutdown() {
                    break;
                }
                let pos = inner.index.entry(slot).record.pos;
                let Ok(body) = self.read_block(pos) else {
                    log_warn!("reconnect read failed");
                    break;
                };
                // Errors past this point are not fatal: the chain already
                // switched branches in a consistent way.
                if self.extend_best_chain(inner, slot, &body, flags).is_err() {
                    break;
                }
            }
        }

        let tip = inner.index.best().expect("best set above");
        let tip_entry = inner.index.entry(tip);
        let tip_hash = tip_entry.hash;
        let tip_height = tip_entry.record.height;
        log_info!(
            "new best {} height {} trust {}",
            cinder_consensus::hash256_to_hex(&tip_hash),
            tip_height,
            inner.index.best_trust()
        );
        self.each_notifier(|notifier| notifier.best_chain_updated(&tip_hash, tip_height));
        Ok(())
    }

    /// Connects one block on top of the current tip under a single store
    /// batch.
    fn extend_best_chain(
        &self,
        inner: &mut ChainInner,
        slot: u32,
        block: &Block,
        flags: &ValidationFlags,
    ) -> Result<(), ValidationError> {
        let hash = inner.index.entry(slot).hash;
        let mut batch = WriteBatch::new();
        let mut overlay = TxIndexOverlay::new();

        if let Err(err) = self.connect_block(inner, block, slot, &mut overlay, &mut batch, flags) {
            self.invalid_chain_found(inner, slot);
            return Err(err);
        }
        overlay.flush_into(&mut batch);
        batch.put(Column::Meta, meta::BEST_CHAIN, hash);
        self.store.write_batch(&batch)?;

        if let Some(prev) = inner.index.parent(slot) {
            inner.index.entry_mut(prev).next = Some(slot);
        }
        inner.index.set_best(Some(slot));

        self.each_notifier(|notifier| notifier.block_connected(block));
        Ok(())
    }

    /// Switches the main chain to `new_slot` under one store transaction:
    /// disconnect to the fork point, connect the new branch, commit, and only
    /// then flip the in-memory `next` links.
    fn reorganize(
        &self,
        inner: &mut ChainInner,
        new_slot: u32,
        flags: &ValidationFlags,
    ) -> Result<(), ValidationError> {
        let best = inner
            .index
            .best()
            .ok_or_else(|| ValidationError::stale("no best chain"))?;
        let fork = inner
            .index
            .fork_point(best, new_slot)
            .ok_or_else(|| ValidationError::transient("disconnected fork"))?;

        let mut disconnect = Vec::new();
        let mut cursor = best;
        while cursor != fork {
            disconnect.push(cursor);
            cursor = inner
                .index
                .parent(cursor)
                .ok_or_else(|| ValidationError::transient("broken chain links"))?;
        }
        let mut connect = Vec::new();
        let mut cursor = new_slot;
        while cursor != fork {
            connect.push(cursor);
            cursor = inner
                .index
                .parent(cursor)
                .ok_or_else(|| ValidationError::transient("broken chain links"))?;
        }
        connect.reverse();

        log_info!(
            "reorganize: disconnecting {} blocks, connecting {}",
            disconnect.len(),
            connect.len()
        );

        let mut batch = WriteBatch::new();
        let mut overlay = TxIndexOverlay::new();

        let mut disconnected_blocks = Vec::with_capacity(disconnect.len());
        for &slot in &disconnect {
            let block = self.read_block(inner.index.entry(slot).record.pos)?;
            self.disconnect_block(inner, &block, slot, &mut overlay, &mut batch)?;
            disconnected_blocks.push(block);
        }

        let mut connected_blocks = Vec::with_capacity(connect.len());
        for &slot in &connect {
            let block = self.read_block(inner.index.entry(slot).record.pos)?;
            if let Err(err) =
                self.connect_block(inner, &block, slot, &mut overlay, &mut batch, flags)
            {
                self.invalid_chain_found(inner, new_slot);
                return Err(err);
            }
            connected_blocks.push(block);
        }

        overlay.flush_into(&mut batch);
        let new_hash = inner.index.entry(new_slot).hash;
        batch.put(Column::Meta, meta::BEST_CHAIN, new_hash);
        self.store.write_batch(&batch)?;

        // Committed: now it is safe to flip the in-memory links.
        for &slot in &disconnect {
            if let Some(prev) = inner.index.parent(slot) {
                inner.index.entry_mut(prev).next = None;
            }
        }
        for &slot in &connect {
            if let Some(prev) = inner.index.parent(slot) {
                inner.index.entry_mut(prev).next = Some(slot);
            }
        }
        inner.index.set_best(Some(new_slot));

        for block in &disconnected_blocks {
            self.each_notifier(|notifier| notifier.block_disconnected(block));
        }
        for block in &connected_blocks {
            self.each_notifier(|notifier| notifier.block_connected(block));
        }
        log_info!("reorganize done");
        Ok(())
    }

    fn invalid_chain_found(&self, inner: &mut ChainInner, slot: u32) {
        let trust = inner.index.entry(slot).chain_trust();
        if trust > inner.best_invalid_trust {
            inner.best_invalid_trust = trust;
            let _ = self.store.put(
                Column::Meta,
                meta::BEST_INVALID_TRUST,
                &trust.to_little_endian(),
            );
        }
        log_warn!(
            "invalid chain found: block {} height {}",
            cinder_consensus::hash256_to_hex(&inner.index.entry(slot).hash),
            inner.index.entry(slot).record.height
        );
    }

    /// Applies a block's transactions to the tx index within `overlay`,
    /// checking inputs, fees, and signature operations.
    fn connect_block(
        &self,
        inner: &mut ChainInner,
        block: &Block,
        slot: u32,
        overlay: &mut TxIndexOverlay,
        batch: &mut WriteBatch,
        flags: &ValidationFlags,
    ) -> Result<(), ValidationError> {
        let consensus = &self.params.consensus;
        check_block(block, consensus, now_seconds(), flags)?;

        let record_pos = inner.index.entry(slot).record.pos;
        let block_time = block.header.time;

        // Duplicate-txid protection: a transaction id may only be reused
        // once every output of the earlier instance is spent.
        if consensus.bip30_active_at(block_time) {
            for tx in &block.transactions {
                if let Some(existing) = overlay.get(self.store.as_ref(), &tx.txid())? {
                    if existing.spent.iter().any(|spent| spent.is_none()) {
                        return Err(ValidationError::consensus(
                            "transaction overwrites unspent txid",
                            0,
                        ));
                    }
                }
            }
        }

        let strict_p2sh = consensus.strict_p2sh_at(block_time);
        let mut sig_ops = 0u32;
        let mut fees: Amount = 0;
        let mut total_in: Amount = 0;
        let mut total_out: Amount = 0;
        let mut sig_checks: Vec<SigCheck> = Vec::new();

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            for input in &tx.vin {
                sig_ops += sig_op_count(&input.script_sig, false);
            }
            for output in &tx.vout {
                sig_ops += sig_op_count(&output.script_pubkey, false);
            }
            if sig_ops > MAX_BLOCK_SIGOPS {
                return Err(ValidationError::malformed("too many sigops", 100));
            }

            let pos_this_tx = TxPos {
                file: record_pos.file,
                offset: record_pos.offset,
                index: tx_index as u32,
            };

            if tx.is_coinbase() {
                total_out = total_out.saturating_add(tx.value_out());
            } else {
                let mut inputs =
                    self.fetch_inputs(tx, overlay, None, true)?;

                if strict_p2sh {
                    for input in &tx.vin {
                        let prev_script = &output_for(&inputs, input)?.script_pubkey;
                        sig_ops += p2sh_sig_op_count(prev_script, &input.script_sig);
                    }
                    if sig_ops > MAX_BLOCK_SIGOPS {
                        return Err(ValidationError::malformed("too many sigops", 100));
                    }
                }

                let tx_value_in = value_in(tx, &inputs)?;
                let tx_value_out = tx.value_out();
                total_in = total_in.saturating_add(tx_value_in);
                total_out = total_out.saturating_add(tx_value_out);

                let fee = self.connect_inputs(
                    &inner.index,
                    tx,
                    &mut inputs,
                    pos_this_tx,
                    Some(slot),
                    true,
                    strict_p2sh,
                    flags,
                    Some(&mut *overlay),
                    Some((&mut sig_checks, tx_index)),
                )?;
                if !tx.is_coinstake() {
                    fees = fees.saturating_add(fee);
                    if !money_range(fees) {
                        return Err(ValidationError::malformed("fees out of range", 100));
                    }
                }
            }

            overlay.put(tx.txid(), TxIndexEntry::new(pos_this_tx, tx.vout.len()));
        }

        // All inexpensive checks passed; run the queued signature checks in
        // parallel.
        let below_checkpoints = inner.index.best_height() < consensus.total_blocks_estimate();
        if flags.check_signatures && !below_checkpoints && !sig_checks.is_empty() {
            let all_valid = sig_checks.par_iter().all(|check| {
                self.verifier.verify_spend(
                    &block.transactions[check.tx_index],
                    check.input_index,
                    &check.prev_script,
                    strict_p2sh,
                )
            });
            if !all_valid {
                return Err(ValidationError::consensus("script verification failed", 100));
            }
        }

        // Fees are destroyed, not awarded: they only shrink the minted total.
        let mint = total_out - total_in + fees;
        let prev_supply = inner
            .index
            .parent(slot)
            .map(|prev| inner.index.entry(prev).record.money_supply)
            .unwrap_or(0);
        {
            let entry = inner.index.entry_mut(slot);
            entry.record.mint = mint;
            entry.record.money_supply = prev_supply + total_out - total_in;
            batch.put(Column::BlockIndex, entry.hash, entry.record.encode());
        }

        if let Some(prev) = inner.index.parent(slot) {
            let hash = inner.index.entry(slot).hash;
            let prev_entry = inner.index.entry_mut(prev);
            prev_entry.record.next_hash = Some(hash);
            batch.put(
                Column::BlockIndex,
                prev_entry.hash,
                prev_entry.record.encode(),
            );
        }

        Ok(())
    }

    /// Unwinds one block: clears the spend slots its transactions set and
    /// erases their own index entries.
    fn disconnect_block(
        &self,
        inner: &mut ChainInner,
        block: &Block,
        slot: u32,
        overlay: &mut TxIndexOverlay,
        batch: &mut WriteBatch,
    ) -> Result<(), ValidationError> {
        for tx in block.transactions.iter().rev() {
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    let Some(mut entry) =
                        overlay.get(self.store.as_ref(), &input.prevout.hash)?
                    else {
                        return Err(ValidationError::transient("disconnect missing prev index"));
                    };
                    let index = input.prevout.index as usize;
                    if index >= entry.spent.len() {
                        return Err(ValidationError::transient("disconnect prevout out of range"));
                    }
                    entry.spent[index] = None;
                    overlay.put(input.prevout.hash, entry);
                }
            }
            overlay.erase(tx.txid());
        }

        if let Some(prev) = inner.index.parent(slot) {
            let prev_entry = inner.index.entry_mut(prev);
            prev_entry.record.next_hash = None;
            batch.put(
                Column::BlockIndex,
                prev_entry.hash,
                prev_entry.record.encode(),
            );
        }
        Ok(())
    }

    /// Resolves every input of `tx`: the pending overlay first, then the
    /// store, then loose transactions.
    pub fn fetch_inputs(
        &self,
        tx: &Transaction,
        overlay: &TxIndexOverlay,
        loose: Option<&dyn TxSource>,
        require_known: bool,
    ) -> Result<FetchedInputs, ValidationError> {
        let mut inputs = FetchedInputs::new();
        if tx.is_coinbase() {
            return Ok(inputs);
        }

        for input in &tx.vin {
            if inputs.contains_key(&input.prevout.hash) {
                continue;
            }
            let fetched = match overlay.get(self.store.as_ref(), &input.prevout.hash)? {
                Some(entry) if !entry.pos.is_mempool() => {
                    let prev_tx = self.read_tx_at(entry.pos)?;
                    FetchedInput {
                        entry,
                        tx: prev_tx,
                    }
                }
                Some(entry) => {
                    let loose_tx = loose
                        .and_then(|source| source.loose_tx(&input.prevout.hash))
                        .ok_or_else(ValidationError::missing_inputs)?;
                    FetchedInput {
                        entry,
                        tx: loose_tx,
                    }
                }
                None => {
                    if require_known {
                        return Err(ValidationError::consensus("prev tx index not found", 0));
                    }
                    let loose_tx = loose
                        .and_then(|source| source.loose_tx(&input.prevout.hash))
                        .ok_or_else(ValidationError::missing_inputs)?;
                    let entry = TxIndexEntry::new(TxPos::mempool(), loose_tx.vout.len());
                    FetchedInput {
                        entry,
                        tx: loose_tx,
                    }
                }
            };
            inputs.insert(input.prevout.hash, fetched);
        }

        for input in &tx.vin {
            let fetched = inputs
                .get(&input.prevout.hash)
                .ok_or_else(ValidationError::missing_inputs)?;
            let index = input.prevout.index as usize;
            if index >= fetched.tx.vout.len() || index >= fetched.entry.spent.len() {
                return Err(ValidationError::malformed("prevout index out of range", 100));
            }
        }

        Ok(inputs)
    }

    /// Mempool-facing input resolution against the committed chain.
    pub fn fetch_inputs_loose(
        &self,
        tx: &Transaction,
        loose: &dyn TxSource,
    ) -> Result<FetchedInputs, ValidationError> {
        let overlay = TxIndexOverlay::new();
        self.fetch_inputs(tx, &overlay, Some(loose), false)
    }

    /// Mempool-facing dry run of input connection against the current tip.
    pub fn connect_inputs_dry(
        &self,
        tx: &Transaction,
        inputs: &mut FetchedInputs,
        flags: &ValidationFlags,
    ) -> Result<Amount, ValidationError> {
        let inner = self.inner.lock().expect("main lock");
        let context = inner.index.best();
        self.connect_inputs(
            &inner.index,
            tx,
            inputs,
            TxPos::mempool(),
            context,
            false,
            true,
            flags,
            None,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_inputs(
        &self,
        index: &ChainIndex,
        tx: &Transaction,
        inputs: &mut FetchedInputs,
        pos_this_tx: TxPos,
        context_slot: Option<u32>,
        is_block: bool,
        strict_p2sh: bool,
        flags: &ValidationFlags,
        mut overlay: Option<&mut TxIndexOverlay>,
        mut sig_queue: Option<(&mut Vec<SigCheck>, usize)>,
    ) -> Result<Amount, ValidationError> {
        if tx.is_coinbase() {
            return Ok(0);
        }
        let consensus = &self.params.consensus;

        let mut tx_value_in: Amount = 0;
        for input in &tx.vin {
            let fetched = inputs
                .get(&input.prevout.hash)
                .ok_or_else(ValidationError::missing_inputs)?;
            let index_out = input.prevout.index as usize;
            if index_out >= fetched.tx.vout.len() || index_out >= fetched.entry.spent.len() {
                return Err(ValidationError::malformed("prevout index out of range", 100));
            }

            // Coin generation must mature before it can be spent.
            if (fetched.tx.is_coinbase() || fetched.tx.is_coinstake())
                && !fetched.entry.pos.is_mempool()
            {
                let mut cursor = context_slot;
                let mut depth = 0i64;
                while let Some(slot) = cursor {
                    if depth >= consensus.coinbase_maturity {
                        break;
                    }
                    let entry = index.entry(slot);
                    if entry.record.pos.file == fetched.entry.pos.file
                        && entry.record.pos.offset == fetched.entry.pos.offset
                    {
                        return Err(ValidationError::consensus(
                            "tried to spend immature generation",
                            0,
                        ));
                    }
                    depth += 1;
                    cursor = index.parent(slot);
                }
            }

            if fetched.tx.time > tx.time {
                return Err(ValidationError::malformed(
                    "transaction timestamp earlier than input",
                    100,
                ));
            }

            let value = fetched.tx.vout[index_out].value;
            tx_value_in = tx_value_in.saturating_add(value);
            if !money_range(value) || !money_range(tx_value_in) {
                return Err(ValidationError::malformed("input values out of range", 100));
            }
        }

        // Cheap checks done; now conflicts and signatures.
        let below_checkpoints = index.best_height() < consensus.total_blocks_estimate();
        for (input_index, input) in tx.vin.iter().enumerate() {
            let fetched = inputs
                .get_mut(&input.prevout.hash)
                .ok_or_else(ValidationError::missing_inputs)?;
            let index_out = input.prevout.index as usize;

            if fetched.entry.spent[index_out].is_some() {
                return Err(ValidationError::consensus("input already spent", 0));
            }

            let skip_signature = !flags.check_signatures || (is_block && below_checkpoints);
            if !skip_signature {
                let prev_script = fetched.tx.vout[index_out].script_pubkey.clone();
                match &mut sig_queue {
                    Some((queue, tx_index)) => queue.push(SigCheck {
                        tx_index: *tx_index,
                        input_index,
                        prev_script,
                    }),
                    None => {
                        if !self
                            .verifier
                            .verify_spend(tx, input_index, &prev_script, strict_p2sh)
                        {
                            if strict_p2sh
                                && self.verifier.verify_spend(tx, input_index, &prev_script, false)
                            {
                                return Err(ValidationError::consensus(
                                    "strict P2SH verification failed",
                                    0,
                                ));
                            }
                            return Err(ValidationError::malformed(
                                "signature verification failed",
                                100,
                            ));
                        }
                    }
                }
            }

            fetched.entry.spent[index_out] = Some(pos_this_tx);
            if let Some(overlay) = overlay.as_deref_mut() {
                overlay.put(input.prevout.hash, fetched.entry.clone());
            }
        }

        if tx.is_coinstake() {
            let coin_age = self.transaction_coin_age(index, tx, inputs)?;
            let stake_reward = tx.value_out() - tx_value_in;
            let ceiling = proof_of_stake_reward(coin_age, tx.time, consensus) - tx.min_fee(1)
                + MIN_TX_FEE;
            if stake_reward > ceiling {
                return Err(ValidationError::malformed("stake reward exceeded", 100));
            }
            Ok(0)
        } else {
            let tx_value_out = tx.value_out();
            if tx_value_in < tx_value_out {
                return Err(ValidationError::malformed("value in below value out", 100));
            }
            let fee = tx_value_in - tx_value_out;
            // Block inclusion enforces the size-scaled fee floor; relay fee
            // policy lives in the memory pool.
            if is_block && fee < tx.min_fee(1) {
                return Err(ValidationError::malformed("fee below minimum", 100));
            }
            Ok(fee)
        }
    }

    /// Coin-days consumed by a transaction; inputs below the minimum stake
    /// age contribute nothing.
    fn transaction_coin_age(
        &self,
        index: &ChainIndex,
        tx: &Transaction,
        inputs: &FetchedInputs,
    ) -> Result<u64, ValidationError> {
        let consensus = &self.params.consensus;
        let mut cent_seconds: i128 = 0;
        for input in &tx.vin {
            let fetched = inputs
                .get(&input.prevout.hash)
                .ok_or_else(ValidationError::missing_inputs)?;
            if fetched.entry.pos.is_mempool() {
                continue;
            }
            if fetched.tx.time > tx.time {
                return Err(ValidationError::consensus(
                    "timestamp violation in coin age",
                    0,
                ));
            }
            let Some(block_slot) =
                index.slot_by_file_pos(fetched.entry.pos.file, fetched.entry.pos.offset)
            else {
                continue;
            };
            let block_time = index.entry(block_slot).record.header.time;
            if (block_time as u64) + consensus.stake_min_age as u64 > tx.time as u64 {
                continue;
            }

            let value = output_for(inputs, input)?.value;
            cent_seconds += (value as i128) * ((tx.time - fetched.tx.time) as i128)
                / cinder_consensus::money::CENT as i128;
        }
        let coin_days = cent_seconds * cinder_consensus::money::CENT as i128
            / cinder_consensus::money::COIN as i128
            / (24 * 60 * 60);
        Ok(coin_days.max(0) as u64)
    }

    /// Verifies the stake kernel of a PoS block and returns its hash.
    fn check_proof_of_stake(
        &self,
        inner: &ChainInner,
        block: &Block,
    ) -> Result<Hash256, ValidationError> {
        let consensus = &self.params.consensus;
        let coinstake = &block.transactions[1];
        let prevout = coinstake.vin[0].prevout;

        let entry = read_tx_index(self.store.as_ref(), &prevout.hash)?
            .ok_or_else(|| ValidationError::consensus("stake prev tx not indexed", 0))?;
        if entry.pos.is_mempool() {
            return Err(ValidationError::consensus("stake prev tx not in chain", 0));
        }
        let prev_tx = self.read_tx_at(entry.pos)?;
        let prev_value = prev_tx
            .vout
            .get(prevout.index as usize)
            .ok_or_else(|| ValidationError::malformed("stake prevout out of range", 100))?
            .value;

        let stake_block_slot = inner
            .index
            .slot_by_file_pos(entry.pos.file, entry.pos.offset)
            .ok_or_else(|| ValidationError::consensus("stake prev block unknown", 0))?;
        let modifier = inner.index.entry(stake_block_slot).record.stake_modifier;

        check_stake_kernel(
            modifier,
            prev_tx.time,
            prev_value,
            &prevout,
            coinstake.time,
            block.header.bits,
            consensus.stake_min_age,
        )
        .map_err(|_| ValidationError::consensus("bad stake kernel", 0))
    }

    /// Full proof-of-burn validation against the current main chain.
    fn check_proof_of_burn(
        &self,
        inner: &ChainInner,
        block: &Block,
    ) -> Result<(), ValidationError> {
        let consensus = &self.params.consensus;
        let Some(pob) = &block.pob else {
            return Err(ValidationError::malformed("not a proof-of-burn block", 100));
        };

        let Some(prev_slot) = inner.index.lookup(&block.header.prev_block) else {
            return Err(ValidationError::consensus("prev block not found", 0));
        };
        if !inner.index.is_main_chain(prev_slot) {
            return Err(ValidationError::lite("prev block not in main chain", 1));
        }

        let Some(burn_slot) = inner.index.main_ancestor_at(pob.burn_block_height as i64) else {
            return Err(ValidationError::lite("burn block not found", 1));
        };
        let burn_entry_hash = inner.index.entry(burn_slot).hash;
        let burn_block = self
            .read_block(inner.index.entry(burn_slot).record.pos)
            .map_err(|_| ValidationError::lite("burn block cannot be read", 1))?;

        if !inner.index.entry(prev_slot).record.kind.is_work() {
            return Err(ValidationError::consensus(
                "previous block is not proof-of-work",
                100,
            ));
        }
        if pob.burn_block_hash != burn_entry_hash {
            return Err(ValidationError::lite("burn block hash mismatch", 10));
        }

        let burn_tx = burn_block
            .transactions
            .get(pob.burn_tx_index as usize)
            .ok_or_else(|| ValidationError::consensus("burn tx index out of range", 10))?;
        let burn_out = burn_tx
            .vout
            .get(pob.burn_out_index as usize)
            .ok_or_else(|| ValidationError::consensus("burn output index out of range", 10))?;
        if burn_out.script_pubkey != consensus.burn_script_pubkey {
            return Err(ValidationError::consensus(
                "burn output does not pay the burn address",
                10,
            ));
        }
        if burn_out.value <= 0 {
            return Err(ValidationError::consensus("burn value is zero", 10));
        }

        let prev_entry = inner.index.entry(prev_slot);
        let pow_between = inner
            .index
            .pow_blocks_between(pob.burn_block_height as i64, prev_entry.record.height);
        let input = BurnHashInput {
            burn_block_hash: pob.burn_block_hash,
            burn_tx_hash: burn_tx.txid(),
            prev_block_hash: block.header.prev_block,
            burn_value: burn_out.value,
            pow_between,
            prev_block_time: prev_entry.record.header.time,
        };
        let final_hash = final_burn_hash(&input, consensus)
            .map_err(|_| ValidationError::consensus("burn hash construction failed", 0))?;

        match check_proof_of_burn_hash(&final_hash, block.header.burn_bits, consensus) {
            Ok(true) => {}
            _ => return Err(ValidationError::consensus("proof-of-burn failed", 100)),
        }

        let expected_header_hash = if consensus.burn_intermediate_at(block.header.time) {
            intermediate_burn_hash(&input)
        } else {
            final_hash
        };
        if pob.burn_hash != expected_header_hash {
            return Err(ValidationError::consensus("burn hash mismatch", 75));
        }

        self.check_burn_signer(block, burn_tx)?;
        Ok(())
    }

    /// Only the burner may mint on their burn: the key paid by the block's
    /// coinbase must be the key that funded the burn transaction.
    fn check_burn_signer(
        &self,
        block: &Block,
        burn_tx: &Transaction,
    ) -> Result<(), ValidationError> {
        let signer_mismatch = ValidationError::consensus("burner and block signer differ", 100);

        let burner_input = burn_tx
            .vin
            .first()
            .ok_or(signer_mismatch)?;
        let funding_entry = read_tx_index(self.store.as_ref(), &burner_input.prevout.hash)?
            .ok_or(signer_mismatch)?;
        if funding_entry.pos.is_mempool() {
            return Err(signer_mismatch);
        }
        let funding_tx = self.read_tx_at(funding_entry.pos)?;
        let funding_script = &funding_tx
            .vout
            .get(burner_input.prevout.index as usize)
            .ok_or(signer_mismatch)?
            .script_pubkey;

        let block_output = block.signing_output().ok_or(signer_mismatch)?;
        let Some((ScriptType::PubKey, block_solutions)) = classify(&block_output.script_pubkey)
        else {
            return Err(signer_mismatch);
        };
        let block_pubkey = &block_solutions[0];

        match classify(funding_script) {
            Some((ScriptType::PubKey, solutions)) if &solutions[0] == block_pubkey => Ok(()),
            Some((ScriptType::PubKeyHash, solutions))
                if solutions[0] == hash160(block_pubkey) =>
            {
                Ok(())
            }
            _ => Err(signer_mismatch),
        }
    }

    /// Anti-spam: blocks not extending the best chain must carry at least
    /// the minimum work reachable since the synchronized checkpoint.
    fn check_min_work_since_checkpoint(
        &self,
        inner: &ChainInner,
        block: &Block,
    ) -> Result<(), ValidationError> {
        let consensus = &self.params.consensus;
        let Some(best) = inner.index.best() else {
            return Ok(());
        };
        if block.header.prev_block == inner.index.entry(best).hash {
            return Ok(());
        }
        let Some(checkpoint_hash) = self.read_sync_checkpoint()? else {
            return Ok(());
        };
        let Some(checkpoint_slot) = inner.index.lookup(&checkpoint_hash) else {
            return Ok(());
        };

        let checkpoint_time = inner.index.entry(checkpoint_slot).record.header.time;
        let delta = block.header.time as i64 - checkpoint_time as i64;
        let is_stake = block.is_proof_of_stake();
        let base_slot = last_of_kind(&inner.index, checkpoint_slot, is_stake);
        let base_bits = inner.index.entry(base_slot).record.header.bits;
        let limit = if is_stake {
            consensus.stake_limit_at(block.header.time)
        } else {
            consensus.work_limit
        };
        let required = compute_max_bits(&limit, base_bits, delta)?;
        let claimed = compact_to_u256(block.header.bits)?;
        if claimed > compact_to_u256(required)? {
            self.enter_safe_mode("block with too little proof since the synchronized checkpoint");
            return Err(ValidationError::consensus("block with too little proof", 100));
        }
        Ok(())
    }

    /// A stale synchronized checkpoint means the checkpoint service is
    /// unreachable or withheld; keep validating but restrict the node.
    fn check_sync_checkpoint_age(&self, inner: &ChainInner) {
        let Ok(Some(checkpoint_hash)) = self.read_sync_checkpoint() else {
            return;
        };
        let Some(checkpoint_slot) = inner.index.lookup(&checkpoint_hash) else {
            return;
        };
        let checkpoint_time = inner.index.entry(checkpoint_slot).record.header.time as i64;
        if checkpoint_time + SYNC_CHECKPOINT_MAX_AGE < now_seconds() {
            self.enter_safe_mode("synchronized checkpoint is too old");
        }
    }

    /// The chain being extended must contain the synchronized checkpoint.
    fn check_sync_checkpoint(
        &self,
        inner: &ChainInner,
        prev_slot: u32,
        height: i64,
    ) -> Result<(), ValidationError> {
        let Some(checkpoint_hash) = self.read_sync_checkpoint()? else {
            return Ok(());
        };
        let Some(checkpoint_slot) = inner.index.lookup(&checkpoint_hash) else {
            return Ok(());
        };
        let checkpoint_height = inner.index.entry(checkpoint_slot).record.height;
        if height <= checkpoint_height {
            self.enter_safe_mode("received a chain violating the synchronized checkpoint");
            return Err(ValidationError::checkpoint("forks below the sync checkpoint"));
        }
        let mut cursor = prev_slot;
        while inner.index.entry(cursor).record.height > checkpoint_height {
            match inner.index.parent(cursor) {
                Some(prev) => cursor = prev,
                None => return Err(ValidationError::checkpoint("chain root above checkpoint")),
            }
        }
        if cursor != checkpoint_slot {
            self.enter_safe_mode("received a chain violating the synchronized checkpoint");
            return Err(ValidationError::checkpoint(
                "rejected by synchronized checkpoint",
            ));
        }
        Ok(())
    }
}
