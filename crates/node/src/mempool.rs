//! Dependency-aware memory pool with conflict rejection and free-relay rate
//! limiting.

use std::collections::HashMap;
use std::sync::RwLock;

use cinder_chainstate::state::{value_in, ChainState, TxSource};
use cinder_chainstate::validation::{
    are_inputs_standard, check_transaction, is_standard_tx, ValidationError, ValidationFlags,
};
use cinder_consensus::constants::{DEFAULT_LIMIT_FREE_RELAY, DEFAULT_MAX_ORPHAN_TRANSACTIONS, MAX_ORPHAN_TX_SIZE};
use cinder_consensus::money::{Amount, MIN_RELAY_TX_FEE};
use cinder_consensus::Hash256;
use cinder_log::{log_debug, log_info};
use cinder_primitives::outpoint::OutPoint;
use cinder_primitives::transaction::Transaction;
use rand::seq::SliceRandom;

/// Transactions under this size may relay without fees, rate-limited.
const FREE_TX_SIZE_LIMIT: usize = 10_000;

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub size: usize,
    pub fee: Amount,
    pub added: i64,
}

struct FreeRelayWindow {
    count: f64,
    last_time: i64,
}

impl FreeRelayWindow {
    /// Exponentially decaying byte counter with a ~10-minute half window.
    fn allow(&mut self, bytes: usize, now: i64, cap: f64) -> bool {
        let elapsed = (now - self.last_time).max(0) as f64;
        self.count *= (1.0 - 1.0 / 600.0_f64).powf(elapsed);
        self.last_time = now;
        if self.count > cap {
            return false;
        }
        self.count += bytes as f64;
        true
    }
}

struct OrphanTxPool {
    by_hash: HashMap<Hash256, Transaction>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    capacity: usize,
}

impl OrphanTxPool {
    fn new(capacity: usize) -> Self {
        Self {
            by_hash: HashMap::new(),
            by_prev: HashMap::new(),
            capacity,
        }
    }

    fn insert(&mut self, txid: Hash256, tx: Transaction) -> bool {
        if self.by_hash.contains_key(&txid) {
            return false;
        }
        if tx.serialized_size() > MAX_ORPHAN_TX_SIZE {
            log_debug!("ignoring large orphan tx");
            return false;
        }
        for input in &tx.vin {
            self.by_prev
                .entry(input.prevout.hash)
                .or_default()
                .push(txid);
        }
        self.by_hash.insert(txid, tx);
        self.limit();
        true
    }

    fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let tx = self.by_hash.remove(txid)?;
        for input in &tx.vin {
            if let Some(children) = self.by_prev.get_mut(&input.prevout.hash) {
                children.retain(|child| child != txid);
                if children.is_empty() {
                    self.by_prev.remove(&input.prevout.hash);
                }
            }
        }
        Some(tx)
    }

    fn children(&self, parent: &Hash256) -> Vec<Hash256> {
        self.by_prev.get(parent).cloned().unwrap_or_default()
    }

    fn limit(&mut self) {
        while self.by_hash.len() > self.capacity {
            let keys: Vec<Hash256> = self.by_hash.keys().copied().collect();
            let Some(victim) = keys.choose(&mut rand::thread_rng()).copied() else {
                return;
            };
            self.remove(&victim);
        }
    }
}

struct MempoolInner {
    by_hash: HashMap<Hash256, MempoolEntry>,
    by_outpoint: HashMap<OutPoint, (Hash256, u32)>,
    free_relay: FreeRelayWindow,
    orphans: OrphanTxPool,
    updates: u64,
}

pub struct Mempool {
    inner: RwLock<MempoolInner>,
    limit_free_relay: i64,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT_FREE_RELAY)
    }
}

impl Mempool {
    /// `limit_free_relay` is in kilobytes per decay window.
    pub fn new(limit_free_relay: i64) -> Self {
        Self {
            inner: RwLock::new(MempoolInner {
                by_hash: HashMap::new(),
                by_outpoint: HashMap::new(),
                free_relay: FreeRelayWindow {
                    count: 0.0,
                    last_time: 0,
                },
                orphans: OrphanTxPool::new(DEFAULT_MAX_ORPHAN_TRANSACTIONS),
                updates: 0,
            }),
            limit_free_relay,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("mempool lock").by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn updates(&self) -> u64 {
        self.inner.read().expect("mempool lock").updates
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.inner
            .read()
            .expect("mempool lock")
            .by_hash
            .contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<Transaction> {
        self.inner
            .read()
            .expect("mempool lock")
            .by_hash
            .get(txid)
            .map(|entry| entry.tx.clone())
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.inner
            .read()
            .expect("mempool lock")
            .by_outpoint
            .get(outpoint)
            .map(|(txid, _)| *txid)
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let mut out: Vec<Hash256> = self
            .inner
            .read()
            .expect("mempool lock")
            .by_hash
            .keys()
            .copied()
            .collect();
        out.sort();
        out
    }

    /// Admission control for loose transactions. Replacement is disabled:
    /// any conflict with a pooled outpoint rejects the newcomer.
    pub fn accept(
        &self,
        chain: &ChainState,
        tx: Transaction,
        check_inputs: bool,
        from_wallet: bool,
        now: i64,
        flags: &ValidationFlags,
    ) -> Result<Amount, ValidationError> {
        let consensus = &chain.params().consensus;
        check_transaction(&tx, consensus)?;

        if tx.is_coinbase() {
            return Err(ValidationError::malformed("coinbase as individual tx", 100));
        }
        if tx.is_coinstake() {
            return Err(ValidationError::malformed("coinstake as individual tx", 100));
        }
        if tx.lock_time > i32::MAX as u32 {
            return Err(ValidationError::consensus("lock time out of range", 0));
        }
        if chain.params().require_standard && !is_standard_tx(&tx) {
            return Err(ValidationError::consensus("nonstandard transaction", 0));
        }

        let txid = tx.txid();
        {
            let inner = self.inner.read().expect("mempool lock");
            if inner.by_hash.contains_key(&txid) {
                return Err(ValidationError::consensus("already in pool", 0));
            }
            for input in &tx.vin {
                if inner.by_outpoint.contains_key(&input.prevout) {
                    return Err(ValidationError::consensus("conflicts with pooled spend", 0));
                }
            }
        }
        if check_inputs && chain.contains_tx(&txid)? {
            return Err(ValidationError::consensus("already in chain", 0));
        }

        let size = tx.serialized_size();
        let mut fee: Amount = 0;
        if check_inputs {
            let mut inputs = chain.fetch_inputs_loose(&tx, self)?;

            if chain.params().require_standard
                && !are_inputs_standard(&tx, |index| {
                    let input = tx.vin.get(index)?;
                    let fetched = inputs.get(&input.prevout.hash)?;
                    fetched
                        .tx
                        .vout
                        .get(input.prevout.index as usize)
                        .map(|output| output.script_pubkey.as_slice())
                })
            {
                return Err(ValidationError::consensus("nonstandard transaction input", 0));
            }

            fee = value_in(&tx, &inputs)?.saturating_sub(tx.value_out());
            let required = if size < FREE_TX_SIZE_LIMIT {
                0
            } else {
                tx.min_fee(1000)
            };
            if fee < required {
                return Err(ValidationError::consensus("not enough fees", 0));
            }

            if fee < MIN_RELAY_TX_FEE && !from_wallet {
                let cap = (self.limit_free_relay * 1000) as f64;
                let mut inner = self.inner.write().expect("mempool lock");
                if !inner.free_relay.allow(size, now, cap) {
                    return Err(ValidationError::lite(
                        "free transaction rejected by rate limiter",
                        0,
                    ));
                }
            }

            chain.connect_inputs_dry(&tx, &mut inputs, flags)?;
        }

        let mut inner = self.inner.write().expect("mempool lock");
        if inner.by_hash.contains_key(&txid) {
            return Err(ValidationError::consensus("already in pool", 0));
        }
        for input in &tx.vin {
            if inner.by_outpoint.contains_key(&input.prevout) {
                return Err(ValidationError::consensus("conflicts with pooled spend", 0));
            }
        }
        for (index, input) in tx.vin.iter().enumerate() {
            inner
                .by_outpoint
                .insert(input.prevout, (txid, index as u32));
        }
        inner.by_hash.insert(
            txid,
            MempoolEntry {
                tx,
                size,
                fee,
                added: now,
            },
        );
        inner.updates += 1;
        log_info!(
            "accepted tx {} (pool size {})",
            cinder_consensus::hash256_to_hex(&txid),
            inner.by_hash.len()
        );
        Ok(fee)
    }

    /// Reinserts a transaction from a disconnected block, without input
    /// checks; dependency order is the caller's concern.
    pub fn resurrect(&self, chain: &ChainState, tx: Transaction, now: i64) {
        let flags = ValidationFlags::default();
        if let Err(err) = self.accept(chain, tx, false, false, now, &flags) {
            log_debug!("resurrection skipped: {err}");
        }
    }

    pub fn remove(&self, txid: &Hash256) -> Option<Transaction> {
        let mut inner = self.inner.write().expect("mempool lock");
        let entry = inner.by_hash.remove(txid)?;
        for input in &entry.tx.vin {
            inner.by_outpoint.remove(&input.prevout);
        }
        inner.updates += 1;
        Some(entry.tx)
    }

    pub fn store_orphan(&self, tx: Transaction) -> bool {
        let txid = tx.txid();
        self.inner
            .write()
            .expect("mempool lock")
            .orphans
            .insert(txid, tx)
    }

    pub fn orphan_count(&self) -> usize {
        self.inner.read().expect("mempool lock").orphans.by_hash.len()
    }

    pub fn has_orphan(&self, txid: &Hash256) -> bool {
        self.inner
            .read()
            .expect("mempool lock")
            .orphans
            .by_hash
            .contains_key(txid)
    }

    pub fn orphan_children(&self, parent: &Hash256) -> Vec<Hash256> {
        self.inner
            .read()
            .expect("mempool lock")
            .orphans
            .children(parent)
    }

    pub fn take_orphan(&self, txid: &Hash256) -> Option<Transaction> {
        self.inner
            .write()
            .expect("mempool lock")
            .orphans
            .remove(txid)
    }
}

impl TxSource for Mempool {
    fn loose_tx(&self, txid: &Hash256) -> Option<Transaction> {
        self.get(txid)
    }
}
