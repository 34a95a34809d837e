//! Keeps the memory pool in step with best-chain changes.

use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use cinder_chainstate::notify::ChainNotifier;
use cinder_chainstate::state::ChainState;
use cinder_log::log_debug;
use cinder_primitives::block::Block;

use crate::mempool::Mempool;

/// Chain observer that removes connected transactions from the pool and
/// resurrects the user transactions of disconnected blocks.
pub struct MempoolSync {
    chain: Weak<ChainState>,
    mempool: Arc<Mempool>,
}

impl MempoolSync {
    pub fn new(chain: Weak<ChainState>, mempool: Arc<Mempool>) -> Self {
        Self { chain, mempool }
    }
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl ChainNotifier for MempoolSync {
    fn block_connected(&self, block: &Block) {
        for tx in &block.transactions {
            self.mempool.remove(&tx.txid());
        }
    }

    fn block_disconnected(&self, block: &Block) {
        let Some(chain) = self.chain.upgrade() else {
            return;
        };
        let now = now_seconds();
        for tx in &block.transactions {
            if tx.is_coinbase() || tx.is_coinstake() {
                continue;
            }
            log_debug!(
                "resurrecting {}",
                cinder_consensus::hash256_to_hex(&tx.txid())
            );
            self.mempool.resurrect(&chain, tx.clone(), now);
        }
    }
}
