//! Event stream for wallet and mempool subscribers living outside the core.

use cinder_consensus::Hash256;
use cinder_primitives::block::Block;

pub trait ChainNotifier: Send + Sync {
    fn tx_accepted(&self, _txid: &Hash256) {}
    fn tx_removed(&self, _txid: &Hash256) {}
    fn block_connected(&self, _block: &Block) {}
    fn block_disconnected(&self, _block: &Block) {}
    fn best_chain_updated(&self, _tip: &Hash256, _height: i64) {}
    fn transaction_updated(&self, _txid: &Hash256) {}
    /// The chain state wants operator attention; services should restrict
    /// themselves until the condition clears.
    fn safe_mode_entered(&self, _reason: &str) {}
}
