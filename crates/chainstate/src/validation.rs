//! Context-free validation of transactions and blocks.

use std::collections::HashSet;

use cinder_consensus::constants::{MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE};
use cinder_consensus::money::{money_range, MAX_MONEY, MIN_TXOUT_AMOUNT, MIN_TX_FEE};
use cinder_consensus::{ConsensusParams, ZERO_HASH};
use cinder_pow::difficulty::{check_proof_of_work, CompactError};
use cinder_pow::rewards::{proof_of_burn_subsidy, proof_of_work_subsidy};
use cinder_primitives::block::Block;
use cinder_primitives::transaction::Transaction;
use cinder_script::secp::verify_hash_signature;
use cinder_script::standard::{
    classify, is_push_only, pushed_stack, script_sig_args_expected, sig_op_count, ScriptType,
    MAX_STANDARD_SIG_SCRIPT_SIZE,
};
use cinder_storage::StoreError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Structurally invalid; reject and penalize heavily.
    Malformed,
    /// Violates a consensus rule in context.
    Consensus,
    /// Low-grade nuisance behaviour.
    DosLite,
    /// Referenced outputs are unknown; candidate for the orphan pool.
    MissingInputs,
    /// Built on a tip that is no longer best.
    Stale,
    /// Storage or I/O failure; retryable.
    Transient,
    /// Refused by a checkpoint; no penalty.
    CheckpointRejected,
    DuplicateStake,
    DuplicateBurn,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ValidationError {
    pub kind: ErrorKind,
    pub reason: &'static str,
    pub dos: u32,
}

impl ValidationError {
    pub fn malformed(reason: &'static str, dos: u32) -> Self {
        Self {
            kind: ErrorKind::Malformed,
            reason,
            dos,
        }
    }

    pub fn consensus(reason: &'static str, dos: u32) -> Self {
        Self {
            kind: ErrorKind::Consensus,
            reason,
            dos,
        }
    }

    pub fn lite(reason: &'static str, dos: u32) -> Self {
        Self {
            kind: ErrorKind::DosLite,
            reason,
            dos,
        }
    }

    pub fn missing_inputs() -> Self {
        Self {
            kind: ErrorKind::MissingInputs,
            reason: "inputs not found",
            dos: 0,
        }
    }

    pub fn stale(reason: &'static str) -> Self {
        Self {
            kind: ErrorKind::Stale,
            reason,
            dos: 0,
        }
    }

    pub fn transient(reason: &'static str) -> Self {
        Self {
            kind: ErrorKind::Transient,
            reason,
            dos: 0,
        }
    }

    pub fn checkpoint(reason: &'static str) -> Self {
        Self {
            kind: ErrorKind::CheckpointRejected,
            reason,
            dos: 0,
        }
    }

    pub fn duplicate_stake() -> Self {
        Self {
            kind: ErrorKind::DuplicateStake,
            reason: "duplicate proof-of-stake kernel",
            dos: 0,
        }
    }

    pub fn duplicate_burn() -> Self {
        Self {
            kind: ErrorKind::DuplicateBurn,
            reason: "duplicate proof-of-burn kernel",
            dos: 0,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)?;
        if self.dos > 0 {
            write!(f, " (misbehaviour {})", self.dos)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl From<StoreError> for ValidationError {
    fn from(_: StoreError) -> Self {
        ValidationError::transient("store error")
    }
}

impl From<CompactError> for ValidationError {
    fn from(_: CompactError) -> Self {
        ValidationError::consensus("invalid compact target", 0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ValidationFlags {
    pub check_pow: bool,
    pub check_signatures: bool,
    pub check_block_signature: bool,
    pub check_kernel: bool,
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self {
            check_pow: true,
            check_signatures: true,
            check_block_signature: true,
            check_kernel: true,
        }
    }
}

/// Context-free transaction checks.
pub fn check_transaction(
    tx: &Transaction,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::malformed("vin empty", 10));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::malformed("vout empty", 10));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ValidationError::malformed("transaction oversized", 100));
    }

    let is_coinbase = tx.is_coinbase();
    let is_coinstake = tx.is_coinstake();
    let mut value_out: i64 = 0;
    for output in &tx.vout {
        if output.is_empty() && !is_coinbase && !is_coinstake {
            return Err(ValidationError::malformed("empty txout in user transaction", 100));
        }
        if !output.is_empty()
            && output.value < MIN_TXOUT_AMOUNT
            && !(params.v05_rules_at(tx.time) && output.value == 0)
        {
            return Err(ValidationError::malformed("txout below minimum", 100));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationError::malformed("txout too large", 100));
        }
        value_out = value_out.saturating_add(output.value);
        if !money_range(value_out) {
            return Err(ValidationError::malformed("txout total out of range", 100));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(ValidationError::malformed("duplicate inputs", 100));
        }
    }

    if is_coinbase {
        let script_len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&script_len) {
            return Err(ValidationError::malformed("coinbase script size", 100));
        }
    } else {
        for input in &tx.vin {
            if input.prevout.is_null() {
                return Err(ValidationError::malformed("null prevout", 10));
            }
        }
    }

    Ok(())
}

/// Relay standardness: push-only bounded inputs, template-recognized outputs,
/// at most one data carrier.
pub fn is_standard_tx(tx: &Transaction) -> bool {
    for input in &tx.vin {
        if input.script_sig.len() > MAX_STANDARD_SIG_SCRIPT_SIZE {
            return false;
        }
        if !is_push_only(&input.script_sig) {
            return false;
        }
    }

    let mut data_outputs = 0;
    for output in &tx.vout {
        let Some((script_type, _)) = classify(&output.script_pubkey) else {
            return false;
        };
        if script_type == ScriptType::NullData {
            data_outputs += 1;
        }
    }
    data_outputs <= 1
}

/// Standardness of spent outputs: every input must leave exactly the stack
/// its prevout template expects, with P2SH redeem scripts expanded once.
pub fn are_inputs_standard<'a>(
    tx: &Transaction,
    prev_script_for: impl Fn(usize) -> Option<&'a [u8]>,
) -> bool {
    if tx.is_coinbase() {
        return true;
    }

    for (input_index, input) in tx.vin.iter().enumerate() {
        let Some(prev_script) = prev_script_for(input_index) else {
            return false;
        };
        let Some((script_type, solutions)) = classify(prev_script) else {
            return false;
        };
        let Some(stack) = pushed_stack(&input.script_sig) else {
            return false;
        };

        let mut expected = match script_sig_args_expected(script_type, &solutions) {
            Some(expected) => expected,
            None if script_type == ScriptType::ScriptHash => 0,
            None => return false,
        };

        if script_type == ScriptType::ScriptHash {
            let Some(redeem_script) = stack.last() else {
                return false;
            };
            let Some((redeem_type, redeem_solutions)) = classify(redeem_script) else {
                return false;
            };
            if redeem_type == ScriptType::ScriptHash {
                return false;
            }
            let Some(redeem_expected) = script_sig_args_expected(redeem_type, &redeem_solutions)
            else {
                return false;
            };
            // The redeem script itself rides along as the final push.
            expected += redeem_expected + 1;
        }

        if stack.len() != expected {
            return false;
        }
    }
    true
}

/// Context-free block checks.
pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    adjusted_time: i64,
    flags: &ValidationFlags,
) -> Result<(), ValidationError> {
    if block.transactions.is_empty() || block.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ValidationError::malformed("block size limits", 100));
    }

    let hash = block.hash();
    if flags.check_pow && block.is_proof_of_work() {
        match check_proof_of_work(&hash, block.header.bits, params) {
            Ok(true) => {}
            Ok(false) => return Err(ValidationError::consensus("proof of work failed", 50)),
            Err(_) => return Err(ValidationError::consensus("invalid work bits", 50)),
        }
    }

    let block_time = block.header.time as i64;
    if block_time > adjusted_time + params.max_clock_drift as i64 {
        return Err(ValidationError::consensus("block timestamp too far in the future", 0));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::malformed("first tx is not coinbase", 100));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(ValidationError::malformed("more than one coinbase", 100));
        }
    }
    for tx in block.transactions.iter().skip(2) {
        if tx.is_coinstake() {
            return Err(ValidationError::malformed("coinstake in wrong position", 100));
        }
    }

    let coinbase = &block.transactions[0];
    if block.is_proof_of_stake()
        && (coinbase.vout.len() != 1 || !coinbase.vout[0].is_empty())
    {
        return Err(ValidationError::consensus(
            "coinbase output not empty for proof-of-stake block",
            0,
        ));
    }

    if block_time > coinbase.time as i64 + params.max_clock_drift as i64 {
        return Err(ValidationError::consensus("coinbase timestamp too early", 50));
    }
    if block.is_proof_of_stake() {
        let coinstake_time = block.transactions[1].time;
        if !crate::kernel::check_coinstake_timestamp(block.header.time, coinstake_time) {
            return Err(ValidationError::consensus("coinstake timestamp violation", 50));
        }
    }

    // Reward ceiling by proof kind; fees are destroyed, never added.
    if block.is_proof_of_work() {
        let reward = proof_of_work_subsidy(block.header.bits, params)?;
        if coinbase.value_out() > reward - coinbase.min_fee(1) + MIN_TX_FEE {
            return Err(ValidationError::consensus("coinbase reward exceeded", 50));
        }
    } else if block.is_proof_of_burn() {
        let reward = proof_of_burn_subsidy(block.header.burn_bits, params)?;
        if coinbase.value_out() > reward - coinbase.min_fee(1) + MIN_TX_FEE {
            return Err(ValidationError::consensus("coinbase reward exceeded", 50));
        }
    } else if coinbase.value_out() > 0 {
        return Err(ValidationError::consensus("coinbase reward exceeded", 50));
    }

    for tx in &block.transactions {
        check_transaction(tx, params)?;
        if (tx.time as i64) > block_time {
            return Err(ValidationError::consensus(
                "block timestamp earlier than transaction",
                50,
            ));
        }
    }

    let mut unique = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        if !unique.insert(tx.txid()) {
            return Err(ValidationError::malformed("duplicate transaction", 100));
        }
    }

    let mut sig_ops = 0u32;
    for tx in &block.transactions {
        for input in &tx.vin {
            sig_ops += sig_op_count(&input.script_sig, false);
        }
        for output in &tx.vout {
            sig_ops += sig_op_count(&output.script_pubkey, false);
        }
        if sig_ops > MAX_BLOCK_SIGOPS {
            return Err(ValidationError::malformed("out-of-bounds sigop count", 100));
        }
    }

    if block.header.merkle_root != block.compute_merkle_root() {
        return Err(ValidationError::malformed("merkle root mismatch", 100));
    }

    if flags.check_block_signature {
        check_block_signature(block, &hash)?;
    }

    Ok(())
}

/// The block must be signed by the key paid by its coinbase (PoW/PoB) or
/// coinstake (PoS). A chain root with an empty signature is exempt.
fn check_block_signature(
    block: &Block,
    hash: &cinder_consensus::Hash256,
) -> Result<(), ValidationError> {
    if block.header.prev_block == ZERO_HASH && block.signature.is_empty() {
        return Ok(());
    }

    let Some(output) = block.signing_output() else {
        return Err(ValidationError::malformed("bad block signature", 100));
    };
    let Some((ScriptType::PubKey, solutions)) = classify(&output.script_pubkey) else {
        return Err(ValidationError::malformed("bad block signature", 100));
    };
    if block.signature.is_empty() {
        return Err(ValidationError::malformed("bad block signature", 100));
    }
    verify_hash_signature(&solutions[0], &block.signature, hash)
        .map_err(|_| ValidationError::malformed("bad block signature", 100))
}
