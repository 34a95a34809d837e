//! Proof-of-burn engine: burn-hash construction, decay multiplier, and
//! effective-burn-coin accounting.
//!
//! A burn hash is computed as
//! `hash = (c / b) * 2^((nPoW - M) / E) * H(burn_block ‖ burn_tx ‖ prev_block)`
//! where `c` is the burn constant, `b` the burnt amount, `nPoW` the number of
//! proof-of-work blocks between the burn and the block being built, `M` the
//! minimum confirmation count, and `E` the doubling interval. Burnt coins are
//! strongest right after maturing and decay geometrically with PoW cadence.

use cinder_consensus::money::Amount;
use cinder_consensus::{ConsensusParams, Hash256};
use cinder_pow::difficulty::round_down_to_compact;
use cinder_primitives::block::Block;
use cinder_primitives::hash::sha256d;
use primitive_types::{U256, U512};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BurnError {
    /// Not enough PoW blocks between the burn and the chain tip.
    Immature { between: i64, required: i64 },
    /// The multiplied hash does not fit in 256 bits.
    Overflow,
    /// The burn transaction burns nothing.
    ZeroBurn,
}

impl std::fmt::Display for BurnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BurnError::Immature { between, required } => write!(
                f,
                "burn transaction has {between} of {required} required PoW confirmations"
            ),
            BurnError::Overflow => write!(f, "burn hash overflows 256 bits"),
            BurnError::ZeroBurn => write!(f, "burn transaction value is zero"),
        }
    }
}

impl std::error::Error for BurnError {}

/// `(c / b) * 2^((between - M) / E)`; grows (weakens the hash) as PoW blocks
/// accumulate past maturity.
pub fn burn_multiplier(burn_value: Amount, pow_between: i64, params: &ConsensusParams) -> f64 {
    let decay_exponent =
        (pow_between - params.burn_min_confirms) as f64 / params.burn_hash_double;
    (params.burn_constant as f64 / burn_value as f64) * decay_exponent.exp2()
}

/// The raw hash over the burn identity, before the multiplier.
pub fn burn_hash_base(
    burn_block_hash: &Hash256,
    burn_tx_hash: &Hash256,
    prev_block_hash: &Hash256,
) -> Hash256 {
    let mut buf = [0u8; 96];
    buf[..32].copy_from_slice(burn_block_hash);
    buf[32..64].copy_from_slice(burn_tx_hash);
    buf[64..].copy_from_slice(prev_block_hash);
    sha256d(&buf)
}

/// Multiplies a 256-bit hash by a positive float via 53-bit mantissa scaling.
fn mul_hash_by_factor(hash: &Hash256, factor: f64) -> Result<U256, BurnError> {
    if !factor.is_finite() || factor <= 0.0 {
        return Err(BurnError::Overflow);
    }

    let bits = factor.to_bits();
    let raw_exponent = ((bits >> 52) & 0x7ff) as i64;
    let fraction = bits & 0x000f_ffff_ffff_ffff;
    let (mantissa, exponent) = if raw_exponent == 0 {
        (fraction, -1074i64)
    } else {
        (fraction | (1 << 52), raw_exponent - 1075)
    };

    let product = U512::from(U256::from_little_endian(hash)) * U512::from(mantissa);
    let scaled = if exponent >= 0 {
        if product.leading_zeros() < exponent as u32 {
            return Err(BurnError::Overflow);
        }
        product << exponent as usize
    } else {
        product >> (-exponent) as usize
    };

    U256::try_from(scaled).map_err(|_| BurnError::Overflow)
}

pub struct BurnHashInput {
    pub burn_block_hash: Hash256,
    pub burn_tx_hash: Hash256,
    pub prev_block_hash: Hash256,
    pub burn_value: Amount,
    /// PoW blocks strictly between the burn block and `prev_block_hash`.
    pub pow_between: i64,
    /// Timestamp of the block at `prev_block_hash`.
    pub prev_block_time: u32,
}

/// The final burn hash compared against the `burn_bits` target.
pub fn final_burn_hash(input: &BurnHashInput, params: &ConsensusParams) -> Result<Hash256, BurnError> {
    if input.burn_value <= 0 {
        return Err(BurnError::ZeroBurn);
    }
    if input.pow_between < params.burn_min_confirms {
        return Err(BurnError::Immature {
            between: input.pow_between,
            required: params.burn_min_confirms,
        });
    }

    let base = burn_hash_base(
        &input.burn_block_hash,
        &input.burn_tx_hash,
        &input.prev_block_hash,
    );
    let multiplier = burn_multiplier(input.burn_value, input.pow_between, params);
    let product = mul_hash_by_factor(&base, multiplier)?;
    let hash = product.to_little_endian();

    if input.prev_block_time >= params.burn_round_down_time {
        Ok(round_down_to_compact(&hash))
    } else {
        Ok(hash)
    }
}

/// The intermediate burn hash recorded in PoB headers after the cutover,
/// used for duplicate detection before the parent chain is known.
pub fn intermediate_burn_hash(input: &BurnHashInput) -> Hash256 {
    burn_hash_base(
        &input.burn_block_hash,
        &input.burn_tx_hash,
        &input.prev_block_hash,
    )
}

/// Total value paid to the canonical burn script across a block, counting at
/// most one burn output per transaction.
pub fn burned_value_in_block(block: &Block, params: &ConsensusParams) -> Amount {
    let mut total: Amount = 0;
    for tx in &block.transactions {
        if let Some(index) = tx.burn_output_index(&params.burn_script_pubkey) {
            total = total.saturating_add(tx.vout[index].value);
        }
    }
    total
}

/// Effective burnt supply visible at a block: the parent's supply, decayed if
/// this block is PoW, plus this block's burns.
pub fn expected_effective_burn_coins(
    prev_effective: i64,
    burned_in_block: Amount,
    block_is_pow: bool,
    params: &ConsensusParams,
) -> i64 {
    if block_is_pow {
        (prev_effective as f64 / params.burn_decay_rate) as i64 + burned_in_block
    } else {
        prev_effective + burned_in_block
    }
}
