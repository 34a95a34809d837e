//! Chain-trust scoring for best-chain selection.

use cinder_consensus::{BlockKind, ConsensusParams};
use cinder_pow::difficulty::compact_to_u256;
use primitive_types::{U256, U512};

use crate::index::ChainIndex;

fn full_score(target: U256) -> U256 {
    // 2^256 / (target + 1), computed in 512 bits; target >= 1 keeps the
    // result inside 256 bits.
    let numerator = U512::one() << 256;
    let quotient = numerator / (U512::from(target) + U512::one());
    U256::try_from(quotient).unwrap_or(U256::MAX)
}

/// Trust contributed by one block, per the chain-check rules: PoS blocks
/// earn a full 2^256-scale score damped when recent PoW backing is thin,
/// PoW/PoB blocks earn a base-scaled score plus a carry from their parent.
pub fn block_trust(
    index: &ChainIndex,
    prev: Option<u32>,
    kind: BlockKind,
    time: u32,
    bits: u32,
    burn_bits: u32,
    params: &ConsensusParams,
) -> U256 {
    if !params.chainchecks_at(time) {
        // Legacy scoring: PoS by target, everything else counts 1.
        let Ok(target) = compact_to_u256(bits) else {
            return U256::zero();
        };
        if target.is_zero() {
            return U256::zero();
        }
        return if kind.is_stake() {
            full_score(target)
        } else {
            U256::one()
        };
    }

    let Ok(target) = compact_to_u256(if kind.is_burn() { burn_bits } else { bits }) else {
        return U256::zero();
    };
    if target.is_zero() {
        return U256::zero();
    }

    let base = U256::from_little_endian(if kind.is_burn() {
        &params.pob_base
    } else {
        &params.pow_base
    });
    let mut block_score = base / (target + U256::one());
    if kind.is_stake() || block_score < U256::one() {
        block_score = U256::one();
    }

    let Some(prev) = prev else {
        return block_score;
    };
    if index.entry(prev).record.height < 12 {
        return block_score;
    }

    let prev_entry = index.entry(prev);
    let prev_height = prev_entry.record.height;

    if kind.is_stake() {
        let score = full_score(target);

        if !prev_entry.record.kind.is_work() {
            return score / 3;
        }

        let mut pow_count = 0;
        let mut cursor = Some(prev);
        while let Some(current) = cursor {
            if prev_height - index.entry(current).record.height >= 12 {
                break;
            }
            if index.entry(current).record.kind.is_work() {
                pow_count += 1;
            }
            cursor = index.parent(current);
        }

        if pow_count < 3 {
            return score / 3;
        }
        score
    } else {
        let prev_prev_trust = index
            .parent(prev)
            .map(|slot| index.entry(slot).chain_trust())
            .unwrap_or_default();
        let last_block_trust = prev_entry.chain_trust().saturating_sub(prev_prev_trust);
        let carry = U256::try_from(U512::from(last_block_trust) * U512::from(2u64) / U512::from(3u64))
            .unwrap_or(U256::MAX);

        let two_stake_parents = prev_entry.record.kind.is_stake()
            && index
                .parent(prev)
                .map(|slot| index.entry(slot).record.kind.is_stake())
                .unwrap_or(false);
        if !two_stake_parents {
            return block_score.saturating_add(carry);
        }

        let mut stake_count = 0;
        let mut cursor = Some(prev);
        while let Some(current) = cursor {
            if prev_height - index.entry(current).record.height >= 12 {
                break;
            }
            if index.entry(current).record.kind.is_stake() {
                stake_count += 1;
            }
            cursor = index.parent(current);
        }

        if stake_count < 7 {
            return block_score.saturating_add(carry);
        }

        let prev_bits = if kind.is_burn() {
            prev_entry.record.header.burn_bits
        } else {
            prev_entry.record.header.bits
        };
        let Ok(prev_target) = compact_to_u256(prev_bits) else {
            return U256::zero();
        };
        if prev_target.is_zero() {
            return U256::zero();
        }
        block_score.saturating_add(full_score(prev_target))
    }
}
