//! Compact target codec and per-kind difficulty retargeting.

use std::cmp::Ordering;

use cinder_consensus::{BlockKind, ConsensusParams, Hash256};
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3))
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32 = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

/// Truncates a hash to the resolution of its compact encoding.
pub fn round_down_to_compact(hash: &Hash256) -> Hash256 {
    compact_to_target(target_to_compact(hash)).unwrap_or(*hash)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    U256::from_little_endian(a).cmp(&U256::from_little_endian(b))
}

/// Header facts the retarget formulas need about one chain entry.
#[derive(Clone, Copy, Debug)]
pub struct TargetInfo {
    pub height: i64,
    pub time: u32,
    pub bits: u32,
    pub burn_bits: u32,
    pub kind: BlockKind,
    pub effective_burn_coins: i64,
}

/// Read access to a branch of the block index, walked by parent links.
pub trait BlockAncestry {
    type Id: Copy;
    fn info(&self, id: Self::Id) -> TargetInfo;
    fn parent(&self, id: Self::Id) -> Option<Self::Id>;
}

/// The most recent ancestor of the wanted kind, with PoB blocks always
/// skipped. Stops at the root even when its kind does not match.
pub fn last_of_kind<A: BlockAncestry>(chain: &A, mut id: A::Id, stake: bool) -> A::Id {
    loop {
        let info = chain.info(id);
        let wrong_kind = info.kind.is_stake() != stake || info.kind.is_burn();
        if !wrong_kind {
            return id;
        }
        match chain.parent(id) {
            Some(parent) => id = parent,
            None => return id,
        }
    }
}

fn retarget_timespan(last_height: i64, params: &ConsensusParams) -> i64 {
    if last_height >= params.retarget_timespan_switch_height {
        6 * 60 * 60
    } else {
        30 * 60
    }
}

/// Exponential moving retarget for PoW and PoS chains, each following its own
/// last-of-kind ancestry.
pub fn next_target_required<A: BlockAncestry>(
    chain: &A,
    last: Option<A::Id>,
    proof_of_stake: bool,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let Some(last) = last else {
        let limit = if proof_of_stake {
            params.stake_limit
        } else {
            params.work_limit
        };
        return Ok(target_to_compact(&limit));
    };

    let last_info = chain.info(last);
    let limit = if proof_of_stake {
        params.stake_limit_at(last_info.time)
    } else {
        params.work_limit
    };
    let limit_bits = target_to_compact(&limit);
    let limit_value = compact_to_u256(limit_bits)?;

    let prev = last_of_kind(chain, last, proof_of_stake);
    let Some(prev_parent) = chain.parent(prev) else {
        return Ok(target_to_compact(&params.initial_hash_target));
    };
    let prev_prev = last_of_kind(chain, prev_parent, proof_of_stake);
    if chain.parent(prev_prev).is_none() {
        return Ok(target_to_compact(&params.initial_hash_target));
    }

    let prev_info = chain.info(prev);
    let prev_prev_info = chain.info(prev_prev);
    let actual_spacing = prev_info.time as i64 - prev_prev_info.time as i64;

    let spacing = if proof_of_stake {
        params.stake_target_spacing
    } else {
        // PoW relaxes when the last blocks were not PoW.
        (params.stake_target_spacing * (1 + last_info.height - prev_info.height))
            .min(10 * params.stake_target_spacing)
    };

    let interval = retarget_timespan(last_info.height, params) / spacing;
    let numerator = ((interval - 1) * spacing + 2 * actual_spacing).max(1);
    let denominator = (interval + 1) * spacing;

    let mut new = compact_to_u256(prev_info.bits)?;
    new = new.saturating_mul(U256::from(numerator as u64)) / U256::from(denominator as u64);

    if new > limit_value {
        new = limit_value;
    }
    Ok(u256_to_compact(new))
}

/// Proof-of-burn retarget. The modern formula paces PoB blocks against the
/// count of intervening PoW blocks; the legacy formula derives the target
/// from the effective burnt supply and survives only to validate old chains.
pub fn next_burn_target_required<A: BlockAncestry>(
    chain: &A,
    last: Option<A::Id>,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let limit_bits = target_to_compact(&params.burn_limit);
    let Some(last) = last else {
        return Ok(limit_bits);
    };
    let last_info = chain.info(last);

    if params.new_protocol_at(last_info.time) {
        let limit_value = compact_to_u256(limit_bits)?;

        let mut pow_between: i64 = 0;
        let mut cursor = Some(last);
        let last_burn = loop {
            let Some(id) = cursor else {
                break None;
            };
            let info = chain.info(id);
            if info.kind.is_burn() {
                break Some(info);
            }
            if info.kind.is_work() {
                pow_between += 1;
            }
            cursor = chain.parent(id);
        };

        let Some(last_burn) = last_burn else {
            return Ok(limit_bits);
        };
        if pow_between == 0 {
            return Ok(last_info.burn_bits);
        }

        let spacing = params.pob_target_spacing;
        let interval = params.pob_target_timespan / spacing;
        let numerator = ((interval - 1) * spacing + 2 * pow_between).max(1);
        let denominator = (interval + 1) * spacing;

        let mut new = compact_to_u256(last_burn.burn_bits)?;
        new = new.saturating_mul(U256::from(numerator as u64)) / U256::from(denominator as u64);

        if new > limit_value {
            new = limit_value;
        }
        Ok(u256_to_compact(new))
    } else {
        let mut back = last;
        for _ in 0..params.burn_min_confirms {
            back = last_of_kind(chain, back, false);
        }
        let back_info = chain.info(back);
        if back_info.effective_burn_coins <= 0 {
            return Ok(0);
        }

        let scaled = U512::from(U256::MAX)
            * U512::from(params.burn_harder_target)
            * U512::from(params.burn_constant as u64)
            / U512::from(back_info.effective_burn_coins as u64);
        let limit_value = compact_to_u256(limit_bits)?;
        let new = if scaled > U512::from(limit_value) {
            limit_value
        } else {
            U256::try_from(scaled).unwrap_or(limit_value)
        };
        Ok(u256_to_compact(new))
    }
}

/// The easiest target reachable `elapsed` seconds after a block with `base`
/// bits, at the maximum 200% adjustment per day.
pub fn compute_max_bits(
    target_limit: &Hash256,
    base: u32,
    elapsed: i64,
) -> Result<u32, CompactError> {
    let limit = U256::from_little_endian(target_limit);
    let mut result = compact_to_u256(base)?.saturating_mul(U256::from(2u64));
    let mut remaining = elapsed;
    while remaining > 0 && result < limit {
        result = result.saturating_mul(U256::from(2u64));
        remaining -= 24 * 60 * 60;
    }
    if result > limit {
        result = limit;
    }
    Ok(u256_to_compact(result))
}

pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<bool, CompactError> {
    let target = compact_to_u256(bits)?;
    let limit = U256::from_little_endian(&params.work_limit);
    if target.is_zero() || target > limit {
        return Ok(false);
    }
    Ok(U256::from_little_endian(hash) <= target)
}

pub fn check_proof_of_burn_hash(
    hash: &Hash256,
    burn_bits: u32,
    params: &ConsensusParams,
) -> Result<bool, CompactError> {
    let target = compact_to_u256(burn_bits)?;
    let limit = U256::from_little_endian(&params.burn_limit);
    if target.is_zero() || target > limit {
        return Ok(false);
    }
    Ok(U256::from_little_endian(hash) <= target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_consensus::{chain_params, Network};

    struct TestChain {
        entries: Vec<TargetInfo>,
    }

    impl TestChain {
        fn new() -> Self {
            Self {
                entries: Vec::new(),
            }
        }

        fn push(&mut self, kind: BlockKind, time: u32, bits: u32, burn_bits: u32) -> usize {
            let height = self.entries.len() as i64;
            self.entries.push(TargetInfo {
                height,
                time,
                bits,
                burn_bits,
                kind,
                effective_burn_coins: 0,
            });
            self.entries.len() - 1
        }

        fn tip(&self) -> Option<usize> {
            self.entries.len().checked_sub(1)
        }
    }

    impl BlockAncestry for TestChain {
        type Id = usize;

        fn info(&self, id: usize) -> TargetInfo {
            self.entries[id]
        }

        fn parent(&self, id: usize) -> Option<usize> {
            id.checked_sub(1)
        }
    }

    fn mainnet() -> ConsensusParams {
        chain_params(Network::Mainnet).consensus
    }

    #[test]
    fn genesis_gets_the_limit() {
        let params = mainnet();
        let chain = TestChain::new();
        let bits = next_target_required(&chain, chain.tip(), false, &params).expect("bits");
        assert_eq!(bits, target_to_compact(&params.work_limit));
    }

    #[test]
    fn young_chain_gets_initial_target() {
        let params = mainnet();
        let mut chain = TestChain::new();
        let work_bits = target_to_compact(&params.work_limit);
        chain.push(BlockKind::Work, 1_000_000, work_bits, 0);
        chain.push(BlockKind::Work, 1_000_090, work_bits, 0);
        let bits = next_target_required(&chain, chain.tip(), false, &params).expect("bits");
        assert_eq!(bits, target_to_compact(&params.initial_hash_target));
    }

    #[test]
    fn slow_blocks_ease_the_target() {
        let params = mainnet();
        let mut chain = TestChain::new();
        let bits = 0x1c0fffff;
        for i in 0..5u32 {
            // 900-second gaps, ten times the stake spacing.
            chain.push(BlockKind::Work, 1_000_000 + i * 900, bits, 0);
        }
        let next = next_target_required(&chain, chain.tip(), false, &params).expect("bits");
        let old = compact_to_u256(bits).expect("target");
        let new = compact_to_u256(next).expect("target");
        assert!(new > old);
    }

    #[test]
    fn fast_blocks_tighten_the_target() {
        let params = mainnet();
        let mut chain = TestChain::new();
        let bits = 0x1c0fffff;
        for i in 0..5u32 {
            chain.push(BlockKind::Work, 1_000_000 + i * 10, bits, 0);
        }
        let next = next_target_required(&chain, chain.tip(), false, &params).expect("bits");
        let old = compact_to_u256(bits).expect("target");
        let new = compact_to_u256(next).expect("target");
        assert!(new < old);
    }

    #[test]
    fn pow_retarget_skips_stake_and_burn_ancestors() {
        let params = mainnet();
        let mut chain = TestChain::new();
        let bits = 0x1c0fffff;
        chain.push(BlockKind::Work, 1_000_000, bits, 0);
        chain.push(BlockKind::Work, 1_000_090, bits, 0);
        chain.push(BlockKind::Work, 1_000_180, bits, 0);
        chain.push(BlockKind::Stake, 1_000_270, 0x1d00ffff, 0);
        chain.push(BlockKind::Burn, 1_000_360, bits, 0x1d00ffff);
        let next = next_target_required(&chain, chain.tip(), false, &params).expect("bits");
        // The seed must be the last PoW block's bits, not the stake/burn bits.
        let seed = compact_to_u256(bits).expect("seed");
        let new = compact_to_u256(next).expect("target");
        assert!(new > seed / 4 && new < seed * 4);
    }

    #[test]
    fn burn_target_with_no_burn_block_is_the_limit() {
        let params = mainnet();
        let mut chain = TestChain::new();
        let time = params.pob_pos_target_switch_time + 100;
        chain.push(BlockKind::Work, time, 0x1c0fffff, 0x1d00ffff);
        let bits = next_burn_target_required(&chain, chain.tip(), &params).expect("bits");
        assert_eq!(bits, target_to_compact(&params.burn_limit));
    }

    #[test]
    fn burn_target_reused_when_no_pow_between() {
        let params = mainnet();
        let mut chain = TestChain::new();
        let time = params.pob_pos_target_switch_time + 100;
        let burn_bits = 0x1d00ffff;
        chain.push(BlockKind::Burn, time, 0x1c0fffff, burn_bits);
        chain.push(BlockKind::Stake, time + 90, 0x1c0fffff, 0x1d00beef);
        let bits = next_burn_target_required(&chain, chain.tip(), &params).expect("bits");
        assert_eq!(bits, 0x1d00beef);
    }

    #[test]
    fn burn_target_moves_toward_three_pow_spacing() {
        let params = mainnet();
        let time = params.pob_pos_target_switch_time + 100;
        let burn_bits = 0x1d00ffff;

        // Exactly three PoW blocks since the last PoB: the target holds.
        let mut chain = TestChain::new();
        chain.push(BlockKind::Burn, time, 0x1c0fffff, burn_bits);
        for i in 1..=3u32 {
            chain.push(BlockKind::Work, time + i * 90, 0x1c0fffff, burn_bits);
        }
        let steady = next_burn_target_required(&chain, chain.tip(), &params).expect("bits");
        assert_eq!(
            compact_to_u256(steady).expect("steady"),
            compact_to_u256(burn_bits).expect("seed")
        );

        // Nine PoW blocks since the last PoB: burning must get easier.
        let mut chain = TestChain::new();
        chain.push(BlockKind::Burn, time, 0x1c0fffff, burn_bits);
        for i in 1..=9u32 {
            chain.push(BlockKind::Work, time + i * 90, 0x1c0fffff, burn_bits);
        }
        let eased = next_burn_target_required(&chain, chain.tip(), &params).expect("bits");
        assert!(compact_to_u256(eased).expect("eased") > compact_to_u256(burn_bits).expect("seed"));
    }

    #[test]
    fn legacy_burn_target_scales_with_effective_coins() {
        let params = mainnet();
        let time = params.pob_pos_target_switch_time - 10_000;
        let mut chain = TestChain::new();
        let slot = chain.push(BlockKind::Work, time, 0x1c0fffff, 0x1d00ffff);
        chain.entries[slot].effective_burn_coins = 50_000 * cinder_consensus::money::COIN;
        let low = next_burn_target_required(&chain, chain.tip(), &params).expect("bits");

        chain.entries[slot].effective_burn_coins = 50 * cinder_consensus::money::COIN;
        let high = next_burn_target_required(&chain, chain.tip(), &params).expect("bits");

        let low_target = compact_to_u256(low).expect("low");
        let high_target = compact_to_u256(high).expect("high");
        assert!(low_target <= high_target);
    }
}
