//! Reward curves: PoW/PoB subsidy from difficulty, PoS reward from coin-age.

use cinder_consensus::money::{Amount, CENT};
use cinder_consensus::{ConsensusParams, Hash256};
use primitive_types::U512;

use crate::difficulty::{compact_to_u256, target_to_compact, CompactError};

/// Subsidy halves for every 16x multiply of difficulty:
/// `(max_mint / subsidy)^4 == target_limit / target`, found by bisection over
/// `[CENT, max_mint]` and truncated to CENT precision.
fn subsidy_for_target(bits: u32, target_limit: &Hash256, max_mint: Amount) -> Result<Amount, CompactError> {
    let target = U512::from(compact_to_u256(bits)?);
    let limit = U512::from(compact_to_u256(target_to_compact(target_limit))?);
    let max = U512::from(max_mint as u64);
    let cent = U512::from(CENT as u64);

    let max_fourth = max * max * max * max;

    let mut lower = cent;
    let mut upper = max;
    while lower + cent <= upper {
        let mid = (lower + upper) >> 1;
        if mid * mid * mid * mid * limit > max_fourth * target {
            upper = mid;
        } else {
            lower = mid;
        }
    }

    let subsidy = (upper.low_u64() as Amount) / CENT * CENT;
    Ok(subsidy.min(max_mint))
}

pub fn proof_of_work_subsidy(bits: u32, params: &ConsensusParams) -> Result<Amount, CompactError> {
    subsidy_for_target(bits, &params.work_limit, params.max_mint_proof_of_work)
}

pub fn proof_of_burn_subsidy(
    burn_bits: u32,
    params: &ConsensusParams,
) -> Result<Amount, CompactError> {
    subsidy_for_target(burn_bits, &params.burn_limit, params.max_mint_proof_of_burn)
}

/// Coin-age reward: `coin_days * reward_per_coin_year * 33 / (365*33 + 8)`,
/// with the per-coin-year rate lifted tenfold under the new protocol.
pub fn proof_of_stake_reward(coin_days: u64, time: u32, params: &ConsensusParams) -> Amount {
    let reward_coin_year: Amount = if time > params.pob_pos_target_switch_time {
        10 * CENT
    } else {
        CENT
    };
    let subsidy = (coin_days as i128) * (reward_coin_year as i128) * 33 / (365 * 33 + 8);
    subsidy as Amount
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_consensus::{chain_params, Network};

    fn mainnet() -> ConsensusParams {
        chain_params(Network::Mainnet).consensus
    }

    #[test]
    fn subsidy_at_limit_difficulty_is_the_cap() {
        let params = mainnet();
        let bits = target_to_compact(&params.work_limit);
        let subsidy = proof_of_work_subsidy(bits, &params).expect("subsidy");
        assert_eq!(subsidy, params.max_mint_proof_of_work);
    }

    #[test]
    fn subsidy_is_monotone_in_target() {
        let params = mainnet();
        let limit_bits = target_to_compact(&params.work_limit);
        let harder = [0x1d00ffff, 0x1c0fffff, 0x1b0fffff];
        let mut last = proof_of_work_subsidy(limit_bits, &params).expect("subsidy");
        for bits in harder {
            let subsidy = proof_of_work_subsidy(bits, &params).expect("subsidy");
            assert!(subsidy <= last);
            assert_eq!(subsidy % CENT, 0);
            last = subsidy;
        }
    }

    #[test]
    fn subsidy_tracks_fourth_root_of_difficulty() {
        let params = mainnet();
        // Difficulty 2^16 => fourth root 16 => subsidy near max/16.
        let bits = 0x1c0fffff;
        let subsidy = proof_of_work_subsidy(bits, &params).expect("subsidy");
        let expected = params.max_mint_proof_of_work / 16;
        assert!((subsidy - expected).abs() <= CENT);
    }

    #[test]
    fn burn_subsidy_uses_its_own_cap() {
        let params = mainnet();
        let bits = target_to_compact(&params.burn_limit);
        let subsidy = proof_of_burn_subsidy(bits, &params).expect("subsidy");
        assert_eq!(subsidy, params.max_mint_proof_of_burn);
        assert_ne!(params.max_mint_proof_of_burn, params.max_mint_proof_of_work);
    }

    #[test]
    fn stake_reward_is_linear_in_coin_days() {
        let params = mainnet();
        let time = params.pob_pos_target_switch_time + 1;
        let one = proof_of_stake_reward(1_000, time, &params);
        let five = proof_of_stake_reward(5_000, time, &params);
        assert_eq!(five, 5 * one);
    }

    #[test]
    fn stake_reward_rate_rises_after_switch() {
        let params = mainnet();
        let before = proof_of_stake_reward(10_000, params.pob_pos_target_switch_time, &params);
        let after = proof_of_stake_reward(10_000, params.pob_pos_target_switch_time + 1, &params);
        assert_eq!(after, 10 * before);
    }
}
