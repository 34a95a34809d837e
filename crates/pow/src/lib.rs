//! Difficulty targets and reward curves for the three proof kinds.

pub mod difficulty;
pub mod rewards;

pub use difficulty::{
    compact_to_target, compact_to_u256, hash_meets_target, next_burn_target_required,
    next_target_required, round_down_to_compact, target_to_compact, u256_to_compact,
    BlockAncestry, CompactError, TargetInfo,
};
pub use rewards::{proof_of_burn_subsidy, proof_of_stake_reward, proof_of_work_subsidy};
