use cinder_pow::{compact_to_u256, u256_to_compact};
use primitive_types::U256;

fn lcg_values(count: usize) -> Vec<U256> {
    let mut state = 0x1234_5678_9abc_def0u64;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let mut words = [0u64; 4];
        for word in &mut words {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            *word = state;
        }
        // Vary magnitude so small values are covered too.
        let mut value = U256(words);
        value >>= (i % 32) * 8;
        out.push(value);
    }
    out
}

#[test]
fn compact_round_trip_never_grows() {
    for value in lcg_values(512) {
        let compact = u256_to_compact(value);
        let back = compact_to_u256(compact).expect("round trip");
        assert!(back <= value, "compact encoding must round down");
    }
}

#[test]
fn compact_round_trip_is_lossy_only_in_low_bits() {
    for value in lcg_values(512) {
        if value.is_zero() {
            continue;
        }
        let compact = u256_to_compact(value);
        let back = compact_to_u256(compact).expect("round trip");
        // The mantissa keeps at least 15 significant bits, so the error is
        // bounded by value / 2^14.
        let error = value - back;
        assert!(error <= (value >> 14) + U256::from(1u64));
    }
}

#[test]
fn compact_round_trip_is_exact_on_its_own_output() {
    for value in lcg_values(256) {
        let compact = u256_to_compact(value);
        let back = compact_to_u256(compact).expect("round trip");
        assert_eq!(u256_to_compact(back), compact);
        assert_eq!(compact_to_u256(u256_to_compact(back)).expect("again"), back);
    }
}

#[test]
fn zero_and_small_values_encode_exactly() {
    for raw in [0u64, 1, 2, 127, 128, 255, 256, 0xffff, 0x7fffff] {
        let value = U256::from(raw);
        let back = compact_to_u256(u256_to_compact(value)).expect("round trip");
        assert_eq!(back, value);
    }
}

#[test]
fn negative_sign_bit_is_rejected() {
    assert!(compact_to_u256(0x0180_0000).is_err());
}
