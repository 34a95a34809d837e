//! Standard script templates, signature-operation counting, and the seams to
//! the external script interpreter.

pub mod secp;
pub mod standard;

use cinder_primitives::transaction::Transaction;

/// External script execution. The full interpreter lives outside the
/// consensus core; validation calls through this trait for every spent input.
pub trait ScriptVerifier: Send + Sync {
    fn verify_spend(
        &self,
        tx: &Transaction,
        input_index: usize,
        prev_script_pubkey: &[u8],
        strict_p2sh: bool,
    ) -> bool;
}

/// Structural stand-in used until the external interpreter is wired in:
/// the input script must be push-only and leave exactly the stack its
/// prevout template expects.
pub struct StructuralVerifier;

impl ScriptVerifier for StructuralVerifier {
    fn verify_spend(
        &self,
        tx: &Transaction,
        input_index: usize,
        prev_script_pubkey: &[u8],
        _strict_p2sh: bool,
    ) -> bool {
        let Some(input) = tx.vin.get(input_index) else {
            return false;
        };
        if !standard::is_push_only(&input.script_sig) {
            return false;
        }
        let Some((script_type, solutions)) = standard::classify(prev_script_pubkey) else {
            return false;
        };
        let Some(stack) = standard::pushed_stack(&input.script_sig) else {
            return false;
        };
        match standard::script_sig_args_expected(script_type, &solutions) {
            Some(expected) => stack.len() == expected,
            None => script_type == standard::ScriptType::ScriptHash && !stack.is_empty(),
        }
    }
}
