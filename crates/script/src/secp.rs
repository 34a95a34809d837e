//! Block-signature verification over the payee's pay-to-pubkey key.

use std::sync::OnceLock;

use cinder_consensus::Hash256;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigError {
    BadPubKey,
    BadSignature,
    Mismatch,
}

impl std::fmt::Display for SigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigError::BadPubKey => write!(f, "malformed public key"),
            SigError::BadSignature => write!(f, "malformed signature"),
            SigError::Mismatch => write!(f, "signature does not match"),
        }
    }
}

impl std::error::Error for SigError {}

fn context() -> &'static Secp256k1<All> {
    static CONTEXT: OnceLock<Secp256k1<All>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::new)
}

pub fn verify_hash_signature(
    pubkey: &[u8],
    signature: &[u8],
    hash: &Hash256,
) -> Result<(), SigError> {
    let pubkey = PublicKey::from_slice(pubkey).map_err(|_| SigError::BadPubKey)?;
    let signature = Signature::from_der(signature).map_err(|_| SigError::BadSignature)?;
    let message = Message::from_digest(*hash);
    context()
        .verify_ecdsa(&message, &signature, &pubkey)
        .map_err(|_| SigError::Mismatch)
}

/// DER signature over a hash; used by the test harness and block assembly.
pub fn sign_hash(secret: &[u8; 32], hash: &Hash256) -> Result<Vec<u8>, SigError> {
    let secret = SecretKey::from_slice(secret).map_err(|_| SigError::BadPubKey)?;
    let message = Message::from_digest(*hash);
    let signature = context().sign_ecdsa(&message, &secret);
    Ok(signature.serialize_der().to_vec())
}

pub fn pubkey_for_secret(secret: &[u8; 32]) -> Result<Vec<u8>, SigError> {
    let secret = SecretKey::from_slice(secret).map_err(|_| SigError::BadPubKey)?;
    let pubkey = PublicKey::from_secret_key(context(), &secret);
    Ok(pubkey.serialize().to_vec())
}
