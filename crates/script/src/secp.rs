use std::sync::OnceLock;

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

pub(crate) fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

/// Lax DER parse with S normalized before verification. Strictness is
/// enforced by the encoding checks, not here.
pub(crate) fn verify_ecdsa(digest: &[u8; 32], der: &[u8], pubkey: &[u8]) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(mut sig) = Signature::from_der_lax(der) else {
        return false;
    };
    sig.normalize_s();
    let msg = Message::from_digest(*digest);
    secp256k1_verify().verify_ecdsa(&msg, &sig, &pubkey).is_ok()
}

/// Whether S is at most half the curve order.
pub(crate) fn is_low_s(der: &[u8]) -> bool {
    let Ok(sig) = Signature::from_der_lax(der) else {
        return false;
    };
    let mut normalized = sig;
    normalized.normalize_s();
    normalized == sig
}
