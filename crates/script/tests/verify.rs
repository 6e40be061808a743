use std::sync::Arc;

use coind_primitives::hash::hash160;
use coind_primitives::{OutPoint, Transaction, TxIn, TxOut};
use coind_script::interpreter::SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
use coind_script::script::{
    push_data, OP_1, OP_CHECKMULTISIG, OP_CHECKSEQUENCEVERIFY, OP_CHECKSIG, OP_DUP, OP_EQUALVERIFY, OP_HASH160,
};
use coind_script::sighash::{signature_hash, SighashType, SIGHASH_ALL};
use coind_script::{
    Interpreter, ScriptError, ScriptVerifier, SignatureCache, MANDATORY_SCRIPT_VERIFY_FLAGS,
    STANDARD_SCRIPT_VERIFY_FLAGS,
};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

fn key(byte: u8) -> (SecretKey, Vec<u8>) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[byte; 32]).expect("secret key");
    let public = PublicKey::from_secret_key(&secp, &secret);
    (secret, public.serialize().to_vec())
}

fn p2pkh(pubkey: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160, 0x14];
    script.extend_from_slice(&hash160(pubkey));
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

fn unsigned_spend() -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::new([0x07; 32], 1), Vec::new())],
        vout: vec![TxOut::new(40_000, vec![OP_1])],
        lock_time: 0,
    }
}

fn sign(tx: &Transaction, script_code: &[u8], secret: &SecretKey) -> Vec<u8> {
    let secp = Secp256k1::new();
    let digest = signature_hash(tx, 0, script_code, SighashType(SIGHASH_ALL));
    let sig = secp.sign_ecdsa(&Message::from_digest(digest), secret);
    let mut bytes = sig.serialize_der().to_vec();
    bytes.push(SIGHASH_ALL as u8);
    bytes
}

#[test]
fn signed_p2pkh_spend_verifies() {
    let (secret, pubkey) = key(0x31);
    let script_pubkey = p2pkh(&pubkey);
    let mut tx = unsigned_spend();
    let sig = sign(&tx, &script_pubkey, &secret);
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &sig);
    push_data(&mut script_sig, &pubkey);
    tx.vin[0].script_sig = script_sig;

    let interpreter = Interpreter::new();
    interpreter
        .verify_input(&tx, 0, &script_pubkey, STANDARD_SCRIPT_VERIFY_FLAGS, false)
        .expect("valid spend");

    // Any change to the outputs breaks the signature.
    let mut tampered = tx.clone();
    tampered.vout[0].value += 1;
    assert_eq!(
        interpreter.verify_input(&tampered, 0, &script_pubkey, MANDATORY_SCRIPT_VERIFY_FLAGS, false),
        Err(ScriptError::EvalFalse)
    );
}

#[test]
fn signature_cache_populated_only_when_storing() {
    let (secret, pubkey) = key(0x32);
    let script_pubkey = p2pkh(&pubkey);
    let mut tx = unsigned_spend();
    let sig = sign(&tx, &script_pubkey, &secret);
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &sig);
    push_data(&mut script_sig, &pubkey);
    tx.vin[0].script_sig = script_sig;

    let cache = Arc::new(SignatureCache::new(16));
    let interpreter = Interpreter::with_sig_cache(Arc::clone(&cache));
    interpreter
        .verify_input(&tx, 0, &script_pubkey, MANDATORY_SCRIPT_VERIFY_FLAGS, false)
        .expect("valid spend");
    assert!(cache.is_empty());
    interpreter
        .verify_input(&tx, 0, &script_pubkey, MANDATORY_SCRIPT_VERIFY_FLAGS, true)
        .expect("valid spend");
    assert_eq!(cache.len(), 1);
}

#[test]
fn one_of_two_multisig_with_nulldummy() {
    let (secret, pubkey_a) = key(0x41);
    let (_, pubkey_b) = key(0x42);
    let mut script_pubkey = vec![OP_1];
    push_data(&mut script_pubkey, &pubkey_a);
    push_data(&mut script_pubkey, &pubkey_b);
    script_pubkey.extend_from_slice(&[OP_1 + 1, OP_CHECKMULTISIG]);

    let mut tx = unsigned_spend();
    let sig = sign(&tx, &script_pubkey, &secret);
    let mut script_sig = vec![0x00];
    push_data(&mut script_sig, &sig);
    tx.vin[0].script_sig = script_sig;

    let interpreter = Interpreter::new();
    interpreter
        .verify_input(&tx, 0, &script_pubkey, STANDARD_SCRIPT_VERIFY_FLAGS, false)
        .expect("valid multisig");

    // A non-empty dummy is only rejected under the policy flags.
    let mut dummy = vec![OP_1];
    push_data(&mut dummy, &sig);
    tx.vin[0].script_sig = dummy;
    assert_eq!(
        interpreter.verify_input(&tx, 0, &script_pubkey, STANDARD_SCRIPT_VERIFY_FLAGS, false),
        Err(ScriptError::SigNullDummy)
    );
    interpreter
        .verify_input(&tx, 0, &script_pubkey, MANDATORY_SCRIPT_VERIFY_FLAGS, false)
        .expect("dummy allowed by consensus");
}

#[test]
fn checksequenceverify_reads_the_version_unsigned() {
    let script_pubkey = vec![OP_1, OP_CHECKSEQUENCEVERIFY];
    let mut tx = unsigned_spend();
    tx.vin[0].sequence = 1;
    let interpreter = Interpreter::new();

    assert_eq!(
        interpreter.verify_input(&tx, 0, &script_pubkey, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, false),
        Err(ScriptError::UnsatisfiedLocktime)
    );

    tx.version = 2;
    interpreter
        .verify_input(&tx, 0, &script_pubkey, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, false)
        .expect("version 2 spend");

    // 0x80000002 is negative as i32 but counts as version 2.
    tx.version = 0x8000_0002u32 as i32;
    interpreter
        .verify_input(&tx, 0, &script_pubkey, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, false)
        .expect("high-bit version spend");
}
