use coind_consensus::money::FeeRate;
use coind_primitives::{OutPoint, Transaction, TxIn, TxOut};
use coind_script::script::{push_data, OP_1, OP_CHECKMULTISIG, OP_CHECKSIG, OP_DUP, OP_RETURN};
use coind_script::standard::{
    are_inputs_standard, classify_script_pubkey, is_standard_tx, ScriptType, StandardPolicy,
};

fn p2pkh() -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[0x11; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn p2sh(hash: [u8; 20]) -> Vec<u8> {
    let mut script = vec![0xa9, 0x14];
    script.extend_from_slice(&hash);
    script.push(0x87);
    script
}

fn spend(outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::new([0x42; 32], 0), vec![0x00, 0x00])],
        vout: outputs,
        lock_time: 0,
    }
}

#[test]
fn classify_p2pkh() {
    assert_eq!(classify_script_pubkey(&p2pkh()), ScriptType::PubKeyHash);
}

#[test]
fn classify_p2sh() {
    assert_eq!(classify_script_pubkey(&p2sh([0x22; 20])), ScriptType::ScriptHash);
}

#[test]
fn classify_p2pk() {
    let mut script = vec![33];
    script.extend_from_slice(&[0x02; 33]);
    script.push(OP_CHECKSIG);
    assert_eq!(classify_script_pubkey(&script), ScriptType::PubKey);
}

#[test]
fn classify_null_data_and_unknown() {
    assert_eq!(classify_script_pubkey(&[OP_RETURN, 0x01, 0x01]), ScriptType::NullData);
    assert_eq!(classify_script_pubkey(&[OP_RETURN, OP_DUP]), ScriptType::NonStandard);
    let mut witness_like = vec![0x00, 0x14];
    witness_like.extend_from_slice(&[0x33; 20]);
    assert_eq!(classify_script_pubkey(&witness_like), ScriptType::NonStandard);
}

#[test]
fn standard_tx_reasons() {
    let policy = StandardPolicy::default();
    assert!(is_standard_tx(&spend(vec![TxOut::new(10_000, p2pkh())]), &policy).is_ok());

    let mut bad_version = spend(vec![TxOut::new(10_000, p2pkh())]);
    bad_version.version = 3;
    assert_eq!(is_standard_tx(&bad_version, &policy), Err("version"));

    let mut not_push = spend(vec![TxOut::new(10_000, p2pkh())]);
    not_push.vin[0].script_sig = vec![OP_DUP];
    assert_eq!(is_standard_tx(&not_push, &policy), Err("scriptsig-not-pushonly"));

    let dust = spend(vec![TxOut::new(100, p2pkh())]);
    assert_eq!(is_standard_tx(&dust, &policy), Err("dust"));

    let two_data = spend(vec![
        TxOut::new(0, vec![OP_RETURN, 0x01, 0x01]),
        TxOut::new(0, vec![OP_RETURN]),
    ]);
    assert_eq!(is_standard_tx(&two_data, &policy), Err("multi-op-return"));

    let mut bare = vec![OP_1];
    push_data(&mut bare, &[0x02; 33]);
    bare.extend_from_slice(&[OP_1, OP_CHECKMULTISIG]);
    let bare_tx = spend(vec![TxOut::new(10_000, bare)]);
    assert!(is_standard_tx(&bare_tx, &policy).is_ok());
    let strict = StandardPolicy {
        permit_bare_multisig: false,
        ..StandardPolicy::default()
    };
    assert_eq!(is_standard_tx(&bare_tx, &strict), Err("bare-multisig"));

    let cheap = StandardPolicy {
        min_relay_fee: FeeRate::new(0),
        ..StandardPolicy::default()
    };
    assert!(is_standard_tx(&dust, &cheap).is_ok());
}

#[test]
fn inputs_standard_counts_stack_items() {
    let tx = spend(vec![TxOut::new(10_000, p2pkh())]);
    // Two pushes satisfy a pay-to-pubkey-hash input.
    assert!(are_inputs_standard(&tx, |_| Some(p2pkh())));

    let mut extra = tx.clone();
    extra.vin[0].script_sig = vec![0x00, 0x00, 0x00];
    assert!(!are_inputs_standard(&extra, |_| Some(p2pkh())));

    assert!(!are_inputs_standard(&tx, |_| None));
}

#[test]
fn p2sh_nonstandard_redeem_script_limited_by_sigops() {
    let redeem = vec![OP_CHECKSIG; 16];
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &redeem);
    let mut tx = spend(vec![TxOut::new(10_000, p2pkh())]);
    tx.vin[0].script_sig = script_sig;
    assert!(!are_inputs_standard(&tx, |_| Some(p2sh([0u8; 20]))));

    let redeem = vec![OP_CHECKSIG; 15];
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &redeem);
    tx.vin[0].script_sig = script_sig;
    assert!(are_inputs_standard(&tx, |_| Some(p2sh([0u8; 20]))));
}
