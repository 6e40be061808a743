use coind_primitives::{OutPoint, Transaction, TxIn, TxOut};
use coind_script::sighash::{
    signature_hash, SighashType, SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_NONE, SIGHASH_SINGLE,
};

fn spend() -> Transaction {
    Transaction {
        version: 1,
        vin: vec![
            TxIn::new(OutPoint::new([0x11; 32], 0), vec![0x00]),
            TxIn::new(OutPoint::new([0x22; 32], 3), vec![0x00]),
        ],
        vout: vec![
            TxOut::new(1_000, vec![0x51]),
            TxOut::new(2_000, vec![0x52]),
        ],
        lock_time: 0,
    }
}

#[test]
fn sighash_type_flags() {
    let combined = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
    assert_eq!(combined.base_type(), SIGHASH_ALL);
    assert!(combined.has_anyone_can_pay());
    assert!(combined.is_defined());

    let none = SighashType(SIGHASH_NONE);
    assert_eq!(none.base_type(), SIGHASH_NONE);
    assert!(!none.has_anyone_can_pay());

    let single = SighashType(SIGHASH_SINGLE | SIGHASH_ANYONECANPAY);
    assert_eq!(single.base_type(), SIGHASH_SINGLE);
    assert!(single.has_anyone_can_pay());

    assert!(!SighashType(0).is_defined());
    assert!(!SighashType(0x04).is_defined());
}

#[test]
fn none_commits_to_no_outputs() {
    let tx = spend();
    let ty = SighashType(SIGHASH_NONE);
    let before = signature_hash(&tx, 0, &[0xac], ty);
    let mut changed = tx.clone();
    changed.vout[1].value = 7;
    changed.vin[1].sequence = 5;
    assert_eq!(before, signature_hash(&changed, 0, &[0xac], ty));
}

#[test]
fn single_commits_to_matching_output_only() {
    let tx = spend();
    let ty = SighashType(SIGHASH_SINGLE);
    let before = signature_hash(&tx, 0, &[0xac], ty);
    let mut changed = tx.clone();
    changed.vout[1].value = 7;
    assert_eq!(before, signature_hash(&changed, 0, &[0xac], ty));
    changed.vout[0].value = 7;
    assert_ne!(before, signature_hash(&changed, 0, &[0xac], ty));
}

#[test]
fn all_commits_to_locktime() {
    let tx = spend();
    let ty = SighashType(SIGHASH_ALL);
    let mut changed = tx.clone();
    changed.lock_time = 1;
    assert_ne!(
        signature_hash(&tx, 1, &[0xac], ty),
        signature_hash(&changed, 1, &[0xac], ty)
    );
}
