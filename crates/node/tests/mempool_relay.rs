mod common;

use coind::accept::AcceptOutcome;
use coind::wire::{Inv, NetMessage};
use coind_chainstate::validation::{ValidationResult, REJECT_INVALID};
use coind_primitives::transaction::Transaction;
use common::{sent, spend, spend_outputs, TestNode, FEE};

fn announces_tx(actions: &[coind::context::PeerAction], txid: [u8; 32]) -> bool {
    sent(actions).into_iter().any(|message| match message {
        NetMessage::Inv(items) => items.contains(&Inv::tx(txid)),
        _ => false,
    })
}

fn rejection(result: ValidationResult<AcceptOutcome>) -> String {
    result.expect_err("rejected").reject_reason().to_string()
}

/// Signals replaceability on every input.
fn opt_in(mut tx: Transaction) -> Transaction {
    for input in &mut tx.vin {
        input.sequence = 0;
    }
    tx
}

#[test]
fn accepted_transaction_is_relayed_to_other_peers() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    node.connect_peer(1);
    node.connect_peer(2);

    let tx = spend(&coinbase, 0);
    let txid = tx.txid();
    let actions = node
        .context
        .process_message(1, NetMessage::Tx(tx), 0)
        .expect("tx");
    assert!(actions.is_empty(), "{actions:?}");
    assert!(node.in_mempool(&txid));

    let to_other = node.context.send_messages(2, 1).expect("send");
    assert!(announces_tx(&to_other, txid));
    let to_source = node.context.send_messages(1, 1).expect("send");
    assert!(!announces_tx(&to_source, txid));
}

#[test]
fn orphan_is_accepted_once_its_parent_arrives() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    node.connect_peer(1);

    let parent = spend(&coinbase, 0);
    let child = spend(&parent, 0);
    node.context
        .process_message(1, NetMessage::Tx(child.clone()), 0)
        .expect("child");
    assert!(!node.in_mempool(&child.txid()));
    assert!(node
        .context
        .lock()
        .expect("lock")
        .orphans
        .contains(&child.txid()));

    node.context
        .process_message(1, NetMessage::Tx(parent.clone()), 0)
        .expect("parent");
    assert!(node.in_mempool(&parent.txid()));
    assert!(node.in_mempool(&child.txid()));
    assert_eq!(node.context.lock().expect("lock").orphans.len(), 0);
}

#[test]
fn disconnecting_a_peer_drops_its_orphans() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    node.connect_peer(1);
    let child = spend(&spend(&coinbase, 0), 0);
    node.context
        .process_message(1, NetMessage::Tx(child), 0)
        .expect("child");
    assert_eq!(node.context.lock().expect("lock").orphans.len(), 1);
    node.context.finalize_node(1).expect("finalize");
    assert_eq!(node.context.lock().expect("lock").orphans.len(), 0);
}

#[test]
fn invalid_transaction_is_rejected_and_scored() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    node.connect_peer(1);

    let mut tx = spend(&coinbase, 0);
    tx.vout.clear();
    let txid = tx.txid();
    let actions = node
        .context
        .process_message(1, NetMessage::Tx(tx), 0)
        .expect("tx");
    match sent(&actions).as_slice() {
        [NetMessage::Reject {
            message,
            code,
            reason,
            hash,
        }] => {
            assert_eq!(message, "tx");
            assert_eq!(u16::from(*code), REJECT_INVALID);
            assert_eq!(reason, "bad-txns-vout-empty");
            assert_eq!(*hash, Some(txid));
        }
        other => panic!("expected reject, got {other:?}"),
    }
    assert_eq!(node.misbehavior(1), 10);
    assert!(!node.in_mempool(&txid));
}

#[test]
fn announced_transaction_is_requested() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    node.connect_peer(1);
    let tx = spend(&coinbase, 0);

    node.context
        .process_message(1, NetMessage::Inv(vec![Inv::tx(tx.txid())]), 0)
        .expect("inv");
    let actions = node.context.send_messages(1, 1).expect("send");
    assert!(sent(&actions).contains(&&NetMessage::GetData(vec![Inv::tx(tx.txid())])));

    // Known transactions are not requested again.
    node.context
        .process_message(1, NetMessage::Tx(tx.clone()), 0)
        .expect("tx");
    node.context
        .process_message(1, NetMessage::Inv(vec![Inv::tx(tx.txid())]), 0)
        .expect("inv");
    let actions = node.context.send_messages(1, 2).expect("send");
    assert!(!sent(&actions)
        .into_iter()
        .any(|message| matches!(message, NetMessage::GetData(_))));
}

#[test]
fn mempool_request_lists_every_transaction() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    let tx = spend(&coinbase, 0);
    node.context
        .submit_transaction(&tx)
        .expect("submit")
        .expect("accepted");
    node.connect_peer(1);
    let actions = node
        .context
        .process_message(1, NetMessage::Mempool, 0)
        .expect("mempool");
    assert_eq!(
        sent(&actions),
        vec![&NetMessage::Inv(vec![Inv::tx(tx.txid())])]
    );
}

#[test]
fn local_submission_is_announced() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    node.connect_peer(1);
    let tx = spend(&coinbase, 0);
    let outcome = node
        .context
        .submit_transaction(&tx)
        .expect("submit")
        .expect("accepted");
    assert!(outcome.accepted);
    let actions = node.context.send_messages(1, 1).expect("send");
    assert!(announces_tx(&actions, tx.txid()));
}

#[test]
fn confirmed_transactions_leave_the_pool_and_return_on_reorg() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    let tx = spend(&coinbase, 0);
    node.context
        .submit_transaction(&tx)
        .expect("submit")
        .expect("accepted");
    let fork_point = node.tip_hash();

    let confirming = node.mine(vec![tx.clone()]);
    assert_eq!(node.mempool_size(), 0);

    let side_one = node.build_block(fork_point, Vec::new(), 1);
    node.submit(&side_one);
    assert_eq!(node.tip_hash(), confirming.hash());
    let side_two = node.build_block(side_one.hash(), Vec::new(), 1);
    node.submit(&side_two);

    assert_eq!(node.tip_hash(), side_two.hash());
    assert!(node.in_mempool(&tx.txid()));
}

#[test]
fn double_spend_of_a_pool_transaction_is_refused() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    node.connect_peer(1);
    let first = spend(&coinbase, 0);
    node.context
        .submit_transaction(&first)
        .expect("submit")
        .expect("accepted");

    let mut second: Transaction = spend(&coinbase, 0);
    second.lock_time = 1;
    node.context
        .process_message(1, NetMessage::Tx(second.clone()), 0)
        .expect("tx");
    assert!(node.in_mempool(&first.txid()));
    assert!(!node.in_mempool(&second.txid()));
}

#[test]
fn resubmitting_a_pool_transaction_is_refused() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    let tx = spend(&coinbase, 0);
    node.submit_tx(&tx).expect("accepted");
    assert_eq!(rejection(node.submit_tx(&tx)), "txn-already-in-mempool");
    assert_eq!(node.mempool_size(), 1);
}

#[test]
fn unconfirmed_chain_stops_at_the_ancestor_limit() {
    let node = TestNode::new();
    let mut parent = node.mature_coinbase();
    for _ in 0..25 {
        let tx = spend(&parent, 0);
        node.submit_tx(&tx).expect("within the limit");
        parent = tx;
    }
    let too_deep = spend(&parent, 0);
    assert_eq!(rejection(node.submit_tx(&too_deep)), "too-long-mempool-chain");
    assert_eq!(node.mempool_size(), 25);
    assert!(!node.in_mempool(&too_deep.txid()));
}

#[test]
fn invalidated_block_returns_its_transactions_to_the_pool() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    let tx = spend(&coinbase, 0);
    let block = node.mine(vec![tx.clone()]);
    assert!(!node.in_mempool(&tx.txid()));
    node.context.invalidate_block(&block.hash()).expect("invalidate");
    assert_eq!(node.height(), 101);
    assert!(node.in_mempool(&tx.txid()));

    node.context.reconsider_block(&block.hash()).expect("reconsider");
    assert_eq!(node.tip_hash(), block.hash());
    assert!(!node.in_mempool(&tx.txid()));
}

#[test]
fn higher_paying_replacement_evicts_an_opted_in_transaction() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    let original = opt_in(spend_outputs(&[(&coinbase, 0)], 1, FEE));
    node.submit_tx(&original).expect("original");

    let replacement = spend_outputs(&[(&coinbase, 0)], 1, 2 * FEE);
    let outcome = node.submit_tx(&replacement).expect("replacement");
    assert!(outcome.accepted);
    assert_eq!(outcome.replaced, vec![original.txid()]);
    assert!(!node.in_mempool(&original.txid()));
    assert!(node.in_mempool(&replacement.txid()));
}

#[test]
fn final_transactions_cannot_be_replaced() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    let original = spend_outputs(&[(&coinbase, 0)], 1, FEE);
    node.submit_tx(&original).expect("original");
    let replacement = spend_outputs(&[(&coinbase, 0)], 1, 2 * FEE);
    assert_eq!(rejection(node.submit_tx(&replacement)), "txn-mempool-conflict");
    assert!(node.in_mempool(&original.txid()));
}

#[test]
fn one_signalling_input_makes_a_transaction_replaceable() {
    let node = TestNode::new();
    let coinbases = node.mature_coinbases(2);
    let mut original = spend_outputs(&[(&coinbases[0], 0), (&coinbases[1], 0)], 1, FEE);
    original.vin[0].sequence = 0;
    node.submit_tx(&original).expect("original");

    // The replacement only touches the signalling input.
    let replacement = spend_outputs(&[(&coinbases[0], 0)], 1, 2 * FEE);
    let outcome = node.submit_tx(&replacement).expect("replacement");
    assert_eq!(outcome.replaced, vec![original.txid()]);
    assert!(!node.in_mempool(&original.txid()));
}

#[test]
fn replacement_must_pay_a_higher_fee_rate() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    let original = opt_in(spend_outputs(&[(&coinbase, 0)], 1, FEE));
    node.submit_tx(&original).expect("original");

    let mut same_rate = spend_outputs(&[(&coinbase, 0)], 1, FEE);
    same_rate.lock_time = 1;
    assert_eq!(rejection(node.submit_tx(&same_rate)), "insufficient fee");
    assert!(node.in_mempool(&original.txid()));
}

#[test]
fn replacement_must_cover_evicted_fees_and_its_own_relay() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    // A large original leaves room for a small replacement to beat its
    // fee rate while paying less in total.
    let original = opt_in(spend_outputs(&[(&coinbase, 0)], 20, FEE));
    node.submit_tx(&original).expect("original");

    let cheaper = spend_outputs(&[(&coinbase, 0)], 1, FEE - 1_000);
    assert_eq!(rejection(node.submit_tx(&cheaper)), "insufficient fee");
    let no_relay_margin = spend_outputs(&[(&coinbase, 0)], 1, FEE + 50);
    assert_eq!(rejection(node.submit_tx(&no_relay_margin)), "insufficient fee");
    assert!(node.in_mempool(&original.txid()));

    let enough = spend_outputs(&[(&coinbase, 0)], 1, FEE + 100);
    let outcome = node.submit_tx(&enough).expect("replacement");
    assert_eq!(outcome.replaced, vec![original.txid()]);
}

#[test]
fn replacement_may_not_add_unconfirmed_inputs() {
    let node = TestNode::new();
    let coinbases = node.mature_coinbases(2);
    let original = opt_in(spend_outputs(&[(&coinbases[0], 0)], 1, FEE));
    let unrelated = spend_outputs(&[(&coinbases[1], 0)], 1, FEE);
    node.submit_tx(&original).expect("original");
    node.submit_tx(&unrelated).expect("unrelated");

    let replacement = spend_outputs(&[(&coinbases[0], 0), (&unrelated, 0)], 1, 3 * FEE);
    assert_eq!(
        rejection(node.submit_tx(&replacement)),
        "replacement-adds-unconfirmed"
    );
    assert!(node.in_mempool(&original.txid()));
}

#[test]
fn replacement_may_not_evict_too_many_transactions() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    let fan_out = spend_outputs(&[(&coinbase, 0)], 101, FEE);
    node.mine(vec![fan_out.clone()]);
    for index in 0..101 {
        let child = opt_in(spend_outputs(&[(&fan_out, index)], 1, FEE));
        node.submit_tx(&child).expect("child");
    }
    assert_eq!(node.mempool_size(), 101);

    let inputs: Vec<(&Transaction, u32)> = (0..101).map(|index| (&fan_out, index)).collect();
    let sweep = spend_outputs(&inputs, 1, 100 * FEE);
    assert_eq!(
        rejection(node.submit_tx(&sweep)),
        "too many potential replacements"
    );
    assert_eq!(node.mempool_size(), 101);
}

#[test]
fn standard_policy_refuses_spends_of_nonstandard_outputs() {
    let node = TestNode::new();
    let coinbase = node.mature_coinbase();
    node.context.lock().expect("lock").policy.require_standard = true;

    // Pay-to-pubkey-hash output, but the coinbase output it spends is a
    // bare OP_TRUE.
    let mut tx = spend(&coinbase, 0);
    let mut p2pkh = vec![0x76, 0xa9, 0x14];
    p2pkh.extend_from_slice(&[7u8; 20]);
    p2pkh.extend_from_slice(&[0x88, 0xac]);
    tx.vout[0].script_pubkey = p2pkh;
    assert_eq!(
        rejection(node.submit_tx(&tx)),
        "bad-txns-nonstandard-inputs"
    );
    assert_eq!(node.mempool_size(), 0);
}
