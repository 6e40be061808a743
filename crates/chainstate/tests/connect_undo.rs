mod common;

use coind_chainstate::coins::Coins;
use coind_consensus::money::COIN;
use common::{coinbase, spend, Node};

/// A node with 100 blocks on genesis, so the coinbase of block 1 is mature
/// for the next block.
fn matured() -> (Node, coind_primitives::block::Block) {
    let mut node = Node::new();
    let blocks = node.mine_many(100);
    (node, blocks[0].clone())
}

#[test]
fn connect_and_disconnect_restore_the_coins() {
    let (mut node, first) = matured();
    let funding = first.transactions[0].clone();
    let payment = spend(&funding, 0, 49 * COIN);
    let block = node.mine(vec![payment.clone()]);

    let tip = node.chain.coins_tip_mut();
    assert!(!tip.have_coins(&funding.txid()).expect("lookup"));
    let created = tip.access_coins(&payment.txid()).expect("lookup").cloned();
    assert_eq!(created, Some(Coins::from_tx(&payment, 101)));

    let trace = node.chain.invalidate_block(&block.hash()).expect("invalidate");
    assert_eq!(trace.disconnected.len(), 1);
    assert_eq!(trace.disconnected[0].transactions[1], payment);

    let tip = node.chain.coins_tip_mut();
    assert!(!tip.have_coins(&payment.txid()).expect("lookup"));
    let restored = tip.access_coins(&funding.txid()).expect("lookup").cloned();
    assert_eq!(restored, Some(Coins::from_tx(&funding, 1)));
    assert_eq!(tip.best_block().expect("best"), node.chain.tip_node().expect("tip").hash);
}

#[test]
fn double_spend_in_a_later_block_is_rejected() {
    let (mut node, first) = matured();
    let funding = first.transactions[0].clone();
    node.mine(vec![spend(&funding, 0, 49 * COIN)]);
    let tip_before = node.tip_hash();

    let conflict = node.build_block(tip_before, vec![spend(&funding, 0, 48 * COIN)], 0);
    node.chain
        .process_new_block(&conflict, Some(7), true, None)
        .expect("process");
    assert_eq!(node.tip_hash(), tip_before);
    assert!(node.chain.index().get(&conflict.hash()).expect("indexed").is_failed());

    let rejections = node.chain.take_block_rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].peer, 7);
    assert_eq!(rejections[0].hash, conflict.hash());
    assert_eq!(
        rejections[0].state.reject_reason(),
        "bad-txns-inputs-missingorspent"
    );
    assert_eq!(rejections[0].state.dos_score(), 100);
    assert!(node.chain.check_block_index().is_empty());
}

#[test]
fn immature_coinbase_cannot_be_spent() {
    let mut node = Node::new();
    let blocks = node.mine_many(5);
    let funding = blocks[0].transactions[0].clone();
    let early = node.build_block(node.tip_hash(), vec![spend(&funding, 0, COIN)], 0);
    node.chain
        .process_new_block(&early, Some(3), true, None)
        .expect("process");
    assert_eq!(node.height(), 5);
    let rejections = node.chain.take_block_rejections();
    assert_eq!(
        rejections[0].state.reject_reason(),
        "bad-txns-premature-spend-of-coinbase"
    );
}

#[test]
fn coinbase_may_not_claim_more_than_subsidy_and_fees() {
    let mut node = Node::new();
    node.mine_many(2);
    let mut greedy = node.build_block(node.tip_hash(), Vec::new(), 0);
    greedy.transactions[0] = coinbase(3, 0, 50 * COIN + 1);
    greedy.header.merkle_root = greedy.merkle_root();
    node.solve(&mut greedy.header);

    node.chain
        .process_new_block(&greedy, Some(4), true, None)
        .expect("process");
    assert_eq!(node.height(), 2);
    let rejections = node.chain.take_block_rejections();
    assert_eq!(rejections[0].state.reject_reason(), "bad-cb-amount");
}

#[test]
fn block_validity_can_be_tested_without_connecting() {
    let (mut node, first) = matured();
    let funding = first.transactions[0].clone();
    let candidate = node.build_block(node.tip_hash(), vec![spend(&funding, 0, COIN)], 0);
    node.chain
        .test_block_validity(&candidate, true, true)
        .expect("valid template");
    assert_eq!(node.height(), 100);
    assert!(node
        .chain
        .coins_tip_mut()
        .have_coins(&funding.txid())
        .expect("lookup"));
}
