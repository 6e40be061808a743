mod common;

use std::sync::atomic::Ordering;

use coind_chainstate::events::ChainEvent;
use coind_chainstate::state::ConnectTrace;
use coind_pow::difficulty::{block_proof, target_to_compact};
use common::{regtest_params, Node};

#[test]
fn genesis_is_the_first_tip() {
    let node = Node::new();
    assert_eq!(node.height(), 0);
    assert_eq!(node.tip_hash(), node.params.consensus.hash_genesis_block);
    assert!(node.chain.check_block_index().is_empty());
    assert_eq!(node.chain.best_header(), node.chain.tip());
}

#[test]
fn extends_the_tip_in_order() {
    let mut node = Node::new();
    let events = node.chain.subscribe();
    let blocks = node.mine_many(3);
    assert_eq!(node.height(), 3);
    assert_eq!(node.tip_hash(), blocks[2].hash());

    let connected: Vec<_> = events
        .try_iter()
        .filter_map(|event| match event {
            ChainEvent::BlockConnected { hash, .. } => Some(hash),
            _ => None,
        })
        .collect();
    let expected: Vec<_> = blocks.iter().map(|block| block.hash()).collect();
    assert_eq!(connected, expected);
}

#[test]
fn reorganizes_to_the_chain_with_more_work() {
    let mut node = Node::new();
    let base = node.mine(Vec::new());

    let a1 = node.build_block(base.hash(), Vec::new(), 1);
    node.submit(&a1);
    let a2 = node.build_block(a1.hash(), Vec::new(), 1);
    node.submit(&a2);
    assert_eq!(node.tip_hash(), a2.hash());

    let b1 = node.build_block(base.hash(), Vec::new(), 2);
    let trace = node.submit(&b1);
    assert!(trace.is_empty(), "equal work must not move the tip");
    let b2 = node.build_block(b1.hash(), Vec::new(), 2);
    let trace = node.submit(&b2);
    assert!(trace.is_empty(), "the first block seen wins ties");
    assert_eq!(node.tip_hash(), a2.hash());

    let b3 = node.build_block(b2.hash(), Vec::new(), 2);
    let trace = node.submit(&b3);
    assert_eq!(node.tip_hash(), b3.hash());
    assert_eq!(node.height(), 4);

    let disconnected: Vec<_> = trace.disconnected.iter().map(|block| block.hash()).collect();
    assert_eq!(disconnected, vec![a2.hash(), a1.hash()]);
    let connected: Vec<_> = trace
        .connected
        .iter()
        .map(|(block, height)| (block.hash(), *height))
        .collect();
    assert_eq!(
        connected,
        vec![(b1.hash(), 2), (b2.hash(), 3), (b3.hash(), 4)]
    );
    let update = trace.tip_updates.last().expect("tip update");
    assert_eq!(node.chain.index().node(update.fork.expect("fork")).hash, base.hash());
    assert!(node.chain.check_block_index().is_empty());
}

#[test]
fn equal_height_fork_with_more_work_replaces_the_chain() {
    let mut params = regtest_params();
    // A limit above the genesis target lets late blocks drop to a cheaper
    // target while punctual ones keep the genesis difficulty.
    params.consensus.pow_limit = [0xff; 32];
    let easy = target_to_compact(&params.consensus.pow_limit);
    let mut node = Node::with_params(params);
    let genesis = node.chain.tip_node().expect("genesis").header();
    let genesis_hash = node.tip_hash();
    assert_ne!(genesis.bits, easy);
    assert!(block_proof(genesis.bits) > block_proof(easy));

    let mut original = Vec::new();
    let (mut parent, mut time) = (genesis_hash, genesis.time);
    for _ in 0..10 {
        time += 1_201;
        let block = node.build_block_at(parent, Vec::new(), 0, time, easy);
        node.submit(&block);
        parent = block.hash();
        original.push(block);
    }
    assert_eq!(node.height(), 10);
    assert_eq!(node.tip_hash(), parent);

    // Only the first fork block is punctual, so only it pays the higher
    // difficulty.
    let mut fork = Vec::new();
    let (mut parent, mut time) = (genesis_hash, genesis.time + 600);
    let mut bits = genesis.bits;
    for height in 1..=10 {
        let block = node.build_block_at(parent, Vec::new(), 1, time, bits);
        let trace = node.submit(&block);
        if height < 10 {
            assert!(trace.is_empty(), "fork at height {height} is not ahead yet");
        } else {
            let disconnected: Vec<_> = trace.disconnected.iter().map(|block| block.hash()).collect();
            let expected: Vec<_> = original.iter().rev().map(|block| block.hash()).collect();
            assert_eq!(disconnected, expected);
            assert_eq!(trace.connected.len(), 10);
        }
        parent = block.hash();
        fork.push(block);
        time += 1_201;
        bits = easy;
    }

    assert_eq!(node.height(), 10);
    assert_eq!(node.tip_hash(), fork[9].hash());
    for (height, block) in fork.iter().enumerate() {
        let active = node.chain.chain().at(height as i32 + 1).expect("active");
        assert_eq!(node.chain.index().node(active).hash, block.hash());
    }
    assert!(node.chain.check_block_index().is_empty());
}

#[test]
fn activation_advances_in_bounded_rounds() {
    let mut node = Node::new();
    let genesis = node.tip_hash();
    let mut blocks = Vec::new();
    let mut parent = genesis;
    for _ in 0..3 {
        let block = node.build_block(parent, Vec::new(), 0);
        node.chain
            .accept_new_block(&block, None, true, None)
            .expect("accept");
        parent = block.hash();
        blocks.push(block);
    }
    assert_eq!(node.tip_hash(), genesis);

    let mut trace = ConnectTrace::default();
    assert!(node
        .chain
        .activate_best_chain_round(None, &mut trace)
        .expect("round"));
    assert_eq!(trace.connected.len(), 1);
    assert_eq!(node.tip_hash(), blocks[0].hash());

    // A shutdown request stops activation between rounds.
    node.chain.shutdown_flag().store(true, Ordering::SeqCst);
    assert!(!node
        .chain
        .activate_best_chain_round(None, &mut trace)
        .expect("round"));
    assert_eq!(node.tip_hash(), blocks[0].hash());
    node.chain.shutdown_flag().store(false, Ordering::SeqCst);

    let mut rounds = 1;
    while node
        .chain
        .activate_best_chain_round(None, &mut trace)
        .expect("round")
    {
        rounds += 1;
    }
    node.chain.finish_activation().expect("finish");
    assert_eq!(rounds, 2);
    assert_eq!(trace.connected.len(), 3);
    assert_eq!(node.tip_hash(), blocks[2].hash());
    assert!(node.chain.check_block_index().is_empty());
}

#[test]
fn out_of_order_blocks_wait_for_their_parent() {
    let mut node = Node::new();
    let b1 = node.build_block(node.tip_hash(), Vec::new(), 0);
    // Header only, so the child can be built on it.
    node.chain.accept_block_header(&b1.header).expect("header");
    let b2 = node.build_block(b1.hash(), Vec::new(), 0);

    node.chain.accept_block_header(&b2.header).expect("header");
    let trace = node.submit(&b2);
    assert!(trace.is_empty());
    assert_eq!(node.chain.unlinked_count(), 1);

    let trace = node.submit(&b1);
    assert_eq!(trace.connected.len(), 2);
    assert_eq!(node.tip_hash(), b2.hash());
    assert_eq!(node.chain.unlinked_count(), 0);
}

#[test]
fn invalidate_and_reconsider_move_the_tip() {
    let mut node = Node::new();
    let blocks = node.mine_many(3);

    let trace = node.chain.invalidate_block(&blocks[1].hash()).expect("invalidate");
    assert_eq!(trace.disconnected.len(), 2);
    assert_eq!(node.tip_hash(), blocks[0].hash());
    let invalid = node.chain.index().get(&blocks[1].hash()).expect("indexed");
    assert!(invalid.is_failed());
    assert!(node.chain.index().get(&blocks[2].hash()).expect("indexed").is_failed());
    assert!(node.chain.check_block_index().is_empty());

    let trace = node.chain.reconsider_block(&blocks[1].hash()).expect("reconsider");
    assert_eq!(trace.connected.len(), 2);
    assert_eq!(node.tip_hash(), blocks[2].hash());
    assert!(!node.chain.index().get(&blocks[2].hash()).expect("indexed").is_failed());
    assert!(node.chain.check_block_index().is_empty());
}

#[test]
fn reloads_the_tip_from_the_store() {
    let mut node = Node::new();
    let blocks = node.mine_many(4);
    node.restart();
    assert_eq!(node.height(), 4);
    assert_eq!(node.tip_hash(), blocks[3].hash());
    assert!(node.chain.check_block_index().is_empty());

    let next = node.mine(Vec::new());
    assert_eq!(node.height(), 5);
    assert_eq!(node.chain.read_block(node.chain.tip().expect("tip")).expect("read"), next);
    node.chain.verify_db(5, 4).expect("verify");
}

#[test]
fn unknown_parent_is_rejected() {
    let mut node = Node::new();
    let mut orphan = node.build_block(node.tip_hash(), Vec::new(), 0);
    orphan.header.prev_block = [9u8; 32];
    node.solve(&mut orphan.header);
    let err = node
        .chain
        .accept_block_header(&orphan.header)
        .expect_err("orphan header");
    let state = err.validation_state().expect("validation failure");
    assert_eq!(state.reject_reason(), "bad-prevblk");
    assert_eq!(state.dos_score(), 10);
}
