mod common;

use coind::context::PeerAction;
use coind::sync::{
    SyncConfig, BLOCK_DOWNLOAD_TIMEOUT_BASE, BLOCK_STALLING_TIMEOUT, PING_INTERVAL,
};
use coind::wire::{Inv, NetMessage};
use coind_chainstate::validation::{REJECT_DUPLICATE, REJECT_OBSOLETE};
use coind_consensus::constants::PROTOCOL_VERSION;
use common::{disconnects, inbound_peer, peer_version, sent, TestNode};

const ZERO_HASH: [u8; 32] = [0u8; 32];

#[test]
fn inbound_handshake_answers_version_and_asks_for_headers() {
    let node = TestNode::new();
    let actions = node.context.initialize_node(1, inbound_peer(1)).expect("init");
    assert!(actions.is_empty());

    let actions = node
        .context
        .process_message(1, NetMessage::Version(peer_version(7, 0)), 0)
        .expect("version");
    let messages = sent(&actions);
    assert_eq!(messages.len(), 2);
    match messages[0] {
        NetMessage::Version(ours) => {
            assert_eq!(ours.version, PROTOCOL_VERSION);
            assert_eq!(ours.start_height, 0);
            assert!(ours.user_agent.starts_with("/coind:"));
        }
        other => panic!("expected version, got {other:?}"),
    }
    assert_eq!(messages[1], &NetMessage::Verack);

    let actions = node
        .context
        .process_message(1, NetMessage::Verack, 0)
        .expect("verack");
    assert_eq!(actions, vec![PeerAction::Send(NetMessage::SendHeaders)]);
}

#[test]
fn outbound_connection_opens_with_version() {
    let node = TestNode::new();
    let mut info = inbound_peer(1);
    info.inbound = false;
    let actions = node.context.initialize_node(1, info).expect("init");
    assert!(matches!(
        actions.as_slice(),
        [PeerAction::Send(NetMessage::Version(_))]
    ));
}

#[test]
fn messages_before_version_are_penalised() {
    let node = TestNode::new();
    node.context.initialize_node(1, inbound_peer(1)).expect("init");
    let actions = node
        .context
        .process_message(1, NetMessage::Ping(5), 0)
        .expect("ping");
    assert!(actions.is_empty());
    assert_eq!(node.misbehavior(1), 1);
}

#[test]
fn duplicate_version_is_rejected() {
    let node = TestNode::new();
    node.connect_peer(1);
    let actions = node
        .context
        .process_message(1, NetMessage::Version(peer_version(9, 0)), 0)
        .expect("version");
    match sent(&actions).as_slice() {
        [NetMessage::Reject { message, code, .. }] => {
            assert_eq!(message, "version");
            assert_eq!(u16::from(*code), REJECT_DUPLICATE);
        }
        other => panic!("expected reject, got {other:?}"),
    }
    assert_eq!(node.misbehavior(1), 1);
}

#[test]
fn obsolete_peers_and_self_connections_are_dropped() {
    let node = TestNode::new();
    node.context.initialize_node(1, inbound_peer(1)).expect("init");
    let mut old = peer_version(3, 0);
    old.version = 100;
    let actions = node
        .context
        .process_message(1, NetMessage::Version(old), 0)
        .expect("version");
    assert!(disconnects(&actions));
    assert!(sent(&actions).iter().any(|message| matches!(
        message,
        NetMessage::Reject { code, .. } if u16::from(*code) == REJECT_OBSOLETE
    )));

    node.context.initialize_node(2, inbound_peer(2)).expect("init");
    let local_nonce = node.context.lock().expect("lock").local_nonce();
    let actions = node
        .context
        .process_message(2, NetMessage::Version(peer_version(local_nonce, 0)), 0)
        .expect("version");
    assert_eq!(actions, vec![PeerAction::Disconnect]);
}

#[test]
fn ping_is_answered_and_pong_records_latency() {
    let node = TestNode::new();
    node.connect_peer(1);
    let actions = node
        .context
        .process_message(1, NetMessage::Ping(42), 0)
        .expect("ping");
    assert_eq!(actions, vec![PeerAction::Send(NetMessage::Pong(42))]);

    let now = PING_INTERVAL + 1;
    let actions = node.context.send_messages(1, now).expect("send");
    let nonce = sent(&actions)
        .into_iter()
        .find_map(|message| match message {
            NetMessage::Ping(nonce) => Some(*nonce),
            _ => None,
        })
        .expect("ping sent");
    assert_ne!(nonce, 0);

    node.context
        .process_message(1, NetMessage::Pong(nonce), now + 5_000)
        .expect("pong");
    let core = node.context.lock().expect("lock");
    let state = core.sync.peer(1).expect("peer");
    assert_eq!(state.ping_nonce_sent, 0);
    assert_eq!(state.ping_time, Some(5_000));
}

#[test]
fn getheaders_returns_the_active_chain_after_the_fork() {
    let node = TestNode::new();
    let genesis = node.tip_hash();
    let blocks = node.mine_many(5);
    node.connect_peer(1);

    let actions = node
        .context
        .process_message(
            1,
            NetMessage::GetHeaders {
                locator: vec![genesis],
                stop: ZERO_HASH,
            },
            0,
        )
        .expect("getheaders");
    match sent(&actions).as_slice() {
        [NetMessage::Headers(headers)] => {
            assert_eq!(headers.len(), 5);
            assert_eq!(headers[0].prev_block, genesis);
            assert_eq!(headers[4].hash(), blocks[4].hash());
        }
        other => panic!("expected headers, got {other:?}"),
    }

    let actions = node
        .context
        .process_message(
            1,
            NetMessage::GetHeaders {
                locator: vec![blocks[2].hash()],
                stop: blocks[3].hash(),
            },
            0,
        )
        .expect("getheaders");
    match sent(&actions).as_slice() {
        [NetMessage::Headers(headers)] => {
            assert_eq!(headers.len(), 1);
            assert_eq!(headers[0].hash(), blocks[3].hash());
        }
        other => panic!("expected headers, got {other:?}"),
    }
}

#[test]
fn getdata_serves_blocks_and_reports_missing_transactions() {
    let node = TestNode::new();
    let blocks = node.mine_many(2);
    node.connect_peer(1);

    let missing = Inv::tx([7u8; 32]);
    let actions = node
        .context
        .process_message(
            1,
            NetMessage::GetData(vec![missing, Inv::block(blocks[1].hash())]),
            0,
        )
        .expect("getdata");
    let messages = sent(&actions);
    assert!(messages.contains(&&NetMessage::Block(blocks[1].clone())));
    assert!(messages.contains(&&NetMessage::NotFound(vec![missing])));
}

#[test]
fn new_tip_is_announced_by_inv() {
    let node = TestNode::new();
    node.mine_many(1);
    node.connect_peer(1);
    let block = node.mine(Vec::new());

    let actions = node.context.send_messages(1, 1).expect("send");
    let announced = sent(&actions).into_iter().any(|message| match message {
        NetMessage::Inv(items) => items.contains(&Inv::block(block.hash())),
        _ => false,
    });
    assert!(announced, "{actions:?}");
}

#[test]
fn new_tip_is_announced_by_headers_when_preferred() {
    let node = TestNode::new();
    let genesis = node.tip_hash();
    node.mine_many(1);
    node.connect_peer(1);
    node.context
        .process_message(1, NetMessage::SendHeaders, 0)
        .expect("sendheaders");
    // The peer syncs our headers first so the announcement connects.
    node.context
        .process_message(
            1,
            NetMessage::GetHeaders {
                locator: vec![genesis],
                stop: ZERO_HASH,
            },
            0,
        )
        .expect("getheaders");
    let block = node.mine(Vec::new());

    let actions = node.context.send_messages(1, 1).expect("send");
    let announced = sent(&actions).into_iter().any(|message| match message {
        NetMessage::Headers(headers) => headers.iter().any(|header| header.hash() == block.hash()),
        _ => false,
    });
    assert!(announced, "{actions:?}");
}

#[test]
fn block_inv_triggers_getheaders_and_fetch() {
    let source = TestNode::new();
    let blocks = source.mine_many(1);

    let node = TestNode::new();
    node.connect_peer(1);
    let actions = node
        .context
        .process_message(1, NetMessage::Inv(vec![Inv::block(blocks[0].hash())]), 0)
        .expect("inv");
    let messages = sent(&actions);
    assert!(messages.iter().any(|message| matches!(
        message,
        NetMessage::GetHeaders { stop, .. } if *stop == blocks[0].hash()
    )));
    assert!(messages.contains(&&NetMessage::GetData(vec![Inv::block(blocks[0].hash())])));

    node.advance_clock_to(&blocks[0]);
    node.context
        .process_message(1, NetMessage::Block(blocks[0].clone()), 0)
        .expect("block");
    assert_eq!(node.tip_hash(), blocks[0].hash());
    assert_eq!(node.context.lock().expect("lock").sync.blocks_in_flight(), 0);
}

#[test]
fn headers_are_fetched_directly() {
    let source = TestNode::new();
    let blocks = source.mine_many(3);

    let node = TestNode::new();
    node.connect_peer(1);
    let headers = blocks.iter().map(|block| block.header.clone()).collect();
    let actions = node
        .context
        .process_message(1, NetMessage::Headers(headers), 0)
        .expect("headers");
    let expected: Vec<Inv> = blocks.iter().map(|block| Inv::block(block.hash())).collect();
    assert!(sent(&actions).contains(&&NetMessage::GetData(expected)));

    for block in &blocks {
        node.advance_clock_to(block);
        node.context
            .process_message(1, NetMessage::Block(block.clone()), 0)
            .expect("block");
    }
    assert_eq!(node.height(), 3);
}

#[test]
fn repeated_oversized_headers_get_the_peer_disconnected() {
    let node = TestNode::with_sync(SyncConfig::default());
    let genesis_header = {
        let core = node.context.lock().expect("lock");
        core.chain.tip_node().expect("tip").header()
    };
    node.connect_peer(1);
    for _ in 0..5 {
        let flood = vec![genesis_header.clone(); 2001];
        node.context
            .process_message(1, NetMessage::Headers(flood), 0)
            .expect("headers");
    }
    assert_eq!(node.misbehavior(1), 100);
    let actions = node.context.send_messages(1, 1).expect("send");
    assert!(disconnects(&actions));
}

#[test]
fn whitelisted_peers_are_not_punished() {
    let node = TestNode::with_sync(SyncConfig {
        ban_score: 20,
        ..SyncConfig::default()
    });
    let mut info = inbound_peer(1);
    info.whitelisted = true;
    node.context.initialize_node(1, info).expect("init");
    node.context
        .process_message(1, NetMessage::Version(peer_version(11, 0)), 0)
        .expect("version");
    let flood = vec![Inv::tx([1u8; 32]); 50_001];
    node.context
        .process_message(1, NetMessage::Inv(flood), 0)
        .expect("inv");
    let actions = node.context.send_messages(1, 1).expect("send");
    assert!(!disconnects(&actions));
}

#[test]
fn stalling_peer_is_dropped_after_the_timeout() {
    let node = TestNode::new();
    node.connect_peer(1);
    node.context
        .lock()
        .expect("lock")
        .sync
        .peer_mut(1)
        .expect("peer")
        .stalling_since = 1_000;

    let actions = node
        .context
        .send_messages(1, 1_000 + BLOCK_STALLING_TIMEOUT)
        .expect("send");
    assert!(!disconnects(&actions));
    let actions = node
        .context
        .send_messages(1, 1_000 + BLOCK_STALLING_TIMEOUT + 1)
        .expect("send");
    assert!(disconnects(&actions));
}

#[test]
fn slow_block_download_times_out() {
    let source = TestNode::new();
    let blocks = source.mine_many(2);

    let node = TestNode::new();
    node.connect_peer(1);
    let headers = blocks.iter().map(|block| block.header.clone()).collect();
    node.context
        .process_message(1, NetMessage::Headers(headers), 0)
        .expect("headers");
    assert_eq!(node.context.lock().expect("lock").sync.blocks_in_flight(), 2);

    // Only peer downloading, so no allowance for other peers.
    let deadline = node.params.consensus.pow_target_spacing * BLOCK_DOWNLOAD_TIMEOUT_BASE;
    let actions = node.context.send_messages(1, deadline).expect("send");
    assert!(!disconnects(&actions));
    let actions = node.context.send_messages(1, deadline + 1).expect("send");
    assert!(disconnects(&actions));
}
