#![allow(dead_code)]

use std::sync::Arc;

use coind::accept::{AcceptOutcome, MempoolPolicy};
use coind::context::{NodeContext, PeerAction};
use coind::sync::{PeerInfo, SyncConfig};
use coind::wire::{NetMessage, VersionMessage, NODE_NETWORK};
use coind_chainstate::clock::Clock;
use coind_chainstate::state::{ChainConfig, ChainState};
use coind_chainstate::validation::ValidationResult;
use coind_chainstate::PeerId;
use coind_consensus::constants::PROTOCOL_VERSION;
use coind_consensus::money::Amount;
use coind_consensus::params::{chain_params, ChainParams, Network};
use coind_consensus::{block_subsidy, Hash256};
use coind_pow::validation::check_proof_of_work;
use coind_primitives::block::{Block, BlockHeader};
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::{Transaction, TxIn, TxOut};
use coind_script::script::push_int;
use coind_script::Interpreter;
use coind_storage::memory::MemoryStore;

pub const OP_TRUE: u8 = 0x51;
pub const FEE: Amount = 10_000;

pub struct TestNode {
    pub context: NodeContext<MemoryStore>,
    pub clock: Arc<Clock>,
    pub params: ChainParams,
    pub dir: tempfile::TempDir,
}

pub fn test_policy() -> MempoolPolicy {
    MempoolPolicy {
        require_standard: false,
        ..MempoolPolicy::default()
    }
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_sync(SyncConfig::default())
    }

    pub fn with_sync(sync: SyncConfig) -> Self {
        let params = chain_params(Network::Regtest);
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(Clock::new());
        clock.set_mock_time(i64::from(params.genesis.time) + 60);
        let mut chain = ChainState::open(
            params.clone(),
            ChainConfig {
                check_block_index: true,
                ..ChainConfig::default()
            },
            Arc::new(MemoryStore::new()),
            dir.path().join("blocks"),
            Arc::new(Interpreter::new()),
        )
        .expect("open chainstate")
        .with_clock(Arc::clone(&clock));
        chain.load_block_index().expect("load index");
        chain.init_genesis().expect("genesis");
        let context = NodeContext::new(chain, test_policy(), sync);
        context.lock().expect("lock").mempool.set_check_ratio(1.0);
        Self {
            context,
            clock,
            params,
            dir,
        }
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.context
            .lock()
            .expect("lock")
            .chain
            .tip_node()
            .expect("tip")
            .hash
    }

    pub fn height(&self) -> i32 {
        self.context.lock().expect("lock").chain.chain().height()
    }

    pub fn in_mempool(&self, txid: &Hash256) -> bool {
        self.context.lock().expect("lock").mempool.exists(txid)
    }

    pub fn mempool_size(&self) -> usize {
        self.context.lock().expect("lock").mempool.size()
    }

    /// A solved block on `parent` holding a coinbase and `txs`. `tag`
    /// separates sibling blocks.
    pub fn build_block(&self, parent: Hash256, txs: Vec<Transaction>, tag: u8) -> Block {
        let core = self.context.lock().expect("lock");
        let parent = core.chain.index().get(&parent).expect("parent");
        let height = parent.height + 1;
        let mut transactions = vec![coinbase(
            height,
            tag,
            block_subsidy(height, &self.params.consensus),
        )];
        transactions.extend(txs);
        let mut block = Block {
            header: BlockHeader {
                version: 4,
                prev_block: parent.hash,
                merkle_root: [0u8; 32],
                time: parent.time + 600 + u32::from(tag),
                bits: parent.bits,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = block.merkle_root();
        while check_proof_of_work(&block.header.hash(), block.header.bits, &self.params.consensus)
            .is_err()
        {
            block.header.nonce += 1;
        }
        block
    }

    /// Moves the clock to just after `block` so the node counts as synced.
    pub fn advance_clock_to(&self, block: &Block) {
        let now = i64::from(block.header.time) + 1;
        if now > self.clock.now() {
            self.clock.set_mock_time(now);
        }
    }

    pub fn submit(&self, block: &Block) {
        self.advance_clock_to(block);
        self.context
            .process_block(block, None)
            .expect("process block")
            .expect("valid block");
    }

    pub fn mine(&self, txs: Vec<Transaction>) -> Block {
        let block = self.build_block(self.tip_hash(), txs, 0);
        self.submit(&block);
        assert_eq!(self.tip_hash(), block.hash());
        block
    }

    pub fn mine_many(&self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.mine(Vec::new())).collect()
    }

    /// Mines past coinbase maturity and returns the first block's coinbase.
    pub fn mature_coinbase(&self) -> Transaction {
        self.mature_coinbases(1).remove(0)
    }

    /// Mines until the coinbases of the first `count` new blocks are
    /// spendable in the mempool and returns them.
    pub fn mature_coinbases(&self, count: usize) -> Vec<Transaction> {
        let blocks = self.mine_many(100 + count);
        blocks[..count]
            .iter()
            .map(|block| block.transactions[0].clone())
            .collect()
    }

    pub fn submit_tx(&self, tx: &Transaction) -> ValidationResult<AcceptOutcome> {
        self.context.submit_transaction(tx).expect("submit")
    }

    /// Registers an inbound peer and completes the version handshake.
    pub fn connect_peer(&self, id: PeerId) -> Vec<PeerAction> {
        self.context
            .initialize_node(id, inbound_peer(id))
            .expect("initialize");
        let mut actions = self
            .context
            .process_message(id, NetMessage::Version(peer_version(id as u64 + 1000, 0)), 0)
            .expect("version");
        actions.extend(
            self.context
                .process_message(id, NetMessage::Verack, 0)
                .expect("verack"),
        );
        actions
    }

    pub fn misbehavior(&self, id: PeerId) -> i32 {
        self.context
            .lock()
            .expect("lock")
            .sync
            .peer(id)
            .expect("peer")
            .misbehavior
    }
}

pub fn inbound_peer(id: PeerId) -> PeerInfo {
    PeerInfo {
        address: format!("10.0.0.{id}:18444"),
        inbound: true,
        whitelisted: false,
        one_shot: false,
    }
}

pub fn peer_version(nonce: u64, start_height: i32) -> VersionMessage {
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: NODE_NETWORK,
        timestamp: 0,
        nonce,
        user_agent: "/test:0.1/".to_string(),
        start_height,
        relay: true,
    }
}

pub fn sent(actions: &[PeerAction]) -> Vec<&NetMessage> {
    actions
        .iter()
        .filter_map(|action| match action {
            PeerAction::Send(message) => Some(message),
            PeerAction::Disconnect => None,
        })
        .collect()
}

pub fn disconnects(actions: &[PeerAction]) -> bool {
    actions.contains(&PeerAction::Disconnect)
}

pub fn coinbase(height: i32, tag: u8, value: Amount) -> Transaction {
    let mut script_sig = Vec::new();
    push_int(&mut script_sig, height as i64);
    script_sig.extend_from_slice(&[0x01, tag]);
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig)],
        vout: vec![TxOut::new(value, vec![OP_TRUE])],
        lock_time: 0,
    }
}

/// Spends `inputs` into `outputs` equal anyone-can-spend outputs, paying
/// `fee`. Every input is final.
pub fn spend_outputs(inputs: &[(&Transaction, u32)], outputs: usize, fee: Amount) -> Transaction {
    let total: Amount = inputs
        .iter()
        .map(|(prev, index)| prev.vout[*index as usize].value)
        .sum::<Amount>()
        - fee;
    let share = total / outputs as Amount;
    let mut vout: Vec<TxOut> = (0..outputs).map(|_| TxOut::new(share, vec![OP_TRUE])).collect();
    vout[0].value += total - share * outputs as Amount;
    Transaction {
        version: 1,
        vin: inputs
            .iter()
            .map(|(prev, index)| TxIn::new(OutPoint::new(prev.txid(), *index), Vec::new()))
            .collect(),
        vout,
        lock_time: 0,
    }
}

/// Spends output `index` of `prev` to a single anyone-can-spend output,
/// paying [`FEE`].
pub fn spend(prev: &Transaction, index: u32) -> Transaction {
    let value = prev.vout[index as usize].value - FEE;
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::new(prev.txid(), index), Vec::new())],
        vout: vec![TxOut::new(value, vec![OP_TRUE])],
        lock_time: 0,
    }
}
