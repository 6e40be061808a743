#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use coind_chainstate::clock::Clock;
use coind_chainstate::state::{ChainConfig, ChainState, ConnectTrace};
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

pub struct Node {
    pub chain: ChainState<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<Clock>,
    pub params: ChainParams,
    pub dir: tempfile::TempDir,
}

pub fn regtest_params() -> ChainParams {
    chain_params(Network::Regtest)
}

fn open_chain(
    params: &ChainParams,
    store: &Arc<MemoryStore>,
    dir: &Path,
    clock: &Arc<Clock>,
) -> ChainState<MemoryStore> {
    let mut chain = ChainState::open(
        params.clone(),
        ChainConfig {
            check_block_index: true,
            ..ChainConfig::default()
        },
        Arc::clone(store),
        dir,
        Arc::new(Interpreter::new()),
    )
    .expect("open chainstate")
    .with_clock(Arc::clone(clock));
    chain.load_block_index().expect("load index");
    chain.init_genesis().expect("genesis");
    chain
}

impl Node {
    pub fn new() -> Self {
        Self::with_params(regtest_params())
    }

    pub fn with_params(params: ChainParams) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(Clock::new());
        clock.set_mock_time(params.genesis.time as i64 + 200_000);
        let chain = open_chain(&params, &store, dir.path(), &clock);
        Self {
            chain,
            store,
            clock,
            params,
            dir,
        }
    }

    /// Drops the chain state and opens it again over the same store and
    /// block files.
    pub fn restart(&mut self) {
        self.chain
            .flush_state(coind_chainstate::state::FlushMode::Always)
            .expect("flush");
        self.chain = open_chain(&self.params, &self.store, self.dir.path(), &self.clock);
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.chain.tip_node().expect("tip").hash
    }

    pub fn height(&self) -> i32 {
        self.chain.chain().height()
    }

    /// A solved block on `parent` holding a coinbase and `txs`. `tag`
    /// separates sibling blocks.
    pub fn build_block(&self, parent: Hash256, txs: Vec<Transaction>, tag: u8) -> Block {
        let node = self.chain.index().get(&parent).expect("parent");
        let (time, bits) = (node.time + 600 + u32::from(tag), node.bits);
        self.build_block_at(parent, txs, tag, time, bits)
    }

    /// Like [`Node::build_block`] with an explicit timestamp and target.
    pub fn build_block_at(
        &self,
        parent: Hash256,
        txs: Vec<Transaction>,
        tag: u8,
        time: u32,
        bits: u32,
    ) -> Block {
        let parent = self.chain.index().get(&parent).expect("parent");
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
                time,
                bits,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = block.merkle_root();
        self.solve(&mut block.header);
        block
    }

    /// Grinds the nonce until the header meets its own target.
    pub fn solve(&self, header: &mut BlockHeader) {
        header.nonce = 0;
        while check_proof_of_work(&header.hash(), header.bits, &self.params.consensus).is_err() {
            header.nonce += 1;
        }
    }

    pub fn submit(&mut self, block: &Block) -> ConnectTrace {
        self.chain
            .process_new_block(block, None, true, None)
            .expect("process block")
    }

    /// Mines one block on the tip and returns it.
    pub fn mine(&mut self, txs: Vec<Transaction>) -> Block {
        let block = self.build_block(self.tip_hash(), txs, 0);
        self.submit(&block);
        assert_eq!(self.tip_hash(), block.hash());
        block
    }

    pub fn mine_many(&mut self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.mine(Vec::new())).collect()
    }
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

/// Spends output `index` of `prev` to a single anyone-can-spend output.
pub fn spend(prev: &Transaction, index: u32, value: Amount) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::new(prev.txid(), index), Vec::new())],
        vout: vec![TxOut::new(value, vec![OP_TRUE])],
        lock_time: 0,
    }
}
