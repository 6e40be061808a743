//! The block tree, the active chain and the UTXO tip, and every operation
//! that moves between them.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coind_consensus::constants::{
    LOCKTIME_MEDIAN_TIME_PAST, LOCKTIME_VERIFY_SEQUENCE, MAX_BLOCK_SIGOPS,
    VERSIONBITS_LAST_OLD_BLOCK_VERSION,
};
use coind_consensus::money::Amount;
use coind_consensus::params::ConsensusParams;
use coind_consensus::{block_subsidy, hash256_to_hex, ChainParams, DeploymentPos, Hash256};
use coind_log::{log_cat, log_debug, log_error, log_info, log_warn, Category};
use coind_pow::difficulty::block_proof;
use coind_primitives::block::{genesis_block, Block, BlockHeader};
use coind_primitives::encoding::DecodeError;
use coind_primitives::transaction::Transaction;
use coind_script::interpreter::{
    SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, SCRIPT_VERIFY_DERSIG,
    SCRIPT_VERIFY_P2SH,
};
use coind_script::ScriptVerifier;
use coind_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

use crate::blockindex::{
    BlockIndex, BlockIndexNode, NodeId, BLOCK_FAILED_CHILD, BLOCK_FAILED_MASK,
    BLOCK_FAILED_VALID, BLOCK_HAVE_DATA, BLOCK_HAVE_UNDO, BLOCK_VALID_CHAIN, BLOCK_VALID_MASK,
    BLOCK_VALID_SCRIPTS, BLOCK_VALID_TRANSACTIONS, BLOCK_VALID_TREE,
};
use crate::blockstore::{BlockStore, UNDO_RECORD_OVERHEAD};
use crate::chain::ActiveChain;
use crate::clock::Clock;
use crate::coins::{Coins, CoinsView, CoinsViewCache, CoinsViewDb, MEMPOOL_HEIGHT};
use crate::events::{ChainEvent, EventBus, DEFAULT_EVENT_QUEUE};
use crate::flatfiles::{FileLocation, FlatFileError, RECORD_HEADER_SIZE};
use crate::index::BlockTreeDb;
use crate::undo::{apply_tx_in_undo, BlockUndo, TxUndo};
use crate::validation::{
    base_script_flags, calculate_sequence_locks, check_block, check_block_header, check_inputs,
    contextual_check_block, contextual_check_block_header, evaluate_sequence_locks, is_final_tx,
    legacy_sigop_count, p2sh_sigop_count, run_script_checks, sequence_locks, LockPoints,
    ScriptCheck, ValidationMetrics, ValidationState, REJECT_INVALID,
};
use crate::versionbits::{ThresholdState, VersionBitsCache};

/// Connection-level identifier of the peer that delivered a block.
pub type PeerId = i64;

/// Blocks within this distance of the tip are always kept and always
/// accepted, even unrequested.
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;
/// Blocks connected per step before candidates are re-evaluated.
const BLOCK_CONNECT_BATCH: i32 = 32;
/// Seconds between index writes.
const DATABASE_WRITE_INTERVAL: i64 = 60 * 60;
/// Seconds between full coin cache flushes.
const DATABASE_FLUSH_INTERVAL: i64 = 24 * 60 * 60;
pub const DEFAULT_COINS_CACHE_BYTES: usize = 100 << 20;
/// Blocks within this distance of our tip count as a live fork.
const FORK_WARNING_DEPTH: i32 = 72;
const SIGCHECK_VERIFICATION_FACTOR: f64 = 5.0;

#[derive(Debug)]
pub enum ChainStateError {
    /// A consensus rule was broken.
    Invalid(ValidationState),
    Store(StoreError),
    FlatFile(FlatFileError),
    Decode(DecodeError),
    /// Local state disagrees with itself.
    Corrupt(String),
}

impl ChainStateError {
    pub fn validation_state(&self) -> Option<&ValidationState> {
        match self {
            ChainStateError::Invalid(state) => Some(state),
            _ => None,
        }
    }

    /// Rule violations, as opposed to local failures.
    pub fn is_invalid(&self) -> bool {
        matches!(self, ChainStateError::Invalid(state) if state.is_invalid())
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Invalid(state) => write!(f, "{state}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ValidationState> for ChainStateError {
    fn from(state: ValidationState) -> Self {
        ChainStateError::Invalid(state)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub checkpoints_enabled: bool,
    /// Run the full block index consistency check after every change.
    pub check_block_index: bool,
    pub coins_cache_bytes: usize,
    /// Drop the index and coins and rebuild them from the block files.
    pub reindex: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            checkpoints_enabled: true,
            check_block_index: false,
            coins_cache_bytes: DEFAULT_COINS_CACHE_BYTES,
            reindex: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushMode {
    /// Flush only when the coin cache exceeds its limit.
    IfNeeded,
    /// Also write on the periodic schedule.
    Periodic,
    Always,
}

/// A block from `peer` that failed to connect.
#[derive(Clone, Debug)]
pub struct BlockRejection {
    pub peer: PeerId,
    pub hash: Hash256,
    pub state: ValidationState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TipUpdate {
    /// Last block shared with the previous tip.
    pub fork: Option<NodeId>,
    pub tip: NodeId,
    pub initial_download: bool,
}

/// What an activation did to the active chain, in order.
#[derive(Debug, Default)]
pub struct ConnectTrace {
    /// Blocks taken off the chain, most recent first.
    pub disconnected: Vec<Block>,
    /// Blocks put on the chain with their heights, lowest first.
    pub connected: Vec<(Block, i32)>,
    pub tip_updates: Vec<TipUpdate>,
}

impl ConnectTrace {
    pub fn is_empty(&self) -> bool {
        self.disconnected.is_empty() && self.connected.is_empty()
    }

    pub fn append(&mut self, mut other: ConnectTrace) {
        self.disconnected.append(&mut other.disconnected);
        self.connected.append(&mut other.connected);
        self.tip_updates.append(&mut other.tip_updates);
    }
}

/// Ordering of candidate tips: most work first, then the block whose data
/// arrived first, then the older index entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct CandidateKey {
    work: U256,
    sequence: Reverse<u32>,
    id: Reverse<NodeId>,
}

fn candidate_key(index: &BlockIndex, id: NodeId) -> CandidateKey {
    let node = index.node(id);
    CandidateKey {
        work: node.chain_work,
        sequence: Reverse(node.sequence_id),
        id: Reverse(id),
    }
}

#[derive(Debug, Default)]
struct ForkWarnings {
    best_fork_tip: Option<NodeId>,
    best_fork_base: Option<NodeId>,
    large_work_fork_found: bool,
    large_work_invalid_chain_found: bool,
}

/// Read-only view of the active chain for policy checks that run next to a
/// mutable borrow of the coin tip.
pub struct ChainView<'a> {
    pub params: &'a ChainParams,
    pub index: &'a BlockIndex,
    pub chain: &'a ActiveChain,
    clock: &'a Clock,
}

impl ChainView<'_> {
    pub fn tip(&self) -> Option<NodeId> {
        self.chain.tip()
    }

    pub fn height(&self) -> i32 {
        self.chain.height()
    }

    pub fn adjusted_time(&self) -> i64 {
        self.clock.adjusted_time()
    }

    /// Whether `tx` could be included in the next block.
    pub fn check_final_tx(&self, tx: &Transaction, flags: u32) -> bool {
        let height = self.chain.height() + 1;
        let block_time = match self.chain.tip() {
            Some(tip) if flags & LOCKTIME_MEDIAN_TIME_PAST != 0 => {
                self.index.median_time_past(tip)
            }
            _ => self.clock.adjusted_time(),
        };
        is_final_tx(tx, height, block_time)
    }

    /// Whether the relative locks of `tx` allow it into the next block.
    /// Coins at [`MEMPOOL_HEIGHT`] are assumed to confirm in that block.
    /// With `use_existing` the cached lock points are evaluated instead.
    pub fn check_sequence_locks(
        &self,
        tx: &Transaction,
        flags: u32,
        view: &dyn CoinsView,
        lock_points: Option<&mut LockPoints>,
        use_existing: bool,
    ) -> Result<bool, StoreError> {
        let Some(tip) = self.chain.tip() else {
            return Ok(false);
        };
        let next_height = self.index.node(tip).height + 1;
        if use_existing {
            if let Some(points) = lock_points {
                return Ok(evaluate_sequence_locks(
                    self.index,
                    tip,
                    (points.height, points.time),
                ));
            }
        }

        let mut prev_heights = Vec::with_capacity(tx.vin.len());
        for input in &tx.vin {
            let Some(coins) = view.coins(&input.prevout.hash)? else {
                log_error!("check_sequence_locks: missing input {}", input.prevout);
                return Ok(false);
            };
            prev_heights.push(if coins.height == MEMPOOL_HEIGHT {
                next_height
            } else {
                coins.height
            });
        }
        let lock = calculate_sequence_locks(tx, flags, &mut prev_heights, self.index, tip);
        if let Some(points) = lock_points {
            points.height = lock.0;
            points.time = lock.1;
            // Unconfirmed inputs with a non-zero lock already fail below.
            let max_input_height = prev_heights
                .iter()
                .copied()
                .filter(|height| *height != next_height)
                .max()
                .unwrap_or(0);
            points.max_input_block = self.index.ancestor(tip, max_input_height.max(0));
        }
        Ok(evaluate_sequence_locks(self.index, tip, lock))
    }

    /// Lock points stay valid while the block they depend on is active.
    pub fn test_lock_point_validity(&self, points: &LockPoints) -> bool {
        points
            .max_input_block
            .map_or(true, |id| self.chain.contains(self.index, id))
    }
}

pub struct ChainState<S: KeyValueStore + 'static> {
    params: ChainParams,
    config: ChainConfig,
    tree: BlockTreeDb<S>,
    index: BlockIndex,
    chain: ActiveChain,
    candidates: BTreeSet<CandidateKey>,
    /// Blocks with data whose parent's data is still missing, by parent.
    unlinked: HashMap<NodeId, Vec<NodeId>>,
    best_header: Option<NodeId>,
    best_invalid: Option<NodeId>,
    forks: ForkWarnings,
    misc_warning: Option<String>,
    block_source: HashMap<Hash256, PeerId>,
    rejections: Vec<BlockRejection>,
    dirty_index: BTreeSet<NodeId>,
    blocks: BlockStore,
    coins_tip: CoinsViewCache<'static>,
    versionbits: VersionBitsCache,
    verifier: Arc<dyn ScriptVerifier>,
    events: EventBus,
    metrics: ValidationMetrics,
    shutdown: Arc<AtomicBool>,
    clock: Arc<Clock>,
    next_sequence_id: u32,
    ibd_done: AtomicBool,
    importing: bool,
    reindexing: bool,
    last_write: i64,
    last_flush: i64,
}

impl<S: KeyValueStore + 'static> ChainState<S> {
    /// Opens the chain state over `store` with block files under
    /// `blocks_dir`. Nothing is loaded until [`Self::load_block_index`].
    pub fn open(
        params: ChainParams,
        config: ChainConfig,
        store: Arc<S>,
        blocks_dir: impl AsRef<Path>,
        verifier: Arc<dyn ScriptVerifier>,
    ) -> Result<Self, ChainStateError> {
        if config.reindex {
            wipe_columns(store.as_ref())?;
        }
        let tree = BlockTreeDb::new(Arc::clone(&store));
        if config.reindex {
            tree.write_reindexing(true)?;
        }
        let blocks = BlockStore::open(blocks_dir, params.message_start)?;
        let coins_tip = CoinsViewCache::owned(Box::new(CoinsViewDb::new(store)));
        let reindexing = config.reindex;
        Ok(Self {
            params,
            config,
            tree,
            index: BlockIndex::new(),
            chain: ActiveChain::new(),
            candidates: BTreeSet::new(),
            unlinked: HashMap::new(),
            best_header: None,
            best_invalid: None,
            forks: ForkWarnings::default(),
            misc_warning: None,
            block_source: HashMap::new(),
            rejections: Vec::new(),
            dirty_index: BTreeSet::new(),
            blocks,
            coins_tip,
            versionbits: VersionBitsCache::new(),
            verifier,
            events: EventBus::new(),
            metrics: ValidationMetrics::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            clock: Arc::new(Clock::new()),
            next_sequence_id: 1,
            ibd_done: AtomicBool::new(false),
            importing: false,
            reindexing,
            last_write: 0,
            last_flush: 0,
        })
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_clock(mut self, clock: Arc<Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn chain(&self) -> &ActiveChain {
        &self.chain
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.chain.tip()
    }

    pub fn tip_node(&self) -> Option<&BlockIndexNode> {
        self.chain.tip().map(|id| self.index.node(id))
    }

    pub fn best_header(&self) -> Option<NodeId> {
        self.best_header
    }

    pub fn best_invalid(&self) -> Option<NodeId> {
        self.best_invalid
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn shutdown_flag(&self) -> &Arc<AtomicBool> {
        &self.shutdown
    }

    pub fn metrics(&self) -> &ValidationMetrics {
        &self.metrics
    }

    pub fn verifier(&self) -> Arc<dyn ScriptVerifier> {
        Arc::clone(&self.verifier)
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn coins_tip_mut(&mut self) -> &mut CoinsViewCache<'static> {
        &mut self.coins_tip
    }

    pub fn view(&self) -> ChainView<'_> {
        ChainView {
            params: &self.params,
            index: &self.index,
            chain: &self.chain,
            clock: &self.clock,
        }
    }

    /// The chain view together with the coin tip, for mempool admission.
    pub fn mempool_context(&mut self) -> (ChainView<'_>, &mut CoinsViewCache<'static>) {
        (
            ChainView {
                params: &self.params,
                index: &self.index,
                chain: &self.chain,
                clock: &self.clock,
            },
            &mut self.coins_tip,
        )
    }

    pub fn subscribe(&mut self) -> crossbeam_channel::Receiver<ChainEvent> {
        self.events.subscribe(DEFAULT_EVENT_QUEUE)
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn take_block_rejections(&mut self) -> Vec<BlockRejection> {
        std::mem::take(&mut self.rejections)
    }

    pub fn is_importing(&self) -> bool {
        self.importing
    }

    pub fn set_importing(&mut self, importing: bool) {
        self.importing = importing;
    }

    pub fn is_reindexing(&self) -> bool {
        self.reindexing
    }

    /// Ends a reindex once every block file has been replayed.
    pub fn finish_reindex(&mut self) -> Result<(), ChainStateError> {
        self.tree.write_reindexing(false)?;
        self.reindexing = false;
        log_info!("reindexing finished");
        self.init_genesis()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_candidate(&self, id: NodeId) -> bool {
        self.candidates.contains(&candidate_key(&self.index, id))
    }

    pub fn unlinked_count(&self) -> usize {
        self.unlinked.values().map(Vec::len).sum()
    }

    pub fn read_block(&self, id: NodeId) -> Result<Block, ChainStateError> {
        self.blocks
            .read_block(self.index.node(id), &self.params.consensus)
    }

    pub fn check_final_tx(&self, tx: &Transaction, flags: u32) -> bool {
        self.view().check_final_tx(tx, flags)
    }

    /// Version a block built on the current tip should carry.
    pub fn compute_block_version(&mut self) -> i32 {
        let tip = self.chain.tip();
        self.versionbits
            .compute_block_version(&self.index, tip, &self.params.consensus)
    }

    pub fn deployment_state(&mut self, pos: DeploymentPos) -> ThresholdState {
        let tip = self.chain.tip();
        self.versionbits
            .state(&self.index, tip, &self.params.consensus, pos)
    }

    /// Warnings an operator should see, most severe first.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.forks.large_work_fork_found {
            warnings.push(
                "Warning: The network does not appear to fully agree! Some miners appear to be experiencing issues."
                    .to_string(),
            );
        } else if self.forks.large_work_invalid_chain_found {
            warnings.push(
                "Warning: We do not appear to fully agree with our peers! You may need to upgrade, or other nodes may need to upgrade."
                    .to_string(),
            );
        }
        if let Some(warning) = &self.misc_warning {
            warnings.push(warning.clone());
        }
        warnings
    }

    fn abort_node(&self, message: &str, err: impl Into<ChainStateError>) -> ChainStateError {
        let err = err.into();
        log_error!("*** {message}: {err}");
        self.shutdown.store(true, Ordering::SeqCst);
        err
    }

    /// Newest checkpoint whose block is in the index.
    pub fn last_checkpoint(&self) -> Option<NodeId> {
        self.params
            .checkpoints
            .iter()
            .filter_map(|checkpoint| {
                self.index
                    .lookup(&checkpoint.hash)
                    .map(|id| (checkpoint.height, id))
            })
            .max_by_key(|(height, _)| *height)
            .map(|(_, id)| id)
    }

    fn enforced_checkpoint(&self) -> Option<NodeId> {
        if self.config.checkpoints_enabled {
            self.last_checkpoint()
        } else {
            None
        }
    }

    fn csv_active(&mut self, prev: Option<NodeId>) -> bool {
        self.versionbits
            .state(&self.index, prev, &self.params.consensus, DeploymentPos::Csv)
            == ThresholdState::Active
    }

    fn is_worse_than_tip(&self, id: NodeId) -> bool {
        match self.chain.tip() {
            Some(tip) => candidate_key(&self.index, id) < candidate_key(&self.index, tip),
            None => false,
        }
    }

    pub fn is_initial_block_download(&self) -> bool {
        if self.importing || self.reindexing {
            return true;
        }
        if self.config.checkpoints_enabled
            && self.chain.height() < self.params.last_checkpoint_height()
        {
            return true;
        }
        if self.ibd_done.load(Ordering::Relaxed) {
            return false;
        }
        let Some(best_header) = self.best_header.map(|id| self.index.node(id)) else {
            return true;
        };
        let behind = self.chain.height() < best_header.height - 24 * 6
            || best_header.block_time() < self.clock.now() - self.params.max_tip_age;
        if !behind {
            log_info!("leaving initial block download");
            self.ibd_done.store(true, Ordering::Relaxed);
        }
        behind
    }

    /// Rough fraction of total verification work done at `id`.
    pub fn guess_verification_progress(&self, id: Option<NodeId>) -> f64 {
        let Some(id) = id else {
            return 0.0;
        };
        let node = self.index.node(id);
        let data = &self.params.checkpoint_data;
        let now = self.clock.now();
        let chain_tx = node.chain_tx as f64;
        let checkpoint_tx = data.transactions_last_checkpoint as f64;
        let (before, after) = if node.chain_tx <= data.transactions_last_checkpoint {
            let expensive_after =
                (now - data.time_last_checkpoint) as f64 / 86400.0 * data.transactions_per_day;
            (
                chain_tx,
                checkpoint_tx - chain_tx + expensive_after * SIGCHECK_VERIFICATION_FACTOR,
            )
        } else {
            let expensive_after =
                (now - node.block_time()) as f64 / 86400.0 * data.transactions_per_day;
            (
                checkpoint_tx + (chain_tx - checkpoint_tx) * SIGCHECK_VERIFICATION_FACTOR,
                expensive_after * SIGCHECK_VERIFICATION_FACTOR,
            )
        };
        if before + after <= 0.0 {
            return 1.0;
        }
        (before / (before + after)).clamp(0.0, 1.0)
    }

    /// Rebuilds the in-memory index from the store and restores the tip
    /// from the coin database.
    pub fn load_block_index(&mut self) -> Result<(), ChainStateError> {
        if self.reindexing {
            return Ok(());
        }
        let ids = self.tree.load_block_index(&mut self.index)?;
        for id in ids {
            let prev = self.index.prev(id);
            let (prev_chain_tx, prev_failed) = prev
                .map(|p| {
                    let parent = self.index.node(p);
                    (parent.chain_tx, parent.is_failed())
                })
                .unwrap_or((0, false));
            let node = self.index.node_mut(id);
            if prev_failed && !node.is_failed() {
                node.status |= BLOCK_FAILED_CHILD;
                self.dirty_index.insert(id);
            }
            if node.tx_count > 0 {
                match prev {
                    Some(parent) if prev_chain_tx == 0 => {
                        node.chain_tx = 0;
                        self.unlinked.entry(parent).or_default().push(id);
                    }
                    _ => node.chain_tx = prev_chain_tx + u64::from(node.tx_count),
                }
            }
            let node = self.index.node(id);
            if node.is_valid(BLOCK_VALID_TRANSACTIONS) && (node.chain_tx != 0 || prev.is_none()) {
                self.candidates.insert(candidate_key(&self.index, id));
            }
            if node.status & BLOCK_FAILED_MASK != 0
                && self
                    .best_invalid
                    .map_or(true, |best| node.chain_work > self.index.node(best).chain_work)
            {
                self.best_invalid = Some(id);
            }
            if node.is_valid(BLOCK_VALID_TREE)
                && self.best_header.map_or(true, |best| {
                    candidate_key(&self.index, best) < candidate_key(&self.index, id)
                })
            {
                self.best_header = Some(id);
            }
        }

        let last_file = self.tree.read_last_block_file()?.unwrap_or(0);
        let infos = self.tree.read_block_file_infos()?;
        self.blocks.load(last_file, infos);
        log_info!("last block file = {last_file}");
        if let Some(info) = self.blocks.file_info(last_file) {
            log_info!("last block file info: {info}");
        }

        let files: BTreeSet<u32> = self
            .index
            .iter()
            .filter(|(_, node)| node.have_data())
            .map(|(_, node)| node.file)
            .collect();
        for file in files {
            if !self.blocks.block_file_exists(file) {
                return Err(ChainStateError::Corrupt(format!(
                    "block file {file} is missing"
                )));
            }
        }

        if self.tree.read_reindexing()? {
            self.reindexing = true;
        }

        let best = self.coins_tip.best_block()?;
        let Some(tip) = self.index.lookup(&best) else {
            return Ok(());
        };
        self.chain.set_tip(&self.index, Some(tip));
        self.prune_block_index_candidates();
        let node = self.index.node(tip);
        log_info!(
            "loaded best chain: hashBestChain={} height={} date={} progress={:.6}",
            hash256_to_hex(&node.hash),
            node.height,
            coind_log::format_unix_time(node.block_time()),
            self.guess_verification_progress(Some(tip))
        );
        Ok(())
    }

    /// Writes the genesis block when the index has no chain yet.
    pub fn init_genesis(&mut self) -> Result<(), ChainStateError> {
        if self.chain.genesis().is_some() {
            return Ok(());
        }
        log_info!("initializing databases");
        if self.reindexing {
            return Ok(());
        }
        let block = genesis_block(&self.params.genesis);
        let hash = block.hash();
        if hash != self.params.consensus.hash_genesis_block {
            return Err(ChainStateError::Corrupt(format!(
                "genesis block hash {} does not match the network",
                hash256_to_hex(&hash)
            )));
        }
        let size = block.serialized_size() as u32;
        let record = self
            .blocks
            .find_block_pos(size + RECORD_HEADER_SIZE, 0, block.header.time, None)?;
        let location = self.blocks.write_block(&block, record)?;
        let id = self.add_to_block_index(hash, &block.header);
        self.received_block_transactions(&block, id, location);
        self.activate_best_chain(Some(&block))?;
        self.flush_state(FlushMode::Always)
    }

    fn add_to_block_index(&mut self, hash: Hash256, header: &BlockHeader) -> NodeId {
        if let Some(id) = self.index.lookup(&hash) {
            return id;
        }
        let id = self.index.insert_header(hash, header);
        self.index.node_mut(id).raise_validity(BLOCK_VALID_TREE);
        let work = self.index.node(id).chain_work;
        if self
            .best_header
            .map_or(true, |best| self.index.node(best).chain_work < work)
        {
            self.best_header = Some(id);
        }
        self.dirty_index.insert(id);
        id
    }

    pub fn accept_block_header(&mut self, header: &BlockHeader) -> Result<NodeId, ChainStateError> {
        let hash = header.hash();
        if hash != self.params.consensus.hash_genesis_block {
            if let Some(id) = self.index.lookup(&hash) {
                if self.index.node(id).is_failed() {
                    return Err(ValidationState::invalid(0, "duplicate")
                        .with_debug("block is marked invalid")
                        .into());
                }
                return Ok(id);
            }
            check_block_header(
                header,
                &self.params.consensus,
                self.clock.adjusted_time(),
                true,
            )?;
            let Some(prev) = self.index.lookup(&header.prev_block) else {
                return Err(ValidationState::dos(10, 0, "bad-prevblk")
                    .with_debug("prev block not found")
                    .into());
            };
            if self.index.node(prev).is_failed() {
                return Err(ValidationState::dos(100, REJECT_INVALID, "bad-prevblk")
                    .with_debug("prev block invalid")
                    .into());
            }
            let checkpoint_height = self
                .enforced_checkpoint()
                .map(|id| self.index.node(id).height);
            contextual_check_block_header(
                header,
                &self.index,
                prev,
                &self.params.consensus,
                checkpoint_height,
            )?;
        }
        Ok(self.add_to_block_index(hash, header))
    }

    /// Stores a block whose header is acceptable. Unrequested blocks are
    /// only kept when they could extend the best chain soon. `disk_pos` is
    /// set when the block already sits in a block file.
    pub fn accept_block(
        &mut self,
        block: &Block,
        source: Option<PeerId>,
        requested: bool,
        disk_pos: Option<FileLocation>,
    ) -> Result<NodeId, ChainStateError> {
        let id = self.accept_block_header(&block.header)?;
        let node = self.index.node(id);
        if let Some(peer) = source {
            self.block_source.insert(node.hash, peer);
        }
        if node.have_data() {
            return Ok(id);
        }
        if !requested {
            let has_more_work = self
                .chain
                .tip()
                .map_or(true, |tip| node.chain_work > self.index.node(tip).chain_work);
            let too_far_ahead = node.height > self.chain.height() + MIN_BLOCKS_TO_KEEP;
            if node.tx_count != 0 || !has_more_work || too_far_ahead {
                return Ok(id);
            }
        }

        let (height, prev) = (node.height, node.prev);
        let csv_active = self.csv_active(prev);
        let checked = check_block(
            block,
            &self.params.consensus,
            self.clock.adjusted_time(),
            true,
            true,
        )
        .and_then(|()| {
            contextual_check_block(block, &self.index, prev, &self.params.consensus, csv_active)
        });
        if let Err(state) = checked {
            if state.is_invalid() && !state.is_corruption_possible() {
                self.index.node_mut(id).status |= BLOCK_FAILED_VALID;
                self.dirty_index.insert(id);
            }
            log_debug!("accept_block: {state}");
            return Err(state.into());
        }

        let size = block.serialized_size() as u32;
        let record = self
            .blocks
            .find_block_pos(size + RECORD_HEADER_SIZE, height, block.header.time, disk_pos)
            .map_err(|err| self.abort_node("Failed to find block position", err))?;
        let location = match disk_pos {
            Some(location) => location,
            None => self
                .blocks
                .write_block(block, record)
                .map_err(|err| self.abort_node("Failed to write block", err))?,
        };
        self.received_block_transactions(block, id, location);
        Ok(id)
    }

    /// Records that the data of `id` is on disk and links it, and every
    /// descendant waiting on it, into the candidate set.
    pub fn received_block_transactions(&mut self, block: &Block, id: NodeId, location: FileLocation) {
        let node = self.index.node_mut(id);
        node.tx_count = block.transactions.len() as u32;
        node.chain_tx = 0;
        node.file = location.file;
        node.data_pos = location.pos;
        node.undo_pos = 0;
        node.status = (node.status | BLOCK_HAVE_DATA) & !BLOCK_HAVE_UNDO;
        node.raise_validity(BLOCK_VALID_TRANSACTIONS);
        self.dirty_index.insert(id);

        let prev = self.index.prev(id);
        let linked = prev.map_or(true, |p| self.index.node(p).chain_tx != 0);
        if !linked {
            if let Some(parent) = prev.filter(|p| self.index.node(*p).is_valid(BLOCK_VALID_TREE)) {
                self.unlinked.entry(parent).or_default().push(id);
            }
            return;
        }

        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let parent_chain_tx = self
                .index
                .prev(current)
                .map_or(0, |p| self.index.node(p).chain_tx);
            let node = self.index.node_mut(current);
            node.chain_tx = parent_chain_tx + u64::from(node.tx_count);
            node.sequence_id = self.next_sequence_id;
            self.next_sequence_id += 1;
            if !self.is_worse_than_tip(current) {
                self.candidates.insert(candidate_key(&self.index, current));
            }
            if let Some(children) = self.unlinked.remove(&current) {
                queue.extend(children);
            }
        }
    }

    /// Checks, stores and tries to activate a block.
    pub fn process_new_block(
        &mut self,
        block: &Block,
        source: Option<PeerId>,
        requested: bool,
        disk_pos: Option<FileLocation>,
    ) -> Result<ConnectTrace, ChainStateError> {
        self.accept_new_block(block, source, requested, disk_pos)?;
        self.activate_best_chain(Some(block))
    }

    /// The checks and storage half of [`ChainState::process_new_block`].
    /// The block is indexed and written but the tip is not moved.
    pub fn accept_new_block(
        &mut self,
        block: &Block,
        source: Option<PeerId>,
        requested: bool,
        disk_pos: Option<FileLocation>,
    ) -> Result<(), ChainStateError> {
        if let Err(state) = check_block(
            block,
            &self.params.consensus,
            self.clock.adjusted_time(),
            true,
            true,
        ) {
            log_debug!(
                "process_new_block: check_block failed for {}: {state}",
                hash256_to_hex(&block.hash())
            );
            return Err(state.into());
        }
        let accepted = self.accept_block(block, source, requested, disk_pos);
        self.maybe_check_block_index();
        accepted.map(|_| ())
    }

    /// Best candidate whose whole path back to the active chain is usable.
    /// Unusable candidates are dropped on the way.
    pub fn find_most_work_chain(&mut self) -> Option<NodeId> {
        loop {
            let best = self.candidates.iter().next_back()?.id.0;
            let mut test = Some(best);
            let mut invalid_ancestor = false;
            while let Some(current) = test {
                if self.chain.contains(&self.index, current) {
                    break;
                }
                let node = self.index.node(current);
                let failed = node.is_failed();
                let missing_data = !node.have_data();
                if failed || missing_data {
                    if failed
                        && self.best_invalid.map_or(true, |invalid| {
                            self.index.node(best).chain_work > self.index.node(invalid).chain_work
                        })
                    {
                        self.best_invalid = Some(best);
                    }
                    let mut walk = best;
                    while walk != current {
                        let key = candidate_key(&self.index, walk);
                        self.candidates.remove(&key);
                        if failed {
                            self.index.node_mut(walk).status |= BLOCK_FAILED_CHILD;
                            self.dirty_index.insert(walk);
                        } else if let Some(parent) = self.index.prev(walk) {
                            let waiting = self.unlinked.entry(parent).or_default();
                            if !waiting.contains(&walk) {
                                waiting.push(walk);
                            }
                        }
                        match self.index.prev(walk) {
                            Some(parent) => walk = parent,
                            None => break,
                        }
                    }
                    let key = candidate_key(&self.index, current);
                    self.candidates.remove(&key);
                    invalid_ancestor = true;
                    break;
                }
                test = self.index.prev(current);
            }
            if !invalid_ancestor {
                return Some(best);
            }
        }
    }

    /// Drops candidates that sort below the tip. The tip itself stays.
    pub fn prune_block_index_candidates(&mut self) {
        let Some(tip) = self.chain.tip() else {
            return;
        };
        let tip_key = candidate_key(&self.index, tip);
        self.candidates = self.candidates.split_off(&tip_key);
    }

    /// Connects toward the most-work candidate until the tip stops changing.
    pub fn activate_best_chain(&mut self, hint: Option<&Block>) -> Result<ConnectTrace, ChainStateError> {
        let mut trace = ConnectTrace::default();
        while self.activate_best_chain_round(hint, &mut trace)? {}
        self.finish_activation()?;
        Ok(trace)
    }

    /// One bounded round of [`ChainState::activate_best_chain`]: a
    /// disconnect run to the fork point and at most one connect batch.
    /// Returns true while the tip is still short of the most-work
    /// candidate. Callers sharing the chain may release their lock between
    /// rounds and must call [`ChainState::finish_activation`] at the end.
    pub fn activate_best_chain_round(
        &mut self,
        hint: Option<&Block>,
        trace: &mut ConnectTrace,
    ) -> Result<bool, ChainStateError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let old_tip = self.chain.tip();
        let Some(most_work) = self.find_most_work_chain() else {
            return Ok(false);
        };
        if Some(most_work) == old_tip {
            return Ok(false);
        }
        let most_work_hash = self.index.node(most_work).hash;
        let step_hint = hint.filter(|block| block.hash() == most_work_hash);
        if let Err(err) = self.activate_best_chain_step(most_work, step_hint, trace) {
            return Err(self.abort_node("Failed to activate best chain", err));
        }

        if let Some(tip) = self.chain.tip() {
            let fork = old_tip.and_then(|old| self.chain.find_fork(&self.index, old));
            if fork != Some(tip) {
                let initial_download = self.is_initial_block_download();
                let node = self.index.node(tip);
                trace.tip_updates.push(TipUpdate {
                    fork,
                    tip,
                    initial_download,
                });
                self.events.publish(ChainEvent::UpdatedBlockTip {
                    hash: node.hash,
                    height: node.height,
                    initial_download,
                });
            }
        }
        Ok(self.chain.tip() != Some(most_work))
    }

    pub fn finish_activation(&mut self) -> Result<(), ChainStateError> {
        self.maybe_check_block_index();
        self.flush_state(FlushMode::Periodic)
    }

    /// Disconnects to the fork point, then connects up to 32 blocks at a
    /// time toward `most_work`, stopping early once the tip has more work
    /// than where it started.
    fn activate_best_chain_step(
        &mut self,
        most_work: NodeId,
        hint: Option<&Block>,
        trace: &mut ConnectTrace,
    ) -> Result<(), ChainStateError> {
        let old_tip = self.chain.tip();
        let fork = self.chain.find_fork(&self.index, most_work);

        while let Some(tip) = self.chain.tip() {
            if Some(tip) == fork {
                break;
            }
            self.disconnect_tip(trace)?;
        }

        let target_height = self.index.node(most_work).height;
        let mut height = fork.map_or(-1, |id| self.index.node(id).height);
        let mut invalid_found = None;
        let mut keep_going = true;
        let mut batch = Vec::new();
        while keep_going && height != target_height {
            let batch_target = (height + BLOCK_CONNECT_BATCH).min(target_height);
            batch.clear();
            let mut cursor = self.index.ancestor(most_work, batch_target);
            while let Some(id) = cursor {
                if self.index.node(id).height == height {
                    break;
                }
                batch.push(id);
                cursor = self.index.prev(id);
            }
            height = batch_target;

            for &id in batch.iter().rev() {
                let block_hint = if id == most_work { hint } else { None };
                match self.connect_tip(id, block_hint, trace) {
                    Ok(()) => {
                        self.prune_block_index_candidates();
                        let improved = match (old_tip, self.chain.tip()) {
                            (None, _) => true,
                            (Some(old), Some(tip)) => {
                                self.index.node(tip).chain_work > self.index.node(old).chain_work
                            }
                            (Some(_), None) => false,
                        };
                        if improved {
                            keep_going = false;
                            break;
                        }
                    }
                    Err(ChainStateError::Invalid(state)) if state.is_invalid() => {
                        let first = batch.last().copied().unwrap_or(id);
                        if !state.is_corruption_possible() {
                            self.invalid_chain_found(first);
                        }
                        invalid_found = Some(first);
                        keep_going = false;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        match invalid_found {
            Some(id) => self.check_fork_warning_conditions_on_new_fork(id),
            None => self.check_fork_warning_conditions(),
        }
        Ok(())
    }

    /// Connects `id`, which must extend the tip.
    fn connect_tip(
        &mut self,
        id: NodeId,
        hint: Option<&Block>,
        trace: &mut ConnectTrace,
    ) -> Result<(), ChainStateError> {
        if self.index.prev(id) != self.chain.tip() {
            return Err(ChainStateError::Corrupt(
                "connect_tip: block does not extend the tip".to_string(),
            ));
        }
        let started = Instant::now();
        let loaded;
        let block = match hint {
            Some(block) => block,
            None => {
                loaded = self
                    .read_block(id)
                    .map_err(|err| self.abort_node("Failed to read block", err))?;
                &loaded
            }
        };
        log_cat!(
            Category::Bench,
            "  - load block from disk: {:.2}ms",
            millis(started.elapsed())
        );

        let node = self.index.node(id);
        let hash = node.hash;
        let height = node.height;
        let target = BlockTarget {
            hash: Some(hash),
            height,
            prev: node.prev,
        };
        let last_checkpoint = self.enforced_checkpoint();
        let adjusted_time = self.clock.adjusted_time();

        let outcome = {
            let mut view = CoinsViewCache::new(&mut self.coins_tip);
            let connected = {
                let mut ctx = ConnectContext {
                    consensus: &self.params.consensus,
                    index: &self.index,
                    versionbits: &mut self.versionbits,
                    verifier: self.verifier.as_ref(),
                    metrics: &self.metrics,
                    last_checkpoint,
                    adjusted_time,
                };
                connect_block(&mut ctx, block, &target, &mut view, false)
            };
            connected.and_then(|undo| {
                if let Some(undo) = undo {
                    store_undo(
                        &mut self.blocks,
                        &mut self.index,
                        &mut self.dirty_index,
                        id,
                        &undo,
                    )?;
                }
                view.flush()?;
                Ok(())
            })
        };
        match outcome {
            Ok(()) => {}
            Err(ChainStateError::Invalid(state)) if state.is_invalid() => {
                self.invalid_block_found(id, &state);
                log_error!(
                    "connect_tip: connect_block {} failed: {state}",
                    hash256_to_hex(&hash)
                );
                return Err(ChainStateError::Invalid(state));
            }
            Err(err) => return Err(err),
        }
        self.block_source.remove(&hash);

        self.flush_state(FlushMode::IfNeeded)?;
        self.update_tip(id);
        log_cat!(
            Category::Bench,
            "  - connect total: {:.2}ms",
            millis(started.elapsed())
        );
        self.events.publish(ChainEvent::BlockConnected {
            hash,
            txids: block.txids(),
        });
        trace.connected.push((block.clone(), height));
        Ok(())
    }

    fn disconnect_tip(&mut self, trace: &mut ConnectTrace) -> Result<(), ChainStateError> {
        let Some(id) = self.chain.tip() else {
            return Err(ChainStateError::Corrupt("disconnect_tip: no tip".to_string()));
        };
        let Some(prev) = self.index.prev(id) else {
            return Err(ChainStateError::Corrupt(
                "disconnect_tip: cannot disconnect genesis".to_string(),
            ));
        };
        let block = self
            .read_block(id)
            .map_err(|err| self.abort_node("Failed to read block", err))?;
        let prev_hash = self.index.node(prev).hash;
        let node = self.index.node(id);
        let (hash, height) = (node.hash, node.height);
        let undo = self.blocks.read_undo(node, &prev_hash)?;

        let started = Instant::now();
        {
            let mut view = CoinsViewCache::new(&mut self.coins_tip);
            if !disconnect_block(&block, height, prev_hash, &undo, &mut view)? {
                return Err(ChainStateError::Corrupt(format!(
                    "disconnect_block {} failed",
                    hash256_to_hex(&hash)
                )));
            }
            view.flush()?;
        }
        log_cat!(
            Category::Bench,
            "- disconnect block: {:.2}ms",
            millis(started.elapsed())
        );

        self.flush_state(FlushMode::IfNeeded)?;
        self.update_tip(prev);
        self.events.publish(ChainEvent::BlockDisconnected {
            hash,
            txids: block.txids(),
        });
        trace.disconnected.push(block);
        Ok(())
    }

    fn update_tip(&mut self, id: NodeId) {
        self.chain.set_tip(&self.index, Some(id));
        let node = self.index.node(id);
        log_info!(
            "update_tip: new best={} height={} version=0x{:08x} log2_work={:.8} tx={} date='{}' progress={:.6} cache={:.1}MiB({}tx)",
            hash256_to_hex(&node.hash),
            node.height,
            node.version,
            log2_work(node.chain_work),
            node.chain_tx,
            coind_log::format_unix_time(node.block_time()),
            self.guess_verification_progress(Some(id)),
            self.coins_tip.dynamic_memory_usage() as f64 / (1u64 << 20) as f64,
            self.coins_tip.cache_size()
        );

        if self.is_initial_block_download() {
            return;
        }
        let mut upgraded = 0;
        let mut cursor = Some(id);
        for _ in 0..100 {
            let Some(current) = cursor else {
                break;
            };
            let prev = self.index.prev(current);
            let expected =
                self.versionbits
                    .compute_block_version(&self.index, prev, &self.params.consensus);
            let version = self.index.node(current).version;
            if version > VERSIONBITS_LAST_OLD_BLOCK_VERSION && (version & !expected) != 0 {
                upgraded += 1;
            }
            cursor = prev;
        }
        if upgraded > 0 {
            log_info!("update_tip: {upgraded} of last 100 blocks have unexpected version");
        }
        if upgraded > 100 / 2 && self.misc_warning.is_none() {
            let warning = "Warning: Unknown block versions being mined! It's possible unknown rules are in effect";
            log_warn!("{warning}");
            self.misc_warning = Some(warning.to_string());
        }
    }

    fn invalid_block_found(&mut self, id: NodeId, state: &ValidationState) {
        let hash = self.index.node(id).hash;
        if state.is_invalid() {
            if let Some(&peer) = self.block_source.get(&hash) {
                self.rejections.push(BlockRejection {
                    peer,
                    hash,
                    state: state.clone(),
                });
            }
        }
        if !state.is_corruption_possible() {
            let key = candidate_key(&self.index, id);
            self.candidates.remove(&key);
            self.index.node_mut(id).status |= BLOCK_FAILED_VALID;
            self.dirty_index.insert(id);
            self.invalid_chain_found(id);
        }
    }

    fn invalid_chain_found(&mut self, id: NodeId) {
        let work = self.index.node(id).chain_work;
        if self
            .best_invalid
            .map_or(true, |best| work > self.index.node(best).chain_work)
        {
            self.best_invalid = Some(id);
        }
        let node = self.index.node(id);
        log_info!(
            "invalid_chain_found: invalid block={} height={} log2_work={:.8} date={}",
            hash256_to_hex(&node.hash),
            node.height,
            log2_work(node.chain_work),
            coind_log::format_unix_time(node.block_time())
        );
        if let Some(tip) = self.tip_node() {
            log_info!(
                "invalid_chain_found: current best={} height={} log2_work={:.8} date={}",
                hash256_to_hex(&tip.hash),
                tip.height,
                log2_work(tip.chain_work),
                coind_log::format_unix_time(tip.block_time())
            );
        }
        self.check_fork_warning_conditions();
    }

    fn check_fork_warning_conditions(&mut self) {
        if self.is_initial_block_download() {
            return;
        }
        let Some(tip) = self.chain.tip() else {
            return;
        };
        let tip_height = self.chain.height();
        if let Some(fork_tip) = self.forks.best_fork_tip {
            if tip_height - self.index.node(fork_tip).height >= FORK_WARNING_DEPTH {
                self.forks.best_fork_tip = None;
            }
        }

        let tip_node = self.index.node(tip);
        let threshold = tip_node
            .chain_work
            .saturating_add(block_proof(tip_node.bits).saturating_mul(U256::from(6u8)));
        let invalid_chain_ahead = self
            .best_invalid
            .is_some_and(|invalid| self.index.node(invalid).chain_work > threshold);

        if self.forks.best_fork_tip.is_some() || invalid_chain_ahead {
            if let (false, Some(base)) = (self.forks.large_work_fork_found, self.forks.best_fork_base) {
                log_warn!(
                    "Warning: Large-work fork detected, forking after block {}",
                    hash256_to_hex(&self.index.node(base).hash)
                );
            }
            match (self.forks.best_fork_tip, self.forks.best_fork_base) {
                (Some(fork_tip), Some(base)) => {
                    let (fork, base) = (self.index.node(fork_tip), self.index.node(base));
                    log_warn!(
                        "check_fork_warning_conditions: large valid fork found, forking the chain at height {} ({}) lasting to height {} ({}). Chain state database corruption likely.",
                        base.height,
                        hash256_to_hex(&base.hash),
                        fork.height,
                        hash256_to_hex(&fork.hash)
                    );
                    self.forks.large_work_fork_found = true;
                }
                _ => {
                    log_warn!(
                        "check_fork_warning_conditions: found invalid chain at least ~6 blocks longer than our best chain. Chain state database corruption likely."
                    );
                    self.forks.large_work_invalid_chain_found = true;
                }
            }
        } else {
            self.forks.large_work_fork_found = false;
            self.forks.large_work_invalid_chain_found = false;
        }
    }

    fn check_fork_warning_conditions_on_new_fork(&mut self, new_fork_tip: NodeId) {
        if let Some(tip) = self.chain.tip() {
            if let Some(fork) = self.index.last_common_ancestor(new_fork_tip, tip) {
                let new_node = self.index.node(new_fork_tip);
                let fork_node = self.index.node(fork);
                let higher = self
                    .forks
                    .best_fork_tip
                    .map_or(true, |best| new_node.height > self.index.node(best).height);
                let fork_work = new_node.chain_work.saturating_sub(fork_node.chain_work);
                let min_work = block_proof(fork_node.bits).saturating_mul(U256::from(7u8));
                if higher
                    && fork_work > min_work
                    && self.chain.height() - new_node.height < FORK_WARNING_DEPTH
                {
                    self.forks.best_fork_tip = Some(new_fork_tip);
                    self.forks.best_fork_base = Some(fork);
                }
            }
        }
        self.check_fork_warning_conditions();
    }

    /// Marks `hash` invalid, disconnects it if active, and re-activates the
    /// best remaining chain.
    pub fn invalidate_block(&mut self, hash: &Hash256) -> Result<ConnectTrace, ChainStateError> {
        let Some(id) = self.index.lookup(hash) else {
            return Err(ChainStateError::Corrupt(format!(
                "block {} not found",
                hash256_to_hex(hash)
            )));
        };
        let key = candidate_key(&self.index, id);
        self.candidates.remove(&key);
        self.index.node_mut(id).status |= BLOCK_FAILED_VALID;
        self.dirty_index.insert(id);

        let mut trace = ConnectTrace::default();
        while self.chain.contains(&self.index, id) {
            let Some(walk) = self.chain.tip() else {
                break;
            };
            let key = candidate_key(&self.index, walk);
            self.candidates.remove(&key);
            self.index.node_mut(walk).status |= BLOCK_FAILED_CHILD;
            self.dirty_index.insert(walk);
            self.disconnect_tip(&mut trace)?;
        }

        // The new tip may have been pruned from the candidates earlier.
        for (candidate, node) in self.index.iter() {
            if node.is_valid(BLOCK_VALID_TRANSACTIONS)
                && node.chain_tx != 0
                && !self.is_worse_than_tip(candidate)
            {
                self.candidates.insert(candidate_key(&self.index, candidate));
            }
        }
        self.invalid_chain_found(id);
        let activated = self.activate_best_chain(None)?;
        trace.append(activated);
        Ok(trace)
    }

    /// Clears the failure flags of `hash`, its descendants and its
    /// ancestors, then re-activates the best chain.
    pub fn reconsider_block(&mut self, hash: &Hash256) -> Result<ConnectTrace, ChainStateError> {
        let Some(id) = self.index.lookup(hash) else {
            return Err(ChainStateError::Corrupt(format!(
                "block {} not found",
                hash256_to_hex(hash)
            )));
        };
        let height = self.index.node(id).height;
        let tip_key = self.chain.tip().map(|tip| candidate_key(&self.index, tip));
        let ids: Vec<NodeId> = self.index.ids().collect();
        for other in ids {
            let node = self.index.node(other);
            if node.is_valid(BLOCK_VALID_TRANSACTIONS) || self.index.ancestor(other, height) != Some(id) {
                continue;
            }
            self.index.node_mut(other).status &= !BLOCK_FAILED_MASK;
            self.dirty_index.insert(other);
            let node = self.index.node(other);
            let key = candidate_key(&self.index, other);
            if node.is_valid(BLOCK_VALID_TRANSACTIONS)
                && node.chain_tx != 0
                && tip_key.map_or(true, |tip| tip < key)
            {
                self.candidates.insert(key);
            }
            if self.best_invalid == Some(other) {
                self.best_invalid = None;
            }
        }

        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.index.node_mut(current);
            if node.status & BLOCK_FAILED_MASK != 0 {
                node.status &= !BLOCK_FAILED_MASK;
                self.dirty_index.insert(current);
            }
            cursor = self.index.prev(current);
        }
        self.activate_best_chain(None)
    }

    /// Whether `block` would connect on top of the current tip. Nothing is
    /// written.
    pub fn test_block_validity(
        &mut self,
        block: &Block,
        check_pow: bool,
        check_merkle_root: bool,
    ) -> Result<(), ChainStateError> {
        let Some(prev) = self.chain.tip() else {
            return Err(ChainStateError::Corrupt("no active chain".to_string()));
        };
        if block.header.prev_block != self.index.node(prev).hash {
            return Err(ValidationState::invalid(REJECT_INVALID, "inconclusive-not-best-prevblk").into());
        }
        let checkpoint_height = self
            .enforced_checkpoint()
            .map(|id| self.index.node(id).height);
        contextual_check_block_header(
            &block.header,
            &self.index,
            prev,
            &self.params.consensus,
            checkpoint_height,
        )?;
        check_block(
            block,
            &self.params.consensus,
            self.clock.adjusted_time(),
            check_pow,
            check_merkle_root,
        )?;
        let csv_active = self.csv_active(Some(prev));
        contextual_check_block(block, &self.index, Some(prev), &self.params.consensus, csv_active)?;

        let target = BlockTarget {
            hash: None,
            height: self.index.node(prev).height + 1,
            prev: Some(prev),
        };
        let adjusted_time = self.clock.adjusted_time();
        let mut view = CoinsViewCache::new(&mut self.coins_tip);
        let mut ctx = ConnectContext {
            consensus: &self.params.consensus,
            index: &self.index,
            versionbits: &mut self.versionbits,
            verifier: self.verifier.as_ref(),
            metrics: &self.metrics,
            last_checkpoint: None,
            adjusted_time,
        };
        connect_block(&mut ctx, block, &target, &mut view, true)?;
        Ok(())
    }

    /// Writes dirty index entries and, when due, the coin cache.
    pub fn flush_state(&mut self, mode: FlushMode) -> Result<(), ChainStateError> {
        let now = self.clock.now();
        if self.last_write == 0 {
            self.last_write = now;
        }
        if self.last_flush == 0 {
            self.last_flush = now;
        }
        let cache_size = self.coins_tip.dynamic_memory_usage();
        let limit = self.config.coins_cache_bytes;
        let cache_large = mode == FlushMode::Periodic && cache_size.saturating_mul(10) / 9 > limit;
        let cache_critical = mode == FlushMode::IfNeeded && cache_size > limit;
        let periodic_write =
            mode == FlushMode::Periodic && now > self.last_write + DATABASE_WRITE_INTERVAL;
        let periodic_flush =
            mode == FlushMode::Periodic && now > self.last_flush + DATABASE_FLUSH_INTERVAL;
        let full_flush = mode == FlushMode::Always || cache_large || cache_critical || periodic_flush;

        if full_flush || periodic_write {
            if let Err(err) = self.write_block_index() {
                return Err(self.abort_node("Failed to write to block index database", err));
            }
            self.last_write = now;
        }
        if full_flush {
            if let Err(err) = self.coins_tip.flush() {
                return Err(self.abort_node("Failed to write to coin database", err));
            }
            self.last_flush = now;
        }
        Ok(())
    }

    fn write_block_index(&mut self) -> Result<(), ChainStateError> {
        self.blocks.flush(false)?;
        let files = self.blocks.take_dirty();
        let dirty: Vec<NodeId> = std::mem::take(&mut self.dirty_index).into_iter().collect();
        self.tree.write_batch_sync(
            files.iter().map(|(file, info)| (*file, info)),
            self.blocks.last_file(),
            dirty.iter().map(|id| self.index.node(*id)),
        )?;
        Ok(())
    }

    /// Re-checks the newest `depth` blocks of the active chain. Level 1
    /// checks blocks, 2 reads undo data, 3 disconnects in memory while the
    /// cache allows, 4 reconnects.
    pub fn verify_db(&mut self, depth: i32, level: i32) -> Result<(), ChainStateError> {
        let Some(tip) = self.chain.tip() else {
            return Ok(());
        };
        if self.index.prev(tip).is_none() {
            return Ok(());
        }
        let chain_height = self.chain.height();
        let depth = if depth <= 0 { chain_height } else { depth.min(chain_height) };
        let level = level.clamp(0, 4);
        log_info!("verifying last {depth} blocks at level {level}");

        let last_checkpoint = self.enforced_checkpoint();
        let adjusted_time = self.clock.adjusted_time();
        let cache_limit = self.config.coins_cache_bytes;
        let tip_usage = self.coins_tip.dynamic_memory_usage();
        let consensus = &self.params.consensus;
        let mut view = CoinsViewCache::new(&mut self.coins_tip);

        let mut state_tip = tip;
        let mut failure: Option<NodeId> = None;
        let mut good_transactions = 0usize;
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            let node = self.index.node(id);
            let Some(prev) = node.prev else {
                break;
            };
            if node.height < chain_height - depth {
                break;
            }
            let block = self.blocks.read_block(node, consensus).map_err(|err| {
                ChainStateError::Corrupt(format!(
                    "*** read_block failed at {}, hash={}: {err}",
                    node.height,
                    hash256_to_hex(&node.hash)
                ))
            })?;
            if level >= 1 {
                check_block(&block, consensus, adjusted_time, true, true).map_err(|state| {
                    ChainStateError::Corrupt(format!(
                        "*** found bad block at {}, hash={}: {state}",
                        node.height,
                        hash256_to_hex(&node.hash)
                    ))
                })?;
            }
            let prev_hash = self.index.node(prev).hash;
            let mut undo = None;
            if level >= 2 && node.have_undo() {
                undo = Some(self.blocks.read_undo(node, &prev_hash).map_err(|err| {
                    ChainStateError::Corrupt(format!(
                        "*** found bad undo data at {}, hash={}: {err}",
                        node.height,
                        hash256_to_hex(&node.hash)
                    ))
                })?);
            }
            if level >= 3 && id == state_tip && view.dynamic_memory_usage() + tip_usage <= cache_limit {
                let undo = match undo {
                    Some(undo) => undo,
                    None => self.blocks.read_undo(node, &prev_hash)?,
                };
                let clean = disconnect_block(&block, node.height, prev_hash, &undo, &mut view)
                    .map_err(|err| {
                        ChainStateError::Corrupt(format!(
                            "*** irrecoverable inconsistency in block data at {}, hash={}: {err}",
                            node.height,
                            hash256_to_hex(&node.hash)
                        ))
                    })?;
                state_tip = prev;
                if clean {
                    good_transactions += block.transactions.len();
                } else {
                    good_transactions = 0;
                    failure = Some(id);
                }
            }
            cursor = Some(prev);
        }
        if let Some(failed) = failure {
            return Err(ChainStateError::Corrupt(format!(
                "*** coin database inconsistencies found (last {} blocks, {} good transactions before that)",
                chain_height - self.index.node(failed).height + 1,
                good_transactions
            )));
        }

        if level >= 4 {
            let mut cursor = state_tip;
            while cursor != tip {
                if self.shutdown.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let Some(next) = self.chain.next(&self.index, cursor) else {
                    break;
                };
                cursor = next;
                let node = self.index.node(next);
                let block = self.blocks.read_block(node, consensus)?;
                let target = BlockTarget {
                    hash: Some(node.hash),
                    height: node.height,
                    prev: node.prev,
                };
                let mut ctx = ConnectContext {
                    consensus,
                    index: &self.index,
                    versionbits: &mut self.versionbits,
                    verifier: self.verifier.as_ref(),
                    metrics: &self.metrics,
                    last_checkpoint,
                    adjusted_time,
                };
                connect_block(&mut ctx, &block, &target, &mut view, false).map_err(|err| {
                    ChainStateError::Corrupt(format!(
                        "*** found unconnectable block at {}, hash={}: {err}",
                        target.height,
                        hash256_to_hex(&node.hash)
                    ))
                })?;
            }
        }

        log_info!(
            "no coin database inconsistencies in last {} blocks ({} transactions)",
            chain_height - self.index.node(state_tip).height,
            good_transactions
        );
        Ok(())
    }

    fn maybe_check_block_index(&self) {
        if !self.config.check_block_index {
            return;
        }
        let problems = self.check_block_index();
        for problem in &problems {
            log_error!("check_block_index: {problem}");
        }
        debug_assert!(problems.is_empty(), "block index inconsistent: {problems:?}");
    }

    /// Structural invariants of the index, candidate set and unlinked map.
    /// Returns one message per violation.
    pub fn check_block_index(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.chain.height() < 0 {
            if self.index.len() > 1 {
                problems.push(format!("{} index entries without an active chain", self.index.len()));
            }
            return problems;
        }

        #[derive(Clone, Copy, Default)]
        struct FirstOf {
            invalid: Option<NodeId>,
            missing: Option<NodeId>,
            never_processed: Option<NodeId>,
            not_tree_valid: Option<NodeId>,
            not_transactions_valid: Option<NodeId>,
            not_chain_valid: Option<NodeId>,
            not_scripts_valid: Option<NodeId>,
        }

        let mut firsts: Vec<FirstOf> = Vec::with_capacity(self.index.len());
        for (id, node) in self.index.iter() {
            let mut first = node.prev.map(|prev| firsts[prev]).unwrap_or_default();
            let validity = node.status & BLOCK_VALID_MASK;
            let has_parent = node.prev.is_some();
            if first.invalid.is_none() && node.status & BLOCK_FAILED_VALID != 0 {
                first.invalid = Some(id);
            }
            if first.missing.is_none() && !node.have_data() {
                first.missing = Some(id);
            }
            if first.never_processed.is_none() && node.tx_count == 0 {
                first.never_processed = Some(id);
            }
            if first.not_tree_valid.is_none() && validity < BLOCK_VALID_TREE {
                first.not_tree_valid = Some(id);
            }
            if has_parent && first.not_transactions_valid.is_none() && validity < BLOCK_VALID_TRANSACTIONS {
                first.not_transactions_valid = Some(id);
            }
            if has_parent && first.not_chain_valid.is_none() && validity < BLOCK_VALID_CHAIN {
                first.not_chain_valid = Some(id);
            }
            if has_parent && first.not_scripts_valid.is_none() && validity < BLOCK_VALID_SCRIPTS {
                first.not_scripts_valid = Some(id);
            }
            firsts.push(first);

            let hex = hash256_to_hex(&node.hash);
            let mut check = |ok: bool, what: &str| {
                if !ok {
                    problems.push(format!("{hex}: {what}"));
                }
            };
            if node.prev.is_none() {
                check(node.hash == self.params.consensus.hash_genesis_block, "genesis hash mismatch");
                check(self.chain.genesis() == Some(id), "genesis is not the active genesis");
            }
            if node.chain_tx == 0 {
                check(node.sequence_id == 0, "unlinked block has a sequence id");
            }
            check(node.have_data() == (node.tx_count > 0), "data flag disagrees with tx count");
            check(first.missing == first.never_processed, "missing data differs from never processed");
            if node.have_undo() {
                check(node.have_data(), "undo without data");
            }
            check(
                (validity >= BLOCK_VALID_TRANSACTIONS) == (node.tx_count > 0),
                "transactions validity disagrees with tx count",
            );
            check(
                first.never_processed.is_some() == (node.chain_tx == 0),
                "chain tx disagrees with parent processing",
            );
            check(
                first.not_transactions_valid.is_some() == (node.chain_tx == 0),
                "chain tx disagrees with parent validity",
            );
            if let Some(prev) = node.prev {
                let parent = self.index.node(prev);
                check(node.height == parent.height + 1, "height is not parent height + 1");
                check(node.chain_work >= parent.chain_work, "chain work below parent");
            } else {
                check(node.height == 0, "root is not at height 0");
            }
            check(
                node.height < 2
                    || node.skip.is_some_and(|skip| self.index.node(skip).height < node.height),
                "skip pointer does not point back",
            );
            check(first.not_tree_valid.is_none(), "entry not tree valid");
            if validity >= BLOCK_VALID_CHAIN {
                check(first.not_chain_valid.is_none(), "chain valid above non chain valid parent");
            }
            if validity >= BLOCK_VALID_SCRIPTS {
                check(first.not_scripts_valid.is_none(), "scripts valid above non scripts valid parent");
            }
            if first.invalid.is_none() {
                check(node.status & BLOCK_FAILED_MASK == 0, "failed without failed ancestor");
            }

            let in_candidates = self.candidates.contains(&candidate_key(&self.index, id));
            if !self.is_worse_than_tip(id) && first.never_processed.is_none() {
                if first.invalid.is_none() && (first.missing.is_none() || Some(id) == self.chain.tip()) {
                    check(in_candidates, "should be a candidate");
                }
            } else {
                check(!in_candidates, "should not be a candidate");
            }

            let in_unlinked = node
                .prev
                .and_then(|prev| self.unlinked.get(&prev))
                .is_some_and(|children| children.contains(&id));
            if node.prev.is_some()
                && node.have_data()
                && first.never_processed.is_some()
                && first.invalid.is_none()
            {
                check(in_unlinked, "should be unlinked");
            }
            if !node.have_data() || first.missing.is_none() {
                check(!in_unlinked, "should not be unlinked");
            }
        }
        problems
    }
}

fn wipe_columns<S: KeyValueStore>(store: &S) -> Result<(), StoreError> {
    let mut batch = WriteBatch::new();
    for column in Column::ALL {
        for (key, _) in store.scan_prefix(column, &[])? {
            batch.delete(column, key);
        }
    }
    store.write_batch(&batch)
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

fn log2_work(work: U256) -> f64 {
    let value = work
        .0
        .iter()
        .rev()
        .fold(0.0f64, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64);
    if value <= 0.0 {
        0.0
    } else {
        value.log2()
    }
}

fn store_undo(
    blocks: &mut BlockStore,
    index: &mut BlockIndex,
    dirty: &mut BTreeSet<NodeId>,
    id: NodeId,
    undo: &BlockUndo,
) -> Result<(), ChainStateError> {
    let node = index.node(id);
    if node.have_undo() && node.is_valid(BLOCK_VALID_SCRIPTS) {
        return Ok(());
    }
    if !node.have_undo() {
        let payload = undo.encode();
        let record = blocks.find_undo_pos(node.file, payload.len() as u32 + UNDO_RECORD_OVERHEAD);
        let location = blocks.write_undo(&payload, record, &node.prev_hash)?;
        let node = index.node_mut(id);
        node.undo_pos = location.pos;
        node.status |= BLOCK_HAVE_UNDO;
    }
    index.node_mut(id).raise_validity(BLOCK_VALID_SCRIPTS);
    dirty.insert(id);
    Ok(())
}

/// What [`connect_block`] needs from the chain state, borrowed field by
/// field so the coin tip can be borrowed mutably next to it.
struct ConnectContext<'a> {
    consensus: &'a ConsensusParams,
    index: &'a BlockIndex,
    versionbits: &'a mut VersionBitsCache,
    verifier: &'a dyn ScriptVerifier,
    metrics: &'a ValidationMetrics,
    last_checkpoint: Option<NodeId>,
    adjusted_time: i64,
}

/// Position of the block being connected. `hash` is `None` for a block
/// that is not in the index yet.
#[derive(Clone, Copy, Debug)]
struct BlockTarget {
    hash: Option<Hash256>,
    height: i32,
    prev: Option<NodeId>,
}

/// Applies `block` to `view` and returns its undo data. With `just_check`
/// nothing about the block is remembered and no undo is produced.
fn connect_block(
    ctx: &mut ConnectContext<'_>,
    block: &Block,
    target: &BlockTarget,
    view: &mut CoinsViewCache<'_>,
    just_check: bool,
) -> Result<Option<BlockUndo>, ChainStateError> {
    let started = Instant::now();
    check_block(block, ctx.consensus, ctx.adjusted_time, !just_check, !just_check)?;

    let prev_hash = target.prev.map_or([0u8; 32], |prev| ctx.index.node(prev).hash);
    if view.best_block()? != prev_hash {
        return Err(ChainStateError::Corrupt(
            "coin view is not at the parent block".to_string(),
        ));
    }
    let block_hash = block.hash();
    if block_hash == ctx.consensus.hash_genesis_block {
        if !just_check {
            view.set_best_block(block_hash);
        }
        return Ok(None);
    }
    let Some(prev) = target.prev else {
        return Err(ChainStateError::Corrupt("block without parent".to_string()));
    };

    // Blocks under the last checkpoint were verified by whoever set it.
    let script_checks = !matches!(
        (ctx.last_checkpoint, target.hash),
        (Some(checkpoint), Some(hash))
            if ctx.index.ancestor(checkpoint, target.height)
                .is_some_and(|id| ctx.index.node(id).hash == hash)
    );

    let mut enforce_bip30 = target
        .hash
        .map_or(true, |hash| !ctx.consensus.is_bip30_exception(target.height, &hash));
    if let Some((bip34_height, bip34_hash)) = ctx.consensus.bip34 {
        if ctx
            .index
            .ancestor(prev, bip34_height)
            .is_some_and(|id| ctx.index.node(id).hash == bip34_hash)
        {
            enforce_bip30 = false;
        }
    }
    if enforce_bip30 {
        for tx in &block.transactions {
            if view
                .access_coins(&tx.txid())?
                .is_some_and(|coins| !coins.is_pruned())
            {
                return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-BIP30")
                    .with_debug("tried to overwrite transaction")
                    .into());
            }
        }
    }

    let mut flags = base_script_flags(block.header.time as i64);
    let strict_p2sh = flags & SCRIPT_VERIFY_P2SH != 0;
    let enforce = ctx.consensus.majority_enforce_block_upgrade;
    let window = ctx.consensus.majority_window;
    if block.header.version >= 3 && ctx.index.is_super_majority(3, Some(prev), enforce, window) {
        flags |= SCRIPT_VERIFY_DERSIG;
    }
    if block.header.version >= 4 && ctx.index.is_super_majority(4, Some(prev), enforce, window) {
        flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
    }
    let mut lock_time_flags = 0;
    if ctx
        .versionbits
        .state(ctx.index, Some(prev), ctx.consensus, DeploymentPos::Csv)
        == ThresholdState::Active
    {
        flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
        lock_time_flags |= LOCKTIME_VERIFY_SEQUENCE;
    }

    let mut undo = BlockUndo {
        txs: Vec::with_capacity(block.transactions.len().saturating_sub(1)),
    };
    let mut checks: Vec<ScriptCheck<'_>> = Vec::new();
    let mut fees: Amount = 0;
    let mut inputs = 0usize;
    let mut sigops = 0u32;
    let mut prev_heights = Vec::new();
    for (position, tx) in block.transactions.iter().enumerate() {
        inputs += tx.vin.len();
        sigops += legacy_sigop_count(tx);
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-blk-sigops")
                .with_debug("too many sigops")
                .into());
        }

        if !tx.is_coinbase() {
            if !view.have_inputs(tx)? {
                return Err(
                    ValidationState::dos(100, REJECT_INVALID, "bad-txns-inputs-missingorspent")
                        .with_debug("inputs missing/spent")
                        .into(),
                );
            }
            prev_heights.clear();
            for input in &tx.vin {
                let height = view
                    .access_coins(&input.prevout.hash)?
                    .map_or(0, |coins| coins.height);
                prev_heights.push(height);
            }
            if !sequence_locks(tx, lock_time_flags, &mut prev_heights, ctx.index, prev) {
                return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-nonfinal")
                    .with_debug("contains a non-BIP68-final transaction")
                    .into());
            }
            if strict_p2sh {
                sigops += p2sh_sigop_count(tx, view)?;
                if sigops > MAX_BLOCK_SIGOPS {
                    return Err(ValidationState::dos(100, REJECT_INVALID, "bad-blk-sigops")
                        .with_debug("too many sigops")
                        .into());
                }
            }
            let fee = check_inputs(
                tx,
                view,
                target.height,
                script_checks,
                flags,
                just_check,
                ctx.verifier,
                Some(&mut checks),
            )?
            .map_err(|state| {
                log_debug!(
                    "connect_block: check_inputs on {} failed with {state}",
                    hash256_to_hex(&tx.txid())
                );
                state
            })?;
            fees += fee;
        }

        let tx_undo = if position > 0 {
            undo.txs.push(TxUndo::default());
            undo.txs.last_mut()
        } else {
            None
        };
        update_coins(tx, view, tx_undo, target.height)?;
    }
    let connect_elapsed = started.elapsed();
    log_cat!(
        Category::Bench,
        "      - connect {} transactions: {:.2}ms ({:.3}ms/tx, {:.3}ms/txin)",
        block.transactions.len(),
        millis(connect_elapsed),
        millis(connect_elapsed) / block.transactions.len().max(1) as f64,
        millis(connect_elapsed) / inputs.max(1) as f64
    );

    let limit = fees + block_subsidy(target.height, ctx.consensus);
    let paid = block.transactions[0].value_out().unwrap_or(Amount::MAX);
    if paid > limit {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-cb-amount")
            .with_debug(format!("coinbase pays too much (actual={paid} vs limit={limit})"))
            .into());
    }

    let scripts_started = Instant::now();
    run_script_checks(&checks, ctx.verifier)?;
    ctx.metrics.record_scripts(scripts_started.elapsed(), checks.len());
    ctx.metrics.record_connect(started.elapsed());
    log_cat!(
        Category::Bench,
        "    - verify {} txins: {:.2}ms",
        inputs,
        millis(started.elapsed())
    );

    if just_check {
        return Ok(None);
    }
    if let Some(hash) = target.hash {
        view.set_best_block(hash);
    }
    Ok(Some(undo))
}

/// Spends the inputs of `tx` and adds its outputs at `height`. Spent
/// outputs are recorded in `undo` when given.
pub fn update_coins(
    tx: &Transaction,
    view: &mut CoinsViewCache<'_>,
    undo: Option<&mut TxUndo>,
    height: i32,
) -> Result<(), ChainStateError> {
    let txid = tx.txid();
    if !tx.is_coinbase() {
        let mut spent = Vec::with_capacity(tx.vin.len());
        for input in &tx.vin {
            let prevout = &input.prevout;
            match view.modify_coins(&prevout.hash, |coins| coins.spend(prevout.index))? {
                Some(entry) => spent.push(entry),
                None => {
                    return Err(ChainStateError::Corrupt(format!(
                        "update_coins: {prevout} is not available"
                    )))
                }
            }
        }
        if let Some(undo) = undo {
            undo.prevouts = spent;
        }
        view.modify_new_coins(&txid, |coins| *coins = Coins::from_tx(tx, height));
    } else {
        view.modify_coins(&txid, |coins| *coins = Coins::from_tx(tx, height))?;
    }
    Ok(())
}

/// Reverts `block` on `view`. Returns `false` when the view did not look
/// like the block had just been connected; the revert still completes.
pub fn disconnect_block(
    block: &Block,
    height: i32,
    prev_hash: Hash256,
    undo: &BlockUndo,
    view: &mut CoinsViewCache<'_>,
) -> Result<bool, ChainStateError> {
    if undo.txs.len() + 1 != block.transactions.len() {
        return Err(ChainStateError::Corrupt(
            "disconnect_block: block and undo data inconsistent".to_string(),
        ));
    }
    let mut clean = true;
    for (position, tx) in block.transactions.iter().enumerate().rev() {
        let expected = Coins::from_tx(tx, height);
        let matched = view.modify_coins(&tx.txid(), |coins| {
            coins.cleanup();
            let matched = (coins.is_pruned() && expected.is_pruned()) || *coins == expected;
            coins.clear();
            matched
        })?;
        if !matched {
            log_error!("disconnect_block: added transaction mismatch? database corrupted");
            clean = false;
        }

        if position > 0 {
            let tx_undo = &undo.txs[position - 1];
            if tx_undo.prevouts.len() != tx.vin.len() {
                return Err(ChainStateError::Corrupt(
                    "disconnect_block: transaction and undo data inconsistent".to_string(),
                ));
            }
            for (input, prevout) in tx.vin.iter().zip(&tx_undo.prevouts).rev() {
                if !apply_tx_in_undo(prevout, view, &input.prevout)? {
                    clean = false;
                }
            }
        }
    }
    view.set_best_block(prev_hash);
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::EmptyCoinsView;
    use coind_primitives::outpoint::OutPoint;
    use coind_primitives::transaction::{TxIn, TxOut};

    fn coinbase(value: Amount, tag: u8) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, tag],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn spend(prev: &Transaction, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: prev.txid(),
                    index: 0,
                },
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn update_then_disconnect_restores_the_view() {
        let funding = coinbase(50, 1);
        let mut base = EmptyCoinsView;
        let mut view = CoinsViewCache::new(&mut base);
        update_coins(&funding, &mut view, None, 1).expect("coinbase");
        view.set_best_block([1u8; 32]);

        let block = Block {
            header: BlockHeader::default(),
            transactions: vec![coinbase(25, 2), spend(&funding, 40)],
        };
        let mut undo = BlockUndo::default();
        update_coins(&block.transactions[0], &mut view, None, 2).expect("coinbase");
        undo.txs.push(TxUndo::default());
        update_coins(&block.transactions[1], &mut view, undo.txs.last_mut(), 2).expect("spend");
        assert!(!view.have_coins(&funding.txid()).expect("lookup"));
        assert_eq!(undo.txs[0].prevouts.len(), 1);

        let clean = disconnect_block(&block, 2, [1u8; 32], &undo, &mut view).expect("disconnect");
        assert!(clean);
        let restored = view
            .access_coins(&funding.txid())
            .expect("lookup")
            .cloned()
            .expect("restored");
        assert_eq!(restored, Coins::from_tx(&funding, 1));
        assert!(!view.have_coins(&block.transactions[1].txid()).expect("lookup"));
        assert_eq!(view.best_block().expect("best"), [1u8; 32]);
    }

    #[test]
    fn spending_a_missing_output_is_corruption() {
        let mut base = EmptyCoinsView;
        let mut view = CoinsViewCache::new(&mut base);
        let orphan = spend(&coinbase(50, 9), 10);
        assert!(matches!(
            update_coins(&orphan, &mut view, None, 5),
            Err(ChainStateError::Corrupt(_))
        ));
    }

    #[test]
    fn undo_length_must_match_the_block() {
        let mut base = EmptyCoinsView;
        let mut view = CoinsViewCache::new(&mut base);
        let block = Block {
            header: BlockHeader::default(),
            transactions: vec![coinbase(50, 1), coinbase(50, 2)],
        };
        assert!(matches!(
            disconnect_block(&block, 1, [0u8; 32], &BlockUndo::default(), &mut view),
            Err(ChainStateError::Corrupt(_))
        ));
    }

    #[test]
    fn candidate_order_prefers_work_then_arrival() {
        let low = CandidateKey {
            work: U256::from(10u8),
            sequence: Reverse(1),
            id: Reverse(1),
        };
        let high = CandidateKey {
            work: U256::from(11u8),
            sequence: Reverse(9),
            id: Reverse(9),
        };
        let early = CandidateKey {
            work: U256::from(10u8),
            sequence: Reverse(0),
            id: Reverse(7),
        };
        assert!(low < high);
        assert!(low < early);
        assert_eq!(
            BTreeSet::from([low, high, early]).iter().next_back(),
            Some(&high)
        );
    }

    #[test]
    fn log2_of_chain_work() {
        assert_eq!(log2_work(U256::from(1024u32)), 10.0);
        assert!((log2_work(U256::one() << 100) - 100.0).abs() < 1e-9);
        assert_eq!(log2_work(U256::zero()), 0.0);
    }
}
