//! Per-peer block download bookkeeping.
//!
//! Everything here runs under the node lock. Functions that need the block
//! graph take the index and active chain by reference so the scheduler can
//! sit next to a borrowed [`ChainState`](coind_chainstate::ChainState).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use coind_chainstate::blockindex::BLOCK_VALID_TREE;
use coind_chainstate::{ActiveChain, BlockIndex, NodeId, PeerId};
use coind_consensus::params::ConsensusParams;
use coind_consensus::{hash256_to_hex, Hash256};
use coind_log::{log_cat, log_error, log_info, Category};

use crate::wire::{Inv, MSG_TX};

pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 16;
/// Blocks beyond the last common block that may be requested at once.
pub const BLOCK_DOWNLOAD_WINDOW: i32 = 1024;
/// Microseconds a peer may hold up the download window.
pub const BLOCK_STALLING_TIMEOUT: i64 = 2_000_000;
/// Block download timeout in units of the target spacing, in millionths.
pub const BLOCK_DOWNLOAD_TIMEOUT_BASE: i64 = 1_000_000;
pub const BLOCK_DOWNLOAD_TIMEOUT_PER_PEER: i64 = 500_000;
pub const MAX_HEADERS_RESULTS: usize = 2000;
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;
pub const MAX_INV_SZ: usize = 50_000;
pub const MAX_GETBLOCKS_RESULTS: usize = 500;
pub const MAX_REJECT_MESSAGE_LENGTH: usize = 111;
/// Microseconds between pings.
pub const PING_INTERVAL: i64 = 120_000_000;
pub use coind_consensus::constants::SENDHEADERS_VERSION;
pub const MIN_PEER_PROTO_VERSION: i32 = 209;
pub const DEFAULT_BANSCORE_THRESHOLD: i32 = 100;
const INVENTORY_KNOWN_CAP: usize = 50_000;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub ban_score: i32,
    pub max_orphan_tx: usize,
    /// Relay transactions from whitelisted peers even when they were not
    /// accepted to the mempool.
    pub whitelist_force_relay: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ban_score: DEFAULT_BANSCORE_THRESHOLD,
            max_orphan_tx: crate::orphans::DEFAULT_MAX_ORPHAN_TRANSACTIONS,
            whitelist_force_relay: true,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueuedBlock {
    pub hash: Hash256,
    pub index: Option<NodeId>,
    /// Whether the header was validated before the request went out.
    pub validated_headers: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockReject {
    pub code: u8,
    pub reason: String,
    pub hash: Hash256,
}

/// How a new peer connection looks from the outside.
#[derive(Clone, Debug, Default)]
pub struct PeerInfo {
    pub address: String,
    pub inbound: bool,
    pub whitelisted: bool,
    pub one_shot: bool,
}

#[derive(Clone, Debug)]
pub struct PeerState {
    pub id: PeerId,
    pub address: String,
    pub name: String,
    pub inbound: bool,
    pub whitelisted: bool,
    pub one_shot: bool,
    pub connected: bool,
    pub disconnect: bool,

    pub misbehavior: i32,
    pub should_ban: bool,
    pub rejects: Vec<BlockReject>,

    pub best_known_block: Option<NodeId>,
    pub last_unknown_block: Option<Hash256>,
    pub last_common_block: Option<NodeId>,
    pub best_header_sent: Option<NodeId>,
    pub sync_started: bool,
    /// Microseconds; zero when not stalling.
    pub stalling_since: i64,
    pub downloading_since: i64,
    pub blocks_in_flight: VecDeque<QueuedBlock>,
    pub blocks_in_flight_valid_headers: usize,
    pub preferred_download: bool,
    pub prefer_headers: bool,

    pub version: i32,
    pub services: u64,
    pub start_height: i32,
    pub relay_txes: bool,
    pub successfully_connected: bool,
    /// Peer does not serve blocks.
    pub client: bool,

    pub ping_nonce_sent: u64,
    pub ping_start: i64,
    pub ping_time: Option<i64>,
    pub min_ping_time: Option<i64>,
    pub ping_queued: bool,

    pub inventory_known: HashSet<Inv>,
    pub inventory_to_send: Vec<Inv>,
    pub blocks_to_announce: Vec<Hash256>,
    pub get_data_queue: VecDeque<Inv>,
    /// Transactions announced by the peer that we want.
    pub ask_for: VecDeque<Inv>,
    /// Block whose delivery triggers an inv of our tip so the peer keeps
    /// asking with getblocks.
    pub hash_continue: Option<Hash256>,
}

impl PeerState {
    fn new(id: PeerId, info: PeerInfo) -> Self {
        Self {
            id,
            name: info.address.clone(),
            address: info.address,
            inbound: info.inbound,
            whitelisted: info.whitelisted,
            one_shot: info.one_shot,
            connected: false,
            disconnect: false,
            misbehavior: 0,
            should_ban: false,
            rejects: Vec::new(),
            best_known_block: None,
            last_unknown_block: None,
            last_common_block: None,
            best_header_sent: None,
            sync_started: false,
            stalling_since: 0,
            downloading_since: 0,
            blocks_in_flight: VecDeque::new(),
            blocks_in_flight_valid_headers: 0,
            preferred_download: false,
            prefer_headers: false,
            version: 0,
            services: 0,
            start_height: -1,
            relay_txes: false,
            successfully_connected: false,
            client: false,
            ping_nonce_sent: 0,
            ping_start: 0,
            ping_time: None,
            min_ping_time: None,
            ping_queued: false,
            inventory_known: HashSet::new(),
            inventory_to_send: Vec::new(),
            blocks_to_announce: Vec::new(),
            get_data_queue: VecDeque::new(),
            ask_for: VecDeque::new(),
            hash_continue: None,
        }
    }

    pub fn add_inventory_known(&mut self, inv: Inv) {
        if self.inventory_known.len() >= INVENTORY_KNOWN_CAP {
            self.inventory_known.clear();
        }
        self.inventory_known.insert(inv);
    }

    /// Queues `inv` for the next announcement. Transactions the peer
    /// already knows are skipped.
    pub fn push_inventory(&mut self, inv: Inv) {
        if inv.inv_type == MSG_TX && self.inventory_known.contains(&inv) {
            return;
        }
        self.inventory_to_send.push(inv);
    }

    pub fn queue_ask_for(&mut self, inv: Inv) {
        if !self.ask_for.contains(&inv) {
            self.ask_for.push_back(inv);
        }
    }

    pub fn push_block_hash(&mut self, hash: Hash256) {
        self.blocks_to_announce.push(hash);
    }
}

#[derive(Debug, Default)]
pub struct SyncState {
    pub config: SyncConfig,
    peers: BTreeMap<PeerId, PeerState>,
    /// Peers we started a headers sync with.
    pub sync_started: usize,
    pub preferred_download: usize,
    pub peers_with_validated_downloads: usize,
    blocks_in_flight: HashMap<Hash256, PeerId>,
    /// Transactions rejected since the tip was `recent_rejects_tip`.
    recent_rejects: HashSet<Hash256>,
    recent_rejects_tip: Option<Hash256>,
}

impl SyncState {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn peer(&self, id: PeerId) -> Option<&PeerState> {
        self.peers.get(&id)
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut PeerState> {
        self.peers.get_mut(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values()
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut PeerState> {
        self.peers.values_mut()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn blocks_in_flight(&self) -> usize {
        self.blocks_in_flight.len()
    }

    pub fn in_flight_from(&self, hash: &Hash256) -> Option<PeerId> {
        self.blocks_in_flight.get(hash).copied()
    }

    pub fn initialize_node(&mut self, id: PeerId, info: PeerInfo) {
        self.peers.insert(id, PeerState::new(id, info));
    }

    /// Drops a disconnected peer and returns its final state.
    pub fn finalize_node(&mut self, id: PeerId) -> Option<PeerState> {
        let mut state = self.peers.remove(&id)?;
        if state.sync_started {
            self.sync_started -= 1;
        }
        if state.misbehavior == 0 && state.connected {
            log_cat!(Category::Net, "peer={id} disconnected cleanly");
        }
        for queued in state.blocks_in_flight.drain(..) {
            self.blocks_in_flight.remove(&queued.hash);
        }
        if state.preferred_download {
            self.preferred_download -= 1;
        }
        if state.blocks_in_flight_valid_headers != 0 {
            self.peers_with_validated_downloads -= 1;
        }
        if self.peers.is_empty() {
            let consistent = self.blocks_in_flight.is_empty()
                && self.preferred_download == 0
                && self.peers_with_validated_downloads == 0;
            if !consistent {
                log_error!(
                    "finalize_node: dangling download state after last peer (in flight {}, preferred {}, validated {})",
                    self.blocks_in_flight.len(),
                    self.preferred_download,
                    self.peers_with_validated_downloads
                );
            }
            debug_assert!(consistent);
        }
        Some(state)
    }

    /// Adds to a peer's misbehavior score. Returns true when this call
    /// pushed it over the ban threshold.
    pub fn misbehaving(&mut self, id: PeerId, howmuch: i32) -> bool {
        if howmuch == 0 {
            return false;
        }
        let threshold = self.config.ban_score;
        let Some(state) = self.peers.get_mut(&id) else {
            return false;
        };
        let before = state.misbehavior;
        state.misbehavior += howmuch;
        if state.misbehavior >= threshold && before < threshold {
            log_info!(
                "misbehaving: {} ({before} -> {}) BAN THRESHOLD EXCEEDED",
                state.name,
                state.misbehavior
            );
            state.should_ban = true;
            true
        } else {
            log_info!("misbehaving: {} ({before} -> {})", state.name, state.misbehavior);
            false
        }
    }

    pub fn update_preferred_download(&mut self, id: PeerId) {
        let Some(state) = self.peers.get_mut(&id) else {
            return;
        };
        if state.preferred_download {
            self.preferred_download -= 1;
        }
        state.preferred_download =
            (!state.inbound || state.whitelisted) && !state.one_shot && !state.client;
        if state.preferred_download {
            self.preferred_download += 1;
        }
    }

    /// Marks the start of a headers sync with `id`.
    pub fn start_sync(&mut self, id: PeerId) {
        if let Some(state) = self.peers.get_mut(&id) {
            if !state.sync_started {
                state.sync_started = true;
                self.sync_started += 1;
            }
        }
    }

    /// Forgets an outstanding request. Returns whether it was in flight.
    pub fn mark_block_as_received(&mut self, hash: &Hash256, now: i64) -> bool {
        let Some(peer) = self.blocks_in_flight.remove(hash) else {
            return false;
        };
        let Some(state) = self.peers.get_mut(&peer) else {
            return true;
        };
        let Some(position) = state.blocks_in_flight.iter().position(|q| &q.hash == hash) else {
            return true;
        };
        let queued = state.blocks_in_flight.remove(position).unwrap_or_else(|| QueuedBlock {
            hash: *hash,
            index: None,
            validated_headers: false,
        });
        if queued.validated_headers {
            state.blocks_in_flight_valid_headers -= 1;
            if state.blocks_in_flight_valid_headers == 0 {
                self.peers_with_validated_downloads -= 1;
            }
        }
        if position == 0 {
            // The next queued block starts its download clock now.
            state.downloading_since = state.downloading_since.max(now);
        }
        state.stalling_since = 0;
        true
    }

    pub fn mark_block_as_in_flight(
        &mut self,
        id: PeerId,
        hash: Hash256,
        index: Option<NodeId>,
        now: i64,
    ) {
        self.mark_block_as_received(&hash, now);
        let Some(state) = self.peers.get_mut(&id) else {
            return;
        };
        let validated_headers = index.is_some();
        state.blocks_in_flight.push_back(QueuedBlock {
            hash,
            index,
            validated_headers,
        });
        if validated_headers {
            state.blocks_in_flight_valid_headers += 1;
            if state.blocks_in_flight_valid_headers == 1 {
                self.peers_with_validated_downloads += 1;
            }
        }
        if state.blocks_in_flight.len() == 1 {
            state.downloading_since = now;
        }
        self.blocks_in_flight.insert(hash, id);
    }

    /// Resolves a previously announced but unknown block, if we know it now.
    pub fn process_block_availability(&mut self, index: &BlockIndex, id: PeerId) {
        let Some(state) = self.peers.get_mut(&id) else {
            return;
        };
        let Some(hash) = state.last_unknown_block else {
            return;
        };
        if let Some(node_id) = index.lookup(&hash) {
            let node = index.node(node_id);
            if !node.chain_work.is_zero() {
                let better = state
                    .best_known_block
                    .map_or(true, |best| node.chain_work >= index.node(best).chain_work);
                if better {
                    state.best_known_block = Some(node_id);
                }
                state.last_unknown_block = None;
            }
        }
    }

    pub fn update_block_availability(&mut self, index: &BlockIndex, id: PeerId, hash: Hash256) {
        self.process_block_availability(index, id);
        let Some(state) = self.peers.get_mut(&id) else {
            return;
        };
        match index.lookup(&hash) {
            Some(node_id) if !index.node(node_id).chain_work.is_zero() => {
                let work = index.node(node_id).chain_work;
                let better = state
                    .best_known_block
                    .map_or(true, |best| work >= index.node(best).chain_work);
                if better {
                    state.best_known_block = Some(node_id);
                }
            }
            _ => state.last_unknown_block = Some(hash),
        }
    }

    /// Up to `count` blocks to request from `id`, and the peer holding up
    /// the download window when nothing could be picked.
    pub fn find_next_blocks_to_download(
        &mut self,
        index: &BlockIndex,
        chain: &ActiveChain,
        id: PeerId,
        count: usize,
    ) -> (Vec<NodeId>, Option<PeerId>) {
        let mut blocks = Vec::new();
        if count == 0 {
            return (blocks, None);
        }
        self.process_block_availability(index, id);
        let Some(state) = self.peers.get_mut(&id) else {
            return (blocks, None);
        };
        let Some(best_known) = state.best_known_block else {
            return (blocks, None);
        };
        let Some(tip) = chain.tip() else {
            return (blocks, None);
        };
        if index.node(best_known).chain_work < index.node(tip).chain_work {
            return (blocks, None);
        }

        let start = state.last_common_block.or_else(|| {
            chain.at(index.node(best_known).height.min(chain.height()))
        });
        let Some(common) = start.and_then(|s| index.last_common_ancestor(s, best_known)) else {
            return (blocks, None);
        };
        state.last_common_block = Some(common);
        if common == best_known {
            return (blocks, None);
        }

        let mut walk = common;
        let window_end = index.node(common).height + BLOCK_DOWNLOAD_WINDOW;
        let max_height = index.node(best_known).height.min(window_end + 1);
        let mut waiting_for: Option<PeerId> = None;
        while index.node(walk).height < max_height {
            let remaining = count.saturating_sub(blocks.len()).max(128) as i32;
            let to_fetch = (max_height - index.node(walk).height).min(remaining);
            let Some(last) = index.ancestor(best_known, index.node(walk).height + to_fetch) else {
                return (blocks, None);
            };
            walk = last;
            let mut batch = Vec::with_capacity(to_fetch as usize);
            let mut cursor = Some(last);
            for _ in 0..to_fetch {
                let Some(current) = cursor else {
                    break;
                };
                batch.push(current);
                cursor = index.prev(current);
            }
            batch.reverse();

            for node_id in batch {
                let node = index.node(node_id);
                if !node.is_valid(BLOCK_VALID_TREE) {
                    // Parts of this chain are invalid; we are not going to
                    // download it.
                    return (blocks, None);
                }
                if node.have_data() || chain.contains(index, node_id) {
                    if node.chain_tx != 0 {
                        state.last_common_block = Some(node_id);
                    }
                } else if let Some(&holder) = self.blocks_in_flight.get(&node.hash) {
                    if waiting_for.is_none() {
                        waiting_for = Some(holder);
                    }
                } else {
                    if node.height > window_end {
                        // The window is full of requests to someone else.
                        let staller = if blocks.is_empty() && waiting_for != Some(id) {
                            waiting_for
                        } else {
                            None
                        };
                        return (blocks, staller);
                    }
                    blocks.push(node_id);
                    if blocks.len() == count {
                        return (blocks, None);
                    }
                }
            }
        }
        (blocks, None)
    }

    /// Whether the tip is recent enough to fetch announced blocks directly.
    pub fn can_direct_fetch(
        index: &BlockIndex,
        chain: &ActiveChain,
        consensus: &ConsensusParams,
        adjusted_time: i64,
    ) -> bool {
        chain.tip().map_or(false, |tip| {
            index.node(tip).block_time() > adjusted_time - consensus.pow_target_spacing * 20
        })
    }

    pub fn peer_has_header(&self, index: &BlockIndex, id: PeerId, node_id: NodeId) -> bool {
        let Some(state) = self.peers.get(&id) else {
            return false;
        };
        let height = index.node(node_id).height;
        let covers = |best: Option<NodeId>| {
            best.and_then(|best| index.ancestor(best, height)) == Some(node_id)
        };
        covers(state.best_known_block) || covers(state.best_header_sent)
    }

    /// Remembers a rejected transaction until the tip changes.
    pub fn add_recent_reject(&mut self, hash: Hash256) {
        self.recent_rejects.insert(hash);
    }

    pub fn is_recent_reject(&mut self, tip: Option<Hash256>, hash: &Hash256) -> bool {
        if self.recent_rejects_tip != tip {
            // Rejections may have depended on the old tip.
            self.recent_rejects_tip = tip;
            self.recent_rejects.clear();
        }
        self.recent_rejects.contains(hash)
    }

    pub fn queue_block_reject(&mut self, id: PeerId, reject: BlockReject) {
        if let Some(state) = self.peers.get_mut(&id) {
            log_cat!(
                Category::Net,
                "queueing reject {} for block {} to peer={id}",
                reject.reason,
                hash256_to_hex(&reject.hash)
            );
            state.rejects.push(reject);
        }
    }
}

/// First block of `locator` that is on the active chain, or genesis.
pub fn find_fork_in_global_index(
    index: &BlockIndex,
    chain: &ActiveChain,
    locator: &[Hash256],
) -> Option<NodeId> {
    locator
        .iter()
        .filter_map(|hash| index.lookup(hash))
        .find(|id| chain.contains(index, *id))
        .or_else(|| chain.genesis())
}

pub fn get_locator(index: &BlockIndex, chain: &ActiveChain, from: Option<NodeId>) -> Vec<Hash256> {
    chain.locator(index, from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::block::BlockHeader;

    fn outbound() -> PeerInfo {
        PeerInfo {
            address: "10.0.0.1:8333".to_string(),
            ..PeerInfo::default()
        }
    }

    #[test]
    fn in_flight_accounting_balances() {
        let mut sync = SyncState::new(SyncConfig::default());
        sync.initialize_node(1, outbound());
        sync.mark_block_as_in_flight(1, [1; 32], Some(5), 100);
        sync.mark_block_as_in_flight(1, [2; 32], None, 200);
        assert_eq!(sync.peers_with_validated_downloads, 1);
        assert_eq!(sync.peer(1).expect("peer").downloading_since, 100);
        assert_eq!(sync.in_flight_from(&[2; 32]), Some(1));

        assert!(sync.mark_block_as_received(&[1; 32], 300));
        assert!(!sync.mark_block_as_received(&[1; 32], 300));
        assert_eq!(sync.peers_with_validated_downloads, 0);
        assert_eq!(sync.peer(1).expect("peer").downloading_since, 300);

        assert_eq!(sync.peer(1).expect("peer").blocks_in_flight.len(), 1);
        assert_eq!(sync.blocks_in_flight(), 1);
        let state = sync.finalize_node(1).expect("state");
        assert!(state.blocks_in_flight.is_empty());
        assert_eq!(sync.blocks_in_flight(), 0);
        assert_eq!(sync.in_flight_from(&[2; 32]), None);
    }

    /// A header chain of `len` blocks over a genesis-only active chain.
    fn header_chain(len: u32) -> (BlockIndex, ActiveChain, Vec<NodeId>) {
        let mut index = BlockIndex::new();
        let mut ids = Vec::new();
        let mut prev = [0u8; 32];
        for n in 0..len {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: 1_000 + n * 600,
                bits: 0x207f_ffff,
                nonce: n,
            };
            prev = header.hash();
            let id = index.insert_header(prev, &header);
            index.node_mut(id).raise_validity(BLOCK_VALID_TREE);
            ids.push(id);
        }
        let mut chain = ActiveChain::new();
        chain.set_tip(&index, Some(ids[0]));
        (index, chain, ids)
    }

    #[test]
    fn full_download_window_names_the_staller() {
        let (index, chain, ids) = header_chain(BLOCK_DOWNLOAD_WINDOW as u32 + 6);
        let tip_hash = index.node(*ids.last().expect("tip")).hash;
        let mut sync = SyncState::new(SyncConfig::default());
        for peer in [1, 2] {
            sync.initialize_node(peer, outbound());
            sync.update_block_availability(&index, peer, tip_hash);
        }

        let (blocks, staller) = sync.find_next_blocks_to_download(&index, &chain, 1, 16);
        assert_eq!(blocks, ids[1..17].to_vec());
        assert_eq!(staller, None);

        // Peer 2 holds every block of the window.
        for &id in &ids[1..=BLOCK_DOWNLOAD_WINDOW as usize] {
            sync.mark_block_as_in_flight(2, index.node(id).hash, Some(id), 0);
        }
        let (blocks, staller) = sync.find_next_blocks_to_download(&index, &chain, 1, 16);
        assert!(blocks.is_empty());
        assert_eq!(staller, Some(2));

        // The holder itself is never reported as stalling itself.
        let (blocks, staller) = sync.find_next_blocks_to_download(&index, &chain, 2, 16);
        assert!(blocks.is_empty());
        assert_eq!(staller, None);
    }

    #[test]
    fn ban_threshold_is_reported_once() {
        let mut sync = SyncState::new(SyncConfig::default());
        sync.initialize_node(3, outbound());
        assert!(!sync.misbehaving(3, 50));
        assert!(sync.misbehaving(3, 50));
        assert!(!sync.misbehaving(3, 10));
        let state = sync.peer(3).expect("peer");
        assert!(state.should_ban);
        assert_eq!(state.misbehavior, 110);
    }

    #[test]
    fn preferred_download_counts_outbound_and_whitelisted() {
        let mut sync = SyncState::new(SyncConfig::default());
        sync.initialize_node(1, outbound());
        sync.initialize_node(
            2,
            PeerInfo {
                inbound: true,
                ..PeerInfo::default()
            },
        );
        sync.initialize_node(
            3,
            PeerInfo {
                inbound: true,
                whitelisted: true,
                ..PeerInfo::default()
            },
        );
        for id in 1..=3 {
            sync.update_preferred_download(id);
        }
        sync.update_preferred_download(1);
        assert_eq!(sync.preferred_download, 2);
        sync.finalize_node(3);
        assert_eq!(sync.preferred_download, 1);
    }

    #[test]
    fn recent_rejects_reset_on_new_tip() {
        let mut sync = SyncState::new(SyncConfig::default());
        assert!(!sync.is_recent_reject(Some([1; 32]), &[9; 32]));
        sync.add_recent_reject([9; 32]);
        assert!(sync.is_recent_reject(Some([1; 32]), &[9; 32]));
        assert!(!sync.is_recent_reject(Some([2; 32]), &[9; 32]));
    }
}
