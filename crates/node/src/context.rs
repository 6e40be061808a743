//! Message handling for the node: chain state, mempool and per-peer sync
//! bookkeeping behind one lock.
//!
//! The transport is not part of this module. A connection layer feeds
//! decoded [`NetMessage`]s into [`NodeContext::process_message`], calls
//! [`NodeContext::send_messages`] on its own schedule, and carries out the
//! returned [`PeerAction`]s.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};

use coind_chainstate::blockindex::{BLOCK_VALID_SCRIPTS, BLOCK_VALID_TREE};
use coind_chainstate::flatfiles::FileLocation;
use coind_chainstate::state::{BlockRejection, FlushMode};
use coind_chainstate::validation::{ValidationResult, REJECT_DUPLICATE, REJECT_OBSOLETE};
use coind_chainstate::{ChainEvent, ChainState, ChainStateError, ConnectTrace, NodeId, PeerId};
use coind_chainstate::{TipUpdate, ValidationState};
use coind_consensus::constants::{PROTOCOL_VERSION, STANDARD_LOCKTIME_VERIFY_FLAGS};
use coind_consensus::{hash256_to_hex, Hash256};
use coind_log::{log_cat, log_error, log_info, log_warn, Category};
use coind_pow::difficulty::block_proof_equivalent_time;
use coind_primitives::block::{Block, BlockHeader};
use coind_primitives::transaction::Transaction;
use coind_storage::KeyValueStore;

use crate::accept::{
    accept_to_memory_pool, limit_mempool_size, AcceptOptions, AcceptOutcome, FreeRelayLimiter,
    MempoolPolicy,
};
use crate::mempool::{Mempool, Txid};
use crate::orphans::OrphanPool;
use crate::sync::{
    find_fork_in_global_index, get_locator, BlockReject, PeerInfo, SyncConfig, SyncState,
    BLOCK_DOWNLOAD_TIMEOUT_BASE, BLOCK_DOWNLOAD_TIMEOUT_PER_PEER, BLOCK_STALLING_TIMEOUT,
    MAX_BLOCKS_IN_TRANSIT_PER_PEER, MAX_BLOCKS_TO_ANNOUNCE, MAX_GETBLOCKS_RESULTS,
    MAX_HEADERS_RESULTS, MAX_INV_SZ, MAX_REJECT_MESSAGE_LENGTH, MIN_PEER_PROTO_VERSION,
    PING_INTERVAL, SENDHEADERS_VERSION,
};
use crate::wire::{Inv, NetMessage, VersionMessage, MSG_BLOCK, MSG_TX, NODE_NETWORK};

/// Peers above this version answer pings with a pong carrying the nonce.
pub const BIP0031_VERSION: i32 = 60_000;
const ONE_MONTH: i64 = 30 * 24 * 60 * 60;
const MAX_INV_PER_MESSAGE: usize = 1000;
const ZERO_HASH: Hash256 = [0u8; 32];

pub fn user_agent() -> String {
    format!("/coind:{}/", env!("CARGO_PKG_VERSION"))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerAction {
    Send(NetMessage),
    Disconnect,
}

fn reject_message(message: &str, code: u16, reason: &str, hash: Option<Hash256>) -> Option<PeerAction> {
    let code = u8::try_from(code).ok()?;
    Some(PeerAction::Send(NetMessage::Reject {
        message: message.to_string(),
        code,
        reason: truncate_reason(reason),
        hash,
    }))
}

fn truncate_reason(reason: &str) -> String {
    reason.chars().take(MAX_REJECT_MESSAGE_LENGTH).collect()
}

/// Everything the message handlers touch.
pub struct CoreState<S: KeyValueStore + 'static> {
    pub chain: ChainState<S>,
    pub mempool: Mempool,
    pub orphans: OrphanPool,
    pub sync: SyncState,
    pub limiter: FreeRelayLimiter,
    pub policy: MempoolPolicy,
    local_nonce: u64,
    /// An accepted peer block whose chain activation runs once the lock
    /// is released.
    pending_activation: Option<Block>,
}

impl<S: KeyValueStore + 'static> CoreState<S> {
    pub fn new(chain: ChainState<S>, policy: MempoolPolicy, sync: SyncConfig) -> Self {
        let mut local_nonce = 0;
        while local_nonce <= 1 {
            local_nonce = rand::random();
        }
        Self {
            chain,
            mempool: Mempool::new(policy.min_relay_fee),
            orphans: OrphanPool::new(),
            sync: SyncState::new(sync),
            limiter: FreeRelayLimiter::new(),
            policy,
            local_nonce,
            pending_activation: None,
        }
    }

    pub fn local_nonce(&self) -> u64 {
        self.local_nonce
    }

    fn shutdown_requested(&self) -> bool {
        self.chain.shutdown_flag().load(Ordering::SeqCst)
    }

    pub fn version_message(&self) -> NetMessage {
        NetMessage::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp: self.chain.clock().adjusted_time(),
            nonce: self.local_nonce,
            user_agent: user_agent(),
            start_height: self.chain.chain().height(),
            relay: true,
        })
    }

    /// Registers a connection. Outbound connections open with our version.
    pub fn initialize_node(&mut self, id: PeerId, info: PeerInfo) -> Vec<PeerAction> {
        let inbound = info.inbound;
        self.sync.initialize_node(id, info);
        if inbound {
            Vec::new()
        } else {
            vec![PeerAction::Send(self.version_message())]
        }
    }

    pub fn finalize_node(&mut self, id: PeerId) {
        self.sync.finalize_node(id);
        self.orphans.erase_orphans_for(id);
    }

    pub fn already_have(&mut self, inv: &Inv) -> Result<bool, String> {
        match inv.inv_type {
            MSG_TX => {
                let tip = self.chain.tip_node().map(|node| node.hash);
                if self.sync.is_recent_reject(tip, &inv.hash)
                    || self.mempool.exists(&inv.hash)
                    || self.orphans.contains(&inv.hash)
                {
                    return Ok(true);
                }
                self.chain
                    .coins_tip_mut()
                    .have_coins(&inv.hash)
                    .map_err(|err| err.to_string())
            }
            MSG_BLOCK => Ok(self.chain.index().lookup(&inv.hash).is_some()),
            // Unknown types are never requested.
            _ => Ok(true),
        }
    }

    fn accept(&mut self, tx: &Transaction, options: AcceptOptions) -> Result<ValidationResult<AcceptOutcome>, String> {
        accept_to_memory_pool(
            &mut self.chain,
            &mut self.mempool,
            &mut self.limiter,
            &self.policy,
            tx,
            options,
        )
        .map_err(|err| err.to_string())
    }

    fn check_mempool(&mut self) -> Result<(), String> {
        if !self.mempool.should_check() {
            return Ok(());
        }
        let spend_height = self.chain.chain().height() + 1;
        let problems = self
            .mempool
            .check(&*self.chain.coins_tip_mut(), spend_height)
            .map_err(|err| err.to_string())?;
        for problem in problems {
            log_error!("mempool consistency: {problem}");
        }
        Ok(())
    }

    pub fn relay_transaction(&mut self, txid: Txid) {
        let inv = Inv::tx(txid);
        for peer in self.sync.peers_mut() {
            if peer.relay_txes {
                peer.push_inventory(inv);
            }
        }
    }

    /// Admits a locally submitted transaction and announces it.
    pub fn submit_transaction(&mut self, tx: &Transaction) -> Result<ValidationResult<AcceptOutcome>, String> {
        let options = AcceptOptions {
            limit_free: false,
            override_mempool_limit: false,
            reject_absurd_fee: true,
        };
        let result = self.accept(tx, options)?;
        if let Ok(outcome) = &result {
            if outcome.accepted {
                let txid = tx.txid();
                self.relay_transaction(txid);
                self.process_orphans(txid)?;
            }
        }
        Ok(result)
    }

    /// Checks and stores a block without moving the tip. Rule violations
    /// come back as `Ok(Err(state))`.
    pub fn accept_new_block(
        &mut self,
        block: &Block,
        source: Option<PeerId>,
        requested: bool,
        disk_pos: Option<FileLocation>,
    ) -> Result<ValidationResult, String> {
        let result = self.chain.accept_new_block(block, source, requested, disk_pos);
        let rejections = self.chain.take_block_rejections();
        self.dispatch_block_rejections(rejections);
        match result {
            Ok(()) => Ok(Ok(())),
            Err(ChainStateError::Invalid(state)) if state.is_invalid() => Ok(Err(state)),
            Err(err) => Err(err.to_string()),
        }
    }

    /// One bounded activation round. Whatever the chain did is applied to
    /// the mempool and peers before returning. Returns true while more
    /// rounds are needed.
    pub fn activate_best_chain_round(&mut self, hint: Option<&Block>) -> Result<bool, String> {
        let mut trace = ConnectTrace::default();
        let result = self.chain.activate_best_chain_round(hint, &mut trace);
        let rejections = self.chain.take_block_rejections();
        self.dispatch_block_rejections(rejections);
        self.apply_connect_trace(trace)?;
        let more = result.map_err(|err| err.to_string())?;
        if !more {
            self.chain.finish_activation().map_err(|err| err.to_string())?;
        }
        Ok(more)
    }

    /// Runs an operator request that moved the tip (invalidate/reconsider)
    /// through the same mempool and announcement path as a new block.
    pub fn apply_chain_change(
        &mut self,
        result: Result<ConnectTrace, ChainStateError>,
    ) -> Result<(), String> {
        let trace = result.map_err(|err| err.to_string())?;
        self.apply_connect_trace(trace)
    }

    fn dispatch_block_rejections(&mut self, rejections: Vec<BlockRejection>) {
        for BlockRejection { peer, hash, state } in rejections {
            if !state.is_invalid() {
                continue;
            }
            if let Ok(code) = u8::try_from(state.reject_code()) {
                self.sync.queue_block_reject(
                    peer,
                    BlockReject {
                        code,
                        reason: truncate_reason(state.reject_reason()),
                        hash,
                    },
                );
            }
            if state.dos_score() > 0 {
                self.sync.misbehaving(peer, state.dos_score());
            }
        }
    }

    pub fn apply_connect_trace(&mut self, trace: ConnectTrace) -> Result<(), String> {
        if trace.is_empty() && trace.tip_updates.is_empty() {
            return Ok(());
        }
        let now = self.chain.clock().now();

        let mut confirmed = HashSet::new();
        for (block, height) in &trace.connected {
            confirmed.extend(block.transactions.iter().map(Transaction::txid));
            for conflict in self.mempool.remove_for_block(&block.transactions, *height, now) {
                self.chain.events_mut().publish(ChainEvent::TxConflicted {
                    txid: conflict.txid(),
                });
            }
        }

        if !trace.disconnected.is_empty() {
            let mut resurrected = Vec::new();
            for block in trace.disconnected.iter().rev() {
                for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                    let txid = tx.txid();
                    if confirmed.contains(&txid) {
                        continue;
                    }
                    match self.accept(tx, AcceptOptions::REORG)? {
                        Ok(outcome) if outcome.accepted => resurrected.push(txid),
                        _ => {
                            self.mempool.remove_recursive(tx);
                        }
                    }
                }
            }
            self.mempool.update_transactions_from_block(&resurrected);
            let spend_height = self.chain.chain().height() + 1;
            let (view, coins_tip) = self.chain.mempool_context();
            let removed = self
                .mempool
                .remove_for_reorg(&view, &*coins_tip, spend_height, STANDARD_LOCKTIME_VERIFY_FLAGS)
                .map_err(|err| err.to_string())?;
            if !removed.is_empty() {
                log_cat!(
                    Category::Mempool,
                    "removed {} transactions no longer final after reorg",
                    removed.len()
                );
            }
        }

        limit_mempool_size(
            &mut self.mempool,
            self.chain.coins_tip_mut(),
            self.policy.max_mempool_bytes,
            self.policy.expiry_secs,
            now,
        );
        self.check_mempool()?;

        for update in &trace.tip_updates {
            self.announce_tip(update);
        }
        Ok(())
    }

    fn announce_tip(&mut self, update: &TipUpdate) {
        if update.initial_download {
            return;
        }
        let index = self.chain.index();
        let new_height = index.node(update.tip).height;
        let mut hashes = Vec::new();
        let mut cursor = Some(update.tip);
        while let Some(id) = cursor {
            if Some(id) == update.fork {
                break;
            }
            hashes.push(index.node(id).hash);
            if hashes.len() == MAX_BLOCKS_TO_ANNOUNCE {
                break;
            }
            cursor = index.prev(id);
        }
        for peer in self.sync.peers_mut() {
            let threshold = if peer.start_height != -1 {
                peer.start_height - 2000
            } else {
                0
            };
            if new_height > threshold {
                for hash in hashes.iter().rev() {
                    peer.push_block_hash(*hash);
                }
            }
        }
    }

    pub fn process_message(&mut self, peer: PeerId, message: NetMessage, now: i64) -> Result<Vec<PeerAction>, String> {
        let mut out = Vec::new();
        let Some(state) = self.sync.peer(peer) else {
            return Ok(out);
        };
        log_cat!(Category::Net, "received: {} peer={peer}", message.command());
        let handshaken = state.version != 0;
        match message {
            NetMessage::Version(version) => self.on_version(peer, version, &mut out)?,
            _ if !handshaken => {
                // Must have a version message before anything else.
                self.sync.misbehaving(peer, 1);
            }
            NetMessage::Verack => self.on_verack(peer, &mut out),
            NetMessage::SendHeaders => {
                if let Some(state) = self.sync.peer_mut(peer) {
                    state.prefer_headers = true;
                }
            }
            NetMessage::Inv(items) => self.on_inv(peer, items, now, &mut out)?,
            NetMessage::GetData(items) => self.on_get_data(peer, items, &mut out)?,
            NetMessage::GetBlocks { locator, stop } => self.on_get_blocks(peer, &locator, stop),
            NetMessage::GetHeaders { locator, stop } => self.on_get_headers(peer, &locator, stop, &mut out),
            NetMessage::Tx(tx) => self.on_tx(peer, tx, &mut out)?,
            NetMessage::Headers(headers) => self.on_headers(peer, &headers, now, &mut out)?,
            NetMessage::Block(block) => self.on_block(peer, block, now, &mut out)?,
            NetMessage::Mempool => {
                let hashes = self.mempool.query_hashes();
                for chunk in hashes.chunks(MAX_INV_SZ) {
                    out.push(PeerAction::Send(NetMessage::Inv(
                        chunk.iter().copied().map(Inv::tx).collect(),
                    )));
                }
            }
            NetMessage::Ping(nonce) => {
                if self.sync.peer(peer).map_or(false, |state| state.version > BIP0031_VERSION) {
                    out.push(PeerAction::Send(NetMessage::Pong(nonce)));
                }
            }
            NetMessage::Pong(nonce) => self.on_pong(peer, nonce, now),
            NetMessage::Reject {
                message,
                code,
                reason,
                hash,
            } => {
                let hash = hash.map(|hash| format!(": hash {}", hash256_to_hex(&hash)));
                log_cat!(
                    Category::Net,
                    "Reject {message} code {code}: {reason}{}",
                    hash.unwrap_or_default()
                );
            }
            NetMessage::NotFound(_) => {}
        }
        Ok(out)
    }

    fn on_version(&mut self, peer: PeerId, msg: VersionMessage, out: &mut Vec<PeerAction>) -> Result<(), String> {
        let our_version = self.version_message();
        let local_nonce = self.local_nonce;
        let Some(state) = self.sync.peer_mut(peer) else {
            return Ok(());
        };
        if state.version != 0 {
            out.extend(reject_message("version", REJECT_DUPLICATE, "Duplicate version message", None));
            self.sync.misbehaving(peer, 1);
            return Ok(());
        }
        if msg.version < MIN_PEER_PROTO_VERSION {
            log_info!(
                "peer={peer} using obsolete version {}; disconnecting",
                msg.version
            );
            out.extend(reject_message(
                "version",
                REJECT_OBSOLETE,
                &format!("Version must be {MIN_PEER_PROTO_VERSION} or greater"),
                None,
            ));
            state.disconnect = true;
            out.push(PeerAction::Disconnect);
            return Ok(());
        }
        if msg.nonce == local_nonce && msg.nonce > 1 {
            log_info!("connected to self at {}, disconnecting", state.address);
            state.disconnect = true;
            out.push(PeerAction::Disconnect);
            return Ok(());
        }

        state.version = if msg.version == 10300 { 300 } else { msg.version };
        state.services = msg.services;
        state.client = msg.services & NODE_NETWORK == 0;
        state.relay_txes = msg.relay;
        state.start_height = msg.start_height;
        if state.inbound {
            out.push(PeerAction::Send(our_version));
        }
        out.push(PeerAction::Send(NetMessage::Verack));
        state.successfully_connected = true;
        log_info!(
            "receive version message: {}: version {}, blocks={}, peer={peer}",
            msg.user_agent,
            state.version,
            msg.start_height
        );
        self.sync.update_preferred_download(peer);
        Ok(())
    }

    fn on_verack(&mut self, peer: PeerId, out: &mut Vec<PeerAction>) {
        let Some(state) = self.sync.peer_mut(peer) else {
            return;
        };
        if !state.inbound {
            state.connected = true;
        }
        if state.version >= SENDHEADERS_VERSION {
            // Ask for new blocks to be announced with headers instead of inv.
            out.push(PeerAction::Send(NetMessage::SendHeaders));
        }
    }

    fn on_inv(&mut self, peer: PeerId, items: Vec<Inv>, now: i64, out: &mut Vec<PeerAction>) -> Result<(), String> {
        if items.len() > MAX_INV_SZ {
            self.sync.misbehaving(peer, 20);
            log_cat!(Category::Net, "message inv size() = {}", items.len());
            return Ok(());
        }
        let busy = self.chain.is_importing() || self.chain.is_reindexing();
        let initial_download = self.chain.is_initial_block_download();
        let mut to_fetch = Vec::new();
        for inv in items {
            if self.shutdown_requested() {
                return Ok(());
            }
            if let Some(state) = self.sync.peer_mut(peer) {
                state.add_inventory_known(inv);
            }
            let have = self.already_have(&inv)?;
            log_cat!(
                Category::Net,
                "got inv: {inv}  {} peer={peer}",
                if have { "have" } else { "new" }
            );

            if inv.inv_type == MSG_BLOCK {
                self.sync.update_block_availability(self.chain.index(), peer, inv.hash);
                if have || busy || self.sync.in_flight_from(&inv.hash).is_some() {
                    continue;
                }
                // Headers first: ask for everything between our best header
                // and the announced block.
                let index = self.chain.index();
                let chain = self.chain.chain();
                let best_header = self.chain.best_header();
                out.push(PeerAction::Send(NetMessage::GetHeaders {
                    locator: get_locator(index, chain, best_header),
                    stop: inv.hash,
                }));
                let can_fetch = SyncState::can_direct_fetch(
                    index,
                    chain,
                    &self.chain.params().consensus,
                    self.chain.clock().adjusted_time(),
                );
                let in_flight = self.sync.peer(peer).map_or(0, |state| state.blocks_in_flight.len());
                if can_fetch && in_flight < MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                    to_fetch.push(inv);
                    self.sync.mark_block_as_in_flight(peer, inv.hash, None, now);
                }
                log_cat!(
                    Category::Net,
                    "getheaders ({}) {} to peer={peer}",
                    best_header.map_or(-1, |id| index.node(id).height),
                    hash256_to_hex(&inv.hash)
                );
            } else if !have && !busy && !initial_download {
                if let Some(state) = self.sync.peer_mut(peer) {
                    state.queue_ask_for(inv);
                }
            }
        }
        if !to_fetch.is_empty() {
            out.push(PeerAction::Send(NetMessage::GetData(to_fetch)));
        }
        Ok(())
    }

    fn on_get_data(&mut self, peer: PeerId, items: Vec<Inv>, out: &mut Vec<PeerAction>) -> Result<(), String> {
        if items.len() > MAX_INV_SZ {
            self.sync.misbehaving(peer, 20);
            log_cat!(Category::Net, "message getdata size() = {}", items.len());
            return Ok(());
        }
        if items.len() != 1 {
            log_cat!(Category::Net, "received getdata ({} invsz) peer={peer}", items.len());
        }
        if let Some(state) = self.sync.peer_mut(peer) {
            state.get_data_queue.extend(items);
        }
        self.process_get_data(peer, out)
    }

    /// Serves queued getdata requests, stopping after one block so a peer
    /// cannot monopolise the node.
    fn process_get_data(&mut self, peer: PeerId, out: &mut Vec<PeerAction>) -> Result<(), String> {
        let mut not_found = Vec::new();
        loop {
            let Some(inv) = self.sync.peer_mut(peer).and_then(|state| state.get_data_queue.pop_front()) else {
                break;
            };
            if self.shutdown_requested() {
                break;
            }
            match inv.inv_type {
                MSG_BLOCK => {
                    self.serve_block(peer, &inv, out)?;
                    break;
                }
                MSG_TX => match self.mempool.lookup(&inv.hash) {
                    Some(tx) => out.push(PeerAction::Send(NetMessage::Tx(tx.clone()))),
                    None => not_found.push(inv),
                },
                _ => {}
            }
        }
        if !not_found.is_empty() {
            out.push(PeerAction::Send(NetMessage::NotFound(not_found)));
        }
        Ok(())
    }

    fn serve_block(&mut self, peer: PeerId, inv: &Inv, out: &mut Vec<PeerAction>) -> Result<(), String> {
        let index = self.chain.index();
        let Some(id) = index.lookup(&inv.hash) else {
            return Ok(());
        };
        let node = index.node(id);
        let send = if self.chain.chain().contains(index, id) {
            true
        } else {
            // Off-chain blocks are only served while they are recent, so
            // peers cannot fingerprint us by the forks we have seen.
            let spacing = self.chain.params().consensus.pow_target_spacing;
            let recent = node.is_valid(BLOCK_VALID_SCRIPTS)
                && self.chain.best_header().map_or(false, |best| {
                    let best = index.node(best);
                    best.block_time() - node.block_time() < ONE_MONTH
                        && block_proof_equivalent_time(best.chain_work, node.chain_work, best.bits, spacing)
                            < ONE_MONTH
                });
            if !recent {
                log_info!(
                    "process_get_data: ignoring request from peer={peer} for old block that isn't in the main chain"
                );
            }
            recent
        };
        if !send || !node.have_data() {
            return Ok(());
        }
        let block = self
            .chain
            .read_block(id)
            .map_err(|err| format!("cannot load block {} from disk: {err}", hash256_to_hex(&inv.hash)))?;
        out.push(PeerAction::Send(NetMessage::Block(block)));

        let tip_hash = self.chain.tip_node().map(|node| node.hash);
        if let Some(state) = self.sync.peer_mut(peer) {
            if state.hash_continue == Some(inv.hash) {
                // Bypass inventory_known so the peer asks for more blocks.
                if let Some(tip_hash) = tip_hash {
                    out.push(PeerAction::Send(NetMessage::Inv(vec![Inv::block(tip_hash)])));
                }
                state.hash_continue = None;
            }
        }
        Ok(())
    }

    fn on_get_blocks(&mut self, peer: PeerId, locator: &[Hash256], stop: Hash256) {
        let index = self.chain.index();
        let chain = self.chain.chain();
        let mut cursor = find_fork_in_global_index(index, chain, locator).and_then(|id| chain.next(index, id));
        log_cat!(
            Category::Net,
            "getblocks {} to {} limit {MAX_GETBLOCKS_RESULTS} from peer={peer}",
            cursor.map_or(-1, |id| index.node(id).height),
            if stop == ZERO_HASH {
                "end".to_string()
            } else {
                hash256_to_hex(&stop)
            }
        );
        let mut invs = Vec::new();
        let mut hash_continue = None;
        while let Some(id) = cursor {
            let node = index.node(id);
            if node.hash == stop {
                log_cat!(
                    Category::Net,
                    "  getblocks stopping at {} {}",
                    node.height,
                    hash256_to_hex(&node.hash)
                );
                break;
            }
            invs.push(Inv::block(node.hash));
            if invs.len() == MAX_GETBLOCKS_RESULTS {
                log_cat!(
                    Category::Net,
                    "  getblocks stopping at limit {} {}",
                    node.height,
                    hash256_to_hex(&node.hash)
                );
                hash_continue = Some(node.hash);
                break;
            }
            cursor = chain.next(index, id);
        }
        if let Some(state) = self.sync.peer_mut(peer) {
            for inv in invs {
                state.push_inventory(inv);
            }
            if hash_continue.is_some() {
                state.hash_continue = hash_continue;
            }
        }
    }

    fn on_get_headers(&mut self, peer: PeerId, locator: &[Hash256], stop: Hash256, out: &mut Vec<PeerAction>) {
        let whitelisted = self.sync.peer(peer).map_or(false, |state| state.whitelisted);
        if self.chain.is_initial_block_download() && !whitelisted {
            log_cat!(
                Category::Net,
                "Ignoring getheaders from peer={peer} because node is in initial block download"
            );
            return;
        }
        let index = self.chain.index();
        let chain = self.chain.chain();
        let start = if locator.is_empty() {
            match index.lookup(&stop) {
                Some(id) => Some(id),
                None => return,
            }
        } else {
            find_fork_in_global_index(index, chain, locator).and_then(|id| chain.next(index, id))
        };
        log_cat!(
            Category::Net,
            "getheaders {} to {} from peer={peer}",
            start.map_or(-1, |id| index.node(id).height),
            hash256_to_hex(&stop)
        );

        let mut headers: Vec<BlockHeader> = Vec::new();
        let mut cursor = start;
        let mut last_sent = None;
        while let Some(id) = cursor {
            let node = index.node(id);
            headers.push(node.header());
            if headers.len() >= MAX_HEADERS_RESULTS || node.hash == stop {
                last_sent = Some(id);
                break;
            }
            cursor = chain.next(index, id);
        }
        let tip = chain.tip();
        if let Some(state) = self.sync.peer_mut(peer) {
            // Walking off the end of the chain means the peer now has our tip.
            state.best_header_sent = last_sent.or(tip);
        }
        out.push(PeerAction::Send(NetMessage::Headers(headers)));
    }

    fn on_tx(&mut self, peer: PeerId, tx: Transaction, out: &mut Vec<PeerAction>) -> Result<(), String> {
        let txid = tx.txid();
        let inv = Inv::tx(txid);
        let whitelisted = match self.sync.peer_mut(peer) {
            Some(state) => {
                state.add_inventory_known(inv);
                state.ask_for.retain(|queued| queued != &inv);
                state.whitelisted
            }
            None => return Ok(()),
        };

        let result = if self.already_have(&inv)? {
            None
        } else {
            Some(self.accept(&tx, AcceptOptions::RELAY)?)
        };

        let mut rejection: Option<ValidationState> = None;
        match result {
            Some(Ok(outcome)) if outcome.accepted => {
                self.check_mempool()?;
                self.relay_transaction(txid);
                log_cat!(
                    Category::Mempool,
                    "AcceptToMemoryPool: peer={peer}: accepted {} (poolsz {} txn, {} kB)",
                    hash256_to_hex(&txid),
                    self.mempool.size(),
                    self.mempool.dynamic_memory_usage() / 1000
                );
                self.process_orphans(txid)?;
            }
            Some(Ok(outcome)) if outcome.missing_inputs => {
                self.orphans.add_orphan_tx(&tx, peer);
                let evicted = self.orphans.limit_orphan_tx_size(self.sync.config.max_orphan_tx);
                if evicted > 0 {
                    log_cat!(Category::Mempool, "mapOrphan overflow, removed {evicted} tx");
                }
            }
            other => {
                self.sync.add_recent_reject(txid);
                if let Some(Err(state)) = other {
                    rejection = Some(state);
                }
                if whitelisted && self.sync.config.whitelist_force_relay {
                    let dos = rejection.as_ref().map_or(0, ValidationState::dos_score);
                    if dos == 0 {
                        log_info!(
                            "Force relaying tx {} from whitelisted peer={peer}",
                            hash256_to_hex(&txid)
                        );
                        self.relay_transaction(txid);
                    } else {
                        log_info!(
                            "Not relaying invalid transaction {} from whitelisted peer={peer} ({})",
                            hash256_to_hex(&txid),
                            rejection.as_ref().map(ToString::to_string).unwrap_or_default()
                        );
                    }
                }
            }
        }

        if let Some(state) = rejection.filter(ValidationState::is_invalid) {
            log_cat!(
                Category::MempoolRej,
                "{} from peer={peer} was not accepted: {state}",
                hash256_to_hex(&txid)
            );
            out.extend(reject_message("tx", state.reject_code(), state.reject_reason(), Some(txid)));
            if state.dos_score() > 0 {
                self.sync.misbehaving(peer, state.dos_score());
            }
        }
        self.chain
            .flush_state(FlushMode::Periodic)
            .map_err(|err| err.to_string())
    }

    /// Retries orphans that spend outputs of newly accepted transactions,
    /// breadth first.
    fn process_orphans(&mut self, parent: Txid) -> Result<(), String> {
        let mut work_queue = VecDeque::from([parent]);
        let mut erase = Vec::new();
        let mut misbehaving_peers = HashSet::new();
        while let Some(hash) = work_queue.pop_front() {
            for orphan_hash in self.orphans.dependents_of(&hash) {
                let Some(orphan) = self.orphans.get(&orphan_hash).cloned() else {
                    continue;
                };
                if misbehaving_peers.contains(&orphan.from_peer) {
                    continue;
                }
                match self.accept(&orphan.tx, AcceptOptions::RELAY)? {
                    Ok(outcome) if outcome.accepted => {
                        log_cat!(
                            Category::Mempool,
                            "   accepted orphan tx {}",
                            hash256_to_hex(&orphan_hash)
                        );
                        self.relay_transaction(orphan_hash);
                        work_queue.push_back(orphan_hash);
                        erase.push(orphan_hash);
                    }
                    Ok(outcome) if outcome.missing_inputs => {}
                    other => {
                        if let Err(state) = &other {
                            if state.is_invalid() && state.dos_score() > 0 {
                                self.sync.misbehaving(orphan.from_peer, state.dos_score());
                                misbehaving_peers.insert(orphan.from_peer);
                                log_cat!(
                                    Category::Mempool,
                                    "   invalid orphan tx {}",
                                    hash256_to_hex(&orphan_hash)
                                );
                            }
                        }
                        log_cat!(
                            Category::Mempool,
                            "   removed orphan tx {}",
                            hash256_to_hex(&orphan_hash)
                        );
                        erase.push(orphan_hash);
                        self.sync.add_recent_reject(orphan_hash);
                    }
                }
                self.check_mempool()?;
            }
        }
        for hash in erase {
            self.orphans.erase_orphan_tx(&hash);
        }
        Ok(())
    }

    fn on_headers(&mut self, peer: PeerId, headers: &[BlockHeader], now: i64, out: &mut Vec<PeerAction>) -> Result<(), String> {
        if headers.len() > MAX_HEADERS_RESULTS {
            self.sync.misbehaving(peer, 20);
            log_cat!(Category::Net, "headers message size = {}", headers.len());
            return Ok(());
        }
        if headers.is_empty() {
            // Nothing interesting. Stop asking this peer for more headers.
            return Ok(());
        }

        let mut last: Option<NodeId> = None;
        for header in headers {
            if let Some(prev) = last {
                if header.prev_block != self.chain.index().node(prev).hash {
                    self.sync.misbehaving(peer, 20);
                    log_cat!(Category::Net, "non-continuous headers sequence from peer={peer}");
                    return Ok(());
                }
            }
            match self.chain.accept_block_header(header) {
                Ok(id) => last = Some(id),
                Err(ChainStateError::Invalid(state)) if state.is_invalid() => {
                    if state.dos_score() > 0 {
                        self.sync.misbehaving(peer, state.dos_score());
                    }
                    log_cat!(Category::Net, "invalid header received from peer={peer}: {state}");
                    return Ok(());
                }
                Err(err) => return Err(err.to_string()),
            }
        }
        let Some(last) = last else {
            return Ok(());
        };

        let index = self.chain.index();
        let chain = self.chain.chain();
        let last_node = index.node(last);
        self.sync.update_block_availability(index, peer, last_node.hash);

        if headers.len() == MAX_HEADERS_RESULTS {
            // The peer may have more headers than fit in one message.
            log_cat!(
                Category::Net,
                "more getheaders ({}) to end to peer={peer} (startheight:{})",
                last_node.height,
                self.sync.peer(peer).map_or(-1, |state| state.start_height)
            );
            out.push(PeerAction::Send(NetMessage::GetHeaders {
                locator: get_locator(index, chain, Some(last)),
                stop: ZERO_HASH,
            }));
        }

        let can_fetch = SyncState::can_direct_fetch(
            index,
            chain,
            &self.chain.params().consensus,
            self.chain.clock().adjusted_time(),
        );
        let tip_work = self.chain.tip_node().map(|node| node.chain_work).unwrap_or_default();
        if !can_fetch || !last_node.is_valid(BLOCK_VALID_TREE) || tip_work > last_node.chain_work {
            return Ok(());
        }

        let mut to_fetch = Vec::new();
        let mut walk = Some(last);
        while let Some(id) = walk {
            if chain.contains(index, id) || to_fetch.len() > MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                break;
            }
            let node = index.node(id);
            if !node.have_data() && self.sync.in_flight_from(&node.hash).is_none() {
                to_fetch.push(id);
            }
            walk = index.prev(id);
        }
        if !walk.map_or(false, |id| chain.contains(index, id)) {
            log_cat!(
                Category::Net,
                "Large reorg, won't direct fetch to {} ({})",
                hash256_to_hex(&last_node.hash),
                last_node.height
            );
            return Ok(());
        }

        let mut get_data = Vec::new();
        for &id in to_fetch.iter().rev() {
            let in_flight = self.sync.peer(peer).map_or(0, |state| state.blocks_in_flight.len());
            if in_flight >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                break;
            }
            let hash = index.node(id).hash;
            get_data.push(Inv::block(hash));
            self.sync.mark_block_as_in_flight(peer, hash, Some(id), now);
            log_cat!(
                Category::Net,
                "Requesting block {} from  peer={peer}",
                hash256_to_hex(&hash)
            );
        }
        if get_data.len() > 1 {
            log_cat!(
                Category::Net,
                "Downloading blocks toward {} ({}) via headers direct fetch",
                hash256_to_hex(&last_node.hash),
                last_node.height
            );
        }
        if !get_data.is_empty() {
            out.push(PeerAction::Send(NetMessage::GetData(get_data)));
        }
        Ok(())
    }

    fn on_block(&mut self, peer: PeerId, block: Block, now: i64, out: &mut Vec<PeerAction>) -> Result<(), String> {
        if self.chain.is_importing() || self.chain.is_reindexing() {
            return Ok(());
        }
        let hash = block.hash();
        log_cat!(
            Category::Net,
            "received block {} peer={peer}",
            hash256_to_hex(&hash)
        );
        let whitelisted = match self.sync.peer_mut(peer) {
            Some(state) => {
                state.add_inventory_known(Inv::block(hash));
                state.whitelisted
            }
            None => return Ok(()),
        };
        // Whitelisted peers may push blocks we did not ask for once we are
        // synced.
        let force = whitelisted && !self.chain.is_initial_block_download();
        let requested = self.sync.mark_block_as_received(&hash, now) || force;
        match self.accept_new_block(&block, Some(peer), requested, None)? {
            Ok(()) => self.pending_activation = Some(block),
            Err(state) => {
                out.extend(reject_message("block", state.reject_code(), state.reject_reason(), Some(hash)));
                if state.dos_score() > 0 {
                    self.sync.misbehaving(peer, state.dos_score());
                }
            }
        }
        Ok(())
    }

    fn on_pong(&mut self, peer: PeerId, nonce: u64, now: i64) {
        let Some(state) = self.sync.peer_mut(peer) else {
            return;
        };
        let mut problem = None;
        let mut finished = false;
        if state.ping_nonce_sent != 0 {
            if nonce == state.ping_nonce_sent {
                finished = true;
                let elapsed = now - state.ping_start;
                if elapsed > 0 {
                    state.ping_time = Some(elapsed);
                    state.min_ping_time = Some(state.min_ping_time.map_or(elapsed, |min| min.min(elapsed)));
                } else {
                    problem = Some("Timing mishap");
                }
            } else if nonce == 0 {
                // Nonce zero is the peer cancelling the ping.
                finished = true;
                problem = Some("Nonce zero");
            } else {
                problem = Some("Nonce mismatch");
            }
        } else {
            problem = Some("Unsolicited pong without ping");
        }
        if let Some(problem) = problem {
            log_cat!(
                Category::Net,
                "pong peer={peer}: {problem}, {:016x} expected, {nonce:016x} received",
                state.ping_nonce_sent
            );
        }
        if finished {
            state.ping_nonce_sent = 0;
        }
    }

    pub fn send_messages(&mut self, peer: PeerId, now: i64) -> Result<Vec<PeerAction>, String> {
        let mut out = Vec::new();
        match self.sync.peer(peer) {
            Some(state) if state.version != 0 => {}
            _ => return Ok(out),
        }

        // Blocks left over from a multi-item getdata.
        if self.sync.peer(peer).map_or(false, |state| !state.get_data_queue.is_empty()) {
            self.process_get_data(peer, &mut out)?;
        }

        self.send_ping(peer, now, &mut out);
        self.send_ban_and_rejects(peer, &mut out);
        let fetch = self.maybe_start_sync(peer, &mut out);
        self.send_announcements(peer, &mut out);
        self.send_inventory(peer, &mut out);
        self.check_download_timeouts(peer, now, &mut out);

        let mut get_data = self.request_blocks(peer, fetch, now);
        self.request_transactions(peer, &mut get_data, &mut out)?;
        if !get_data.is_empty() {
            out.push(PeerAction::Send(NetMessage::GetData(get_data)));
        }
        Ok(out)
    }

    fn send_ping(&mut self, peer: PeerId, now: i64, out: &mut Vec<PeerAction>) {
        let Some(state) = self.sync.peer_mut(peer) else {
            return;
        };
        let due = state.ping_nonce_sent == 0 && state.ping_start + PING_INTERVAL < now;
        if !state.ping_queued && !due {
            return;
        }
        let mut nonce = 0u64;
        while nonce == 0 {
            nonce = rand::random();
        }
        state.ping_queued = false;
        state.ping_start = now;
        if state.version > BIP0031_VERSION {
            state.ping_nonce_sent = nonce;
            out.push(PeerAction::Send(NetMessage::Ping(nonce)));
        } else {
            // Old peers never answer; nothing to wait for.
            state.ping_nonce_sent = 0;
            out.push(PeerAction::Send(NetMessage::Ping(0)));
        }
    }

    fn send_ban_and_rejects(&mut self, peer: PeerId, out: &mut Vec<PeerAction>) {
        let Some(state) = self.sync.peer_mut(peer) else {
            return;
        };
        if state.should_ban {
            if state.whitelisted {
                log_warn!("Warning: not punishing whitelisted peer {}!", state.address);
            } else {
                state.disconnect = true;
                out.push(PeerAction::Disconnect);
            }
            state.should_ban = false;
        }
        for reject in state.rejects.drain(..) {
            out.push(PeerAction::Send(NetMessage::Reject {
                message: "block".to_string(),
                code: reject.code,
                reason: reject.reason,
                hash: Some(reject.hash),
            }));
        }
    }

    /// Sends the first getheaders to a peer when it is a good sync
    /// candidate. Returns whether blocks may be fetched from it.
    fn maybe_start_sync(&mut self, peer: PeerId, out: &mut Vec<PeerAction>) -> bool {
        let global_preferred = self.sync.preferred_download;
        let global_started = self.sync.sync_started;
        let Some(state) = self.sync.peer(peer) else {
            return false;
        };
        let fetch = state.preferred_download || (global_preferred == 0 && !state.client && !state.one_shot);
        if state.sync_started
            || state.client
            || state.disconnect
            || self.chain.is_importing()
            || self.chain.is_reindexing()
        {
            return fetch;
        }
        let start_height = state.start_height;
        let index = self.chain.index();
        let chain = self.chain.chain();
        let Some(best) = self.chain.best_header().or_else(|| chain.tip()) else {
            return fetch;
        };
        let recent = index.node(best).block_time() > self.chain.clock().adjusted_time() - 24 * 60 * 60;
        if (global_started == 0 && fetch) || recent {
            self.sync.start_sync(peer);
            // Start one block back so a peer at our tip still answers with
            // a non-empty headers message.
            let from = index.prev(best).unwrap_or(best);
            log_cat!(
                Category::Net,
                "initial getheaders ({}) to peer={peer} (startheight:{start_height})",
                index.node(from).height
            );
            out.push(PeerAction::Send(NetMessage::GetHeaders {
                locator: get_locator(index, chain, Some(from)),
                stop: ZERO_HASH,
            }));
        }
        fetch
    }

    fn send_announcements(&mut self, peer: PeerId, out: &mut Vec<PeerAction>) {
        let index = self.chain.index();
        let chain = self.chain.chain();
        self.sync.process_block_availability(index, peer);
        let Some((prefer_headers, to_announce)) = self
            .sync
            .peer_mut(peer)
            .map(|state| (state.prefer_headers, std::mem::take(&mut state.blocks_to_announce)))
        else {
            return;
        };
        if to_announce.is_empty() {
            return;
        }

        let mut revert_to_inv = !prefer_headers || to_announce.len() > MAX_BLOCKS_TO_ANNOUNCE;
        let mut headers = Vec::new();
        let mut best_index: Option<NodeId> = None;
        if !revert_to_inv {
            let mut found_start = false;
            for hash in &to_announce {
                let Some(id) = index.lookup(hash) else {
                    revert_to_inv = true;
                    break;
                };
                let node = index.node(id);
                if chain.at(node.height) != Some(id) {
                    // Reorged away while queued.
                    revert_to_inv = true;
                    break;
                }
                if best_index.is_some() && node.prev != best_index {
                    // Not a connected sequence; fall back to inv.
                    revert_to_inv = true;
                    break;
                }
                best_index = Some(id);
                if found_start {
                    headers.push(node.header());
                } else if self.sync.peer_has_header(index, peer, id) {
                    continue;
                } else if node.prev.map_or(true, |prev| self.sync.peer_has_header(index, peer, prev)) {
                    found_start = true;
                    headers.push(node.header());
                } else {
                    // Peer is missing a parent; it would not connect.
                    revert_to_inv = true;
                    break;
                }
            }
        }

        if revert_to_inv {
            // Only the last block is announced; the peer fetches the rest
            // through getheaders.
            let Some(hash) = to_announce.last() else {
                return;
            };
            let Some(id) = index.lookup(hash) else {
                return;
            };
            if chain.at(index.node(id).height) != Some(id) {
                log_cat!(
                    Category::Net,
                    "Announcing block {} not on main chain (tip={})",
                    hash256_to_hex(hash),
                    chain.tip().map(|tip| hash256_to_hex(&index.node(tip).hash)).unwrap_or_default()
                );
            }
            if !self.sync.peer_has_header(index, peer, id) {
                if let Some(state) = self.sync.peer_mut(peer) {
                    state.push_inventory(Inv::block(*hash));
                }
                log_cat!(
                    Category::Net,
                    "send_messages: sending inv peer={peer} hash={}",
                    hash256_to_hex(hash)
                );
            }
        } else if !headers.is_empty() {
            log_cat!(
                Category::Net,
                "send_messages: sending {} headers to peer={peer}",
                headers.len()
            );
            if let Some(state) = self.sync.peer_mut(peer) {
                state.best_header_sent = best_index;
            }
            out.push(PeerAction::Send(NetMessage::Headers(headers)));
        }
    }

    fn send_inventory(&mut self, peer: PeerId, out: &mut Vec<PeerAction>) {
        let Some(state) = self.sync.peer_mut(peer) else {
            return;
        };
        let pending = std::mem::take(&mut state.inventory_to_send);
        let mut invs = Vec::with_capacity(pending.len());
        for inv in pending {
            if inv.inv_type == MSG_TX && state.inventory_known.contains(&inv) {
                continue;
            }
            state.add_inventory_known(inv);
            invs.push(inv);
        }
        for chunk in invs.chunks(MAX_INV_PER_MESSAGE) {
            out.push(PeerAction::Send(NetMessage::Inv(chunk.to_vec())));
        }
    }

    fn check_download_timeouts(&mut self, peer: PeerId, now: i64, out: &mut Vec<PeerAction>) {
        let spacing = self.chain.params().consensus.pow_target_spacing;
        let validated_peers = self.sync.peers_with_validated_downloads as i64;
        let Some(state) = self.sync.peer_mut(peer) else {
            return;
        };
        if state.disconnect {
            return;
        }
        if state.stalling_since != 0 && state.stalling_since < now - BLOCK_STALLING_TIMEOUT {
            // A peer holding up the download window loses its slot; the
            // blocks go to someone else once the connection drops.
            log_info!("Peer={peer} is stalling block download, disconnecting");
            state.disconnect = true;
            out.push(PeerAction::Disconnect);
            return;
        }
        let Some(front) = state.blocks_in_flight.front() else {
            return;
        };
        let others = validated_peers - i64::from(state.blocks_in_flight_valid_headers > 0);
        let deadline = state.downloading_since
            + spacing * (BLOCK_DOWNLOAD_TIMEOUT_BASE + BLOCK_DOWNLOAD_TIMEOUT_PER_PEER * others);
        if now > deadline {
            log_info!(
                "Timeout downloading block {} from peer={peer}, disconnecting",
                hash256_to_hex(&front.hash)
            );
            state.disconnect = true;
            out.push(PeerAction::Disconnect);
        }
    }

    fn request_blocks(&mut self, peer: PeerId, fetch: bool, now: i64) -> Vec<Inv> {
        let mut get_data = Vec::new();
        let Some(state) = self.sync.peer(peer) else {
            return get_data;
        };
        let in_flight = state.blocks_in_flight.len();
        if state.disconnect
            || state.client
            || !(fetch || !self.chain.is_initial_block_download())
            || in_flight >= MAX_BLOCKS_IN_TRANSIT_PER_PEER
        {
            return get_data;
        }
        let index = self.chain.index();
        let chain = self.chain.chain();
        let (blocks, staller) =
            self.sync
                .find_next_blocks_to_download(index, chain, peer, MAX_BLOCKS_IN_TRANSIT_PER_PEER - in_flight);
        for id in blocks {
            let node = index.node(id);
            get_data.push(Inv::block(node.hash));
            self.sync.mark_block_as_in_flight(peer, node.hash, Some(id), now);
            log_cat!(
                Category::Net,
                "Requesting block {} ({}) peer={peer}",
                hash256_to_hex(&node.hash),
                node.height
            );
        }
        if in_flight == 0 {
            if let Some(staller) = staller {
                if let Some(state) = self.sync.peer_mut(staller) {
                    if state.stalling_since == 0 {
                        state.stalling_since = now;
                        log_cat!(Category::Net, "Stall started peer={staller}");
                    }
                }
            }
        }
        get_data
    }

    fn request_transactions(&mut self, peer: PeerId, get_data: &mut Vec<Inv>, out: &mut Vec<PeerAction>) -> Result<(), String> {
        if self.sync.peer(peer).map_or(true, |state| state.disconnect) {
            return Ok(());
        }
        while let Some(inv) = self.sync.peer_mut(peer).and_then(|state| state.ask_for.pop_front()) {
            if self.already_have(&inv)? {
                continue;
            }
            log_cat!(Category::Net, "Requesting {inv} peer={peer}");
            get_data.push(inv);
            if get_data.len() >= MAX_INV_PER_MESSAGE {
                out.push(PeerAction::Send(NetMessage::GetData(std::mem::take(get_data))));
            }
        }
        Ok(())
    }
}

/// Shared handle to the node core.
pub struct NodeContext<S: KeyValueStore + 'static> {
    core: Mutex<CoreState<S>>,
}

impl<S: KeyValueStore + 'static> NodeContext<S> {
    pub fn new(chain: ChainState<S>, policy: MempoolPolicy, sync: SyncConfig) -> Self {
        Self {
            core: Mutex::new(CoreState::new(chain, policy, sync)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, CoreState<S>>, String> {
        self.core
            .lock()
            .map_err(|_| "node state lock poisoned".to_string())
    }

    pub fn initialize_node(&self, id: PeerId, info: PeerInfo) -> Result<Vec<PeerAction>, String> {
        Ok(self.lock()?.initialize_node(id, info))
    }

    pub fn finalize_node(&self, id: PeerId) -> Result<(), String> {
        self.lock()?.finalize_node(id);
        Ok(())
    }

    pub fn process_message(&self, peer: PeerId, message: NetMessage, now: i64) -> Result<Vec<PeerAction>, String> {
        let (out, pending) = {
            let mut core = self.lock()?;
            let out = core.process_message(peer, message, now)?;
            (out, core.pending_activation.take())
        };
        if let Some(block) = pending {
            self.activate_best_chain(Some(&block))?;
        }
        Ok(out)
    }

    pub fn send_messages(&self, peer: PeerId, now: i64) -> Result<Vec<PeerAction>, String> {
        self.lock()?.send_messages(peer, now)
    }

    /// Feeds a block from disk. Such blocks are always treated as requested.
    pub fn process_block(&self, block: &Block, disk_pos: Option<FileLocation>) -> Result<ValidationResult, String> {
        if let Err(state) = self.lock()?.accept_new_block(block, None, true, disk_pos)? {
            return Ok(Err(state));
        }
        self.activate_best_chain(Some(block))?;
        Ok(Ok(()))
    }

    /// Moves the tip toward the most-work chain one bounded round at a
    /// time. The lock is taken per round, so peers and RPC-style callers
    /// get in between the batches of a long reorg.
    pub fn activate_best_chain(&self, hint: Option<&Block>) -> Result<(), String> {
        while self.lock()?.activate_best_chain_round(hint)? {}
        Ok(())
    }

    pub fn submit_transaction(&self, tx: &Transaction) -> Result<ValidationResult<AcceptOutcome>, String> {
        self.lock()?.submit_transaction(tx)
    }

    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), String> {
        let mut core = self.lock()?;
        let result = core.chain.invalidate_block(hash);
        core.apply_chain_change(result)
    }

    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), String> {
        let mut core = self.lock()?;
        let result = core.chain.reconsider_block(hash);
        core.apply_chain_change(result)
    }

    pub fn into_inner(self) -> Result<CoreState<S>, String> {
        self.core
            .into_inner()
            .map_err(|_| "node state lock poisoned".to_string())
    }
}
