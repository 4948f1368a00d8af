//! # Chain Import Service
//!
//! Sits between the network transport and the block tree. Inbound messages
//! arrive on an mpsc queue tagged with the sending peer; anything we want to
//! say back goes out on another mpsc queue. The service itself never touches
//! a socket.
//!
//! ```text
//!  transport ──NetworkMessage──▶ ChainService ──NetworkMessage──▶ transport
//!                                   │    │
//!                      SharedBlockTree  ChainDb
//!                                   │
//!                            broadcast<ChainEvent> ──▶ API, metrics
//! ```
//!
//! ## Import Path
//!
//! 1. Verify the header hash and extrinsics root.
//! 2. Check the height against the parent, persist the block, then link it
//!    into the tree. Writing the store first means any node the tree hands
//!    out can be hydrated; a block the tree would refuse is never written.
//! 3. If the parent is unknown, park the block in the [`OrphanPool`] and ask
//!    the sender for the parent. When a parent lands, its parked children
//!    are imported in turn.
//! 4. Blocks that could only attach below the finalized root are stale and
//!    rejected outright, as are blocks whose parent was pruned by
//!    finalization. Orphans waiting on a pruned fork are dropped with it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use super::message::{
    BlockRequestMessage, BlockResponseMessage, Direction, Message, MessageError, NetworkMessage,
    PeerId, StatusMessage,
};
use super::peers::{PeerError, PeerHandle};
use crate::blocktree::{BlockTreeError, ImportOutcome, SharedBlockTree};
use crate::config::{
    MAX_BLOCKS_PER_REQUEST, MIN_SUPPORTED_VERSION, ORPHAN_POOL_CAPACITY, PROTOCOL_VERSION,
    PRUNED_HASH_MEMORY, ROLE_FULL,
};
use crate::storage::block::now_millis;
use crate::storage::{Block, BlockError, BlockHash, BlockId, ChainDb, DbError};

// ---------------------------------------------------------------------------
// Errors & Events
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("block tree: {0}")]
    Tree(#[from] BlockTreeError),

    #[error("database: {0}")]
    Db(#[from] DbError),

    #[error("invalid block: {0}")]
    InvalidBlock(#[from] BlockError),

    #[error("message: {0}")]
    Message(#[from] MessageError),

    #[error("peers: {0}")]
    Peer(#[from] PeerError),

    #[error("block #{number} is at or below finalized #{finalized}")]
    Stale { number: u64, finalized: u64 },

    #[error("block {hash} builds on pruned block {parent}")]
    PrunedParent { hash: BlockHash, parent: BlockHash },

    #[error("database has no genesis; run `init` first")]
    MissingGenesis,

    #[error("outbound channel closed")]
    ChannelClosed,
}

/// Notifications for API and metrics consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainEvent {
    BlockImported {
        hash: BlockHash,
        number: u64,
        parent_hash: BlockHash,
    },
    BestBlockChanged {
        hash: BlockHash,
        number: u64,
    },
    Finalized {
        hash: BlockHash,
        number: u64,
        pruned: usize,
    },
}

/// What happened to a block handed to [`ChainService::import_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportResult {
    Imported,
    AlreadyKnown,
    /// Buffered until `missing_parent` arrives.
    Orphaned { missing_parent: BlockHash },
}

// ---------------------------------------------------------------------------
// OrphanPool
// ---------------------------------------------------------------------------

/// Blocks waiting for their parent, keyed by the parent hash.
///
/// Bounded: when full, the oldest orphan is dropped to make room. The pool
/// also remembers the most recent hashes pruned by finalization, so that an
/// orphan chain hanging off a dead fork is dropped as soon as that fork is
/// recognized.
#[derive(Debug)]
pub struct OrphanPool {
    by_parent: HashMap<BlockHash, Vec<Block>>,
    /// Orphan hashes in arrival order, for eviction.
    order: VecDeque<BlockHash>,
    known: HashSet<BlockHash>,
    capacity: usize,
    dead: HashSet<BlockHash>,
    dead_order: VecDeque<BlockHash>,
}

impl OrphanPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            by_parent: HashMap::new(),
            order: VecDeque::new(),
            known: HashSet::new(),
            capacity,
            dead: HashSet::new(),
            dead_order: VecDeque::new(),
        }
    }

    /// Buffer `block`. Returns the evicted orphan, if the pool was full.
    pub fn insert(&mut self, block: Block) -> Option<Block> {
        let hash = block.hash();
        if self.capacity == 0 || !self.known.insert(hash) {
            return None;
        }

        let evicted = if self.known.len() > self.capacity {
            self.evict_oldest()
        } else {
            None
        };
        self.order.push_back(hash);
        self.by_parent.entry(block.parent_hash()).or_default().push(block);
        evicted
    }

    fn evict_oldest(&mut self) -> Option<Block> {
        while let Some(oldest) = self.order.pop_front() {
            if !self.known.remove(&oldest) {
                continue;
            }
            let parent = self
                .by_parent
                .iter()
                .find(|(_, waiting)| waiting.iter().any(|b| b.hash() == oldest))
                .map(|(parent, _)| *parent);
            let Some(parent) = parent else {
                continue;
            };
            let waiting = self.by_parent.get_mut(&parent)?;
            let pos = waiting.iter().position(|b| b.hash() == oldest)?;
            let block = waiting.remove(pos);
            if waiting.is_empty() {
                self.by_parent.remove(&parent);
            }
            return Some(block);
        }
        None
    }

    /// Remove and return every orphan whose parent is `parent`.
    pub fn take_children(&mut self, parent: &BlockHash) -> Vec<Block> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        for child in &children {
            self.known.remove(&child.hash());
        }
        self.order.retain(|h| self.known.contains(h));
        children
    }

    /// Drop orphans that can no longer attach above a root at `number`.
    pub fn prune_at_or_below(&mut self, number: u64) -> usize {
        let mut dropped = 0;
        for waiting in self.by_parent.values_mut() {
            waiting.retain(|b| {
                let keep = b.number() > number;
                if !keep {
                    self.known.remove(&b.hash());
                    dropped += 1;
                }
                keep
            });
        }
        self.by_parent.retain(|_, waiting| !waiting.is_empty());
        self.order.retain(|h| self.known.contains(h));
        dropped
    }

    /// Record `hashes` as unreachable and drop every orphan descending from
    /// them, however deep. Returns the number of orphans dropped.
    pub fn mark_dead(&mut self, hashes: impl IntoIterator<Item = BlockHash>) -> usize {
        let mut dropped = 0;
        let mut frontier: Vec<BlockHash> = Vec::new();
        for hash in hashes {
            self.remember_dead(hash);
            frontier.push(hash);
        }
        while let Some(hash) = frontier.pop() {
            for child in self.by_parent.remove(&hash).unwrap_or_default() {
                let child_hash = child.hash();
                self.known.remove(&child_hash);
                self.remember_dead(child_hash);
                frontier.push(child_hash);
                dropped += 1;
            }
        }
        self.order.retain(|h| self.known.contains(h));
        dropped
    }

    /// Whether `hash` was pruned, or descends from something that was.
    pub fn is_dead(&self, hash: &BlockHash) -> bool {
        self.dead.contains(hash)
    }

    fn remember_dead(&mut self, hash: BlockHash) {
        if !self.dead.insert(hash) {
            return;
        }
        self.dead_order.push_back(hash);
        while self.dead_order.len() > PRUNED_HASH_MEMORY {
            if let Some(oldest) = self.dead_order.pop_front() {
                self.dead.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.known.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub orphan_capacity: usize,
    /// Cap on blocks served per request and asked for per request.
    pub max_blocks_per_request: u32,
    /// Roles we advertise in our status message.
    pub roles: u8,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            orphan_capacity: ORPHAN_POOL_CAPACITY,
            max_blocks_per_request: MAX_BLOCKS_PER_REQUEST,
            roles: ROLE_FULL,
        }
    }
}

// ---------------------------------------------------------------------------
// ChainService
// ---------------------------------------------------------------------------

pub struct ChainService {
    config: ServiceConfig,
    tree: SharedBlockTree,
    db: Arc<ChainDb>,
    peers: PeerHandle,
    genesis_hash: BlockHash,
    outbound: mpsc::Sender<NetworkMessage>,
    events: broadcast::Sender<ChainEvent>,
    orphans: Mutex<OrphanPool>,
    next_request_id: AtomicU64,
    transactions_seen: AtomicU64,
}

impl ChainService {
    pub fn new(
        config: ServiceConfig,
        tree: SharedBlockTree,
        db: Arc<ChainDb>,
        peers: PeerHandle,
        outbound: mpsc::Sender<NetworkMessage>,
        events: broadcast::Sender<ChainEvent>,
    ) -> Self {
        let genesis_hash = tree.root().hash();
        let orphans = Mutex::new(OrphanPool::new(config.orphan_capacity));
        Self {
            config,
            tree,
            db,
            peers,
            genesis_hash,
            outbound,
            events,
            orphans,
            next_request_id: AtomicU64::new(1),
            transactions_seen: AtomicU64::new(0),
        }
    }

    /// Use the database's recorded genesis rather than the current root,
    /// which differs once the tree was restored past a finalized block.
    pub fn with_genesis_hash(mut self, genesis_hash: BlockHash) -> Self {
        self.genesis_hash = genesis_hash;
        self
    }

    pub fn tree(&self) -> &SharedBlockTree {
        &self.tree
    }

    pub fn db(&self) -> &ChainDb {
        &self.db
    }

    pub fn peers(&self) -> &PeerHandle {
        &self.peers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    pub fn transactions_seen(&self) -> u64 {
        self.transactions_seen.load(Ordering::Relaxed)
    }

    /// Status message describing our current view of the chain.
    pub fn local_status(&self) -> StatusMessage {
        let best = self.tree.deepest_leaf();
        StatusMessage {
            protocol_version: PROTOCOL_VERSION,
            min_supported_version: MIN_SUPPORTED_VERSION,
            roles: self.config.roles,
            best_block_number: best.number(),
            best_block_hash: best.hash(),
            genesis_hash: self.genesis_hash,
        }
    }

    // -- Import -------------------------------------------------------------

    /// Verify, persist and index `block`, then any orphans it unblocks.
    pub fn import_block(&self, block: Block) -> Result<ImportResult, ServiceError> {
        let hash = block.hash();
        let result = self.import_one(block)?;
        if result == ImportResult::Imported {
            self.import_waiting_children(hash);
        }
        Ok(result)
    }

    fn import_one(&self, block: Block) -> Result<ImportResult, ServiceError> {
        block.verify()?;
        let hash = block.hash();
        if self.tree.contains(&hash) {
            debug!(hash = %hash, "block already known");
            return Ok(ImportResult::AlreadyKnown);
        }

        let parent = block.parent_hash();
        let Some(parent_node) = self.tree.get_node(&parent) else {
            return self.park_orphan(block);
        };
        // Refused blocks must never reach the store, or every later
        // restore would trip over them.
        if block.number() < parent_node.number() {
            return Err(BlockTreeError::InvalidBlockNumber {
                parent_number: parent_node.number(),
                got: block.number(),
            }
            .into());
        }

        let best_before = self.tree.deepest_leaf().hash();
        self.db.put_block(&block)?;
        match self.tree.add_block(&block) {
            Ok(ImportOutcome::Imported(update)) => {
                debug!(hash = %hash, number = block.number(), update = ?update, "block imported");
            }
            Ok(ImportOutcome::AlreadyKnown) => return Ok(ImportResult::AlreadyKnown),
            // Parent was pruned by a finalization between the check and the insert.
            Err(BlockTreeError::ParentNotFound { .. }) => return self.park_orphan(block),
            Err(e) => return Err(e.into()),
        }

        let _ = self.events.send(ChainEvent::BlockImported {
            hash,
            number: block.number(),
            parent_hash: parent,
        });

        let best = self.tree.deepest_leaf();
        if best.hash() != best_before {
            info!(hash = %best.hash(), number = best.number(), "new best block");
            let _ = self.events.send(ChainEvent::BestBlockChanged {
                hash: best.hash(),
                number: best.number(),
            });
        }
        Ok(ImportResult::Imported)
    }

    fn park_orphan(&self, block: Block) -> Result<ImportResult, ServiceError> {
        let missing_parent = block.parent_hash();
        let finalized = self.tree.root().number();
        if block.number() <= finalized {
            return Err(ServiceError::Stale {
                number: block.number(),
                finalized,
            });
        }

        {
            let mut orphans = self.orphans.lock();
            if orphans.is_dead(&missing_parent) {
                let hash = block.hash();
                let dropped = orphans.mark_dead([hash]);
                debug!(hash = %hash, parent = %missing_parent, dropped, "block on pruned fork");
                return Err(ServiceError::PrunedParent {
                    hash,
                    parent: missing_parent,
                });
            }
        }

        debug!(hash = %block.hash(), parent = %missing_parent, "buffering orphan");
        if let Some(evicted) = self.orphans.lock().insert(block) {
            warn!(hash = %evicted.hash(), number = evicted.number(), "orphan pool full, evicted oldest");
        }
        Ok(ImportResult::Orphaned { missing_parent })
    }

    fn import_waiting_children(&self, parent: BlockHash) {
        let mut ready = vec![parent];
        while let Some(hash) = ready.pop() {
            let children = self.orphans.lock().take_children(&hash);
            for child in children {
                let child_hash = child.hash();
                match self.import_one(child) {
                    Ok(ImportResult::Imported) => ready.push(child_hash),
                    Ok(_) => {}
                    Err(e @ ServiceError::Tree(BlockTreeError::InvalidBlockNumber { .. })) => {
                        let dropped = self.orphans.lock().mark_dead([child_hash]);
                        warn!(hash = %child_hash, error = %e, dropped, "dropping invalid orphan");
                    }
                    Err(e) => warn!(hash = %child_hash, error = %e, "failed to import orphan"),
                }
            }
        }
    }

    // -- Finality -----------------------------------------------------------

    /// Finalize `hash` in the tree, record it on disk, and drop orphans that
    /// can no longer attach.
    pub fn finalize(&self, hash: &BlockHash) -> Result<usize, ServiceError> {
        let pruned_hashes = self.tree.finalize_pruned(hash)?;
        let pruned = pruned_hashes.len();
        self.db.set_finalized_hash(hash)?;
        let number = self.tree.root().number();
        let dropped = {
            let mut orphans = self.orphans.lock();
            orphans.prune_at_or_below(number) + orphans.mark_dead(pruned_hashes)
        };
        if dropped > 0 {
            debug!(dropped, "dropped stale orphans");
        }
        let _ = self.events.send(ChainEvent::Finalized {
            hash: *hash,
            number,
            pruned,
        });
        Ok(pruned)
    }

    // -- Message handling ---------------------------------------------------

    /// Decode raw bytes from `peer` and handle them. Undecodable input is
    /// logged and dropped.
    pub async fn handle_bytes(&self, peer: PeerId, bytes: &[u8]) -> Result<(), ServiceError> {
        match Message::decode(bytes) {
            Ok(message) => self.handle_message(NetworkMessage { peer, message }).await,
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping undecodable message");
                Ok(())
            }
        }
    }

    pub async fn handle_message(&self, msg: NetworkMessage) -> Result<(), ServiceError> {
        let NetworkMessage { peer, message } = msg;
        match message {
            Message::Status(status) => self.on_status(peer, status).await,
            Message::BlockAnnounce(announce) => {
                let header = announce.header;
                let root_number = self.tree.root().number();
                let known = self.tree.contains(&header.hash)
                    || self.orphans.lock().contains(&header.hash);
                if known || header.number <= root_number {
                    return Ok(());
                }
                debug!(peer = %peer, hash = %header.hash, number = header.number, "block announced");
                self.request(
                    peer,
                    BlockId::Hash(header.hash),
                    Some(header.hash),
                    Direction::Ascending,
                    1,
                )
                .await
            }
            Message::BlockRequest(request) => self.on_block_request(peer, request).await,
            Message::BlockResponse(response) => self.on_block_response(peer, response).await,
            Message::Transactions(txs) => {
                self.transactions_seen
                    .fetch_add(txs.extrinsics.len() as u64, Ordering::Relaxed);
                debug!(peer = %peer, count = txs.extrinsics.len(), "ignoring transactions");
                Ok(())
            }
        }
    }

    async fn on_status(&self, peer: PeerId, status: StatusMessage) -> Result<(), ServiceError> {
        let their_best = status.best_block_number;
        let their_hash = status.best_block_hash;
        if !self.peers.set_status(peer.clone(), status).await? {
            return Ok(());
        }

        let ours = self.tree.deepest_leaf();
        if their_best > ours.number() && !self.tree.contains(&their_hash) {
            debug!(peer = %peer, ours = ours.number(), theirs = their_best, "peer is ahead");
            let max = self.config.max_blocks_per_request;
            self.request(
                peer,
                BlockId::Number(ours.number() + 1),
                None,
                Direction::Ascending,
                max,
            )
            .await?;
        }
        Ok(())
    }

    async fn on_block_response(
        &self,
        peer: PeerId,
        response: BlockResponseMessage,
    ) -> Result<(), ServiceError> {
        debug!(peer = %peer, id = response.id, count = response.blocks.len(), "block response");
        let mut missing = Vec::new();
        for block in response.blocks {
            let block = block.with_arrival_time(now_millis());
            let hash = block.hash();
            match self.import_block(block) {
                Ok(ImportResult::Orphaned { missing_parent }) => {
                    if !missing.contains(&missing_parent) {
                        missing.push(missing_parent);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(peer = %peer, hash = %hash, error = %e, "rejected block"),
            }
        }

        let max = self.config.max_blocks_per_request;
        for parent in missing {
            if self.tree.contains(&parent) {
                continue;
            }
            self.request(
                peer.clone(),
                BlockId::Hash(parent),
                None,
                Direction::Descending,
                max,
            )
            .await?;
        }
        Ok(())
    }

    async fn on_block_request(
        &self,
        peer: PeerId,
        request: BlockRequestMessage,
    ) -> Result<(), ServiceError> {
        let max = request
            .max
            .unwrap_or(self.config.max_blocks_per_request)
            .min(self.config.max_blocks_per_request) as usize;
        let hashes = self.collect_request_hashes(&request, max);

        let mut blocks = Vec::with_capacity(hashes.len());
        for hash in hashes {
            match self.db.get_block(&hash)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        debug!(peer = %peer, id = request.id, count = blocks.len(), "serving blocks");
        self.send(NetworkMessage::new(
            peer,
            Message::BlockResponse(BlockResponseMessage {
                id: request.id,
                blocks,
            }),
        ))
        .await
    }

    /// Hashes answering `request`, resolved under one read lock.
    fn collect_request_hashes(&self, request: &BlockRequestMessage, max: usize) -> Vec<BlockHash> {
        self.tree.read(|tree| {
            let start = match request.from {
                BlockId::Hash(hash) => tree.get_node(&hash),
                BlockId::Number(number) => tree.get_node_from_block_number(number),
            };
            let Some(start) = start else {
                return Vec::new();
            };

            let walk: Vec<BlockHash> = match request.direction {
                Direction::Ascending => {
                    let best = tree.longest_path();
                    match best.iter().position(|n| n.hash() == start.hash()) {
                        Some(pos) => best[pos..].iter().map(|n| n.hash()).collect(),
                        None => vec![start.hash()],
                    }
                }
                Direction::Descending => tree
                    .sub_chain(&tree.root_node().hash(), &start.hash())
                    .map(|path| path.iter().rev().map(|n| n.hash()).collect())
                    .unwrap_or_else(|_| vec![start.hash()]),
            };

            let mut hashes = Vec::new();
            for hash in walk.into_iter().take(max) {
                hashes.push(hash);
                if Some(hash) == request.to {
                    break;
                }
            }
            hashes
        })
    }

    async fn request(
        &self,
        peer: PeerId,
        from: BlockId,
        to: Option<BlockHash>,
        direction: Direction,
        max: u32,
    ) -> Result<(), ServiceError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer, id, from = %from, "requesting blocks");
        self.send(NetworkMessage::new(
            peer,
            Message::BlockRequest(BlockRequestMessage {
                id,
                from,
                to,
                direction,
                max: Some(max),
            }),
        ))
        .await
    }

    async fn send(&self, msg: NetworkMessage) -> Result<(), ServiceError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| ServiceError::ChannelClosed)
    }

    /// Process inbound messages until the channel closes or `shutdown`
    /// flips to true. Per-message errors are logged and do not stop the loop.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<NetworkMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(best = self.tree.deepest_leaf().number(), "chain service started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => {
                        let peer = msg.peer.clone();
                        if let Err(e) = self.handle_message(msg).await {
                            warn!(peer = %peer, error = %e, "failed to handle message");
                            if matches!(e, ServiceError::ChannelClosed) {
                                break;
                            }
                        }
                    }
                    None => {
                        warn!("inbound channel closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("chain service stopped");
    }
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// Rebuild the in-memory tree from everything in `db`.
///
/// Blocks are replayed in height order from genesis, then the recorded
/// finalized block (if any besides genesis) is finalized again so the tree
/// comes back rooted where it was.
pub fn restore_tree(db: &ChainDb) -> Result<SharedBlockTree, ServiceError> {
    let genesis_hash = db.genesis_hash()?.ok_or(ServiceError::MissingGenesis)?;
    let genesis = db
        .get_block(&genesis_hash)?
        .ok_or(ServiceError::MissingGenesis)?;
    let tree = SharedBlockTree::from_genesis(&genesis);

    // Equal heights along a path are legal, so a child can sort ahead of its
    // parent. Park those and retry once the parent is in.
    let mut waiting: HashMap<BlockHash, Vec<Block>> = HashMap::new();
    for block in db.blocks_by_number()? {
        let mut ready = vec![block];
        while let Some(block) = ready.pop() {
            if block.hash() == genesis_hash {
                continue;
            }
            match tree.add_block(&block) {
                Ok(_) => ready.extend(waiting.remove(&block.hash()).unwrap_or_default()),
                Err(BlockTreeError::ParentNotFound { parent }) => {
                    waiting.entry(parent).or_default().push(block)
                }
                Err(e @ BlockTreeError::InvalidBlockNumber { .. }) => {
                    warn!(hash = %block.hash(), error = %e, "skipping stored block");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    let unlinked: usize = waiting.values().map(Vec::len).sum();
    if unlinked > 0 {
        warn!(unlinked, "stored blocks without a known ancestor were skipped");
    }

    if let Some(finalized) = db.finalized_hash()? {
        if finalized != genesis_hash {
            tree.finalize(&finalized)?;
        }
    }

    info!(
        blocks = tree.len(),
        best = tree.deepest_leaf().number(),
        root = tree.root().number(),
        "block tree restored"
    );
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{BlockAnnounceMessage, TransactionsMessage};
    use crate::network::peers::PeerManager;
    use crate::storage::BlockHeader;

    struct Harness {
        service: Arc<ChainService>,
        outbound: mpsc::Receiver<NetworkMessage>,
        events: broadcast::Receiver<ChainEvent>,
        genesis: Block,
    }

    fn harness_with(config: ServiceConfig) -> Harness {
        let db = Arc::new(ChainDb::open_temporary().unwrap());
        let genesis = Block::genesis([0u8; 32], 1_000);
        db.put_block(&genesis).unwrap();
        db.set_genesis_hash(&genesis.hash()).unwrap();

        let tree = SharedBlockTree::from_genesis(&genesis);
        let local = StatusMessage {
            protocol_version: PROTOCOL_VERSION,
            min_supported_version: MIN_SUPPORTED_VERSION,
            roles: ROLE_FULL,
            best_block_number: 0,
            best_block_hash: genesis.hash(),
            genesis_hash: genesis.hash(),
        };
        let (manager, peers) = PeerManager::new(local);
        tokio::spawn(manager.run());

        let (out_tx, out_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = broadcast::channel(64);
        let service = ChainService::new(config, tree, db, peers, out_tx, event_tx);
        Harness {
            service: Arc::new(service),
            outbound: out_rx,
            events: event_rx,
            genesis,
        }
    }

    fn harness() -> Harness {
        harness_with(ServiceConfig::default())
    }

    fn child(parent: &Block, tag: u8) -> Block {
        Block::new(&parent.header, vec![vec![tag]], [tag; 32])
    }

    #[tokio::test]
    async fn import_emits_events_and_persists() {
        let mut h = harness();
        let a = child(&h.genesis, 1);

        assert_eq!(h.service.import_block(a.clone()).unwrap(), ImportResult::Imported);
        assert!(h.service.db().has_block(&a.hash()).unwrap());
        assert_eq!(
            h.events.recv().await.unwrap(),
            ChainEvent::BlockImported {
                hash: a.hash(),
                number: 1,
                parent_hash: h.genesis.hash()
            }
        );
        assert_eq!(
            h.events.recv().await.unwrap(),
            ChainEvent::BestBlockChanged {
                hash: a.hash(),
                number: 1
            }
        );
        assert_eq!(h.service.import_block(a).unwrap(), ImportResult::AlreadyKnown);
    }

    #[tokio::test]
    async fn tampered_block_is_rejected() {
        let h = harness();
        let mut a = child(&h.genesis, 1);
        a.header.number = 7;
        assert!(matches!(
            h.service.import_block(a),
            Err(ServiceError::InvalidBlock(_))
        ));
        assert_eq!(h.service.tree().len(), 1);
    }

    #[tokio::test]
    async fn orphans_connect_when_parent_arrives() {
        let h = harness();
        let a = child(&h.genesis, 1);
        let b = child(&a, 2);
        let c = child(&b, 3);

        assert_eq!(
            h.service.import_block(c.clone()).unwrap(),
            ImportResult::Orphaned {
                missing_parent: b.hash()
            }
        );
        h.service.import_block(b.clone()).unwrap();
        assert_eq!(h.service.orphan_count(), 2);

        h.service.import_block(a).unwrap();
        assert_eq!(h.service.orphan_count(), 0);
        assert_eq!(h.service.tree().deepest_leaf().hash(), c.hash());
        h.service.tree().check_invariants().unwrap();
    }

    #[tokio::test]
    async fn orphan_pool_evicts_oldest() {
        let h = harness_with(ServiceConfig {
            orphan_capacity: 2,
            ..ServiceConfig::default()
        });
        let a = child(&h.genesis, 1);
        let b = child(&a, 2);
        let c = child(&b, 3);
        let d = child(&c, 4);
        for block in [&b, &c, &d] {
            h.service.import_block(block.clone()).unwrap();
        }
        assert_eq!(h.service.orphan_count(), 2);

        // b was evicted, so a links but the chain stops there.
        h.service.import_block(a.clone()).unwrap();
        assert_eq!(h.service.tree().deepest_leaf().hash(), a.hash());
    }

    #[tokio::test]
    async fn finalize_records_and_rejects_stale_blocks() {
        let mut h = harness();
        let a = child(&h.genesis, 1);
        let b = child(&a, 2);
        let side = child(&h.genesis, 9);
        for block in [&a, &b, &side] {
            h.service.import_block(block.clone()).unwrap();
        }
        while h.events.try_recv().is_ok() {}

        assert_eq!(h.service.finalize(&a.hash()).unwrap(), 2);
        assert_eq!(h.service.db().finalized_hash().unwrap(), Some(a.hash()));
        assert_eq!(
            h.events.recv().await.unwrap(),
            ChainEvent::Finalized {
                hash: a.hash(),
                number: 1,
                pruned: 2
            }
        );

        assert!(matches!(
            h.service.import_block(Block::new(&h.genesis.header, vec![], [11; 32])),
            Err(ServiceError::Stale { .. })
        ));
        // Above the new root, but hanging off the pruned fork.
        let late = child(&side, 10);
        assert!(matches!(
            h.service.import_block(late),
            Err(ServiceError::PrunedParent { .. })
        ));
        assert_eq!(h.service.orphan_count(), 0);
    }

    #[tokio::test]
    async fn orphans_on_a_pruned_fork_are_dropped() {
        let h = harness();
        let a = child(&h.genesis, 1);
        let side = child(&h.genesis, 9);
        let gap = child(&side, 10);
        let waiting = child(&gap, 11);
        let deeper = child(&waiting, 12);
        for block in [&a, &side] {
            h.service.import_block(block.clone()).unwrap();
        }
        h.service.import_block(waiting).unwrap();
        h.service.import_block(deeper).unwrap();
        assert_eq!(h.service.orphan_count(), 2);

        h.service.finalize(&a.hash()).unwrap();
        // The missing link shows up only after its fork died.
        assert!(matches!(
            h.service.import_block(gap.clone()),
            Err(ServiceError::PrunedParent { parent, .. }) if parent == side.hash()
        ));
        assert_eq!(h.service.orphan_count(), 0);
        assert!(!h.service.db().has_block(&gap.hash()).unwrap());
    }

    #[tokio::test]
    async fn block_numbered_below_parent_is_not_persisted() {
        let h = harness();
        let a = child(&h.genesis, 1);
        let b = child(&a, 2);
        for block in [&a, &b] {
            h.service.import_block(block.clone()).unwrap();
        }

        let header = BlockHeader::new(b.hash(), 1, [5; 32], [0; 32], Vec::new());
        let low = Block::from_header(header, 1_100);
        assert!(matches!(
            h.service.import_block(low.clone()),
            Err(ServiceError::Tree(BlockTreeError::InvalidBlockNumber {
                parent_number: 2,
                got: 1
            }))
        ));
        assert!(!h.service.db().has_block(&low.hash()).unwrap());

        let restored = restore_tree(h.service.db()).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.deepest_leaf().hash(), b.hash());
    }

    #[tokio::test]
    async fn invalid_orphan_takes_its_descendants_with_it() {
        let h = harness();
        let a = child(&h.genesis, 1);
        let b = child(&a, 2);
        let header = BlockHeader::new(b.hash(), 1, [5; 32], [0; 32], Vec::new());
        let low = Block::from_header(header, 1_100);
        let above_low = child(&low, 6);

        h.service.import_block(low.clone()).unwrap();
        h.service.import_block(above_low.clone()).unwrap();
        assert_eq!(h.service.orphan_count(), 2);

        h.service.import_block(a).unwrap();
        h.service.import_block(b.clone()).unwrap();
        assert_eq!(h.service.orphan_count(), 0);
        assert_eq!(h.service.tree().deepest_leaf().hash(), b.hash());
        assert!(!h.service.db().has_block(&low.hash()).unwrap());
        assert!(!h.service.db().has_block(&above_low.hash()).unwrap());
    }

    #[tokio::test]
    async fn announce_of_unknown_block_triggers_request() {
        let mut h = harness();
        let a = child(&h.genesis, 1);
        h.service
            .handle_message(NetworkMessage::new(
                "alice",
                Message::BlockAnnounce(BlockAnnounceMessage {
                    header: a.header.clone(),
                }),
            ))
            .await
            .unwrap();

        let out = h.outbound.recv().await.unwrap();
        assert_eq!(out.peer, "alice");
        match out.message {
            Message::BlockRequest(req) => {
                assert_eq!(req.from, BlockId::Hash(a.hash()));
                assert_eq!(req.to, Some(a.hash()));
                assert_eq!(req.max, Some(1));
            }
            other => panic!("expected block request, got {:?}", other),
        }

        // Known blocks are not re-requested.
        h.service.import_block(a.clone()).unwrap();
        h.service
            .handle_message(NetworkMessage::new(
                "alice",
                Message::BlockAnnounce(BlockAnnounceMessage { header: a.header }),
            ))
            .await
            .unwrap();
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn response_with_gap_requests_parent() {
        let mut h = harness();
        let a = child(&h.genesis, 1);
        let b = child(&a, 2);
        h.service
            .handle_message(NetworkMessage::new(
                "bob",
                Message::BlockResponse(BlockResponseMessage {
                    id: 3,
                    blocks: vec![b.clone()],
                }),
            ))
            .await
            .unwrap();

        match h.outbound.recv().await.unwrap().message {
            Message::BlockRequest(req) => {
                assert_eq!(req.from, BlockId::Hash(a.hash()));
                assert_eq!(req.direction, Direction::Descending);
            }
            other => panic!("expected block request, got {:?}", other),
        }

        h.service
            .handle_message(NetworkMessage::new(
                "bob",
                Message::BlockResponse(BlockResponseMessage {
                    id: 4,
                    blocks: vec![a],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(h.service.tree().deepest_leaf().hash(), b.hash());
    }

    #[tokio::test]
    async fn serves_block_requests_from_store() {
        let mut h = harness();
        let a = child(&h.genesis, 1);
        let b = child(&a, 2);
        let c = child(&b, 3);
        for block in [&a, &b, &c] {
            h.service.import_block(block.clone()).unwrap();
        }

        let ask = |from, to, direction, max| {
            NetworkMessage::new(
                "carol",
                Message::BlockRequest(BlockRequestMessage {
                    id: 77,
                    from,
                    to,
                    direction,
                    max,
                }),
            )
        };

        h.service
            .handle_message(ask(BlockId::Number(1), None, Direction::Ascending, Some(2)))
            .await
            .unwrap();
        match h.outbound.recv().await.unwrap().message {
            Message::BlockResponse(resp) => {
                assert_eq!(resp.id, 77);
                let got: Vec<_> = resp.blocks.iter().map(|b| b.hash()).collect();
                assert_eq!(got, vec![a.hash(), b.hash()]);
            }
            other => panic!("expected response, got {:?}", other),
        }

        h.service
            .handle_message(ask(
                BlockId::Hash(c.hash()),
                Some(a.hash()),
                Direction::Descending,
                None,
            ))
            .await
            .unwrap();
        match h.outbound.recv().await.unwrap().message {
            Message::BlockResponse(resp) => {
                let got: Vec<_> = resp.blocks.iter().map(|b| b.hash()).collect();
                assert_eq!(got, vec![c.hash(), b.hash(), a.hash()]);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn status_from_peer_ahead_starts_sync() {
        let mut h = harness();
        let mut status = h.service.local_status();
        status.best_block_number = 50;
        status.best_block_hash = BlockHash([5; 32]);

        h.service
            .handle_message(NetworkMessage::new("dave", Message::Status(status)))
            .await
            .unwrap();
        assert_eq!(h.service.peers().count().await.unwrap(), 1);
        match h.outbound.recv().await.unwrap().message {
            Message::BlockRequest(req) => {
                assert_eq!(req.from, BlockId::Number(1));
                assert_eq!(req.max, Some(MAX_BLOCKS_PER_REQUEST));
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn transactions_are_counted_and_dropped() {
        let h = harness();
        h.service
            .handle_message(NetworkMessage::new(
                "erin",
                Message::Transactions(TransactionsMessage {
                    extrinsics: vec![vec![1], vec![2]],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(h.service.transactions_seen(), 2);
    }

    #[tokio::test]
    async fn garbage_bytes_are_skipped() {
        let h = harness();
        h.service.handle_bytes("frank".into(), &[0xFF, 1, 2]).await.unwrap();
        h.service.handle_bytes("frank".into(), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn run_loop_imports_until_shutdown() {
        let h = harness();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let service = Arc::clone(&h.service);
        let task = tokio::spawn(service.run(in_rx, stop_rx));

        let a = child(&h.genesis, 1);
        in_tx
            .send(NetworkMessage::new(
                "gina",
                Message::BlockResponse(BlockResponseMessage {
                    id: 1,
                    blocks: vec![a.clone()],
                }),
            ))
            .await
            .unwrap();

        for _ in 0..100 {
            if h.service.tree().contains(&a.hash()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(h.service.tree().contains(&a.hash()));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn restore_replays_store_and_finality() {
        let db = ChainDb::open_temporary().unwrap();
        let genesis = Block::genesis([0u8; 32], 1_000);
        db.put_block(&genesis).unwrap();
        db.set_genesis_hash(&genesis.hash()).unwrap();

        let a = child(&genesis, 1);
        let b = child(&a, 2);
        let side = child(&genesis, 3);
        // Same height as its parent; its hash may sort ahead of b's.
        let header = BlockHeader::new(b.hash(), 2, [4; 32], [0; 32], Vec::new());
        let flat = Block::from_header(header, 1_050);
        for block in [&a, &b, &side, &flat] {
            db.put_block(block).unwrap();
        }
        db.set_finalized_hash(&a.hash()).unwrap();

        let tree = restore_tree(&db).unwrap();
        assert_eq!(tree.root().hash(), a.hash());
        assert_eq!(tree.len(), 3);
        assert!(!tree.contains(&side.hash()));
        assert_eq!(tree.deepest_leaf().hash(), flat.hash());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn restore_skips_stored_block_numbered_below_parent() {
        let db = ChainDb::open_temporary().unwrap();
        let genesis = Block::genesis([0u8; 32], 1_000);
        db.put_block(&genesis).unwrap();
        db.set_genesis_hash(&genesis.hash()).unwrap();

        let a = child(&genesis, 1);
        let b = child(&a, 2);
        let header = BlockHeader::new(b.hash(), 1, [5; 32], [0; 32], Vec::new());
        let low = Block::from_header(header, 1_100);
        for block in [&a, &b, &low] {
            db.put_block(block).unwrap();
        }

        let tree = restore_tree(&db).unwrap();
        assert_eq!(tree.len(), 3);
        assert!(!tree.contains(&low.hash()));
        tree.check_invariants().unwrap();
    }

    #[test]
    fn restore_without_genesis_fails() {
        let db = ChainDb::open_temporary().unwrap();
        assert!(matches!(restore_tree(&db), Err(ServiceError::MissingGenesis)));
    }

    #[test]
    fn orphan_pool_prunes_by_height() {
        let genesis = Block::genesis([0u8; 32], 0);
        let a = child(&genesis, 1);
        let b = child(&a, 2);
        let mut pool = OrphanPool::new(8);
        pool.insert(a.clone());
        pool.insert(b.clone());
        assert!(pool.insert(b.clone()).is_none());
        assert_eq!(pool.len(), 2);

        assert_eq!(pool.prune_at_or_below(1), 1);
        assert!(!pool.contains(&a.hash()));
        assert_eq!(pool.take_children(&a.hash()), vec![b]);
        assert!(pool.is_empty());
    }

    #[test]
    fn orphan_pool_drops_descendants_of_dead_hashes() {
        let genesis = Block::genesis([0u8; 32], 0);
        let a = child(&genesis, 1);
        let b = child(&a, 2);
        let c = child(&b, 3);
        let other = child(&genesis, 7);
        let mut pool = OrphanPool::new(8);
        for block in [&b, &c, &other] {
            pool.insert(block.clone());
        }

        assert_eq!(pool.mark_dead([a.hash()]), 2);
        assert!(pool.is_dead(&a.hash()));
        assert!(pool.is_dead(&c.hash()));
        assert!(!pool.contains(&b.hash()));
        assert!(pool.contains(&other.hash()));
        assert_eq!(pool.len(), 1);
    }
}
