//! The sync engine context.
//!
//! [`SyncEngine`] owns every table shared across peers: per-peer state, the in-flight index,
//! the header sync coordinator, the orphan pool and the priority queue. All public operations
//! take `&mut self`; callers serialize access with one coarse lock (see [`crate::service`]).
//!
//! The engine never performs I/O. Outbound messages, disconnects and bans are queued as
//! [`PeerAction`]s and collected with [`SyncEngine::take_actions`].

mod handlers;
mod lifecycle;
mod tick;

use std::collections::HashMap;
use std::sync::Arc;

use dashcore::{BlockHash, Transaction, Txid};
use tracing::{debug, error, warn};

use crate::chain::Checkpoints;
use crate::config::SyncConfig;
use crate::constants::reject_codes;
use crate::error::{SyncEngineError, SyncResult};
use crate::mempool::{OrphanTransactionPool, RecentRejects};
use crate::peer::{BanDecision, MisbehaviorTracker, PeerSyncState};
use crate::sync::{
    ExtraTxCache, HeaderSyncCoordinator, InFlightIndex, PriorityCallback, PriorityDownloadQueue,
};
use crate::types::{
    BlockHandle, HeaderProgress, NodeId, NodeStateStats, OutboundMessage, PeerAction,
    RejectMessage, RejectedItem, Timestamp,
};
use crate::validation::{Clock, NodeBackend, RejectReason, SyncObserver};

/// Capacity of the recently rejected transaction filter.
const RECENT_REJECTS_CAPACITY: usize = 120_000;

/// Peer block and header synchronization engine.
pub struct SyncEngine<N: NodeBackend> {
    /// Engine configuration
    config: SyncConfig,

    /// Block index, validation, mempool and block storage
    node: N,

    /// Source of time for timeouts and orphan expiry
    clock: Arc<dyn Clock>,

    /// Compiled checkpoints anchoring reverse header sync
    checkpoints: Checkpoints,

    /// Sync state of every connected peer
    peers: HashMap<NodeId, PeerSyncState>,

    /// Requested blocks and their owners
    in_flight: InFlightIndex,

    /// Forward, reverse and partial header sync counters and the reverse staging buffer
    headers: HeaderSyncCoordinator,

    orphans: OrphanTransactionPool,

    /// Recently seen transactions outside the mempool, for compact block reconstruction
    extra_txn: ExtraTxCache,

    priority: PriorityDownloadQueue,

    misbehavior: MisbehaviorTracker,

    /// Peer that delivered a block, and whether it may be punished if the block is invalid
    block_sources: HashMap<BlockHash, (NodeId, bool)>,

    recent_rejects: RecentRejects,

    observers: Vec<Arc<dyn SyncObserver>>,

    /// Actions queued for the connection layer
    actions: Vec<(NodeId, PeerAction)>,

    /// Hold back block download until the header tip is close to the present
    prevent_block_download_during_header_sync: bool,

    /// Best starting height advertised by any peer
    max_starting_height: i32,

    /// Number of connected peers we prefer to download from
    preferred_download_count: usize,
}

/// Look up a peer's state in the table, independently of the other engine fields.
fn state_mut(
    peers: &mut HashMap<NodeId, PeerSyncState>,
    peer: NodeId,
) -> SyncResult<&mut PeerSyncState> {
    peers.get_mut(&peer).ok_or(SyncEngineError::UnknownPeer(peer))
}

/// Reject message for `reason`, if its code may be sent over the wire.
fn reject_message(reason: &RejectReason, item: RejectedItem) -> Option<RejectMessage> {
    if reason.code == 0 || reason.code >= reject_codes::INTERNAL {
        return None;
    }
    Some(RejectMessage {
        code: reason.code as u8,
        reason: reason.reason.chars().take(reject_codes::MAX_REASON_LENGTH).collect(),
        item,
    })
}

impl<N: NodeBackend> SyncEngine<N> {
    /// Create an engine with empty tables.
    pub fn new(
        config: SyncConfig,
        node: N,
        checkpoints: Checkpoints,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        config.validate()?;

        Ok(Self {
            in_flight: InFlightIndex::new(),
            headers: HeaderSyncCoordinator::new(config.reverse_headers),
            orphans: OrphanTransactionPool::new(
                config.orphan_expire_time,
                config.orphan_expire_interval,
                config.max_orphan_tx_weight,
            ),
            extra_txn: ExtraTxCache::new(config.block_reconstruction_extra_txn),
            priority: PriorityDownloadQueue::new(),
            misbehavior: MisbehaviorTracker::new(config.ban_score_threshold),
            block_sources: HashMap::new(),
            recent_rejects: RecentRejects::new(RECENT_REJECTS_CAPACITY),
            observers: Vec::new(),
            actions: Vec::new(),
            prevent_block_download_during_header_sync: false,
            max_starting_height: 0,
            preferred_download_count: 0,
            peers: HashMap::new(),
            config,
            node,
            clock,
            checkpoints,
        })
    }

    /// Register an observer for progress and relay notifications.
    pub fn add_observer(&mut self, observer: Arc<dyn SyncObserver>) {
        self.observers.push(observer);
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut N {
        &mut self.node
    }

    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    pub fn peer(&self, peer: NodeId) -> Option<&PeerSyncState> {
        self.peers.get(&peer)
    }

    /// Connected peers in ascending id order.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn in_flight(&self) -> &InFlightIndex {
        &self.in_flight
    }

    pub fn header_sync(&self) -> &HeaderSyncCoordinator {
        &self.headers
    }

    pub fn orphans(&self) -> &OrphanTransactionPool {
        &self.orphans
    }

    pub fn extra_txn(&self) -> &ExtraTxCache {
        &self.extra_txn
    }

    pub fn preferred_download_count(&self) -> usize {
        self.preferred_download_count
    }

    /// Whether `txid` was rejected since the active tip last changed.
    pub fn is_recently_rejected(&mut self, txid: &Txid) -> bool {
        let tip = self.node.active_tip().and_then(|tip| self.node.hash(tip));
        self.recent_rejects.reset_on_tip(tip);
        self.recent_rejects.contains(txid)
    }

    /// Drain the actions queued for the connection layer.
    pub fn take_actions(&mut self) -> Vec<(NodeId, PeerAction)> {
        std::mem::take(&mut self.actions)
    }

    /// Stop or resume holding back block download while the header tip is old.
    pub fn prevent_block_download_during_header_sync(&mut self, prevent: bool) {
        self.prevent_block_download_during_header_sync = prevent;
    }

    /// Queue blocks to be fetched ahead of normal traffic and delivered to `callback` in order.
    pub fn add_priority_download(
        &mut self,
        handles: &[BlockHandle],
        callback: PriorityCallback,
    ) -> SyncResult<()> {
        self.priority.add(handles, callback, &self.node);
        debug!("Added {} priority block requests", handles.len());
        // blocks already on disk can be delivered right away
        self.process_priority_requests()
    }

    pub fn cancel_priority_download(&mut self, handle: BlockHandle) -> usize {
        self.priority.cancel(handle)
    }

    pub fn cancel_all_priority_downloads(&mut self) {
        self.priority.cancel_all();
    }

    pub fn count_priority_downloads(&self) -> usize {
        self.priority.len()
    }

    /// Validation finished checking a block. Queues a reject for and penalizes the peer
    /// that delivered it when the block was invalid.
    pub fn block_checked(&mut self, hash: &BlockHash, rejection: Option<&RejectReason>) {
        let source = self.block_sources.remove(hash);
        let (Some(reason), Some((peer, punish))) = (rejection, source) else {
            return;
        };
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };

        if let Some(reject) = reject_message(reason, RejectedItem::Block(*hash)) {
            state.rejects.push(reject);
        }
        if reason.dos_score > 0 && punish {
            self.misbehavior.penalize(state, reason.dos_score);
        }
    }

    /// A block was connected to the active chain.
    pub fn block_connected(&mut self, block: &dashcore::Block) {
        let erased = self.orphans.erase_for_block(block);
        if erased > 0 {
            debug!("Erased {} orphan tx included or conflicted by block", erased);
        }
    }

    /// Statistics for the RPC layer, `None` for an unknown peer.
    pub fn node_state_stats(&self, peer: NodeId) -> Option<NodeStateStats> {
        let state = self.peers.get(&peer)?;
        let height_of = |handle: Option<BlockHandle>| {
            handle.and_then(|h| self.node.height(h)).unwrap_or(-1)
        };
        Some(NodeStateStats {
            misbehavior_score: state.misbehavior,
            sync_height: height_of(state.best_known_block),
            common_height: height_of(state.last_common_block),
            heights_in_flight: state
                .in_flight
                .iter()
                .filter_map(|queued| queued.index.and_then(|h| self.node.height(h)))
                .collect(),
        })
    }

    /// Best guess of the network's chain height.
    pub fn probable_height(&self) -> i32 {
        let best_header = self.node.best_header().and_then(|h| self.node.height(h)).unwrap_or(0);
        let best_partial =
            self.node.best_partial_header().and_then(|h| self.node.height(h)).unwrap_or(0);
        self.max_starting_height
            .max(self.checkpoints.last_height())
            .max(best_header)
            .max(best_partial)
    }

    fn now(&self) -> Timestamp {
        self.clock.now_micros()
    }

    fn push_message(&mut self, peer: NodeId, message: OutboundMessage) {
        self.actions.push((peer, PeerAction::Send(message)));
    }

    /// Queue a disconnect or ban and stop scheduling work for `peer`.
    fn drop_peer(&mut self, peer: NodeId, action: PeerAction) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.disconnecting = true;
        }
        self.actions.push((peer, action));
    }

    fn misbehaving(&mut self, peer: NodeId, amount: i32, reason: &str) {
        if let Some(state) = self.peers.get_mut(&peer) {
            debug!(peer = %peer, "Penalizing peer by {}: {}", amount, reason);
            self.misbehavior.penalize(state, amount);
        }
    }

    /// Penalize `peer` and build the matching protocol violation.
    fn violation(
        &mut self,
        peer: NodeId,
        penalty: i32,
        reason: impl Into<String>,
    ) -> SyncEngineError {
        let reason = reason.into();
        self.misbehaving(peer, penalty, &reason);
        SyncEngineError::ProtocolViolation {
            peer,
            reason,
            penalty,
        }
    }

    /// The active tip is recent enough to fetch new blocks directly on announcement.
    fn can_direct_fetch(&self) -> bool {
        let spacing = self.config.pow_target_spacing.as_secs() as i64;
        let cutoff = self.clock.adjusted_time() - spacing * 20;
        self.node
            .active_tip()
            .and_then(|tip| self.node.entry(tip))
            .is_some_and(|entry| entry.time() > cutoff)
    }

    fn already_have_tx(&mut self, txid: &Txid) -> bool {
        self.is_recently_rejected(txid) || self.node.contains(txid) || self.orphans.contains(txid)
    }

    fn relay_transaction(&self, tx: &Arc<Transaction>) {
        for observer in &self.observers {
            observer.relay_transaction(tx);
        }
    }

    fn notify_header_progress(&self) {
        if self.observers.is_empty() {
            return;
        }
        let best_header_height =
            self.node.best_header().and_then(|h| self.node.height(h)).unwrap_or(-1);
        let best_partial_height =
            self.node.best_partial_header().and_then(|h| self.node.height(h)).unwrap_or(-1);
        let reverse_buffered = self.headers.reverse.len();
        let progress = HeaderProgress {
            header_count: best_header_height + 1 + reverse_buffered as i32,
            best_header_height,
            best_partial_height,
            reverse_buffered,
            probable_height: self.probable_height(),
        };
        for observer in &self.observers {
            observer.header_progress(progress);
        }
    }

    /// Deliver completed priority requests. A drain failure resets the scan in SPV mode
    /// and is fatal otherwise.
    fn process_priority_requests(&mut self) -> SyncResult<()> {
        match self.priority.drain(&self.node) {
            Ok(_) => Ok(()),
            Err(err) if self.config.spv_mode => {
                warn!("{}, resetting SPV scan", err);
                self.priority.cancel_all();
                let reason = err.to_string();
                for observer in &self.observers {
                    observer.spv_reset_requested(&reason);
                }
                Ok(())
            }
            Err(err) => {
                error!("Priority block delivery failed: {}", err);
                Err(SyncEngineError::Fatal(err.to_string()))
            }
        }
    }

    /// Flush queued block rejects and act on a raised ban flag.
    /// Returns true if the peer is being disconnected.
    fn send_rejects_and_check_banned(&mut self, peer: NodeId) -> bool {
        let Some(state) = self.peers.get_mut(&peer) else {
            return false;
        };
        for reject in state.rejects.drain(..) {
            self.actions.push((peer, PeerAction::Send(OutboundMessage::Reject(reject))));
        }
        match self.misbehavior.resolve(state) {
            BanDecision::None => false,
            BanDecision::DisconnectOnly => {
                self.drop_peer(peer, PeerAction::Disconnect);
                true
            }
            BanDecision::Ban => {
                self.drop_peer(peer, PeerAction::Ban);
                true
            }
        }
    }
}
