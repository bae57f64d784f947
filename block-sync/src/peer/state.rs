//! Per-connection sync state.

use std::collections::VecDeque;

use dashcore::BlockHash;

use crate::chain::BlockIndex;
use crate::sync::compact::PartiallyDownloadedBlock;
use crate::types::{BlockHandle, InvItem, NodeId, PeerAddress, PeerFlags, RejectMessage, Timestamp};

/// A block requested from a peer and not yet received.
#[derive(Debug, Clone)]
pub struct QueuedBlock {
    pub hash: BlockHash,
    pub index: Option<BlockHandle>,
    /// The header was validated before the request, i.e. `index` is set.
    pub validated_headers: bool,
    /// Reconstruction state when the block is being fetched as a compact block.
    pub partial_block: Option<PartiallyDownloadedBlock>,
    pub priority: bool,
}

/// Compact block and announcement preferences learned from `sendcmpct` and `sendheaders`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCapabilities {
    /// Peer wants compact blocks carrying segregated signatures (version 2).
    pub wants_cmpct_witness: bool,
    /// Peer sent a valid `sendcmpct`, locking in its version.
    pub provides_header_and_ids: bool,
    /// Peer wants new blocks announced as compact blocks.
    pub prefer_header_and_ids: bool,
    /// Peer wants new blocks announced with `headers` instead of `inv`.
    pub prefer_headers: bool,
    /// Peer supports the compact block version we want to receive.
    pub supports_desired_cmpct_version: bool,
}

/// Everything the engine tracks about one connected peer.
#[derive(Debug, Clone)]
pub struct PeerSyncState {
    pub id: NodeId,
    pub address: PeerAddress,

    /// Best block the peer is known to have.
    pub best_known_block: Option<BlockHandle>,
    /// Hash of the last block the peer announced that we had no header for.
    pub hash_last_unknown_block: Option<BlockHash>,
    /// Last block both we and the peer have.
    pub last_common_block: Option<BlockHandle>,
    /// Best header we sent the peer.
    pub best_header_sent: Option<BlockHandle>,

    pub in_flight: VecDeque<QueuedBlock>,
    pub blocks_in_flight_valid_headers: usize,

    pub forward_sync_started: bool,
    pub reverse_sync_started: bool,
    pub partial_sync_started: bool,

    pub unconnecting_headers: u32,
    /// When the peer started holding back the download window.
    pub stalling_since: Option<Timestamp>,
    /// When the download of the front of `in_flight` started.
    pub downloading_since: Timestamp,
    /// Deadline for the next forward or reverse header response. `None` is infinite.
    pub headers_timeout: Option<Timestamp>,
    /// Deadline for the next partial header response. `None` is infinite.
    pub partial_headers_timeout: Option<Timestamp>,

    pub misbehavior: i32,
    pub should_ban: bool,
    /// A disconnect or ban is queued. Nothing more is scheduled for the peer.
    pub disconnecting: bool,

    pub preferred_download: bool,
    pub capabilities: PeerCapabilities,

    /// Block rejects to flush on the next tick.
    pub rejects: Vec<RejectMessage>,
    /// Announced transactions to request on the next tick.
    pub tx_requests: VecDeque<InvItem>,
    /// Time in seconds of the last new block this peer delivered.
    pub last_block_time: i64,
}

impl PeerSyncState {
    pub fn new(id: NodeId, address: PeerAddress) -> Self {
        let preferred_download = address.is_preferred_download();
        Self {
            id,
            address,
            best_known_block: None,
            hash_last_unknown_block: None,
            last_common_block: None,
            best_header_sent: None,
            in_flight: VecDeque::new(),
            blocks_in_flight_valid_headers: 0,
            forward_sync_started: false,
            reverse_sync_started: false,
            partial_sync_started: false,
            unconnecting_headers: 0,
            stalling_since: None,
            downloading_since: 0,
            headers_timeout: None,
            partial_headers_timeout: None,
            misbehavior: 0,
            should_ban: false,
            disconnecting: false,
            preferred_download,
            capabilities: PeerCapabilities::default(),
            rejects: Vec::new(),
            tx_requests: VecDeque::new(),
            last_block_time: 0,
        }
    }

    pub fn blocks_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_client(&self) -> bool {
        self.address.flags.contains(PeerFlags::CLIENT)
    }

    pub fn is_whitelisted(&self) -> bool {
        self.address.flags.contains(PeerFlags::WHITELISTED)
    }

    pub fn has_segregated_signatures(&self) -> bool {
        self.address.flags.contains(PeerFlags::SEGSIG)
    }

    pub fn in_flight_position(&self, hash: &BlockHash) -> Option<usize> {
        self.in_flight.iter().position(|queued| queued.hash == *hash)
    }

    pub fn queued_block_mut(&mut self, hash: &BlockHash) -> Option<&mut QueuedBlock> {
        self.in_flight.iter_mut().find(|queued| queued.hash == *hash)
    }

    /// Resolve `hash_last_unknown_block` once its header is known.
    pub fn process_block_availability<I: BlockIndex + ?Sized>(&mut self, index: &I) {
        let Some(hash) = self.hash_last_unknown_block else {
            return;
        };
        if let Some(handle) = index.lookup(&hash) {
            if index.entry(handle).is_some_and(|e| e.has_chain_work()) {
                self.consider_best_known(index, handle);
                self.hash_last_unknown_block = None;
            }
        }
    }

    /// Record that the peer has the block `hash`.
    pub fn update_block_availability<I: BlockIndex + ?Sized>(
        &mut self,
        index: &I,
        hash: &BlockHash,
    ) {
        self.process_block_availability(index);

        match index.lookup(hash) {
            Some(handle) if index.entry(handle).is_some_and(|e| e.has_chain_work()) => {
                self.consider_best_known(index, handle);
            }
            // assume the latest unknown announcement is the best one
            _ => self.hash_last_unknown_block = Some(*hash),
        }
    }

    fn consider_best_known<I: BlockIndex + ?Sized>(&mut self, index: &I, candidate: BlockHandle) {
        let better = match self.best_known_block {
            None => true,
            Some(best) => {
                index.compare_work(candidate, best).is_ge()
                    || index.height(candidate) >= index.height(best)
            }
        };
        if better {
            self.best_known_block = Some(candidate);
        }
    }

    /// Whether the peer is known to have the header of `handle`.
    pub fn has_header<I: BlockIndex + ?Sized>(&self, index: &I, handle: BlockHandle) -> bool {
        let Some(height) = index.height(handle) else {
            return false;
        };
        [self.best_known_block, self.best_header_sent]
            .into_iter()
            .flatten()
            .any(|known| index.ancestor(known, height) == Some(handle))
    }
}
