//! Block download scheduling and in-flight bookkeeping.
//!
//! Every requested block is owned by exactly one peer. [`InFlightIndex`] maps hashes to
//! their owner and keeps the per-peer queues in [`PeerSyncState::in_flight`] consistent
//! with that map.

use std::collections::HashMap;

use dashcore::BlockHash;
use tracing::{debug, trace};

use crate::chain::{BlockIndex, ValidityLevel};
use crate::constants::{BLOCK_DOWNLOAD_WINDOW, FIND_BLOCKS_MIN_CHUNK, HEADER_TIP_NEAR_PRESENT};
use crate::peer::{PeerSyncState, QueuedBlock};
use crate::sync::compact::PartiallyDownloadedBlock;
use crate::sync::priority::PriorityDownloadQueue;
use crate::types::{BlockHandle, NodeId, Timestamp};

/// Result of removing a block from the in-flight index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Received {
    /// The block was in flight from some peer.
    pub requested: bool,
    /// It was requested through the priority queue.
    pub priority: bool,
    pub index: Option<BlockHandle>,
}

/// Blocks chosen for download from one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub blocks: Vec<BlockHandle>,
    /// Peer holding back the download window, if nothing could be selected because of it.
    pub staller: Option<NodeId>,
    /// The blocks come from the priority queue.
    pub priority: bool,
}

/// Global map of requested blocks to the peer they were requested from.
#[derive(Debug, Default)]
pub struct InFlightIndex {
    owners: HashMap<BlockHash, NodeId>,
    peers_with_validated_downloads: usize,
}

impl InFlightIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self, hash: &BlockHash) -> Option<NodeId> {
        self.owners.get(hash).copied()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.owners.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn peers_with_validated_downloads(&self) -> usize {
        self.peers_with_validated_downloads
    }

    /// Record that `hash` was requested from `peer`.
    ///
    /// Returns false without side effects if that exact pair is already in flight.
    /// Any other owner of `hash` loses it.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_in_flight(
        &mut self,
        peers: &mut HashMap<NodeId, PeerSyncState>,
        peer: NodeId,
        hash: BlockHash,
        index: Option<BlockHandle>,
        with_partial_block: bool,
        priority: bool,
        now: Timestamp,
    ) -> bool {
        if self.owner(&hash) == Some(peer) {
            return false;
        }
        if !peers.contains_key(&peer) {
            return false;
        }

        self.mark_received(peers, &hash, now);

        let Some(state) = peers.get_mut(&peer) else {
            return false;
        };
        let validated_headers = index.is_some();
        state.in_flight.push_back(QueuedBlock {
            hash,
            index,
            validated_headers,
            partial_block: with_partial_block.then(PartiallyDownloadedBlock::new),
            priority,
        });
        if validated_headers {
            state.blocks_in_flight_valid_headers += 1;
            if state.blocks_in_flight_valid_headers == 1 {
                self.peers_with_validated_downloads += 1;
            }
        }
        if state.in_flight.len() == 1 {
            // starting a new download batch from this peer
            state.downloading_since = now;
        }
        self.owners.insert(hash, peer);
        true
    }

    /// Remove `hash` from whichever peer owns it.
    pub fn mark_received(
        &mut self,
        peers: &mut HashMap<NodeId, PeerSyncState>,
        hash: &BlockHash,
        now: Timestamp,
    ) -> Received {
        let Some(owner) = self.owners.remove(hash) else {
            return Received::default();
        };
        let Some(state) = peers.get_mut(&owner) else {
            return Received::default();
        };
        let Some(position) = state.in_flight_position(hash) else {
            return Received::default();
        };

        let queued = state.in_flight.remove(position);
        let Some(queued) = queued else {
            return Received::default();
        };
        if queued.validated_headers {
            state.blocks_in_flight_valid_headers -= 1;
            if state.blocks_in_flight_valid_headers == 0 {
                self.peers_with_validated_downloads -= 1;
            }
        }
        if position == 0 {
            // the front of the queue arrived, the next one starts its clock now
            state.downloading_since = state.downloading_since.max(now);
        }
        state.stalling_since = None;

        Received {
            requested: true,
            priority: queued.priority,
            index: queued.index,
        }
    }

    /// Drop every entry owned by a disconnecting peer. Returns the number removed.
    pub fn remove_peer(&mut self, state: &PeerSyncState) -> usize {
        for queued in &state.in_flight {
            self.owners.remove(&queued.hash);
        }
        if state.blocks_in_flight_valid_headers > 0 {
            self.peers_with_validated_downloads -= 1;
        }
        state.in_flight.len()
    }

    /// Pick up to `count` blocks to request from the peer in `state`.
    #[allow(clippy::too_many_arguments)]
    pub fn find_next_blocks<I: BlockIndex + ?Sized>(
        &self,
        state: &mut PeerSyncState,
        index: &I,
        priority_queue: &PriorityDownloadQueue,
        count: usize,
        full_sync_mode: bool,
        prevent_during_header_sync: bool,
        adjusted_time: i64,
    ) -> Selection {
        let mut selection = Selection::default();
        if count == 0 {
            return selection;
        }

        state.process_block_availability(index);

        if !priority_queue.is_empty() {
            selection.priority = true;
            let best_height = state.best_known_block.and_then(|best| index.height(best));
            for request in priority_queue.pending() {
                let Some(entry) = index.entry(request.handle) else {
                    continue;
                };
                let reachable = best_height.is_some_and(|best| best >= entry.height);
                if reachable && !self.contains(&entry.hash) {
                    selection.blocks.push(request.handle);
                    if selection.blocks.len() == count {
                        break;
                    }
                }
            }
            return selection;
        }

        if !full_sync_mode {
            return selection;
        }

        if prevent_during_header_sync {
            let tip_time = index.header_tip().and_then(|tip| index.entry(tip)).map(|e| e.time());
            let near_present = adjusted_time - HEADER_TIP_NEAR_PRESENT.as_secs() as i64;
            let still_old = tip_time.map_or(true, |time| time < near_present);
            if still_old {
                return selection;
            }
        }

        let Some(best_known) = state.best_known_block else {
            return selection;
        };
        let Some(best_height) = index.height(best_known) else {
            return selection;
        };
        let active_height = index.active_height();
        if let Some(tip) = index.active_tip() {
            if index.compare_work(best_known, tip).is_lt() && best_height < active_height {
                // this peer has nothing interesting
                return selection;
            }
        }
        if !index.meets_minimum_chain_work(best_known) {
            return selection;
        }

        if state.last_common_block.is_none() {
            // guess a parent of our tip as the fork point, a wrong guess is corrected below
            state.last_common_block = index.active_at(best_height.min(active_height));
        }
        let Some(last_common) = state
            .last_common_block
            .and_then(|common| index.last_common_ancestor(common, best_known))
        else {
            return selection;
        };
        state.last_common_block = Some(last_common);

        if last_common == best_known {
            if best_height >= active_height {
                if let Some(entry) = index.entry(best_known) {
                    if !entry.is_valid(ValidityLevel::Tree)
                        || (!state.has_segregated_signatures()
                            && index.is_segsig_enabled(entry.prev))
                    {
                        return selection;
                    }
                    if !entry.has_data()
                        && !index.active_contains(best_known)
                        && !self.contains(&entry.hash)
                    {
                        selection.blocks.push(best_known);
                    }
                }
            }
            return selection;
        }

        let Some(common_height) = index.height(last_common) else {
            return selection;
        };
        let window_end = common_height + BLOCK_DOWNLOAD_WINDOW;
        let max_height = best_height.min(window_end + 1);
        let mut walk_height = common_height;
        let mut waiting_for: Option<NodeId> = None;

        while walk_height < max_height {
            let wanted =
                (count - selection.blocks.len()).max(FIND_BLOCKS_MIN_CHUNK as usize) as i32;
            let to_fetch = (max_height - walk_height).min(wanted);
            let chunk: Vec<BlockHandle> = ((walk_height + 1)..=(walk_height + to_fetch))
                .filter_map(|height| index.ancestor(best_known, height))
                .collect();
            walk_height += to_fetch;

            for handle in chunk {
                let Some(entry) = index.entry(handle) else {
                    return selection;
                };
                if !entry.is_valid(ValidityLevel::Tree) {
                    // the chain this peer is on is invalid
                    return selection;
                }
                if !state.has_segregated_signatures() && index.is_segsig_enabled(entry.prev) {
                    return selection;
                }

                if entry.has_data() || index.active_contains(handle) {
                    if entry.chain_tx > 0 {
                        state.last_common_block = Some(handle);
                    }
                } else if let Some(owner) = self.owner(&entry.hash) {
                    if waiting_for.is_none() {
                        waiting_for = Some(owner);
                    }
                } else {
                    if entry.height > window_end {
                        // would fit if the window were one larger
                        if selection.blocks.is_empty() && waiting_for != Some(state.id) {
                            selection.staller = waiting_for;
                        }
                        return selection;
                    }
                    selection.blocks.push(handle);
                    if selection.blocks.len() == count {
                        return selection;
                    }
                }
            }
        }

        trace!(peer = %state.id, "Selected {} blocks for download", selection.blocks.len());
        selection
    }
}

/// Verify that the index and every per-peer queue agree. Used by tests and debug assertions.
pub fn check_consistency(index: &InFlightIndex, peers: &HashMap<NodeId, PeerSyncState>) -> bool {
    let queued: usize = peers.values().map(|state| state.in_flight.len()).sum();
    if queued != index.owners.len() {
        debug!("In-flight index has {} entries, peers queue {}", index.owners.len(), queued);
        return false;
    }
    let validated = peers.values().filter(|state| state.blocks_in_flight_valid_headers > 0).count();
    if validated != index.peers_with_validated_downloads {
        return false;
    }
    peers.iter().all(|(id, state)| {
        state.in_flight.iter().all(|queued| index.owner(&queued.hash) == Some(*id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_address, MockChain};

    fn peers(ids: &[u64]) -> HashMap<NodeId, PeerSyncState> {
        ids.iter()
            .map(|&id| (NodeId(id), PeerSyncState::new(NodeId(id), test_address(0))))
            .collect()
    }

    #[test]
    fn test_mark_in_flight_single_owner() {
        let chain = MockChain::with_headers_only(10);
        let mut peers = peers(&[1, 2]);
        let mut index = InFlightIndex::new();
        let handle = chain.at_height(1).unwrap();
        let hash = chain.hash_at(1);

        assert!(index.mark_in_flight(&mut peers, NodeId(1), hash, Some(handle), false, false, 10));
        // same pair again is a no-op
        assert!(!index.mark_in_flight(&mut peers, NodeId(1), hash, Some(handle), false, false, 20));
        assert_eq!(peers[&NodeId(1)].downloading_since, 10);
        assert_eq!(index.peers_with_validated_downloads(), 1);

        // another peer takes over
        assert!(index.mark_in_flight(&mut peers, NodeId(2), hash, Some(handle), false, false, 30));
        assert_eq!(index.owner(&hash), Some(NodeId(2)));
        assert_eq!(peers[&NodeId(1)].blocks_in_flight(), 0);
        assert_eq!(peers[&NodeId(2)].blocks_in_flight(), 1);
        assert!(check_consistency(&index, &peers));
    }

    #[test]
    fn test_mark_received_updates_state() {
        let chain = MockChain::with_headers_only(10);
        let mut peers = peers(&[1]);
        let mut index = InFlightIndex::new();
        for height in 1..=3 {
            index.mark_in_flight(
                &mut peers,
                NodeId(1),
                chain.hash_at(height),
                chain.at_height(height),
                false,
                height == 2,
                100,
            );
        }
        peers.get_mut(&NodeId(1)).unwrap().stalling_since = Some(50);

        let received = index.mark_received(&mut peers, &chain.hash_at(2), 500);
        assert!(received.requested);
        assert!(received.priority);
        // not the front, so the download clock is untouched
        assert_eq!(peers[&NodeId(1)].downloading_since, 100);
        assert!(peers[&NodeId(1)].stalling_since.is_none());

        index.mark_received(&mut peers, &chain.hash_at(1), 700);
        assert_eq!(peers[&NodeId(1)].downloading_since, 700);

        assert_eq!(index.mark_received(&mut peers, &chain.hash_at(9), 800), Received::default());
        assert!(check_consistency(&index, &peers));
    }

    #[test]
    fn test_remove_peer() {
        let chain = MockChain::with_headers_only(10);
        let mut peers = peers(&[1, 2]);
        let mut index = InFlightIndex::new();
        for height in 1..=4 {
            let peer = NodeId(1 + (height % 2) as u64);
            let hash = chain.hash_at(height);
            index.mark_in_flight(&mut peers, peer, hash, chain.at_height(height), false, false, 0);
        }
        let state = peers.remove(&NodeId(1)).unwrap();
        assert_eq!(index.remove_peer(&state), 2);
        assert_eq!(index.len(), 2);
        assert!(check_consistency(&index, &peers));
    }

    #[test]
    fn test_find_next_blocks_walks_window() {
        let chain = MockChain::with_headers_only(300);
        let mut peers = peers(&[1]);
        let index = InFlightIndex::new();
        let state = peers.get_mut(&NodeId(1)).unwrap();
        state.best_known_block = chain.at_height(300);

        let queue = PriorityDownloadQueue::new();
        let selection = index.find_next_blocks(state, &chain, &queue, 16, true, false, 0);
        assert!(!selection.priority);
        assert_eq!(selection.blocks.len(), 16);
        assert_eq!(selection.blocks[0], chain.at_height(1).unwrap());
        assert_eq!(selection.blocks[15], chain.at_height(16).unwrap());
        assert_eq!(state.last_common_block, chain.at_height(0));
    }

    #[test]
    fn test_find_next_blocks_nothing_when_peer_at_our_tip() {
        let chain = MockChain::with_active_chain(20);
        let mut peers = peers(&[1]);
        let index = InFlightIndex::new();
        let state = peers.get_mut(&NodeId(1)).unwrap();
        state.best_known_block = chain.active_tip();

        let queue = PriorityDownloadQueue::new();
        let selection = index.find_next_blocks(state, &chain, &queue, 16, true, false, 0);
        assert!(selection.blocks.is_empty());
        assert!(selection.staller.is_none());
    }

    #[test]
    fn test_find_next_blocks_reports_staller() {
        let chain = MockChain::with_headers_only(2000);
        let mut peers = peers(&[1, 2]);
        let mut index = InFlightIndex::new();
        // peer 2 holds the first block of the window
        let first = chain.hash_at(1);
        index.mark_in_flight(&mut peers, NodeId(2), first, chain.at_height(1), false, false, 0);
        // the rest of the window is already stored, only the block past it is missing
        let mut chain = chain;
        for height in 2..=BLOCK_DOWNLOAD_WINDOW {
            chain.store_block(chain.at_height(height).unwrap());
        }

        let state = peers.get_mut(&NodeId(1)).unwrap();
        state.best_known_block = chain.at_height(2000);
        let queue = PriorityDownloadQueue::new();
        let selection = index.find_next_blocks(state, &chain, &queue, 16, true, false, 0);
        assert!(selection.blocks.is_empty());
        assert_eq!(selection.staller, Some(NodeId(2)));
    }

    #[test]
    fn test_find_next_blocks_priority_first() {
        let chain = MockChain::with_headers_only(50);
        let mut peers = peers(&[1]);
        let index = InFlightIndex::new();
        let mut queue = PriorityDownloadQueue::new();
        let wanted = [chain.at_height(40).unwrap(), chain.at_height(45).unwrap()];
        queue.add(&wanted, std::sync::Arc::new(|_, _| {}), &chain);

        let state = peers.get_mut(&NodeId(1)).unwrap();
        state.best_known_block = chain.at_height(42);
        // full sync disabled: priority requests are still served
        let selection = index.find_next_blocks(state, &chain, &queue, 16, false, false, 0);
        assert!(selection.priority);
        assert_eq!(selection.blocks, vec![wanted[0]]);
    }

    #[test]
    fn test_find_next_blocks_held_back_during_header_sync() {
        let chain = MockChain::with_headers_only(50);
        let mut peers = peers(&[1]);
        let index = InFlightIndex::new();
        let state = peers.get_mut(&NodeId(1)).unwrap();
        state.best_known_block = chain.at_height(50);

        let far_future = 10 * HEADER_TIP_NEAR_PRESENT.as_secs() as i64 + chain.tip_time();
        let queue = PriorityDownloadQueue::new();
        let held = index.find_next_blocks(state, &chain, &queue, 8, true, true, far_future);
        assert!(held.blocks.is_empty());
        let tip_time = chain.tip_time();
        let released = index.find_next_blocks(state, &chain, &queue, 8, true, true, tip_time);
        assert_eq!(released.blocks.len(), 8);
    }
}
