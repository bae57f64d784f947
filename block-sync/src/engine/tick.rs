//! Periodic per-peer work: starting header sync, enforcing timeouts and scheduling downloads.

use std::collections::VecDeque;

use dashcore::hashes::Hash;
use dashcore::BlockHash;
use tracing::{debug, info, warn};

use super::{state_mut, SyncEngine};
use crate::chain::block_locator;
use crate::constants::{
    HEADER_TIP_NEAR_PRESENT, MAX_BLOCKS_IN_TRANSIT_PER_PEER, MAX_GETDATA_BATCH,
    REVERSEHEADERS_VERSION,
};
use crate::error::SyncResult;
use crate::types::{InvItem, NodeId, OutboundMessage, PeerAction, PeerFlags};
use crate::validation::NodeBackend;

impl<N: NodeBackend> SyncEngine<N> {
    /// Run the periodic send step for `peer`.
    ///
    /// The connection layer calls this for every peer after each handled message and on
    /// every tick. Any resulting messages or disconnects are queued as actions.
    pub fn send_messages(&mut self, peer: NodeId) -> SyncResult<()> {
        if state_mut(&mut self.peers, peer)?.disconnecting {
            return Ok(());
        }
        if self.send_rejects_and_check_banned(peer) {
            return Ok(());
        }

        let now = self.now();
        let adjusted = self.clock.adjusted_time();
        let header_timeout = self.config.headers_download_timeout.as_micros() as i64;
        let last_checkpoint = self.checkpoints.last_height();
        let partial_active = self.node.is_partial_sync_active();
        let partial_near_present = self.node.is_partial_near_present();
        let ibd = self.node.is_initial_block_download();

        let best_header = self.node.best_header();
        let best_entry = best_header.and_then(|h| self.node.entry(h));
        let best_header_height = best_entry.map_or(-1, |entry| entry.height);
        let near_present = adjusted - HEADER_TIP_NEAR_PRESENT.as_secs() as i64;
        let best_header_recent = best_entry.is_some_and(|entry| entry.time() > near_present);
        let best_header_prev = best_entry.and_then(|entry| entry.prev);

        let state = state_mut(&mut self.peers, peer)?;
        if state.partial_sync_started && !partial_active {
            state.partial_sync_started = false;
            state.partial_headers_timeout = None;
            self.headers.partial_started = self.headers.partial_started.saturating_sub(1);
        }

        let is_client = state.is_client();
        let one_shot = state.address.flags.contains(PeerFlags::ONE_SHOT);
        let fetch = state.address.starting_height >= last_checkpoint
            && (state.preferred_download
                || (self.preferred_download_count == 0 && !is_client && !one_shot));

        // Partial (light) header sync from the best partial header.
        if fetch
            && !state.partial_sync_started
            && self.headers.partial_started == 0
            && partial_active
            && !is_client
        {
            state.partial_sync_started = true;
            self.headers.partial_started += 1;
            state.partial_headers_timeout =
                if partial_near_present { None } else { Some(now + header_timeout) };
            let from = self.node.best_partial_header();
            info!(
                peer = %peer,
                "Starting partial header sync from height {}",
                from.and_then(|h| self.node.height(h)).unwrap_or(-1)
            );
            let locator = block_locator(&self.node, from);
            self.push_message(
                peer,
                OutboundMessage::GetHeaders {
                    locator,
                    stop: BlockHash::all_zeros(),
                },
            );
        }

        // Full header sync, reverse from the last checkpoint when possible.
        let state = state_mut(&mut self.peers, peer)?;
        if self.config.full_sync_mode
            && (!partial_active || partial_near_present)
            && !state.forward_sync_started
            && !state.reverse_sync_started
            && !is_client
        {
            let reverse_gap = last_checkpoint - self.headers.reverse.len() as i32;
            if self.headers.reverse_enabled()
                && state.address.version >= REVERSEHEADERS_VERSION
                && self.headers.rsync_started == 0
                && fetch
                && state.address.starting_height > last_checkpoint
                && best_header_height < reverse_gap
            {
                state.reverse_sync_started = true;
                self.headers.rsync_started += 1;
                if !best_header_recent {
                    state.headers_timeout = Some(now + header_timeout);
                }
                let (height, count) =
                    self.headers.reverse.next_request(last_checkpoint, best_header_height);
                info!(
                    peer = %peer,
                    "Starting reverse header sync: getrheaders ({}, {})",
                    height,
                    count
                );
                self.push_message(
                    peer,
                    OutboundMessage::GetRHeaders {
                        height,
                        count,
                    },
                );
            } else if (self.headers.rsync_started == 0 && self.headers.sync_started == 0 && fetch)
                || best_header_recent
            {
                state.forward_sync_started = true;
                self.headers.sync_started += 1;
                if !best_header_recent {
                    state.headers_timeout = Some(now + header_timeout);
                }
                // one back so the peer answers with at least one header even if it is in sync
                let from = best_header_prev.or(best_header);
                info!(
                    peer = %peer,
                    "Initial getheaders ({}) to peer (startheight: {})",
                    from.and_then(|h| self.node.height(h)).unwrap_or(-1),
                    state.address.starting_height
                );
                let locator = block_locator(&self.node, from);
                self.push_message(
                    peer,
                    OutboundMessage::GetHeaders {
                        locator,
                        stop: BlockHash::all_zeros(),
                    },
                );
            }
        }

        if self.check_timeouts(peer, now)? {
            return Ok(());
        }

        self.request_blocks(peer, fetch, ibd, now, adjusted)?;
        self.request_transactions(peer)
    }

    /// Enforce stalling, block download and header timeouts. Returns true if the peer is
    /// being disconnected.
    fn check_timeouts(&mut self, peer: NodeId, now: i64) -> SyncResult<bool> {
        let stalling_timeout = self.config.block_stalling_timeout.as_micros() as i64;
        let state = state_mut(&mut self.peers, peer)?;

        if state.stalling_since.is_some_and(|since| since < now - stalling_timeout) {
            warn!(peer = %peer, "Peer is stalling block download, disconnecting");
            self.drop_peer(peer, PeerAction::Disconnect);
            return Ok(true);
        }

        if !state.in_flight.is_empty() {
            let own = usize::from(state.blocks_in_flight_valid_headers > 0);
            let others = self.in_flight.peers_with_validated_downloads().saturating_sub(own);
            let timeout = self.config.block_download_timeout(others as u32).as_micros() as i64;
            if now > state.downloading_since + timeout {
                let hash = state.in_flight.front().map(|queued| queued.hash);
                warn!(
                    peer = %peer,
                    "Timeout downloading block {}, disconnecting",
                    hash.map(|h| h.to_string()).unwrap_or_default()
                );
                self.drop_peer(peer, PeerAction::Disconnect);
                return Ok(true);
            }
        }

        if state.partial_headers_timeout.is_some_and(|deadline| now > deadline) {
            state.partial_headers_timeout = None;
            warn!(peer = %peer, "Timeout downloading partial headers, disconnecting");
            self.drop_peer(peer, PeerAction::Disconnect);
            return Ok(true);
        }

        if state.headers_timeout.is_some_and(|deadline| now > deadline) {
            state.headers_timeout = None;
            warn!(peer = %peer, "Timeout downloading headers, disconnecting");
            self.drop_peer(peer, PeerAction::Disconnect);
            return Ok(true);
        }

        Ok(false)
    }

    fn request_blocks(
        &mut self,
        peer: NodeId,
        fetch: bool,
        ibd: bool,
        now: i64,
        adjusted: i64,
    ) -> SyncResult<()> {
        let state = state_mut(&mut self.peers, peer)?;
        let in_flight = state.blocks_in_flight();
        if state.is_client() || !(fetch || !ibd) || in_flight >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
            return Ok(());
        }

        let selection = self.in_flight.find_next_blocks(
            state,
            &self.node,
            &self.priority,
            MAX_BLOCKS_IN_TRANSIT_PER_PEER - in_flight,
            self.config.full_sync_mode,
            self.prevent_block_download_during_header_sync,
            adjusted,
        );

        let mut items = Vec::with_capacity(selection.blocks.len());
        for handle in &selection.blocks {
            let Some(hash) = self.node.hash(*handle) else {
                continue;
            };
            self.in_flight.mark_in_flight(
                &mut self.peers,
                peer,
                hash,
                Some(*handle),
                false,
                selection.priority,
                now,
            );
            for observer in &self.observers {
                observer.block_requested(&hash, selection.priority);
            }
            debug!(
                peer = %peer,
                "Requesting block {} ({}) from peer",
                hash,
                self.node.height(*handle).unwrap_or(-1)
            );
            items.push(InvItem::Block(hash));
        }

        if !items.is_empty() {
            self.push_message(peer, OutboundMessage::GetData(items));
        }

        let idle = self.peers.get(&peer).is_some_and(|state| state.in_flight.is_empty());
        if let Some(staller) = selection.staller.filter(|_| idle) {
            if let Some(staller_state) = self.peers.get_mut(&staller) {
                if staller_state.stalling_since.is_none() {
                    staller_state.stalling_since = Some(now);
                    debug!(peer = %staller, "Stall started");
                }
            }
        }
        Ok(())
    }

    /// Ask for transactions announced by the peer that we still don't have.
    fn request_transactions(&mut self, peer: NodeId) -> SyncResult<()> {
        let pending: VecDeque<InvItem> =
            std::mem::take(&mut state_mut(&mut self.peers, peer)?.tx_requests);

        let mut batch = Vec::new();
        for item in pending {
            let Some(txid) = item.txid() else {
                continue;
            };
            if self.already_have_tx(&txid) {
                continue;
            }
            batch.push(item);
            if batch.len() >= MAX_GETDATA_BATCH {
                self.push_message(peer, OutboundMessage::GetData(std::mem::take(&mut batch)));
            }
        }
        if !batch.is_empty() {
            self.push_message(peer, OutboundMessage::GetData(batch));
        }
        Ok(())
    }
}
