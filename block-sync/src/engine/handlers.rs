//! Inbound message handlers.
//!
//! Every handler takes the sending peer and the decoded payload. Protocol violations
//! penalize the peer and return [`SyncEngineError::ProtocolViolation`]; everything else
//! returns a [`HandlerOutcome`].

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashcore::bip152::{BlockTransactions, BlockTransactionsRequest, HeaderAndShortIds};
use dashcore::hashes::Hash;
use dashcore::{Block, BlockHash, Header, OutPoint, Transaction, Txid};
use rand::Rng;
use tracing::{debug, info, trace, warn};

use super::{reject_message, state_mut, SyncEngine};
use crate::chain::{block_locator, ValidityLevel};
use crate::constants::misbehavior_scores::{
    INVALID_COMPACT_BLOCK, INVALID_REVERSE_HEADERS, INVALID_RHEADERS_REQUEST,
    NON_CONTINUOUS_HEADERS, OUT_OF_BOUNDS_TX_INDEX, OVERSIZED_MESSAGE, UNCONNECTING_HEADERS,
};
use crate::constants::{
    HEADER_TIP_NEAR_PRESENT, HISTORICAL_BLOCK_AGE, MAX_BLOCKS_IN_TRANSIT_PER_PEER,
    MAX_BLOCKS_TO_ANNOUNCE, MAX_BLOCKTXN_DEPTH, MAX_CMPCTBLOCK_DEPTH, MAX_HEADERS_RESULTS,
    MAX_INV_SZ, MAX_RHEADERS_RESULTS, MAX_UNCONNECTING_HEADERS,
};
use crate::error::{SyncEngineError, SyncResult};
use crate::sync::headers::is_continuous;
use crate::sync::{FillStatus, PartiallyDownloadedBlock};
use crate::types::{
    BlockHandle, HandlerOutcome, InvItem, NodeId, OutboundMessage, PeerMessage, RejectedItem,
};
use crate::validation::{BlockAcceptance, NodeBackend, TxAcceptance};

impl<N: NodeBackend> SyncEngine<N> {
    /// Handle one message from `peer`, then deliver completed priority requests and flush
    /// queued rejects.
    ///
    /// Returns [`SyncEngineError::Fatal`] if a priority request cannot be delivered outside
    /// SPV mode; the node must stop.
    pub fn process_message(
        &mut self,
        peer: NodeId,
        message: PeerMessage,
    ) -> SyncResult<HandlerOutcome> {
        if state_mut(&mut self.peers, peer)?.disconnecting {
            trace!(peer = %peer, "Dropping {} from disconnecting peer", message.command());
            return Ok(HandlerOutcome::Ignored);
        }
        trace!(peer = %peer, "Received {}", message.command());

        let result = match message {
            PeerMessage::Headers(headers) => self.handle_headers(peer, headers),
            PeerMessage::RHeaders {
                height,
                headers,
            } => self.handle_rheaders(peer, height, headers),
            PeerMessage::CmpctBlock(cmpct) => self.handle_cmpctblock(peer, cmpct),
            PeerMessage::BlockTxn(response) => self.handle_blocktxn(peer, response),
            PeerMessage::GetBlockTxn(request) => self.handle_getblocktxn(peer, request),
            PeerMessage::GetHeaders {
                locator,
                stop,
            } => self.handle_getheaders(peer, &locator, stop),
            PeerMessage::GetRHeaders {
                height,
                count,
            } => self.handle_getrheaders(peer, height, count),
            PeerMessage::Inv(items) => self.handle_inv(peer, items),
            PeerMessage::GetData(items) => self.handle_getdata(peer, items),
            PeerMessage::Tx(tx) => self.handle_tx(peer, tx),
            PeerMessage::Block(block) => self.handle_block(peer, block),
            PeerMessage::SendCmpct {
                announce,
                version,
            } => self.handle_sendcmpct(peer, announce, version),
            PeerMessage::SendHeaders => self.handle_sendheaders(peer),
        };

        if let Err(err) = &result {
            debug!(peer = %peer, "Message processing failed: {}", err);
        }

        self.process_priority_requests()?;
        self.send_rejects_and_check_banned(peer);
        result
    }

    /// Handle a `headers` batch from forward or partial sync, or an announcement.
    pub fn handle_headers(
        &mut self,
        peer: NodeId,
        headers: Vec<Header>,
    ) -> SyncResult<HandlerOutcome> {
        if headers.len() > MAX_HEADERS_RESULTS {
            return Err(self.violation(
                peer,
                OVERSIZED_MESSAGE,
                format!("headers message size = {}", headers.len()),
            ));
        }
        let (Some(first), Some(last)) = (headers.first().copied(), headers.last().copied()) else {
            return Ok(HandlerOutcome::Processed);
        };
        let last_hash = last.block_hash();

        if self.node.lookup(&first.prev_blockhash).is_none()
            && headers.len() < MAX_BLOCKS_TO_ANNOUNCE
        {
            return self.handle_unconnecting_headers(peer, &first, last_hash);
        }

        if !is_continuous(&headers) {
            return Err(self.violation(
                peer,
                NON_CONTINUOUS_HEADERS,
                "non-continuous headers sequence",
            ));
        }

        let state = state_mut(&mut self.peers, peer)?;
        if state.partial_sync_started {
            state.partial_headers_timeout = None;
        } else if state.forward_sync_started || state.reverse_sync_started {
            state.headers_timeout = None;
        }

        let last_handle = match self.node.process_new_block_headers(&headers, false) {
            Ok(handle) => handle,
            Err(reason) if reason.dos_score > 0 => {
                return Err(self.violation(
                    peer,
                    reason.dos_score,
                    format!("invalid header received: {}", reason.reason),
                ));
            }
            Err(reason) => {
                debug!(peer = %peer, "Headers not accepted: {}", reason.reason);
                return Ok(HandlerOutcome::Ignored);
            }
        };

        self.notify_header_progress();

        let state = state_mut(&mut self.peers, peer)?;
        if state.unconnecting_headers > 0 {
            debug!(
                peer = %peer,
                "Resetting unconnecting headers streak ({} -> 0)",
                state.unconnecting_headers
            );
        }
        state.unconnecting_headers = 0;
        state.update_block_availability(&self.node, &last_hash);

        let Some(last_handle) = last_handle.or_else(|| self.node.lookup(&last_hash)) else {
            return Ok(HandlerOutcome::Processed);
        };

        if headers.len() == MAX_HEADERS_RESULTS && !self.continue_header_sync(peer, last_handle)? {
            return Ok(HandlerOutcome::Processed);
        }

        self.direct_fetch_after_headers(peer, last_handle)?;
        Ok(HandlerOutcome::Processed)
    }

    /// A short batch whose parent we do not know: ask for the missing history and count
    /// the streak.
    fn handle_unconnecting_headers(
        &mut self,
        peer: NodeId,
        first: &Header,
        last_hash: BlockHash,
    ) -> SyncResult<HandlerOutcome> {
        let header_tip = self.node.header_tip();
        let near_present =
            self.clock.adjusted_time() - HEADER_TIP_NEAR_PRESENT.as_secs() as i64;
        let tip_recent = header_tip
            .and_then(|tip| self.node.entry(tip))
            .is_some_and(|entry| entry.time() > near_present);

        let state = state_mut(&mut self.peers, peer)?;
        state.unconnecting_headers += 1;
        let streak = state.unconnecting_headers;
        state.update_block_availability(&self.node, &last_hash);
        debug!(
            peer = %peer,
            "Received header {}: missing prev block {}, streak {}",
            first.block_hash(),
            first.prev_blockhash,
            streak
        );

        if tip_recent {
            let locator = block_locator(&self.node, header_tip);
            self.push_message(
                peer,
                OutboundMessage::GetHeaders {
                    locator,
                    stop: BlockHash::all_zeros(),
                },
            );
        }

        if streak % MAX_UNCONNECTING_HEADERS == 0 {
            self.misbehaving(peer, UNCONNECTING_HEADERS, "unconnecting headers");
        }
        Ok(HandlerOutcome::Processed)
    }

    /// A full batch arrived: request the next one unless the peer's sync mode was abandoned.
    /// Returns false if header sync with the peer stopped.
    fn continue_header_sync(&mut self, peer: NodeId, last: BlockHandle) -> SyncResult<bool> {
        let partial_active = self.node.is_partial_sync_active();
        let partial_near_present = self.node.is_partial_near_present();
        let reverse_active = self.headers.rsync_started > 0;
        let timeout = self.config.headers_download_timeout.as_micros() as i64;
        let now = self.now();

        let state = state_mut(&mut self.peers, peer)?;
        if !state.forward_sync_started && !state.partial_sync_started && !state.reverse_sync_started
        {
            return Ok(false);
        }

        if state.forward_sync_started
            && (reverse_active || (partial_active && !partial_near_present))
        {
            info!(peer = %peer, "Abandoning forward header sync with peer");
            state.forward_sync_started = false;
            state.headers_timeout = None;
            self.headers.sync_started = self.headers.sync_started.saturating_sub(1);
            return Ok(false);
        }

        if state.partial_sync_started && !partial_active {
            info!(peer = %peer, "Partial sync no longer active, stopping partial header sync");
            state.partial_sync_started = false;
            state.partial_headers_timeout = None;
            self.headers.partial_started = self.headers.partial_started.saturating_sub(1);
            return Ok(false);
        }

        if state.partial_sync_started {
            state.partial_headers_timeout = Some(now + timeout);
        } else {
            state.headers_timeout = Some(now + timeout);
        }

        let locator = block_locator(&self.node, Some(last));
        debug!(
            peer = %peer,
            "More getheaders ({}) to peer",
            self.node.height(last).unwrap_or(-1)
        );
        self.push_message(
            peer,
            OutboundMessage::GetHeaders {
                locator,
                stop: BlockHash::all_zeros(),
            },
        );
        Ok(true)
    }

    /// Request blocks between the active chain and newly connected headers when close to tip.
    fn direct_fetch_after_headers(&mut self, peer: NodeId, last: BlockHandle) -> SyncResult<()> {
        if self.node.is_partial_sync_active() || !self.can_direct_fetch() {
            return Ok(());
        }
        let Some(last_entry) = self.node.entry(last) else {
            return Ok(());
        };
        if !last_entry.is_valid(ValidityLevel::Tree) {
            return Ok(());
        }
        let Some(tip) = self.node.active_tip() else {
            return Ok(());
        };
        if self.node.compare_work(tip, last).is_gt() {
            return Ok(());
        }
        let last_hash = last_entry.hash;

        let segsig = self
            .peers
            .get(&peer)
            .ok_or(SyncEngineError::UnknownPeer(peer))?
            .has_segregated_signatures();

        let mut to_fetch = Vec::new();
        let mut walk = Some(last);
        while let Some(handle) = walk {
            if self.node.active_contains(handle)
                || to_fetch.len() > MAX_BLOCKS_IN_TRANSIT_PER_PEER
            {
                break;
            }
            let Some(entry) = self.node.entry(handle) else {
                break;
            };
            if !entry.has_data()
                && !self.in_flight.contains(&entry.hash)
                && (segsig || !self.node.is_segsig_enabled(entry.prev))
            {
                to_fetch.push((handle, entry.hash));
            }
            walk = entry.prev;
        }

        if !walk.is_some_and(|handle| self.node.active_contains(handle)) {
            debug!(peer = %peer, "Large reorg, won't direct fetch to {}", last_hash);
            return Ok(());
        }
        if !self.config.full_sync_mode {
            return Ok(());
        }

        let now = self.now();
        let mut requested = Vec::new();
        for (handle, hash) in to_fetch.into_iter().rev() {
            let in_flight = self.peers.get(&peer).map_or(0, |state| state.blocks_in_flight());
            if in_flight >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                break;
            }
            self.in_flight.mark_in_flight(
                &mut self.peers,
                peer,
                hash,
                Some(handle),
                false,
                false,
                now,
            );
            debug!(peer = %peer, "Requesting block {} from peer", hash);
            requested.push(hash);
        }
        if requested.is_empty() {
            return Ok(());
        }
        if requested.len() > 1 {
            debug!(
                peer = %peer,
                "Downloading blocks toward {} via headers direct fetch",
                last_hash
            );
        }

        let supports_compact = self
            .peers
            .get(&peer)
            .is_some_and(|state| state.capabilities.supports_desired_cmpct_version);
        let prev_connectable = self
            .node
            .entry(last)
            .and_then(|entry| entry.prev)
            .and_then(|prev| self.node.entry(prev))
            .is_some_and(|prev| prev.is_valid(ValidityLevel::Chain));

        // a single block near the tip is cheaper to get as a compact block
        if requested.len() == 1 && supports_compact && self.in_flight.len() == 1 && prev_connectable
        {
            let request = vec![InvItem::CompactBlock(requested[0])];
            self.push_message(peer, OutboundMessage::GetData(request));
        } else {
            let items = requested.into_iter().map(InvItem::Block).collect();
            self.push_message(peer, OutboundMessage::GetData(items));
        }
        Ok(())
    }

    /// Handle an `rheaders` batch of reverse header sync.
    pub fn handle_rheaders(
        &mut self,
        peer: NodeId,
        height: u32,
        headers: Vec<Header>,
    ) -> SyncResult<HandlerOutcome> {
        if !self.headers.reverse_enabled() {
            debug!(peer = %peer, "Ignoring rheaders, reverse sync is disabled");
            return Ok(HandlerOutcome::Ignored);
        }
        if headers.len() > MAX_RHEADERS_RESULTS {
            return Err(self.violation(
                peer,
                OVERSIZED_MESSAGE,
                format!("rheaders message size = {}", headers.len()),
            ));
        }
        if headers.is_empty() {
            return Ok(HandlerOutcome::Processed);
        }

        match self.headers.reverse.ingest(&headers, &self.checkpoints) {
            Ok(ingest) if ingest.stale => {
                debug!(peer = %peer, "Ignoring stale rheaders from height {}", height);
                return Ok(HandlerOutcome::Ignored);
            }
            Ok(ingest) => {
                trace!(
                    peer = %peer,
                    "Buffered {} reverse headers from height {}",
                    ingest.connected,
                    height
                );
            }
            Err(err) => {
                return Err(self.violation(peer, INVALID_REVERSE_HEADERS, err.to_string()));
            }
        }

        let anchor = self.checkpoints.last_height();
        let best_header_height =
            self.node.best_header().and_then(|h| self.node.height(h)).unwrap_or(-1);
        let gap = self.headers.reverse.gap(anchor, best_header_height);

        if gap <= 0 {
            let batch = self.headers.reverse.take_for_commit();
            let committed = batch.len();
            let top_hash = batch.last().map(|header| header.block_hash());

            let commit = self.node.process_new_block_headers(&batch, true);

            let state = state_mut(&mut self.peers, peer)?;
            if state.reverse_sync_started {
                state.reverse_sync_started = false;
                self.headers.rsync_started = self.headers.rsync_started.saturating_sub(1);
            }
            state.headers_timeout = None;

            if let Err(reason) = commit {
                warn!(
                    peer = %peer,
                    "Failed to commit {} reverse headers: {}",
                    committed,
                    reason.reason
                );
                if reason.dos_score == 0 {
                    return Ok(HandlerOutcome::Ignored);
                }
                self.headers.disable_reverse();
                return Err(self.violation(
                    peer,
                    INVALID_REVERSE_HEADERS,
                    format!("reverse headers commit failed: {}", reason.reason),
                ));
            }

            info!(
                peer = %peer,
                "Committed {} reverse headers up to checkpoint {}",
                committed,
                anchor
            );
            let state = state_mut(&mut self.peers, peer)?;
            if let Some(hash) = top_hash {
                state.update_block_availability(&self.node, &hash);
            }
        }

        self.notify_header_progress();

        if gap > 0 {
            let (start, count) = self.headers.reverse.next_request(anchor, best_header_height);
            let timeout = self.config.headers_download_timeout.as_micros() as i64;
            let now = self.now();
            let state = state_mut(&mut self.peers, peer)?;
            if state.reverse_sync_started {
                state.headers_timeout = Some(now + timeout);
            }
            debug!(peer = %peer, "More getrheaders ({}, {}) to peer", start, count);
            self.push_message(
                peer,
                OutboundMessage::GetRHeaders {
                    height: start,
                    count,
                },
            );
        }
        Ok(HandlerOutcome::Processed)
    }

    /// Handle a `cmpctblock` announcement.
    pub fn handle_cmpctblock(
        &mut self,
        peer: NodeId,
        cmpct: HeaderAndShortIds,
    ) -> SyncResult<HandlerOutcome> {
        let header = cmpct.header;
        let hash = header.block_hash();

        if self.node.lookup(&header.prev_blockhash).is_none() {
            // doesn't connect, ask for the headers in between
            if !self.node.is_initial_block_download() {
                let locator = block_locator(&self.node, self.node.best_header());
                self.push_message(
                    peer,
                    OutboundMessage::GetHeaders {
                        locator,
                        stop: BlockHash::all_zeros(),
                    },
                );
            }
            return Ok(HandlerOutcome::Processed);
        }

        let processed = match self.node.process_new_block_headers(&[header], false) {
            Ok(handle) => handle.or_else(|| self.node.lookup(&hash)),
            Err(reason) if reason.dos_score > 0 => {
                return Err(self.violation(
                    peer,
                    reason.dos_score,
                    format!("invalid header received via cmpctblock: {}", reason.reason),
                ));
            }
            Err(reason) => {
                debug!(peer = %peer, "Compact block header not accepted: {}", reason.reason);
                return Ok(HandlerOutcome::Ignored);
            }
        };
        let Some(handle) = processed else {
            return Ok(HandlerOutcome::Ignored);
        };

        let state = state_mut(&mut self.peers, peer)?;
        state.update_block_availability(&self.node, &hash);

        let Some(entry) = self.node.entry(handle) else {
            return Ok(HandlerOutcome::Ignored);
        };
        if entry.has_data() {
            return Ok(HandlerOutcome::Processed);
        }
        let (height, tx_count, prev) = (entry.height, entry.tx_count, entry.prev);

        let owner = self.in_flight.owner(&hash);
        let already_in_flight = owner.is_some();
        let active_height = self.node.active_height();
        let less_work = self
            .node
            .active_tip()
            .is_some_and(|tip| self.node.compare_work(handle, tip).is_le());

        // already have the block or something better
        if (less_work && height != active_height) || tx_count != 0 {
            if already_in_flight {
                self.push_message(peer, OutboundMessage::GetData(vec![InvItem::Block(hash)]));
            }
            return Ok(HandlerOutcome::Processed);
        }

        if !already_in_flight && !self.can_direct_fetch() {
            return Ok(HandlerOutcome::Processed);
        }

        let state = state_mut(&mut self.peers, peer)?;
        if self.node.is_segsig_enabled(prev) && !state.capabilities.supports_desired_cmpct_version {
            return Ok(HandlerOutcome::Processed);
        }
        let peer_in_flight = state.blocks_in_flight();

        if height > active_height + 2 {
            // too far ahead to reconstruct
            if already_in_flight {
                self.push_message(peer, OutboundMessage::GetData(vec![InvItem::Block(hash)]));
                return Ok(HandlerOutcome::Processed);
            }
            return self.handle_headers(peer, vec![header]);
        }

        if (!already_in_flight && peer_in_flight < MAX_BLOCKS_IN_TRANSIT_PER_PEER)
            || owner == Some(peer)
        {
            self.reconstruct_requested_block(peer, handle, &cmpct)
        } else {
            self.reconstruct_opportunistically(peer, &cmpct)
        }
    }

    /// Reconstruct a compact block we own the download of, asking for missing transactions.
    fn reconstruct_requested_block(
        &mut self,
        peer: NodeId,
        handle: BlockHandle,
        cmpct: &HeaderAndShortIds,
    ) -> SyncResult<HandlerOutcome> {
        let hash = cmpct.header.block_hash();
        let now = self.now();

        let newly_requested = self.in_flight.mark_in_flight(
            &mut self.peers,
            peer,
            hash,
            Some(handle),
            true,
            false,
            now,
        );
        if !newly_requested {
            let state = state_mut(&mut self.peers, peer)?;
            match state.queued_block_mut(&hash) {
                Some(queued) if queued.partial_block.is_none() => {
                    queued.partial_block = Some(PartiallyDownloadedBlock::new());
                }
                _ => {
                    debug!(
                        peer = %peer,
                        "Peer sent us compact block {} we were already syncing",
                        hash
                    );
                    return Ok(HandlerOutcome::Ignored);
                }
            }
        }

        let mempool = self.node.transactions();
        let state = state_mut(&mut self.peers, peer)?;
        let Some(partial) =
            state.queued_block_mut(&hash).and_then(|queued| queued.partial_block.as_mut())
        else {
            return Ok(HandlerOutcome::Ignored);
        };

        match partial.init_data(cmpct, mempool, &self.extra_txn) {
            FillStatus::Invalid => {
                self.in_flight.mark_received(&mut self.peers, &hash, now);
                Err(self.violation(peer, INVALID_COMPACT_BLOCK, "invalid compact block"))
            }
            FillStatus::Failed => {
                debug!(
                    peer = %peer,
                    "Short ID collision in compact block {}, requesting full block",
                    hash
                );
                self.push_message(peer, OutboundMessage::GetData(vec![InvItem::Block(hash)]));
                Ok(HandlerOutcome::Processed)
            }
            FillStatus::Ok => {
                let missing = partial.missing_indexes();
                if missing.is_empty() {
                    // everything was in the mempool
                    return self.handle_blocktxn(
                        peer,
                        BlockTransactions {
                            block_hash: hash,
                            transactions: Vec::new(),
                        },
                    );
                }
                debug!(
                    peer = %peer,
                    "Requesting {} of {} transactions of compact block {}",
                    missing.len(),
                    partial.tx_count(),
                    hash
                );
                self.push_message(
                    peer,
                    OutboundMessage::GetBlockTxn(BlockTransactionsRequest {
                        block_hash: hash,
                        indexes: missing,
                    }),
                );
                Ok(HandlerOutcome::Processed)
            }
        }
    }

    /// The block is in flight elsewhere or the peer is busy: accept it only if it completes
    /// from local transactions alone.
    fn reconstruct_opportunistically(
        &mut self,
        peer: NodeId,
        cmpct: &HeaderAndShortIds,
    ) -> SyncResult<HandlerOutcome> {
        let hash = cmpct.header.block_hash();
        let mut partial = PartiallyDownloadedBlock::new();
        if partial.init_data(cmpct, self.node.transactions(), &self.extra_txn) != FillStatus::Ok {
            return Ok(HandlerOutcome::Processed);
        }

        let node = &self.node;
        let (status, block) = partial.fill_block(Vec::new(), |block| node.check_block(block));
        let (FillStatus::Ok, Some(block)) = (status, block) else {
            return Ok(HandlerOutcome::Processed);
        };

        debug!(peer = %peer, "Reconstructed compact block {} without a round trip", hash);
        self.accept_block(peer, Arc::new(block), true, true, false);

        let valid = self
            .node
            .lookup(&hash)
            .and_then(|handle| self.node.entry(handle))
            .is_some_and(|entry| entry.is_valid(ValidityLevel::Transactions));
        if valid {
            let now = self.now();
            self.in_flight.mark_received(&mut self.peers, &hash, now);
        }
        Ok(HandlerOutcome::Processed)
    }

    /// Handle a `blocktxn` response completing a compact block.
    pub fn handle_blocktxn(
        &mut self,
        peer: NodeId,
        response: BlockTransactions,
    ) -> SyncResult<HandlerOutcome> {
        let hash = response.block_hash;
        let now = self.now();
        let owned = self.in_flight.owner(&hash) == Some(peer);

        let state = state_mut(&mut self.peers, peer)?;
        let partial = match state.queued_block_mut(&hash) {
            Some(queued) if owned => queued.partial_block.as_mut(),
            _ => None,
        };
        let Some(partial) = partial else {
            debug!(
                peer = %peer,
                "Peer sent us block transactions for block {} we weren't expecting",
                hash
            );
            return Ok(HandlerOutcome::Ignored);
        };

        let node = &self.node;
        let (status, block) =
            partial.fill_block(response.transactions, |block| node.check_block(block));

        match (status, block) {
            (FillStatus::Invalid, _) => {
                self.in_flight.mark_received(&mut self.peers, &hash, now);
                Err(self.violation(peer, INVALID_COMPACT_BLOCK, "invalid block transactions"))
            }
            (FillStatus::Failed, _) => {
                debug!(peer = %peer, "Reconstruction of {} failed, requesting full block", hash);
                self.push_message(peer, OutboundMessage::GetData(vec![InvItem::Block(hash)]));
                Ok(HandlerOutcome::Processed)
            }
            (FillStatus::Ok, Some(block)) => {
                self.in_flight.mark_received(&mut self.peers, &hash, now);
                // requested by us, so force processing
                self.accept_block(peer, Arc::new(block), true, true, false);
                Ok(HandlerOutcome::Processed)
            }
            (FillStatus::Ok, None) => Ok(HandlerOutcome::Ignored),
        }
    }

    /// Handle a full `block`.
    pub fn handle_block(&mut self, peer: NodeId, block: Arc<Block>) -> SyncResult<HandlerOutcome> {
        let hash = block.block_hash();
        let whitelisted = self
            .peers
            .get(&peer)
            .ok_or(SyncEngineError::UnknownPeer(peer))?
            .is_whitelisted();

        let mut force = whitelisted && !self.node.is_initial_block_download();
        let now = self.now();
        let received = self.in_flight.mark_received(&mut self.peers, &hash, now);
        force |= received.requested;

        let assume_pow_valid = self
            .node
            .lookup(&hash)
            .and_then(|handle| self.node.entry(handle))
            .is_some_and(|entry| entry.is_valid(ValidityLevel::Tree));

        debug!(peer = %peer, "Received block {}", hash);
        self.accept_block(peer, block, force, assume_pow_valid, true);
        Ok(HandlerOutcome::Processed)
    }

    /// Hand a block to validation and record its delivery.
    fn accept_block(
        &mut self,
        peer: NodeId,
        block: Arc<Block>,
        force: bool,
        assume_pow_valid: bool,
        punish_invalid: bool,
    ) -> BlockAcceptance {
        let hash = block.block_hash();
        self.block_sources.insert(hash, (peer, punish_invalid));

        let acceptance = self.node.process_new_block(block, force, assume_pow_valid);
        if acceptance.is_new {
            let adjusted = self.clock.adjusted_time();
            if let Some(state) = self.peers.get_mut(&peer) {
                state.last_block_time = adjusted;
            }
        }

        let stored = self
            .node
            .lookup(&hash)
            .filter(|&handle| self.node.entry(handle).is_some_and(|entry| entry.has_data()));
        if let Some(handle) = stored {
            self.priority.mark_downloaded(handle);
        }

        self.block_checked(&hash, acceptance.rejection.as_ref());
        acceptance
    }

    /// Handle a loose transaction, retrying orphans that spend it once accepted.
    pub fn handle_tx(&mut self, peer: NodeId, tx: Arc<Transaction>) -> SyncResult<HandlerOutcome> {
        let state = state_mut(&mut self.peers, peer)?;
        if !self.config.relay_transactions
            && !(state.is_whitelisted() && self.config.whitelist_relay)
        {
            debug!(peer = %peer, "Transaction sent in violation of protocol");
            return Ok(HandlerOutcome::Ignored);
        }

        let txid = tx.txid();
        state.tx_requests.retain(|item| item.txid() != Some(txid));

        if self.already_have_tx(&txid) {
            trace!(peer = %peer, "Already have transaction {}", txid);
            return Ok(HandlerOutcome::Ignored);
        }

        match self.node.accept_to_mempool(tx.clone()) {
            TxAcceptance::Accepted {
                removed,
            } => {
                debug!(peer = %peer, "Accepted transaction {} into the mempool", txid);
                self.relay_transaction(&tx);
                for evicted in removed {
                    self.extra_txn.push(evicted);
                }
                self.process_orphans_of(&tx);
                Ok(HandlerOutcome::Processed)
            }
            TxAcceptance::MissingInputs => {
                self.store_orphan(peer, tx);
                Ok(HandlerOutcome::Processed)
            }
            TxAcceptance::Rejected(reason) => {
                if !reason.corruption_possible {
                    self.recent_rejects.insert(txid);
                }
                self.extra_txn.push(tx);
                debug!(peer = %peer, "Transaction {} was not accepted: {}", txid, reason.reason);

                if let Some(reject) = reject_message(&reason, RejectedItem::Tx(txid)) {
                    self.push_message(peer, OutboundMessage::Reject(reject));
                }
                if reason.dos_score > 0 {
                    return Err(self.violation(
                        peer,
                        reason.dos_score,
                        format!("invalid transaction {}: {}", txid, reason.reason),
                    ));
                }
                Ok(HandlerOutcome::Processed)
            }
        }
    }

    /// Quarantine a transaction with unknown inputs and request its parents.
    fn store_orphan(&mut self, peer: NodeId, tx: Arc<Transaction>) {
        let txid = tx.txid();
        let parents: Vec<Txid> = tx.input.iter().map(|input| input.previous_output.txid).collect();

        if parents.iter().any(|parent| self.recent_rejects.contains(parent)) {
            debug!(peer = %peer, "Not keeping orphan {} with rejected parents", txid);
            self.recent_rejects.insert(txid);
            return;
        }

        let mut wanted = Vec::new();
        for parent in parents {
            if !self.already_have_tx(&parent) && !wanted.contains(&parent) {
                wanted.push(parent);
            }
        }
        if let Some(state) = self.peers.get_mut(&peer) {
            for parent in wanted {
                let item = InvItem::Tx(parent);
                if !state.tx_requests.contains(&item) {
                    state.tx_requests.push_back(item);
                }
            }
        }

        let now = self.now();
        if self.orphans.add(tx.clone(), peer, now) {
            self.extra_txn.push(tx);
        }
        let evicted = self.orphans.sweep_and_limit(self.config.max_orphan_transactions, now);
        if evicted > 0 {
            debug!("Orphan pool overflow, removed {} tx", evicted);
        }
    }

    /// Retry every orphan spending outputs of `parent`, cascading through accepted ones.
    fn process_orphans_of(&mut self, parent: &Transaction) {
        let mut work: VecDeque<OutPoint> = outpoints_of(parent).collect();
        let mut punished: HashSet<NodeId> = HashSet::new();
        let mut done: HashSet<Txid> = HashSet::new();

        while let Some(outpoint) = work.pop_front() {
            for child_txid in self.orphans.children_of(&outpoint) {
                if done.contains(&child_txid) {
                    continue;
                }
                let Some(orphan) = self.orphans.get(&child_txid) else {
                    continue;
                };
                let (child, from_peer) = (orphan.tx.clone(), orphan.from_peer);
                if punished.contains(&from_peer) {
                    continue;
                }

                match self.node.accept_to_mempool(child.clone()) {
                    TxAcceptance::Accepted {
                        removed,
                    } => {
                        debug!("Accepted orphan tx {}", child_txid);
                        self.relay_transaction(&child);
                        work.extend(outpoints_of(&child));
                        for evicted in removed {
                            self.extra_txn.push(evicted);
                        }
                        done.insert(child_txid);
                    }
                    TxAcceptance::MissingInputs => {}
                    TxAcceptance::Rejected(reason) => {
                        if reason.dos_score > 0 {
                            self.misbehaving(from_peer, reason.dos_score, "invalid orphan tx");
                            punished.insert(from_peer);
                        }
                        debug!("Removed invalid orphan tx {}: {}", child_txid, reason.reason);
                        if !reason.corruption_possible {
                            self.recent_rejects.insert(child_txid);
                        }
                        done.insert(child_txid);
                    }
                }
            }
        }

        for txid in done {
            self.orphans.erase(&txid);
        }
    }

    /// Handle an `inv` announcement.
    pub fn handle_inv(&mut self, peer: NodeId, items: Vec<InvItem>) -> SyncResult<HandlerOutcome> {
        if items.len() > MAX_INV_SZ {
            return Err(self.violation(
                peer,
                OVERSIZED_MESSAGE,
                format!("inv message size = {}", items.len()),
            ));
        }

        let state = state_mut(&mut self.peers, peer)?;
        let blocks_only = !self.config.relay_transactions
            && !(state.is_whitelisted() && self.config.whitelist_relay);
        let ibd = self.node.is_initial_block_download();
        let partial_active = self.node.is_partial_sync_active();

        for item in items {
            if let Some(hash) = item.block_hash() {
                let state = state_mut(&mut self.peers, peer)?;
                state.update_block_availability(&self.node, &hash);
                if self.node.lookup(&hash).is_none() && !self.in_flight.contains(&hash) && !ibd {
                    let best_header = self.node.best_header();
                    debug!(
                        peer = %peer,
                        "getheaders ({}) {} to peer",
                        best_header.and_then(|h| self.node.height(h)).unwrap_or(-1),
                        hash
                    );
                    let locator = block_locator(&self.node, best_header);
                    self.push_message(
                        peer,
                        OutboundMessage::GetHeaders {
                            locator,
                            stop: hash,
                        },
                    );
                }
            } else if let Some(txid) = item.txid() {
                if blocks_only {
                    debug!(
                        peer = %peer,
                        "Transaction ({}) inv sent in violation of protocol",
                        txid
                    );
                    continue;
                }
                if !self.already_have_tx(&txid) && (!ibd || partial_active) {
                    let state = state_mut(&mut self.peers, peer)?;
                    if !state.tx_requests.contains(&InvItem::Tx(txid)) {
                        state.tx_requests.push_back(InvItem::Tx(txid));
                    }
                }
            }
        }
        Ok(HandlerOutcome::Processed)
    }

    /// Handle a `getdata` request for blocks and transactions.
    pub fn handle_getdata(
        &mut self,
        peer: NodeId,
        items: Vec<InvItem>,
    ) -> SyncResult<HandlerOutcome> {
        if items.len() > MAX_INV_SZ {
            return Err(self.violation(
                peer,
                OVERSIZED_MESSAGE,
                format!("getdata message size = {}", items.len()),
            ));
        }

        let mut not_found = Vec::new();
        for item in items {
            match item {
                InvItem::Block(hash)
                | InvItem::WitnessBlock(hash)
                | InvItem::CompactBlock(hash) => {
                    self.serve_block(peer, item, hash)?;
                }
                InvItem::Tx(txid) | InvItem::WitnessTx(txid) => {
                    match self.node.get_transaction(&txid) {
                        Some(tx) => self.push_message(peer, OutboundMessage::Tx(tx)),
                        None => not_found.push(item),
                    }
                }
            }
        }

        if !not_found.is_empty() {
            self.push_message(peer, OutboundMessage::NotFound(not_found));
        }
        Ok(HandlerOutcome::Processed)
    }

    fn serve_block(&mut self, peer: NodeId, item: InvItem, hash: BlockHash) -> SyncResult<()> {
        let Some(handle) = self.node.lookup(&hash) else {
            return Ok(());
        };
        let Some(entry) = self.node.entry(handle) else {
            return Ok(());
        };
        let active_height = self.node.active_height();
        let best_header_time =
            self.node.best_header().and_then(|h| self.node.entry(h)).map(|best| best.time());

        // don't serve blocks off the active chain that are old or not fully validated
        let send = self.node.active_contains(handle)
            || entry.height >= active_height
            || (entry.is_valid(ValidityLevel::Scripts)
                && best_header_time.is_some_and(|best| {
                    best - entry.time() < HISTORICAL_BLOCK_AGE.as_secs() as i64
                }));
        if !send {
            debug!(
                peer = %peer,
                "Ignoring request for old block {} that isn't on the active chain",
                hash
            );
            return Ok(());
        }
        if !entry.has_data() {
            return Ok(());
        }
        let height = entry.height;

        let Some(block) = self.node.read_block(handle) else {
            warn!("Cannot load block {} from disk", hash);
            return Ok(());
        };

        let serve_compact = matches!(item, InvItem::CompactBlock(_))
            && self.can_direct_fetch()
            && height >= active_height - MAX_CMPCTBLOCK_DEPTH;
        if serve_compact {
            let version = if state_mut(&mut self.peers, peer)?.capabilities.wants_cmpct_witness {
                2
            } else {
                1
            };
            let nonce: u64 = rand::thread_rng().gen();
            match HeaderAndShortIds::from_block(&block, nonce, version, &[]) {
                Ok(cmpct) => {
                    self.push_message(peer, OutboundMessage::CmpctBlock(cmpct));
                    return Ok(());
                }
                Err(err) => debug!("Cannot build compact block {}: {}", hash, err),
            }
        }
        self.push_message(peer, OutboundMessage::Block(Arc::new(block)));
        Ok(())
    }

    /// Handle a `getblocktxn` request.
    pub fn handle_getblocktxn(
        &mut self,
        peer: NodeId,
        request: BlockTransactionsRequest,
    ) -> SyncResult<HandlerOutcome> {
        let hash = request.block_hash;
        let stored = self
            .node
            .lookup(&hash)
            .filter(|&handle| self.node.entry(handle).is_some_and(|entry| entry.has_data()));
        let Some(handle) = stored else {
            debug!(peer = %peer, "Peer sent us a getblocktxn for a block we don't have");
            return Ok(HandlerOutcome::Ignored);
        };
        let Some(block) = self.node.read_block(handle) else {
            warn!("Cannot load block {} from disk", hash);
            return Ok(HandlerOutcome::Ignored);
        };

        let height = self.node.height(handle).unwrap_or(0);
        if height < self.node.active_height() - MAX_BLOCKTXN_DEPTH {
            debug!(
                peer = %peer,
                "Peer sent us a getblocktxn for a block > {} deep",
                MAX_BLOCKTXN_DEPTH
            );
            self.push_message(peer, OutboundMessage::Block(Arc::new(block)));
            return Ok(HandlerOutcome::Processed);
        }

        match BlockTransactions::from_request(&request, &block) {
            Ok(response) => {
                self.push_message(peer, OutboundMessage::BlockTxn(response));
                Ok(HandlerOutcome::Processed)
            }
            Err(err) => Err(self.violation(
                peer,
                OUT_OF_BOUNDS_TX_INDEX,
                format!("getblocktxn with out-of-bounds tx indices: {}", err),
            )),
        }
    }

    /// Serve `getheaders` from the active chain.
    pub fn handle_getheaders(
        &mut self,
        peer: NodeId,
        locator: &[BlockHash],
        stop: BlockHash,
    ) -> SyncResult<HandlerOutcome> {
        let state = state_mut(&mut self.peers, peer)?;
        if self.node.is_initial_block_download() && !state.is_whitelisted() {
            debug!(
                peer = %peer,
                "Ignoring getheaders from peer because node is in initial block download"
            );
            return Ok(HandlerOutcome::Ignored);
        }

        let start = if locator.is_empty() {
            // a null locator asks for exactly the stop block
            match self.node.lookup(&stop) {
                Some(handle) => Some(handle),
                None => return Ok(HandlerOutcome::Ignored),
            }
        } else {
            let fork = locator
                .iter()
                .find_map(|hash| self.node.lookup(hash))
                .and_then(|handle| self.node.find_fork(handle))
                .or_else(|| self.node.active_at(0));
            fork.and_then(|handle| self.node.active_next(handle))
        };

        let mut headers = Vec::new();
        let mut last_sent = None;
        let mut current = start;
        while let Some(handle) = current {
            let Some(entry) = self.node.entry(handle) else {
                break;
            };
            headers.push(entry.header);
            last_sent = Some(handle);
            if headers.len() >= MAX_HEADERS_RESULTS || entry.hash == stop {
                break;
            }
            current = self.node.active_next(handle);
        }

        debug!(
            peer = %peer,
            "getheaders {} to {} from peer",
            start.and_then(|h| self.node.height(h)).unwrap_or(-1),
            stop
        );
        let state = state_mut(&mut self.peers, peer)?;
        state.best_header_sent = last_sent.or_else(|| self.node.active_tip());
        self.push_message(peer, OutboundMessage::Headers(headers));
        Ok(HandlerOutcome::Processed)
    }

    /// Serve `getrheaders`: `count` active-chain headers walking down from `height`.
    pub fn handle_getrheaders(
        &mut self,
        peer: NodeId,
        height: u32,
        count: u32,
    ) -> SyncResult<HandlerOutcome> {
        let state = state_mut(&mut self.peers, peer)?;
        if self.node.is_initial_block_download() && !state.is_whitelisted() {
            debug!(
                peer = %peer,
                "Ignoring getrheaders from peer because node is in initial block download"
            );
            return Ok(HandlerOutcome::Ignored);
        }

        let active_height = self.node.active_height();
        if i64::from(height) > i64::from(active_height) {
            return Err(self.violation(
                peer,
                INVALID_RHEADERS_REQUEST,
                format!("getrheaders height {} above tip {}", height, active_height),
            ));
        }
        if count > height {
            return Err(self.violation(
                peer,
                INVALID_RHEADERS_REQUEST,
                format!("getrheaders count {} exceeds height {}", count, height),
            ));
        }

        let count = count.min(MAX_RHEADERS_RESULTS as u32);
        let headers: Vec<Header> = (0..count)
            .filter_map(|offset| self.node.active_at(height as i32 - offset as i32))
            .filter_map(|handle| self.node.entry(handle).map(|entry| entry.header))
            .collect();

        debug!(peer = %peer, "Sending {} rheaders from height {}", headers.len(), height);
        self.push_message(
            peer,
            OutboundMessage::RHeaders {
                height,
                headers,
            },
        );
        Ok(HandlerOutcome::Processed)
    }

    /// Record the compact block version and announcement preference of the peer.
    pub fn handle_sendcmpct(
        &mut self,
        peer: NodeId,
        announce: bool,
        version: u64,
    ) -> SyncResult<HandlerOutcome> {
        if version != 1 && version != 2 {
            return Ok(HandlerOutcome::Ignored);
        }
        let state = state_mut(&mut self.peers, peer)?;
        let segsig = state.has_segregated_signatures();
        let caps = &mut state.capabilities;
        let witness = version == 2;

        if !caps.provides_header_and_ids {
            caps.provides_header_and_ids = true;
            caps.wants_cmpct_witness = witness;
        }
        if caps.wants_cmpct_witness == witness {
            caps.prefer_header_and_ids = announce;
        }
        if !caps.supports_desired_cmpct_version {
            caps.supports_desired_cmpct_version = if segsig { witness } else { version == 1 };
        }
        Ok(HandlerOutcome::Processed)
    }

    pub fn handle_sendheaders(&mut self, peer: NodeId) -> SyncResult<HandlerOutcome> {
        state_mut(&mut self.peers, peer)?.capabilities.prefer_headers = true;
        Ok(HandlerOutcome::Processed)
    }
}

fn outpoints_of(tx: &Transaction) -> impl Iterator<Item = OutPoint> + '_ {
    let txid = tx.txid();
    (0..tx.output.len() as u32).map(move |vout| OutPoint::new(txid, vout))
}
