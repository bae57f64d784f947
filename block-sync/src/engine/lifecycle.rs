//! Peer registration and removal.

use tracing::{debug, info};

use super::SyncEngine;
use crate::peer::PeerSyncState;
use crate::sync::scheduler::check_consistency;
use crate::types::{NodeId, PeerAddress};
use crate::validation::NodeBackend;

impl<N: NodeBackend> SyncEngine<N> {
    /// Register a newly connected peer.
    ///
    /// # Panics
    ///
    /// If `peer` is already registered. The connection layer owns peer ids and must never
    /// reuse a live one.
    pub fn connect(&mut self, peer: NodeId, address: PeerAddress) {
        assert!(!self.peers.contains_key(&peer), "peer {} registered twice", peer);

        let state = PeerSyncState::new(peer, address);
        if state.preferred_download {
            self.preferred_download_count += 1;
        }
        self.max_starting_height = self.max_starting_height.max(state.address.starting_height);
        info!(
            peer = %peer,
            "Peer connected: {} (height {}, version {})",
            state.address.addr,
            state.address.starting_height,
            state.address.version
        );
        self.peers.insert(peer, state);
    }

    /// Remove a peer and everything it owns. Returns false for an unknown peer.
    ///
    /// Its in-flight blocks become fetchable from other peers and its orphans are dropped.
    pub fn disconnect(&mut self, peer: NodeId) -> bool {
        let Some(state) = self.peers.remove(&peer) else {
            return false;
        };

        if state.forward_sync_started {
            self.headers.sync_started = self.headers.sync_started.saturating_sub(1);
        }
        if state.reverse_sync_started {
            self.headers.rsync_started = self.headers.rsync_started.saturating_sub(1);
        }
        if state.partial_sync_started {
            self.headers.partial_started = self.headers.partial_started.saturating_sub(1);
        }
        if state.preferred_download {
            self.preferred_download_count = self.preferred_download_count.saturating_sub(1);
        }

        let released = self.in_flight.remove_peer(&state);
        let orphans = self.orphans.evict_for(peer);
        debug!(
            peer = %peer,
            "Peer disconnected, released {} blocks in flight and {} orphans",
            released,
            orphans
        );

        debug_assert!(check_consistency(&self.in_flight, &self.peers));
        if self.peers.is_empty() {
            debug_assert!(self.in_flight.is_empty());
            debug_assert_eq!(self.in_flight.peers_with_validated_downloads(), 0);
            debug_assert_eq!(self.preferred_download_count, 0);
            debug_assert_eq!(self.headers.sync_started, 0);
        }
        true
    }
}
