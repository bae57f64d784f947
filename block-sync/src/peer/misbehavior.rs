//! Ban score accounting.

use tracing::{info, warn};

use crate::peer::PeerSyncState;
use crate::types::PeerFlags;

/// What the connection layer must do with a peer whose ban flag was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanDecision {
    None,
    /// Drop the connection but keep the address off the ban list.
    DisconnectOnly,
    Ban,
}

#[derive(Debug, Clone, Copy)]
pub struct MisbehaviorTracker {
    threshold: i32,
}

impl MisbehaviorTracker {
    pub fn new(threshold: i32) -> Self {
        Self {
            threshold,
        }
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    /// Add `amount` to the peer's score. Returns true if this call crossed the threshold.
    pub fn penalize(&self, state: &mut PeerSyncState, amount: i32) -> bool {
        if amount == 0 {
            return false;
        }

        let before = state.misbehavior;
        state.misbehavior = state.misbehavior.saturating_add(amount);

        if state.misbehavior >= self.threshold && before < self.threshold {
            warn!(
                peer = %state.id,
                "Misbehaving peer {} ({} -> {}) BAN THRESHOLD EXCEEDED",
                state.address.addr,
                before,
                state.misbehavior
            );
            state.should_ban = true;
            true
        } else {
            info!(peer = %state.id, "Misbehaving ({} -> {})", before, state.misbehavior);
            false
        }
    }

    /// Consume the one-shot ban flag.
    pub fn resolve(&self, state: &mut PeerSyncState) -> BanDecision {
        if !std::mem::take(&mut state.should_ban) {
            return BanDecision::None;
        }

        let flags = state.address.flags;
        if flags.contains(PeerFlags::WHITELISTED) {
            warn!("Not punishing whitelisted peer {}", state.address.addr);
            BanDecision::DisconnectOnly
        } else if flags.contains(PeerFlags::MANUAL) {
            warn!("Not punishing manually added peer {}", state.address.addr);
            BanDecision::DisconnectOnly
        } else if flags.contains(PeerFlags::LOCAL) {
            warn!("Not banning local peer {}", state.address.addr);
            BanDecision::DisconnectOnly
        } else {
            BanDecision::Ban
        }
    }
}
