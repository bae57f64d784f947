//! Peer state and misbehavior policy.

pub mod misbehavior;
pub mod state;

pub use misbehavior::{BanDecision, MisbehaviorTracker};
pub use state::{PeerCapabilities, PeerSyncState, QueuedBlock};
