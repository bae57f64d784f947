//! Collaborator interfaces the engine calls into.
//!
//! Consensus validation, the mempool and block storage live outside this crate.
//! The engine is generic over a single [`NodeBackend`] that provides all of them.

use std::sync::Arc;

use dashcore::{Block, BlockHash, Header, Transaction, Txid};

use crate::chain::BlockIndex;
use crate::types::{BlockHandle, HeaderProgress, Timestamp};

/// Why validation rejected an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectReason {
    pub code: u16,
    pub reason: String,
    /// Misbehavior penalty for the peer that sent the object. 0 means not punishable.
    pub dos_score: i32,
    /// The failure may be caused by corruption in transit rather than by the object itself.
    pub corruption_possible: bool,
}

impl RejectReason {
    pub fn new(code: u16, reason: impl Into<String>, dos_score: i32) -> Self {
        Self {
            code,
            reason: reason.into(),
            dos_score,
            corruption_possible: false,
        }
    }
}

/// Outcome of handing a block to validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAcceptance {
    pub accepted: bool,
    /// The block was not seen before.
    pub is_new: bool,
    /// Set when checking the block failed.
    pub rejection: Option<RejectReason>,
}

/// Outcome of handing a loose transaction to the mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxAcceptance {
    /// Accepted. Carries transactions evicted from the mempool to make room.
    Accepted {
        removed: Vec<Arc<Transaction>>,
    },
    /// One or more inputs reference unknown outputs.
    MissingInputs,
    Rejected(RejectReason),
}

/// Context-free block check used after compact block reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockCheck {
    Valid,
    /// Merkle root mismatch or duplicated transactions: the short IDs collided.
    Mutated,
    Invalid(RejectReason),
}

pub trait Validation {
    fn process_new_block(
        &mut self,
        block: Arc<Block>,
        force_processing: bool,
        assume_pow_valid: bool,
    ) -> BlockAcceptance;

    /// Connect a batch of headers. Returns the handle of the last header.
    fn process_new_block_headers(
        &mut self,
        headers: &[Header],
        skip_pow_check: bool,
    ) -> Result<Option<BlockHandle>, RejectReason>;

    fn accept_to_mempool(&mut self, tx: Arc<Transaction>) -> TxAcceptance;

    fn check_block(&self, block: &Block) -> BlockCheck;
}

pub trait Mempool {
    fn get_transaction(&self, txid: &Txid) -> Option<Arc<Transaction>>;

    fn contains(&self, txid: &Txid) -> bool {
        self.get_transaction(txid).is_some()
    }

    /// Snapshot of all mempool transactions.
    fn transactions(&self) -> Vec<Arc<Transaction>>;
}

pub trait BlockStore {
    fn read_block(&self, handle: BlockHandle) -> Option<Block>;
}

/// Everything the engine needs from the node.
pub trait NodeBackend: BlockIndex + Validation + Mempool + BlockStore {}

impl<T: BlockIndex + Validation + Mempool + BlockStore> NodeBackend for T {}

/// Notifications emitted by the engine. All methods default to no-ops.
pub trait SyncObserver: Send + Sync {
    fn header_progress(&self, _progress: HeaderProgress) {}

    /// A transaction was accepted and should be announced to other peers.
    fn relay_transaction(&self, _tx: &Arc<Transaction>) {}

    /// Stored block data went missing in light mode; the wallet scan must restart.
    fn spv_reset_requested(&self, _reason: &str) {}

    fn block_requested(&self, _hash: &BlockHash, _priority: bool) {}
}

/// Source of time for timeouts and expiry.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> Timestamp;

    /// Network-adjusted time in seconds.
    fn adjusted_time(&self) -> i64 {
        self.now_micros() / 1_000_000
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> Timestamp {
        chrono::Utc::now().timestamp_micros()
    }
}
