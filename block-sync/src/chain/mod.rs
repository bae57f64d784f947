//! Read-only view of the external block index.
//!
//! The index tree is owned and persisted by the node. The sync engine only keeps
//! [`BlockHandle`]s into it and asks the questions below.

pub mod checkpoints;
pub mod locator;

use std::cmp::Ordering;

use bitflags::bitflags;
use dashcore::{BlockHash, Header};

use crate::types::BlockHandle;

pub use checkpoints::Checkpoints;
pub use locator::block_locator;

/// How far validation of an indexed block has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidityLevel {
    Unknown,
    /// Header parsed and proof of work checked.
    Header,
    /// All parents are known and valid to this level; chain work is computed.
    Tree,
    /// Transactions checked and merkle root verified.
    Transactions,
    /// Contextual checks and no double spends within the chain.
    Chain,
    /// Scripts and signatures verified.
    Scripts,
}

bitflags! {
    /// Storage and failure flags of an indexed block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockStatus: u32 {
        /// Full block data is stored.
        const HAVE_DATA = 1 << 0;
        const HAVE_UNDO = 1 << 1;
        /// Block failed validation.
        const FAILED_VALID = 1 << 2;
        /// Block descends from a failed block.
        const FAILED_CHILD = 1 << 3;
        const FAILED_MASK = Self::FAILED_VALID.bits() | Self::FAILED_CHILD.bits();
    }
}

/// A single node of the block index tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub hash: BlockHash,
    pub height: i32,
    pub prev: Option<BlockHandle>,
    pub header: Header,
    pub validity: ValidityLevel,
    pub status: BlockStatus,
    /// Number of transactions up to and including this block.
    /// 0 unless it and all ancestors are stored.
    pub chain_tx: u64,
    /// Number of transactions in this block, 0 if the body was never seen.
    pub tx_count: u32,
}

impl IndexEntry {
    pub fn is_valid(&self, level: ValidityLevel) -> bool {
        !self.status.intersects(BlockStatus::FAILED_MASK) && self.validity >= level
    }

    /// Chain work is known, i.e. the block connects to the tree.
    pub fn has_chain_work(&self) -> bool {
        self.validity >= ValidityLevel::Tree
    }

    pub fn has_data(&self) -> bool {
        self.status.contains(BlockStatus::HAVE_DATA)
    }

    /// Block time in seconds.
    pub fn time(&self) -> i64 {
        self.header.time as i64
    }
}

/// The block index tree and chain state the engine reads from.
pub trait BlockIndex {
    fn lookup(&self, hash: &BlockHash) -> Option<BlockHandle>;

    fn entry(&self, handle: BlockHandle) -> Option<&IndexEntry>;

    /// Ancestor of `handle` at `height`, `None` if `height` is above it.
    fn ancestor(&self, handle: BlockHandle, height: i32) -> Option<BlockHandle>;

    /// Compare the accumulated chain work of two blocks.
    fn compare_work(&self, a: BlockHandle, b: BlockHandle) -> Ordering;

    fn meets_minimum_chain_work(&self, handle: BlockHandle) -> bool;

    fn active_tip(&self) -> Option<BlockHandle>;

    fn active_at(&self, height: i32) -> Option<BlockHandle>;

    /// Header with the most work, whether or not its body is stored.
    fn best_header(&self) -> Option<BlockHandle>;

    fn is_initial_block_download(&self) -> bool;

    /// Tip of the header-only partial chain used by light sync.
    fn best_partial_header(&self) -> Option<BlockHandle> {
        None
    }

    fn partial_contains(&self, _handle: BlockHandle) -> bool {
        false
    }

    fn is_partial_sync_active(&self) -> bool {
        false
    }

    /// Whether the partial chain tip is close to the present.
    fn is_partial_near_present(&self) -> bool {
        false
    }

    /// Whether segregated signatures are active for the block following `prev`.
    fn is_segsig_enabled(&self, _prev: Option<BlockHandle>) -> bool {
        false
    }

    fn hash(&self, handle: BlockHandle) -> Option<BlockHash> {
        self.entry(handle).map(|e| e.hash)
    }

    fn height(&self, handle: BlockHandle) -> Option<i32> {
        self.entry(handle).map(|e| e.height)
    }

    /// Height of the active tip, -1 with an empty chain.
    fn active_height(&self) -> i32 {
        self.active_tip().and_then(|tip| self.height(tip)).unwrap_or(-1)
    }

    fn active_contains(&self, handle: BlockHandle) -> bool {
        match self.height(handle) {
            Some(height) => self.active_at(height) == Some(handle),
            None => false,
        }
    }

    /// Successor of `handle` on the active chain.
    fn active_next(&self, handle: BlockHandle) -> Option<BlockHandle> {
        if !self.active_contains(handle) {
            return None;
        }
        self.active_at(self.height(handle)? + 1)
    }

    /// Last block of the active chain that is an ancestor of `handle`.
    fn find_fork(&self, handle: BlockHandle) -> Option<BlockHandle> {
        let height = self.height(handle)?.min(self.active_height());
        let mut current = self.ancestor(handle, height);
        while let Some(h) = current {
            if self.active_contains(h) {
                return Some(h);
            }
            current = self.entry(h).and_then(|e| e.prev);
        }
        None
    }

    fn last_common_ancestor(&self, a: BlockHandle, b: BlockHandle) -> Option<BlockHandle> {
        let height = self.height(a)?.min(self.height(b)?);
        let mut a = self.ancestor(a, height)?;
        let mut b = self.ancestor(b, height)?;
        while a != b {
            a = self.entry(a)?.prev?;
            b = self.entry(b)?.prev?;
        }
        Some(a)
    }

    /// Best partial header when it is ahead of the best full header, else the best header.
    fn header_tip(&self) -> Option<BlockHandle> {
        let best = self.best_header().or_else(|| self.active_tip());
        match (self.best_partial_header(), best) {
            (Some(partial), Some(best)) if self.height(partial) > self.height(best) => {
                Some(partial)
            }
            (partial, None) => partial,
            (_, best) => best,
        }
    }
}
