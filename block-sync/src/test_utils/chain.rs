use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashcore::hashes::Hash;
use dashcore::{Block, BlockHash, Header, Transaction, Txid};

use super::{coinbase_tx, header_for};
use crate::chain::{BlockIndex, BlockStatus, IndexEntry, ValidityLevel};
use crate::constants::reject_codes;
use crate::types::BlockHandle;
use crate::validation::{
    BlockAcceptance, BlockCheck, BlockStore, Mempool, RejectReason, TxAcceptance, Validation,
};

/// Time of the genesis header in seconds.
pub const GENESIS_TIME: u32 = 1_700_000_000;

/// Seconds between consecutive mock headers.
pub const BLOCK_SPACING: u32 = 300;

/// A call to [`Validation::process_new_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedBlock {
    pub hash: BlockHash,
    pub force: bool,
    pub assume_pow_valid: bool,
}

/// In-memory block index, validation, mempool and block storage.
#[derive(Debug, Default)]
pub struct MockChain {
    entries: Vec<IndexEntry>,
    by_hash: HashMap<BlockHash, BlockHandle>,
    active: Vec<BlockHandle>,
    best_header: Option<BlockHandle>,
    blocks: HashMap<BlockHandle, Block>,
    mempool: BTreeMap<Txid, Arc<Transaction>>,
    /// Transactions whose outputs count as confirmed.
    confirmed: HashSet<Txid>,

    pub initial_block_download: bool,
    pub best_partial: Option<BlockHandle>,
    pub partial_sync_active: bool,
    pub partial_near_present: bool,
    /// Height from which segregated signatures are active.
    pub segsig_height: Option<i32>,
    /// Headers below this height do not meet the minimum chain work.
    pub minimum_work_height: i32,

    /// Returned by the next header batch instead of connecting it.
    pub header_rejection: Option<RejectReason>,
    pub block_rejections: HashMap<BlockHash, RejectReason>,
    pub tx_rejections: HashMap<Txid, RejectReason>,
    /// Handed back as evicted by the next accepted transaction.
    pub evict_on_accept: Vec<Arc<Transaction>>,

    /// Stored blocks whose data can no longer be read back.
    pub unreadable: HashSet<BlockHandle>,

    pub processed_blocks: Vec<ProcessedBlock>,
    /// Size and `skip_pow_check` of every header batch.
    pub header_batches: Vec<(usize, bool)>,
}

impl MockChain {
    /// Chain of `tip_height + 1` fully stored and connected blocks.
    pub fn with_active_chain(tip_height: i32) -> Self {
        let mut chain = Self::genesis();
        for _ in 0..tip_height {
            let tip = chain.hash_at(chain.active_height());
            let header = chain.next_header(tip, 0, &[]);
            let handle = chain.insert_header(header);
            chain.store_block(handle);
            chain.connect(handle);
        }
        chain
    }

    /// Stored genesis followed by `tip_height` headers without data.
    pub fn with_headers_only(tip_height: i32) -> Self {
        let mut chain = Self::genesis();
        let headers = chain.build_fork(chain.hash_at(0), tip_height as usize, 0);
        chain.add_headers(&headers);
        chain
    }

    fn genesis() -> Self {
        let mut chain = Self::default();
        let coinbase = coinbase_tx(0, 0);
        let header = header_for(BlockHash::all_zeros(), GENESIS_TIME, 0, &[coinbase]);
        let handle = chain.insert_header(header);
        chain.store_block(handle);
        chain.connect(handle);
        chain
    }

    fn next_header(&self, prev: BlockHash, salt: u32, txs: &[Transaction]) -> Header {
        let (height, time) = match self.lookup(&prev).and_then(|h| self.entry(h)) {
            Some(entry) => (entry.height + 1, entry.header.time + BLOCK_SPACING),
            None => (0, GENESIS_TIME),
        };
        let mut txdata = vec![coinbase_tx(height, salt)];
        txdata.extend_from_slice(txs);
        header_for(prev, time, salt, &txdata)
    }

    /// `count` headers extending `prev`, not added to the index.
    pub fn build_headers(&self, prev: BlockHash, count: usize) -> Vec<Header> {
        self.build_fork(prev, count, self.entries.len() as u32 + 1)
    }

    /// Like [`Self::build_headers`], with `salt` distinguishing competing branches.
    pub fn build_fork(&self, prev: BlockHash, count: usize, salt: u32) -> Vec<Header> {
        let mut headers: Vec<Header> = Vec::with_capacity(count);
        let (mut height, mut time) = match self.lookup(&prev).and_then(|h| self.entry(h)) {
            Some(entry) => (entry.height, entry.header.time),
            None => (-1, GENESIS_TIME - BLOCK_SPACING),
        };
        let mut prev = prev;
        for _ in 0..count {
            height += 1;
            time += BLOCK_SPACING;
            let header = header_for(prev, time, salt, &[coinbase_tx(height, salt)]);
            prev = header.block_hash();
            headers.push(header);
        }
        headers
    }

    /// A block with `txs` extending `prev`, not added to the index.
    pub fn build_block(&self, prev: BlockHash, txs: Vec<Transaction>) -> Block {
        let header = self.next_header(prev, 7, &txs);
        let height = self.lookup(&prev).and_then(|h| self.height(h)).map_or(0, |h| h + 1);
        let mut txdata = vec![coinbase_tx(height, 7)];
        txdata.extend(txs);
        Block {
            header,
            txdata,
        }
    }

    fn insert_header(&mut self, header: Header) -> BlockHandle {
        let hash = header.block_hash();
        if let Some(&handle) = self.by_hash.get(&hash) {
            return handle;
        }
        let prev = self.by_hash.get(&header.prev_blockhash).copied();
        let height = prev.and_then(|p| self.height(p)).map_or(0, |h| h + 1);
        let handle = BlockHandle(self.entries.len() as u32);
        self.entries.push(IndexEntry {
            hash,
            height,
            prev,
            header,
            validity: ValidityLevel::Tree,
            status: BlockStatus::empty(),
            chain_tx: 0,
            tx_count: 0,
        });
        self.by_hash.insert(hash, handle);
        let better =
            self.best_header.and_then(|b| self.height(b)).map_or(true, |best| height > best);
        if better {
            self.best_header = Some(handle);
        }
        handle
    }

    /// Add headers to the index. Stops at the first header whose parent is unknown.
    pub fn add_headers(&mut self, headers: &[Header]) -> Option<BlockHandle> {
        let mut last = None;
        for header in headers {
            if !self.by_hash.contains_key(&header.prev_blockhash) {
                return None;
            }
            last = Some(self.insert_header(*header));
        }
        last
    }

    fn put_block(&mut self, handle: BlockHandle, block: Block) {
        let tx_count = block.txdata.len() as u32;
        let parent_chain_tx = self
            .entry(handle)
            .and_then(|e| e.prev)
            .and_then(|p| self.entry(p))
            .map(|p| p.chain_tx);
        let is_genesis = self.entry(handle).is_some_and(|e| e.prev.is_none());
        let entry = &mut self.entries[handle.0 as usize];
        entry.status |= BlockStatus::HAVE_DATA;
        entry.tx_count = tx_count;
        entry.validity = entry.validity.max(ValidityLevel::Transactions);
        entry.chain_tx = match parent_chain_tx {
            Some(parent) if parent > 0 => parent + tx_count as u64,
            _ if is_genesis => tx_count as u64,
            _ => 0,
        };
        self.blocks.insert(handle, block);
    }

    /// Store a coinbase-only body for a header-only entry.
    pub fn store_block(&mut self, handle: BlockHandle) {
        let Some(entry) = self.entry(handle) else {
            return;
        };
        let block = Block {
            header: entry.header,
            txdata: vec![coinbase_tx(entry.height, entry.header.nonce)],
        };
        self.put_block(handle, block);
    }

    fn connect(&mut self, handle: BlockHandle) {
        let entry = &mut self.entries[handle.0 as usize];
        entry.validity = ValidityLevel::Scripts;
        self.active.push(handle);
    }

    /// Extend the active chain over stored children of the tip.
    fn activate_best_chain(&mut self) {
        loop {
            let Some(tip) = self.active_tip() else {
                return;
            };
            let next = (0..self.entries.len() as u32).map(BlockHandle).find(|&h| {
                let entry = &self.entries[h.0 as usize];
                entry.prev == Some(tip) && entry.has_data()
            });
            match next {
                Some(handle) => self.connect(handle),
                None => return,
            }
        }
    }

    /// Drop the active chain back to `height`.
    pub fn rewind_active(&mut self, height: i32) {
        self.active.truncate((height + 1).max(0) as usize);
    }

    pub fn at_height(&self, height: i32) -> Option<BlockHandle> {
        self.best_header.and_then(|best| self.ancestor(best, height))
    }

    pub fn hash_at(&self, height: i32) -> BlockHash {
        self.header_at(height).block_hash()
    }

    pub fn header_at(&self, height: i32) -> Header {
        let handle = self.at_height(height).expect("height on the best header chain");
        self.entries[handle.0 as usize].header
    }

    pub fn tip_hash(&self) -> BlockHash {
        let best = self.best_header.expect("non-empty chain");
        self.entries[best.0 as usize].hash
    }

    /// Time of the best header in seconds.
    pub fn tip_time(&self) -> i64 {
        let best = self.best_header.expect("non-empty chain");
        self.entries[best.0 as usize].time()
    }

    pub fn add_to_mempool(&mut self, tx: Arc<Transaction>) {
        self.mempool.insert(tx.txid(), tx);
    }

    /// Treat the outputs of `txid` as confirmed.
    pub fn add_confirmed(&mut self, txid: Txid) {
        self.confirmed.insert(txid);
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.len()
    }

    pub fn mark_failed(&mut self, handle: BlockHandle) {
        self.entries[handle.0 as usize].status |= BlockStatus::FAILED_VALID;
    }
}

impl BlockIndex for MockChain {
    fn lookup(&self, hash: &BlockHash) -> Option<BlockHandle> {
        self.by_hash.get(hash).copied()
    }

    fn entry(&self, handle: BlockHandle) -> Option<&IndexEntry> {
        self.entries.get(handle.0 as usize)
    }

    fn ancestor(&self, handle: BlockHandle, height: i32) -> Option<BlockHandle> {
        let mut current = Some(handle);
        while let Some(h) = current {
            let entry = self.entry(h)?;
            if entry.height == height {
                return Some(h);
            }
            if entry.height < height {
                return None;
            }
            current = entry.prev;
        }
        None
    }

    fn compare_work(&self, a: BlockHandle, b: BlockHandle) -> Ordering {
        self.height(a).cmp(&self.height(b))
    }

    fn meets_minimum_chain_work(&self, handle: BlockHandle) -> bool {
        self.height(handle).is_some_and(|h| h >= self.minimum_work_height)
    }

    fn active_tip(&self) -> Option<BlockHandle> {
        self.active.last().copied()
    }

    fn active_at(&self, height: i32) -> Option<BlockHandle> {
        usize::try_from(height).ok().and_then(|h| self.active.get(h).copied())
    }

    fn best_header(&self) -> Option<BlockHandle> {
        self.best_header
    }

    fn is_initial_block_download(&self) -> bool {
        self.initial_block_download
    }

    fn best_partial_header(&self) -> Option<BlockHandle> {
        self.best_partial
    }

    fn partial_contains(&self, handle: BlockHandle) -> bool {
        match (self.best_partial, self.height(handle)) {
            (Some(partial), Some(height)) => self.ancestor(partial, height) == Some(handle),
            _ => false,
        }
    }

    fn is_partial_sync_active(&self) -> bool {
        self.partial_sync_active
    }

    fn is_partial_near_present(&self) -> bool {
        self.partial_near_present
    }

    fn is_segsig_enabled(&self, prev: Option<BlockHandle>) -> bool {
        let height = prev.and_then(|p| self.height(p)).map_or(0, |h| h + 1);
        self.segsig_height.is_some_and(|from| height >= from)
    }
}

impl Validation for MockChain {
    fn process_new_block(
        &mut self,
        block: Arc<Block>,
        force_processing: bool,
        assume_pow_valid: bool,
    ) -> BlockAcceptance {
        let hash = block.block_hash();
        self.processed_blocks.push(ProcessedBlock {
            hash,
            force: force_processing,
            assume_pow_valid,
        });

        if let Some(reason) = self.block_rejections.get(&hash) {
            return BlockAcceptance {
                accepted: false,
                is_new: false,
                rejection: Some(reason.clone()),
            };
        }
        if !self.by_hash.contains_key(&block.header.prev_blockhash) {
            return BlockAcceptance {
                accepted: false,
                is_new: false,
                rejection: Some(RejectReason::new(reject_codes::INVALID, "prev-blk-not-found", 10)),
            };
        }

        let handle = self.insert_header(block.header);
        let is_new = !self.entries[handle.0 as usize].has_data();
        if is_new {
            self.put_block(handle, Arc::unwrap_or_clone(block));
            self.activate_best_chain();
        }
        BlockAcceptance {
            accepted: true,
            is_new,
            rejection: None,
        }
    }

    fn process_new_block_headers(
        &mut self,
        headers: &[Header],
        skip_pow_check: bool,
    ) -> Result<Option<BlockHandle>, RejectReason> {
        self.header_batches.push((headers.len(), skip_pow_check));
        if let Some(reason) = self.header_rejection.clone() {
            return Err(reason);
        }
        let Some(first) = headers.first() else {
            return Ok(None);
        };
        if !self.by_hash.contains_key(&first.prev_blockhash) {
            return Err(RejectReason::new(reject_codes::INVALID, "prev-blk-not-found", 10));
        }
        Ok(self.add_headers(headers))
    }

    fn accept_to_mempool(&mut self, tx: Arc<Transaction>) -> TxAcceptance {
        let txid = tx.txid();
        if let Some(reason) = self.tx_rejections.get(&txid) {
            return TxAcceptance::Rejected(reason.clone());
        }
        if self.mempool.contains_key(&txid) {
            return TxAcceptance::Rejected(RejectReason::new(
                reject_codes::DUPLICATE,
                "txn-already-in-mempool",
                0,
            ));
        }
        let missing = tx.input.iter().any(|input| {
            let parent = input.previous_output.txid;
            !self.mempool.contains_key(&parent) && !self.confirmed.contains(&parent)
        });
        if missing {
            return TxAcceptance::MissingInputs;
        }
        self.mempool.insert(txid, tx);
        TxAcceptance::Accepted {
            removed: std::mem::take(&mut self.evict_on_accept),
        }
    }

    fn check_block(&self, block: &Block) -> BlockCheck {
        if block.check_merkle_root() {
            BlockCheck::Valid
        } else {
            BlockCheck::Mutated
        }
    }
}

impl Mempool for MockChain {
    fn get_transaction(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.mempool.get(txid).cloned()
    }

    fn transactions(&self) -> Vec<Arc<Transaction>> {
        self.mempool.values().cloned().collect()
    }
}

impl BlockStore for MockChain {
    fn read_block(&self, handle: BlockHandle) -> Option<Block> {
        if self.unreadable.contains(&handle) {
            return None;
        }
        self.blocks.get(&handle).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_chain_layout() {
        let chain = MockChain::with_active_chain(10);
        assert_eq!(chain.active_height(), 10);
        assert_eq!(chain.best_header(), chain.active_tip());
        let tip = chain.entry(chain.active_tip().unwrap()).unwrap();
        assert!(tip.has_data());
        assert_eq!(tip.chain_tx, 11);
        assert!(tip.is_valid(ValidityLevel::Scripts));
    }

    #[test]
    fn test_headers_only_layout() {
        let chain = MockChain::with_headers_only(5);
        assert_eq!(chain.active_height(), 0);
        assert_eq!(chain.height(chain.best_header().unwrap()), Some(5));
        let entry = chain.entry(chain.at_height(3).unwrap()).unwrap();
        assert!(!entry.has_data());
        assert!(entry.is_valid(ValidityLevel::Tree));
        assert_eq!(chain.tip_time(), (GENESIS_TIME + 5 * BLOCK_SPACING) as i64);
    }

    #[test]
    fn test_process_new_block_connects() {
        let mut chain = MockChain::with_active_chain(3);
        let block = chain.build_block(chain.tip_hash(), vec![]);
        let acceptance = chain.process_new_block(Arc::new(block.clone()), false, false);
        assert!(acceptance.accepted && acceptance.is_new);
        assert_eq!(chain.active_height(), 4);
        assert_eq!(chain.read_block(chain.active_tip().unwrap()), Some(block.clone()));

        let again = chain.process_new_block(Arc::new(block), false, false);
        assert!(!again.is_new);
    }

    #[test]
    fn test_forks_are_distinct() {
        let chain = MockChain::with_active_chain(3);
        let a = chain.build_fork(chain.hash_at(1), 2, 1);
        let b = chain.build_fork(chain.hash_at(1), 2, 2);
        assert_ne!(a[0].block_hash(), b[0].block_hash());
        assert_ne!(a[0].block_hash(), chain.hash_at(2));
    }
}
