//! Compact block reconstruction.
//!
//! A `cmpctblock` announcement carries the header, prefilled transactions and 6-byte short IDs
//! for the rest. [`PartiallyDownloadedBlock`] resolves the short IDs against the mempool and the
//! [`ExtraTxCache`], then completes the block from a `blocktxn` response.

use std::collections::HashMap;
use std::sync::Arc;

use dashcore::bip152::{HeaderAndShortIds, ShortId};
use dashcore::{Block, Header, Transaction, Txid};
use tracing::debug;

use crate::validation::BlockCheck;

/// Upper bound on the number of transactions a block can hold.
const MAX_BLOCK_TRANSACTIONS: usize = 100_000;

/// Result of a reconstruction step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    Ok,
    /// The announcement or response is structurally broken. The peer is at fault.
    Invalid,
    /// Reconstruction failed without evidence of misbehavior, e.g. short ID collisions.
    /// Fall back to requesting the full block.
    Failed,
}

/// Ring buffer of recently seen transactions that are not in the mempool: orphans,
/// rejected transactions and transactions evicted from the mempool.
#[derive(Debug, Clone)]
pub struct ExtraTxCache {
    entries: Vec<(Txid, Arc<Transaction>)>,
    next: usize,
    capacity: usize,
}

impl ExtraTxCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            next: 0,
            capacity,
        }
    }

    pub fn push(&mut self, tx: Arc<Transaction>) {
        if self.capacity == 0 {
            return;
        }
        let entry = (tx.txid(), tx);
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
        } else {
            self.entries[self.next] = entry;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Txid, Arc<Transaction>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reconstruction state for one announced block.
#[derive(Debug, Clone, Default)]
pub struct PartiallyDownloadedBlock {
    header: Option<Header>,
    txn_available: Vec<Option<Arc<Transaction>>>,
    prefilled_count: usize,
    mempool_count: usize,
    extra_count: usize,
}

impl PartiallyDownloadedBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the announcement against locally known transactions.
    pub fn init_data<I>(
        &mut self,
        cmpct: &HeaderAndShortIds,
        mempool: I,
        extra_txn: &ExtraTxCache,
    ) -> FillStatus
    where
        I: IntoIterator<Item = Arc<Transaction>>,
    {
        debug_assert!(self.header.is_none() && self.txn_available.is_empty());

        let short_count = cmpct.short_ids.len();
        if short_count == 0 && cmpct.prefilled_txs.is_empty() {
            return FillStatus::Invalid;
        }
        let total = short_count + cmpct.prefilled_txs.len();
        if total > MAX_BLOCK_TRANSACTIONS {
            return FillStatus::Invalid;
        }

        let mut available: Vec<Option<Arc<Transaction>>> = vec![None; total];

        // prefilled indexes are differentially encoded
        let mut last_prefilled: i64 = -1;
        for (i, prefilled) in cmpct.prefilled_txs.iter().enumerate() {
            last_prefilled += prefilled.idx as i64 + 1;
            if last_prefilled > u16::MAX as i64 {
                return FillStatus::Invalid;
            }
            // a prefilled index past every short ID would leave a gap we can never fill
            if last_prefilled as usize > short_count + i {
                return FillStatus::Invalid;
            }
            available[last_prefilled as usize] = Some(Arc::new(prefilled.tx.clone()));
        }
        self.prefilled_count = cmpct.prefilled_txs.len();

        let mut positions: HashMap<ShortId, usize> = HashMap::with_capacity(short_count);
        let mut offset = 0;
        for (i, short_id) in cmpct.short_ids.iter().enumerate() {
            while matches!(available.get(i + offset), Some(Some(_))) {
                offset += 1;
            }
            if i + offset >= total {
                return FillStatus::Invalid;
            }
            positions.insert(*short_id, i + offset);
        }
        if positions.len() != short_count {
            // duplicate short IDs inside one announcement
            return FillStatus::Failed;
        }

        let keys = ShortId::calculate_siphash_keys(&cmpct.header, cmpct.nonce);
        let mut have = vec![false; total];

        if short_count > 0 {
            for tx in mempool {
                let short_id = ShortId::with_siphash_keys(&tx.txid().to_raw_hash(), keys);
                if let Some(&idx) = positions.get(&short_id) {
                    if !have[idx] {
                        available[idx] = Some(tx);
                        have[idx] = true;
                        self.mempool_count += 1;
                    } else if available[idx].take().is_some() {
                        // two mempool transactions share the short ID, request it instead
                        self.mempool_count -= 1;
                    }
                }
                if self.mempool_count == short_count {
                    break;
                }
            }
        }

        if self.mempool_count < short_count {
            for (txid, tx) in extra_txn.iter() {
                let short_id = ShortId::with_siphash_keys(&txid.to_raw_hash(), keys);
                if let Some(&idx) = positions.get(&short_id) {
                    if !have[idx] {
                        available[idx] = Some(tx.clone());
                        have[idx] = true;
                        self.mempool_count += 1;
                        self.extra_count += 1;
                    } else if available[idx].as_ref().is_some_and(|known| known.txid() != *txid) {
                        available[idx] = None;
                        self.mempool_count -= 1;
                        self.extra_count -= 1;
                    }
                }
                if self.mempool_count == short_count {
                    break;
                }
            }
        }

        debug!(
            "Initialized compact block {}: {} txn prefilled, {} from mempool \
             (incl. {} from extra pool), {} to request",
            cmpct.header.block_hash(),
            self.prefilled_count,
            self.mempool_count,
            self.extra_count,
            total - self.prefilled_count - self.mempool_count
        );

        self.header = Some(cmpct.header);
        self.txn_available = available;
        FillStatus::Ok
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn tx_count(&self) -> usize {
        self.txn_available.len()
    }

    pub fn is_tx_available(&self, index: usize) -> bool {
        matches!(self.txn_available.get(index), Some(Some(_)))
    }

    /// Block indexes still unresolved, in ascending order.
    pub fn missing_indexes(&self) -> Vec<u64> {
        self.txn_available
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.is_none())
            .map(|(idx, _)| idx as u64)
            .collect()
    }

    /// Complete the block with `missing`, which must hold exactly the unresolved transactions
    /// in block order. The state is consumed; a second call returns `Invalid`.
    ///
    /// A block that fails `check` for reasons other than a mutated merkle tree is still
    /// returned with `Ok` so validation can reject it with the proper reason.
    pub fn fill_block<F>(
        &mut self,
        missing: Vec<Transaction>,
        check: F,
    ) -> (FillStatus, Option<Block>)
    where
        F: FnOnce(&Block) -> BlockCheck,
    {
        let Some(header) = self.header.take() else {
            return (FillStatus::Invalid, None);
        };

        let mut missing = missing.into_iter();
        let mut txdata = Vec::with_capacity(self.txn_available.len());
        for slot in std::mem::take(&mut self.txn_available) {
            match slot {
                Some(tx) => txdata.push(Arc::unwrap_or_clone(tx)),
                None => match missing.next() {
                    Some(tx) => txdata.push(tx),
                    None => return (FillStatus::Invalid, None),
                },
            }
        }
        if missing.next().is_some() {
            return (FillStatus::Invalid, None);
        }

        let block = Block {
            header,
            txdata,
        };

        match check(&block) {
            BlockCheck::Mutated => (FillStatus::Failed, None),
            BlockCheck::Valid | BlockCheck::Invalid(_) => (FillStatus::Ok, Some(block)),
        }
    }
}
