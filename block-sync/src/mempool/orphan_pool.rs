//! Transactions whose inputs are not known yet.
//!
//! Orphans are indexed by the outpoints they spend so a newly accepted parent finds its
//! children. Entries expire after a fixed lifetime and the pool is trimmed to capacity by
//! random eviction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use dashcore::hashes::Hash;
use dashcore::{Block, OutPoint, Transaction, Txid};
use rand::Rng;
use tracing::{debug, trace};

use crate::types::{NodeId, Timestamp};

/// A transaction waiting for its parents.
#[derive(Debug, Clone)]
pub struct OrphanTx {
    pub tx: Arc<Transaction>,
    /// Peer that sent the transaction
    pub from_peer: NodeId,
    /// When the orphan is swept, in microseconds
    pub expires_at: Timestamp,
}

/// Bounded pool of transactions with unknown inputs
pub struct OrphanTransactionPool {
    /// Orphans ordered by txid, so a random successor lookup picks a uniform victim
    orphans: BTreeMap<Txid, OrphanTx>,
    /// Orphans indexed by every outpoint they spend
    by_prev: HashMap<OutPoint, BTreeSet<Txid>>,
    /// Earliest time the next expiry sweep may run
    next_sweep: Timestamp,
    expire_time: Duration,
    expire_interval: Duration,
    max_tx_weight: u64,
}

impl OrphanTransactionPool {
    pub fn new(expire_time: Duration, expire_interval: Duration, max_tx_weight: u64) -> Self {
        Self {
            orphans: BTreeMap::new(),
            by_prev: HashMap::new(),
            next_sweep: 0,
            expire_time,
            expire_interval,
            max_tx_weight,
        }
    }

    /// Adds an orphan. Returns false for duplicates and transactions at or above the weight limit.
    pub fn add(&mut self, tx: Arc<Transaction>, from_peer: NodeId, now: Timestamp) -> bool {
        let txid = tx.txid();
        if self.orphans.contains_key(&txid) {
            return false;
        }

        // Large orphans are an easy memory exhaustion vector. A legitimate sender will
        // rebroadcast once the parents are known.
        let weight = tx.weight().to_wu();
        if weight >= self.max_tx_weight {
            debug!("Ignoring large orphan tx (weight: {}, txid: {})", weight, txid);
            return false;
        }

        for input in &tx.input {
            self.by_prev.entry(input.previous_output).or_default().insert(txid);
        }
        self.orphans.insert(
            txid,
            OrphanTx {
                tx,
                from_peer,
                expires_at: now + self.expire_time.as_micros() as i64,
            },
        );

        debug!(
            "Stored orphan tx {} (mapsz {} outsz {})",
            txid,
            self.orphans.len(),
            self.by_prev.len()
        );
        true
    }

    /// Removes an orphan. Returns true if it was present.
    pub fn erase(&mut self, txid: &Txid) -> bool {
        let Some(orphan) = self.orphans.remove(txid) else {
            return false;
        };
        for input in &orphan.tx.input {
            if let Some(spenders) = self.by_prev.get_mut(&input.previous_output) {
                spenders.remove(txid);
                if spenders.is_empty() {
                    self.by_prev.remove(&input.previous_output);
                }
            }
        }
        trace!("Removed orphan tx {}", txid);
        true
    }

    /// Removes every orphan received from `peer`.
    pub fn evict_for(&mut self, peer: NodeId) -> usize {
        let victims: Vec<Txid> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.from_peer == peer)
            .map(|(txid, _)| *txid)
            .collect();

        let erased = victims.iter().filter(|txid| self.erase(txid)).count();
        if erased > 0 {
            debug!("Erased {} orphan tx from peer={}", erased, peer);
        }
        erased
    }

    /// Removes orphans included in or conflicting with `block`.
    pub fn erase_for_block(&mut self, block: &Block) -> usize {
        let mut victims = Vec::new();
        for tx in &block.txdata {
            for input in &tx.input {
                if let Some(spenders) = self.by_prev.get(&input.previous_output) {
                    victims.extend(spenders.iter().copied());
                }
            }
        }

        let erased = victims.iter().filter(|txid| self.erase(txid)).count();
        if erased > 0 {
            debug!("Erased {} orphan tx included or conflicted by block", erased);
        }
        erased
    }

    /// Sweeps expired orphans, then evicts random ones until at most `max` remain.
    /// Returns the number of random evictions.
    pub fn sweep_and_limit(&mut self, max: usize, now: Timestamp) -> usize {
        self.sweep_and_limit_with_rng(max, now, &mut rand::thread_rng())
    }

    pub fn sweep_and_limit_with_rng<R: Rng + ?Sized>(
        &mut self,
        max: usize,
        now: Timestamp,
        rng: &mut R,
    ) -> usize {
        let expire_time = self.expire_time.as_micros() as i64;
        let expire_interval = self.expire_interval.as_micros() as i64;

        if self.next_sweep <= now {
            let mut min_expiry = now + expire_time - expire_interval;
            let mut expired = Vec::new();
            for (txid, orphan) in &self.orphans {
                if orphan.expires_at <= now {
                    expired.push(*txid);
                } else {
                    min_expiry = min_expiry.min(orphan.expires_at);
                }
            }
            let erased = expired.iter().filter(|txid| self.erase(txid)).count();

            // sweep again one interval after the next entry expires, batching the scan
            self.next_sweep = min_expiry + expire_interval;
            if erased > 0 {
                debug!("Erased {} orphan tx due to expiration", erased);
            }
        }

        let mut evicted = 0;
        while self.orphans.len() > max {
            let random = Txid::from_byte_array(rng.gen());
            let victim = self
                .orphans
                .range((Bound::Included(random), Bound::Unbounded))
                .next()
                .or_else(|| self.orphans.iter().next())
                .map(|(txid, _)| *txid);
            match victim {
                Some(txid) => {
                    self.erase(&txid);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    /// Orphans spending `outpoint`.
    pub fn children_of(&self, outpoint: &OutPoint) -> Vec<Txid> {
        self.by_prev.get(outpoint).map(|set| set.iter().copied().collect()).unwrap_or_default()
    }

    pub fn get(&self, txid: &Txid) -> Option<&OrphanTx> {
        self.orphans.get(txid)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.orphans.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    /// Gets statistics about the orphan pool
    pub fn stats(&self) -> OrphanPoolStats {
        let mut peers: Vec<NodeId> = self.orphans.values().map(|o| o.from_peer).collect();
        peers.sort();
        peers.dedup();
        OrphanPoolStats {
            total_orphans: self.orphans.len(),
            spent_outpoints: self.by_prev.len(),
            source_peers: peers.len(),
        }
    }
}

/// Statistics about the orphan pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanPoolStats {
    pub total_orphans: usize,
    pub spent_outpoints: usize,
    pub source_peers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{block_with_transactions, spending_tx};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const MINUTE: i64 = 60 * 1_000_000;

    fn pool() -> OrphanTransactionPool {
        OrphanTransactionPool::new(
            Duration::from_secs(20 * 60),
            Duration::from_secs(5 * 60),
            400_000,
        )
    }

    fn orphan(n: u32) -> Arc<Transaction> {
        Arc::new(spending_tx(Txid::from_byte_array([n as u8; 32]), n))
    }

    #[test]
    fn test_add_and_duplicate() {
        let mut pool = pool();
        let tx = orphan(1);
        assert!(pool.add(tx.clone(), NodeId(1), 0));
        assert!(!pool.add(tx.clone(), NodeId(2), 0));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.children_of(&tx.input[0].previous_output), vec![tx.txid()]);
    }

    #[test]
    fn test_heavy_orphan_refused() {
        let mut pool = OrphanTransactionPool::new(
            Duration::from_secs(60),
            Duration::from_secs(10),
            100,
        );
        assert!(!pool.add(orphan(1), NodeId(1), 0));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_evict_for_peer() {
        let mut pool = pool();
        for n in 0..10 {
            pool.add(orphan(n), NodeId((n % 2) as u64), 0);
        }
        assert_eq!(pool.evict_for(NodeId(1)), 5);
        assert_eq!(pool.len(), 5);
        assert!(pool.orphans.values().all(|o| o.from_peer == NodeId(0)));
        assert_eq!(pool.stats().source_peers, 1);
        assert_eq!(pool.stats().spent_outpoints, 5);
    }

    #[test]
    fn test_limit_evicts_to_capacity() {
        let mut pool = pool();
        let mut rng = StdRng::seed_from_u64(42);
        for n in 0..101 {
            assert!(pool.add(orphan(n), NodeId(1), 0));
        }
        let evicted = pool.sweep_and_limit_with_rng(100, 0, &mut rng);
        assert_eq!(evicted, 1);
        assert_eq!(pool.len(), 100);
        assert_eq!(pool.by_prev.len(), 100);
    }

    #[test]
    fn test_expiry_sweep_is_amortized() {
        let mut pool = pool();
        let mut rng = StdRng::seed_from_u64(1);
        pool.add(orphan(1), NodeId(1), 0);
        pool.sweep_and_limit_with_rng(100, 0, &mut rng);
        assert_eq!(pool.next_sweep, 20 * MINUTE);

        pool.add(orphan(2), NodeId(1), MINUTE);
        pool.sweep_and_limit_with_rng(100, 20 * MINUTE, &mut rng);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&orphan(2).txid()));
        // one interval after the survivor expires
        assert_eq!(pool.next_sweep, 26 * MINUTE);

        // expired, but the next sweep is not due yet
        pool.sweep_and_limit_with_rng(100, 22 * MINUTE, &mut rng);
        assert_eq!(pool.len(), 1);

        pool.sweep_and_limit_with_rng(100, 26 * MINUTE, &mut rng);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_erase_for_block() {
        let mut pool = pool();
        let block = block_with_transactions(3);
        let mut conflicting = block.txdata[1].clone();
        conflicting.output[0].value += 1;
        let conflicting = Arc::new(conflicting);
        let unrelated = orphan(7);
        pool.add(conflicting.clone(), NodeId(1), 0);
        pool.add(unrelated.clone(), NodeId(1), 0);

        assert_eq!(pool.erase_for_block(&block), 1);
        assert!(!pool.contains(&conflicting.txid()));
        assert!(pool.contains(&unrelated.txid()));
    }
}
