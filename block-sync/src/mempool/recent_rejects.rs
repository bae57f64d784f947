use std::collections::{HashSet, VecDeque};

use dashcore::{BlockHash, Txid};

/// Transactions rejected since the active tip last changed.
///
/// Bounded FIFO: the oldest entry is forgotten once `capacity` is reached.
#[derive(Debug)]
pub struct RecentRejects {
    tip: Option<BlockHash>,
    order: VecDeque<Txid>,
    set: HashSet<Txid>,
    capacity: usize,
}

impl RecentRejects {
    pub fn new(capacity: usize) -> Self {
        Self {
            tip: None,
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    /// Forget everything if the tip moved, a new block may make rejected transactions valid.
    pub fn reset_on_tip(&mut self, tip: Option<BlockHash>) {
        if self.tip != tip {
            self.tip = tip;
            self.clear();
        }
    }

    pub fn insert(&mut self, txid: Txid) {
        if self.capacity == 0 || !self.set.insert(txid) {
            return;
        }
        self.order.push_back(txid);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.set.contains(txid)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }
}
