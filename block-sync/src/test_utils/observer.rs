use std::sync::{Arc, Mutex};

use dashcore::{BlockHash, Transaction, Txid};

use crate::types::HeaderProgress;
use crate::validation::SyncObserver;

/// Records every notification.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub progress: Mutex<Vec<HeaderProgress>>,
    pub relayed: Mutex<Vec<Txid>>,
    pub spv_resets: Mutex<Vec<String>>,
    pub requested: Mutex<Vec<(BlockHash, bool)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn relayed(&self) -> Vec<Txid> {
        self.relayed.lock().unwrap().clone()
    }

    pub fn spv_resets(&self) -> usize {
        self.spv_resets.lock().unwrap().len()
    }

    pub fn last_progress(&self) -> Option<HeaderProgress> {
        self.progress.lock().unwrap().last().copied()
    }
}

impl SyncObserver for RecordingObserver {
    fn header_progress(&self, progress: HeaderProgress) {
        self.progress.lock().unwrap().push(progress);
    }

    fn relay_transaction(&self, tx: &Arc<Transaction>) {
        self.relayed.lock().unwrap().push(tx.txid());
    }

    fn spv_reset_requested(&self, reason: &str) {
        self.spv_resets.lock().unwrap().push(reason.to_string());
    }

    fn block_requested(&self, hash: &BlockHash, priority: bool) {
        self.requested.lock().unwrap().push((*hash, priority));
    }
}
