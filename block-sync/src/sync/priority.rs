//! Out-of-band block requests delivered in strict FIFO order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use dashcore::Block;
use thiserror::Error;
use tracing::debug;

use crate::chain::BlockIndex;
use crate::types::BlockHandle;
use crate::validation::BlockStore;

/// Invoked with each delivered block, in enqueue order.
pub type PriorityCallback = Arc<dyn Fn(Arc<Block>, BlockHandle) + Send + Sync>;

#[derive(Clone)]
pub struct PriorityBlockRequest {
    pub handle: BlockHandle,
    pub downloaded: bool,
    pub callback: PriorityCallback,
}

impl fmt::Debug for PriorityBlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityBlockRequest")
            .field("handle", &self.handle)
            .field("downloaded", &self.downloaded)
            .finish_non_exhaustive()
    }
}

/// Stored block data for a downloaded head entry could not be read.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("Can't read block {0:?} from storage")]
    ReadFailed(BlockHandle),

    #[error("Block {0:?} marked downloaded but has no data")]
    MissingData(BlockHandle),
}

#[derive(Debug, Default)]
pub struct PriorityDownloadQueue {
    entries: VecDeque<PriorityBlockRequest>,
}

impl PriorityDownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append requests for `handles`. Blocks already stored start out downloaded.
    pub fn add<I: BlockIndex + ?Sized>(
        &mut self,
        handles: &[BlockHandle],
        callback: PriorityCallback,
        index: &I,
    ) {
        for &handle in handles {
            let downloaded = index.entry(handle).is_some_and(|e| e.has_data());
            self.entries.push_back(PriorityBlockRequest {
                handle,
                downloaded,
                callback: callback.clone(),
            });
        }
    }

    /// Remove every request for `handle`, keeping the order of the rest.
    pub fn cancel(&mut self, handle: BlockHandle) -> usize {
        let before = self.entries.len();
        self.entries.retain(|request| request.handle != handle);
        before - self.entries.len()
    }

    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    /// Mark requests for `handle` downloaded. Returns true if any matched.
    pub fn mark_downloaded(&mut self, handle: BlockHandle) -> bool {
        let mut found = false;
        for request in self.entries.iter_mut().filter(|r| r.handle == handle) {
            request.downloaded = true;
            found = true;
        }
        found
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Requests not yet downloaded, in queue order.
    pub fn pending(&self) -> impl Iterator<Item = &PriorityBlockRequest> {
        self.entries.iter().filter(|request| !request.downloaded)
    }

    /// Deliver downloaded requests from the head until the first pending one.
    /// Returns the number of callbacks fired.
    pub fn drain<N>(&mut self, node: &N) -> Result<usize, DrainError>
    where
        N: BlockIndex + BlockStore + ?Sized,
    {
        let mut delivered = 0;
        while let Some(head) = self.entries.front() {
            if !head.downloaded {
                break;
            }

            let handle = head.handle;
            if !node.entry(handle).is_some_and(|e| e.has_data()) {
                return Err(DrainError::MissingData(handle));
            }
            let block = node.read_block(handle).ok_or(DrainError::ReadFailed(handle))?;

            (head.callback)(Arc::new(block), handle);
            debug!(
                "Processed priority block request ({}) height={}",
                node.hash(handle).map(|h| h.to_string()).unwrap_or_default(),
                node.height(handle).unwrap_or(-1)
            );
            self.entries.pop_front();
            delivered += 1;
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChain;
    use std::sync::Mutex;

    fn recording() -> (PriorityCallback, Arc<Mutex<Vec<BlockHandle>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: PriorityCallback = Arc::new(move |_block, handle| {
            sink.lock().unwrap().push(handle);
        });
        (callback, seen)
    }

    #[test]
    fn test_fifo_delivery_with_out_of_order_completion() {
        let mut chain = MockChain::with_headers_only(5);
        let handles: Vec<BlockHandle> = (1..=4).map(|h| chain.at_height(h).unwrap()).collect();
        let (callback, seen) = recording();

        let mut queue = PriorityDownloadQueue::new();
        queue.add(&handles, callback, &chain);
        assert_eq!(queue.pending().count(), 4);

        // entries 2..4 arrive first
        for &handle in &handles[1..] {
            chain.store_block(handle);
            queue.mark_downloaded(handle);
        }
        assert_eq!(queue.drain(&chain), Ok(0));
        assert!(seen.lock().unwrap().is_empty());

        chain.store_block(handles[0]);
        queue.mark_downloaded(handles[0]);
        assert_eq!(queue.drain(&chain), Ok(4));
        assert_eq!(*seen.lock().unwrap(), handles);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_already_stored_blocks_start_downloaded() {
        let chain = MockChain::with_active_chain(3);
        let (callback, seen) = recording();
        let mut queue = PriorityDownloadQueue::new();
        queue.add(&[chain.active_at(2).unwrap()], callback, &chain);
        assert_eq!(queue.pending().count(), 0);
        assert_eq!(queue.drain(&chain), Ok(1));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_keeps_order() {
        let chain = MockChain::with_headers_only(5);
        let handles: Vec<BlockHandle> = (1..=4).map(|h| chain.at_height(h).unwrap()).collect();
        let (callback, _) = recording();
        let mut queue = PriorityDownloadQueue::new();
        queue.add(&handles, callback, &chain);

        assert_eq!(queue.cancel(handles[1]), 1);
        let remaining: Vec<BlockHandle> = queue.pending().map(|r| r.handle).collect();
        assert_eq!(remaining, vec![handles[0], handles[2], handles[3]]);

        queue.cancel_all();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_missing_data_errors() {
        let chain = MockChain::with_headers_only(3);
        let handle = chain.at_height(1).unwrap();
        let (callback, _) = recording();
        let mut queue = PriorityDownloadQueue::new();
        queue.add(&[handle], callback, &chain);
        queue.mark_downloaded(handle);
        assert_eq!(queue.drain(&chain), Err(DrainError::MissingData(handle)));
        assert_eq!(queue.len(), 1);
    }
}
