//! Header synchronization strategies.
//!
//! Three strategies run side by side:
//! - forward sync with `getheaders`, from one peer at a time unless the header tip is recent
//! - reverse sync with `getrheaders`, walking down from the newest checkpoint into a staging
//!   buffer that is committed in one pass once it reaches our best header
//! - partial sync of the header-only light chain
//!
//! [`HeaderSyncCoordinator`] holds the cross-peer counters for these and the reverse buffer.

use dashcore::{BlockHash, Header};
use thiserror::Error;
use tracing::{debug, info};

use crate::chain::Checkpoints;
use crate::constants::MAX_RHEADERS_RESULTS;

/// Why a reverse header batch was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReverseHeadersError {
    #[error("non-continuous reverse headers sequence")]
    NonContinuous,

    #[error("reverse header {hash} at height {height} mismatches checkpoint")]
    CheckpointMismatch {
        height: i32,
        hash: BlockHash,
    },
}

/// Outcome of feeding a reverse batch into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseIngest {
    /// Headers that connected to the buffer.
    pub connected: usize,
    /// A header did not connect before any did; the batch was most likely meant for an
    /// older request, possibly from another peer.
    pub stale: bool,
}

/// Headers received through reverse sync, newest first, verified against checkpoints
/// but not yet in the block index.
#[derive(Debug, Default, Clone)]
pub struct ReverseHeaderBuffer {
    headers: Vec<Header>,
}

impl ReverseHeaderBuffer {
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Height of the next header the buffer expects.
    pub fn expected_height(&self, anchor_height: i32) -> i32 {
        anchor_height - self.headers.len() as i32
    }

    /// Append a batch walking down from the anchor.
    ///
    /// Every header must be the parent of the previous one. A header landing on a
    /// checkpoint height must carry the checkpoint hash. Nothing is appended past genesis.
    pub fn ingest(
        &mut self,
        batch: &[Header],
        checkpoints: &Checkpoints,
    ) -> Result<ReverseIngest, ReverseHeadersError> {
        let anchor_height = checkpoints.last_height();
        let mut connected = 0;

        for header in batch {
            let hash = header.block_hash();
            let expected_height = self.expected_height(anchor_height);

            if let Some(last) = self.headers.last() {
                if last.prev_blockhash != hash {
                    if connected > 0 {
                        return Err(ReverseHeadersError::NonContinuous);
                    }
                    return Ok(ReverseIngest {
                        connected,
                        stale: true,
                    });
                }
            }

            if let Some(expected) = checkpoints.hash_at(expected_height) {
                if expected != hash {
                    return Err(ReverseHeadersError::CheckpointMismatch {
                        height: expected_height,
                        hash,
                    });
                }
                debug!("Reverse headers passed checkpoint {}", expected_height);
            }

            if (self.headers.len() as i32) < anchor_height {
                self.headers.push(*header);
            }
            connected += 1;
        }

        Ok(ReverseIngest {
            connected,
            stale: false,
        })
    }

    /// Headers still missing between our best header and the buffer.
    pub fn gap(&self, anchor_height: i32, best_header_height: i32) -> i32 {
        anchor_height - best_header_height - self.headers.len() as i32
    }

    /// Parameters of the next `getrheaders` request: start height and count.
    pub fn next_request(&self, anchor_height: i32, best_header_height: i32) -> (u32, u32) {
        let start = self.expected_height(anchor_height).max(0) as u32;
        let gap = self.gap(anchor_height, best_header_height).max(0) as u32;
        (start, gap.min(MAX_RHEADERS_RESULTS as u32))
    }

    /// Empty the buffer, returning its headers oldest first.
    pub fn take_for_commit(&mut self) -> Vec<Header> {
        let mut headers = std::mem::take(&mut self.headers);
        headers.reverse();
        headers
    }

    pub fn clear(&mut self) {
        self.headers = Vec::new();
    }
}

/// Cross-peer header sync state.
#[derive(Debug)]
pub struct HeaderSyncCoordinator {
    /// Peers with forward sync started.
    pub sync_started: usize,
    /// Peers with reverse sync started.
    pub rsync_started: usize,
    /// Peers with partial sync started.
    pub partial_started: usize,
    pub reverse: ReverseHeaderBuffer,
    reverse_enabled: bool,
}

impl HeaderSyncCoordinator {
    pub fn new(reverse_enabled: bool) -> Self {
        Self {
            sync_started: 0,
            rsync_started: 0,
            partial_started: 0,
            reverse: ReverseHeaderBuffer::default(),
            reverse_enabled,
        }
    }

    pub fn reverse_enabled(&self) -> bool {
        self.reverse_enabled
    }

    /// Give up on reverse sync after a failed commit. Forward sync takes over.
    pub fn disable_reverse(&mut self) {
        info!("Reverse header sync disabled, falling back to forward sync");
        self.reverse_enabled = false;
        self.reverse.clear();
    }
}

/// Whether each header's parent is the previous header.
pub fn is_continuous(headers: &[Header]) -> bool {
    headers.windows(2).all(|pair| pair[1].prev_blockhash == pair[0].block_hash())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChain;

    /// A chain of 30 headers with checkpoints at 10 and 20.
    fn setup() -> (MockChain, Checkpoints) {
        let chain = MockChain::with_headers_only(30);
        let checkpoints = Checkpoints::new([(10, chain.hash_at(10)), (20, chain.hash_at(20))]);
        (chain, checkpoints)
    }

    fn descending(chain: &MockChain, from: i32, to: i32) -> Vec<Header> {
        (to..=from).rev().map(|h| chain.header_at(h)).collect()
    }

    #[test]
    fn test_continuity() {
        let (chain, _) = setup();
        let headers: Vec<Header> = (1..=3).map(|h| chain.header_at(h)).collect();
        assert!(is_continuous(&headers));
        assert!(is_continuous(&headers[..1]));
        let broken = vec![headers[0], headers[2], headers[1]];
        assert!(!is_continuous(&broken));
    }

    #[test]
    fn test_reverse_batches_connect_to_checkpoint() {
        let (chain, checkpoints) = setup();
        let mut buffer = ReverseHeaderBuffer::default();

        let first = buffer.ingest(&descending(&chain, 20, 16), &checkpoints).unwrap();
        assert_eq!(first.connected, 5);
        assert_eq!(buffer.next_request(20, 0), (15, 15));

        let second = buffer.ingest(&descending(&chain, 15, 1), &checkpoints).unwrap();
        assert_eq!(second.connected, 15);
        assert_eq!(buffer.gap(20, 0), 0);

        let committed = buffer.take_for_commit();
        assert_eq!(committed.len(), 20);
        assert_eq!(committed[0], chain.header_at(1));
        assert_eq!(committed[19], chain.header_at(20));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_checkpoint_mismatch() {
        let (chain, checkpoints) = setup();
        let mut buffer = ReverseHeaderBuffer::default();
        // a batch anchored at the wrong block
        let err = buffer.ingest(&descending(&chain, 21, 18), &checkpoints).unwrap_err();
        assert_eq!(
            err,
            ReverseHeadersError::CheckpointMismatch {
                height: 20,
                hash: chain.hash_at(21),
            }
        );
        assert!(buffer.is_empty());

        // below the anchor the hash chain itself pins every header
        buffer.ingest(&descending(&chain, 20, 11), &checkpoints).unwrap();
        let mut forged = chain.header_at(10);
        forged.nonce ^= 1;
        let outcome = buffer.ingest(&[forged], &checkpoints).unwrap();
        assert!(outcome.stale);
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_stale_and_broken_batches() {
        let (chain, checkpoints) = setup();
        let mut buffer = ReverseHeaderBuffer::default();
        buffer.ingest(&descending(&chain, 20, 16), &checkpoints).unwrap();

        // first header does not connect: ignored
        let stale = buffer.ingest(&descending(&chain, 12, 10), &checkpoints).unwrap();
        assert_eq!(stale, ReverseIngest { connected: 0, stale: true });
        assert_eq!(buffer.len(), 5);

        // connects, then breaks
        let mut batch = descending(&chain, 15, 13);
        batch.push(chain.header_at(5));
        assert_eq!(buffer.ingest(&batch, &checkpoints), Err(ReverseHeadersError::NonContinuous));
    }

    #[test]
    fn test_disable_reverse_clears_buffer() {
        let (chain, checkpoints) = setup();
        let mut coordinator = HeaderSyncCoordinator::new(true);
        coordinator.reverse.ingest(&descending(&chain, 20, 16), &checkpoints).unwrap();
        coordinator.disable_reverse();
        assert!(!coordinator.reverse_enabled());
        assert!(coordinator.reverse.is_empty());
    }
}
