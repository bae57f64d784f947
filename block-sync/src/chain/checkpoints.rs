//! Compiled-in checkpoints anchoring reverse header sync.

use dashcore::BlockHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: BlockHash,
}

/// Checkpoints sorted by height, lowest first.
#[derive(Debug, Clone, Default)]
pub struct Checkpoints {
    checkpoints: Vec<Checkpoint>,
}

impl Checkpoints {
    pub fn new(entries: impl IntoIterator<Item = (i32, BlockHash)>) -> Self {
        let mut checkpoints: Vec<Checkpoint> = entries
            .into_iter()
            .map(|(height, hash)| Checkpoint {
                height,
                hash,
            })
            .collect();
        checkpoints.sort_by_key(|cp| cp.height);
        checkpoints.dedup_by_key(|cp| cp.height);

        debug_assert!(checkpoints.iter().all(|cp| cp.height >= 0), "checkpoint below genesis");

        Self {
            checkpoints,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Height of the newest checkpoint, 0 without checkpoints.
    pub fn last_height(&self) -> i32 {
        self.checkpoints.last().map(|cp| cp.height).unwrap_or(0)
    }

    pub fn last(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Expected hash at `height`, if a checkpoint exists there.
    pub fn hash_at(&self, height: i32) -> Option<BlockHash> {
        self.checkpoints
            .binary_search_by_key(&height, |cp| cp.height)
            .ok()
            .map(|idx| self.checkpoints[idx].hash)
    }

    /// Newest checkpoint at or below `height`.
    pub fn last_before(&self, height: i32) -> Option<&Checkpoint> {
        match self.checkpoints.binary_search_by_key(&height, |cp| cp.height) {
            Ok(idx) => Some(&self.checkpoints[idx]),
            Err(0) => None,
            Err(idx) => Some(&self.checkpoints[idx - 1]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashcore::hashes::Hash;

    fn hash(n: u8) -> BlockHash {
        BlockHash::from_byte_array([n; 32])
    }

    #[test]
    fn test_sorted_and_deduplicated() {
        let cps =
            Checkpoints::new([(5000, hash(2)), (0, hash(0)), (2500, hash(1)), (5000, hash(3))]);
        assert_eq!(cps.last_height(), 5000);
        assert_eq!(cps.hash_at(2500), Some(hash(1)));
        assert_eq!(cps.hash_at(2501), None);
    }

    #[test]
    fn test_last_before() {
        let cps = Checkpoints::new([(100, hash(1)), (200, hash(2))]);
        assert_eq!(cps.last_before(50), None);
        assert_eq!(cps.last_before(100).map(|cp| cp.height), Some(100));
        assert_eq!(cps.last_before(199).map(|cp| cp.height), Some(100));
        assert_eq!(cps.last_before(10_000).map(|cp| cp.height), Some(200));
    }

    #[test]
    fn test_empty() {
        let cps = Checkpoints::default();
        assert!(cps.is_empty());
        assert_eq!(cps.last_height(), 0);
        assert!(cps.last().is_none());
    }
}
