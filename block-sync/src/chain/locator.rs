//! Block locators for `getheaders`.
//!
//! A locator lists the starting block and then ancestors at exponentially growing
//! distances, ending at genesis, so a peer can find the fork point in few round trips.

use dashcore::BlockHash;

use super::BlockIndex;
use crate::types::BlockHandle;

/// Build a locator walking back from `from`. Empty if `from` is `None` or unknown.
pub fn block_locator<I: BlockIndex + ?Sized>(
    index: &I,
    from: Option<BlockHandle>,
) -> Vec<BlockHash> {
    let mut locator = Vec::with_capacity(32);
    let mut step = 1;
    let mut current = from;

    while let Some(entry) = current.and_then(|h| index.entry(h)) {
        locator.push(entry.hash);
        if entry.height == 0 {
            break;
        }
        let next_height = (entry.height - step).max(0);
        current = current.and_then(|h| index.ancestor(h, next_height));
        // step back 1 for the first ten entries, then double
        if locator.len() > 10 {
            step *= 2;
        }
    }

    locator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChain;

    #[test]
    fn test_locator_shape() {
        let chain = MockChain::with_active_chain(100);
        let locator = block_locator(&chain, chain.active_tip());

        assert_eq!(locator.first(), Some(&chain.hash_at(100)));
        assert_eq!(locator.last(), Some(&chain.hash_at(0)));
        let expected: Vec<i32> =
            vec![100, 99, 98, 97, 96, 95, 94, 93, 92, 91, 90, 89, 87, 83, 75, 59, 27, 0];
        let heights: Vec<i32> = locator
            .iter()
            .map(|hash| chain.lookup(hash).and_then(|h| chain.height(h)).unwrap())
            .collect();
        assert_eq!(heights, expected);
    }

    #[test]
    fn test_locator_empty_without_start() {
        let chain = MockChain::with_active_chain(3);
        assert!(block_locator(&chain, None).is_empty());
        assert_eq!(block_locator(&chain, chain.active_at(0)), vec![chain.hash_at(0)]);
    }
}
