//! Test doubles for the engine's collaborators.
//!
//! [`MockChain`] implements the block index, validation, mempool and block store in memory.
//! Chain work equals height, so comparing work compares heights.

mod chain;
mod clock;
mod observer;
mod transport;

pub use chain::{MockChain, ProcessedBlock, BLOCK_SPACING, GENESIS_TIME};
pub use clock::MockClock;
pub use observer::RecordingObserver;
pub use transport::RecordingTransport;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use dashcore::blockdata::block::Version;
use dashcore::hashes::Hash;
use dashcore::{
    Block, BlockHash, CompactTarget, Header, OutPoint, ScriptBuf, Transaction, TxIn, TxMerkleNode,
    TxOut, Txid, Witness,
};

use crate::types::{PeerAddress, PeerFlags};

/// Regtest difficulty, proof of work is never checked by the mocks.
pub const TEST_BITS: u32 = 0x207fffff;

/// An outbound, preferred peer speaking a protocol version that supports reverse headers.
pub fn test_address(starting_height: i32) -> PeerAddress {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 9999);
    PeerAddress::new(addr, starting_height, 70016).with_flags(PeerFlags::empty())
}

/// A transaction spending output `n` of `prev_txid` into a single output worth `n`.
pub fn spending_tx(prev_txid: Txid, n: u32) -> Transaction {
    Transaction {
        version: 1,
        lock_time: 0,
        input: vec![TxIn {
            previous_output: OutPoint::new(prev_txid, n),
            script_sig: ScriptBuf::new(),
            sequence: 0xffffffff,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: n as u64,
            script_pubkey: ScriptBuf::new(),
        }],
        special_transaction_payload: None,
    }
}

/// A transaction spending every listed outpoint into `outputs` outputs.
pub fn spend_outpoints(outpoints: &[OutPoint], outputs: u32) -> Transaction {
    Transaction {
        version: 1,
        lock_time: 0,
        input: outpoints
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: 0xffffffff,
                witness: Witness::new(),
            })
            .collect(),
        output: (0..outputs)
            .map(|i| TxOut {
                value: 1_000 + i as u64,
                script_pubkey: ScriptBuf::new(),
            })
            .collect(),
        special_transaction_payload: None,
    }
}

/// Coinbase unique to `height` and `salt`.
pub fn coinbase_tx(height: i32, salt: u32) -> Transaction {
    let mut script = height.to_le_bytes().to_vec();
    script.extend_from_slice(&salt.to_le_bytes());
    Transaction {
        version: 1,
        lock_time: 0,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from(script),
            sequence: 0xffffffff,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: 500_000_000,
            script_pubkey: ScriptBuf::new(),
        }],
        special_transaction_payload: None,
    }
}

/// Header committing to `txdata`.
pub fn header_for(
    prev_blockhash: BlockHash,
    time: u32,
    nonce: u32,
    txdata: &[Transaction],
) -> Header {
    let mut block = Block {
        header: Header {
            version: Version::ONE,
            prev_blockhash,
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(TEST_BITS),
            nonce,
        },
        txdata: txdata.to_vec(),
    };
    block.header.merkle_root = block.compute_merkle_root().unwrap_or_else(TxMerkleNode::all_zeros);
    block.header
}

/// A detached block with a coinbase and `n` distinct loose transactions.
pub fn block_with_transactions(n: u32) -> Block {
    let mut txdata = vec![coinbase_tx(1, 0)];
    txdata.extend((0..n).map(|i| spending_tx(Txid::from_byte_array([0xab; 32]), i)));
    Block {
        header: header_for(BlockHash::all_zeros(), GENESIS_TIME, 0, &txdata),
        txdata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_with_transactions_is_consistent() {
        let block = block_with_transactions(5);
        assert_eq!(block.txdata.len(), 6);
        assert!(block.check_merkle_root());
        let mut txids: Vec<Txid> = block.txdata.iter().map(|tx| tx.txid()).collect();
        txids.sort();
        txids.dedup();
        assert_eq!(txids.len(), 6);
    }
}
