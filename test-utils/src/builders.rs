//! Test data builders for headers and transactions

use chrono::Utc;
use dashcore::blockdata::block;
use dashcore::hashes::Hash;
use dashcore::{
    BlockHash, CompactTarget, Header, OutPoint, ScriptBuf, Transaction, TxIn, TxMerkleNode, TxOut,
    Txid, Witness,
};
use rand::Rng;

/// Regtest difficulty.
pub const EASY_BITS: u32 = 0x207fffff;

/// Builder for creating test block headers
pub struct TestHeaderBuilder {
    version: block::Version,
    prev_blockhash: BlockHash,
    merkle_root: TxMerkleNode,
    time: u32,
    bits: CompactTarget,
    nonce: u32,
}

impl Default for TestHeaderBuilder {
    fn default() -> Self {
        Self {
            version: block::Version::from_consensus(536870912), // Version 0x20000000
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: Utc::now().timestamp() as u32,
            bits: CompactTarget::from_consensus(EASY_BITS),
            nonce: 0,
        }
    }
}

impl TestHeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prev_blockhash(mut self, hash: BlockHash) -> Self {
        self.prev_blockhash = hash;
        self
    }

    pub fn with_time(mut self, time: u32) -> Self {
        self.time = time;
        self
    }

    pub fn with_nonce(mut self, nonce: u32) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn build(self) -> Header {
        Header {
            version: self.version,
            prev_blockhash: self.prev_blockhash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }
}

/// Builder for creating test transactions
#[derive(Default)]
pub struct TestTransactionBuilder {
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
}

impl TestTransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spend(mut self, txid: Txid, vout: u32) -> Self {
        self.inputs.push(TxIn {
            previous_output: OutPoint {
                txid,
                vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: 0xffffffff,
            witness: Witness::new(),
        });
        self
    }

    pub fn add_output(mut self, value: u64) -> Self {
        self.outputs.push(TxOut {
            value,
            script_pubkey: ScriptBuf::new(),
        });
        self
    }

    pub fn build(self) -> Transaction {
        Transaction {
            version: 1,
            lock_time: 0,
            input: self.inputs,
            output: self.outputs,
            special_transaction_payload: None,
        }
    }
}

/// `count` linked headers extending `prev`, one every ten minutes from `start_time`.
pub fn create_header_chain(prev: BlockHash, count: usize, start_time: u32) -> Vec<Header> {
    let mut headers = Vec::with_capacity(count);
    let mut prev_hash = prev;

    for i in 0..count {
        let header = TestHeaderBuilder::new()
            .with_prev_blockhash(prev_hash)
            .with_time(start_time + i as u32 * 600)
            .build();

        prev_hash = header.block_hash();
        headers.push(header);
    }

    headers
}

/// A line of `depth` transactions, each spending output 0 of the one before. The first
/// spends output 0 of `root`.
pub fn create_tx_chain(root: Txid, depth: usize) -> Vec<Transaction> {
    let mut txs: Vec<Transaction> = Vec::with_capacity(depth);
    let mut parent = root;
    for i in 0..depth {
        let tx =
            TestTransactionBuilder::new().spend(parent, 0).add_output(10_000 - i as u64).build();
        parent = tx.txid();
        txs.push(tx);
    }
    txs
}

/// Create a random transaction ID
pub fn random_txid() -> Txid {
    Txid::from_byte_array(rand::thread_rng().gen())
}

/// Create a random block hash
pub fn random_block_hash() -> BlockHash {
    BlockHash::from_byte_array(rand::thread_rng().gen())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_builder() {
        let prev = random_block_hash();
        let header = TestHeaderBuilder::new().with_prev_blockhash(prev).with_nonce(12345).build();

        assert_eq!(header.prev_blockhash, prev);
        assert_eq!(header.nonce, 12345);
        assert_eq!(header.bits, CompactTarget::from_consensus(EASY_BITS));
    }

    #[test]
    fn test_transaction_builder() {
        let tx = TestTransactionBuilder::new().spend(random_txid(), 3).add_output(50000).build();

        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output.vout, 3);
        assert_eq!(tx.output[0].value, 50000);
    }

    #[test]
    fn test_header_chain_creation() {
        let start = random_block_hash();
        let chain = create_header_chain(start, 10, 1_600_000_000);

        assert_eq!(chain.len(), 10);
        assert_eq!(chain[0].prev_blockhash, start);
        for i in 1..chain.len() {
            assert_eq!(chain[i].prev_blockhash, chain[i - 1].block_hash());
        }
    }

    #[test]
    fn test_tx_chain_links_parents() {
        let root = random_txid();
        let txs = create_tx_chain(root, 3);

        assert_eq!(txs[0].input[0].previous_output.txid, root);
        assert_eq!(txs[1].input[0].previous_output.txid, txs[0].txid());
        assert_eq!(txs[2].input[0].previous_output.txid, txs[1].txid());
    }
}
