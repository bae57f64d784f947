//! Block download ownership across peers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use block_sync::test_utils::{test_address, MockChain, MockClock};
use block_sync::{BlockIndex, Checkpoints, InvItem, NodeId, PeerMessage, SyncConfig, SyncEngine};
use test_utils::{assert_panics_with, random_txid, TestTransactionBuilder};

fn engine(chain: MockChain) -> SyncEngine<MockChain> {
    let clock = Arc::new(MockClock::at_secs(chain.tip_time() + 60));
    SyncEngine::new(SyncConfig::default(), chain, Checkpoints::default(), clock).unwrap()
}

fn connect_synced(engine: &mut SyncEngine<MockChain>, peer: NodeId) {
    engine.connect(peer, test_address(2020));
    let tip = engine.node().tip_hash();
    engine.process_message(peer, PeerMessage::Inv(vec![InvItem::Block(tip)])).unwrap();
}

#[test]
fn test_disconnect_hands_blocks_to_other_peer() {
    let (first, second) = (NodeId(1), NodeId(2));
    let mut engine = engine(MockChain::with_headers_only(20));
    connect_synced(&mut engine, first);
    connect_synced(&mut engine, second);

    engine.send_messages(first).unwrap();
    engine.send_messages(second).unwrap();
    let requested: Vec<_> = engine.peer(first).unwrap().in_flight.iter().map(|q| q.hash).collect();
    assert_eq!(requested.len(), 20);
    for hash in &requested {
        assert_eq!(engine.in_flight().owner(hash), Some(first));
    }
    assert_eq!(engine.peer(second).unwrap().blocks_in_flight(), 0);

    let orphan = TestTransactionBuilder::new().spend(random_txid(), 0).add_output(1_000).build();
    engine.process_message(first, PeerMessage::Tx(Arc::new(orphan))).unwrap();
    assert_eq!(engine.orphans().len(), 1);

    let before = engine.in_flight().len();
    assert!(engine.disconnect(first));
    assert_eq!(before - engine.in_flight().len(), requested.len());
    assert!(engine.orphans().is_empty());

    engine.send_messages(second).unwrap();
    for hash in &requested {
        assert_eq!(engine.in_flight().owner(hash), Some(second));
    }
}

#[test]
fn test_delivered_block_leaves_flight() {
    let chain = MockChain::with_headers_only(3);
    let header = chain.header_at(1);
    let mut engine = engine(chain);
    let peer = NodeId(1);
    connect_synced(&mut engine, peer);
    engine.send_messages(peer).unwrap();
    assert_eq!(engine.in_flight().len(), 3);

    let block = dashcore::Block {
        header,
        txdata: vec![block_sync::test_utils::coinbase_tx(1, 0)],
    };
    engine.process_message(peer, PeerMessage::Block(Arc::new(block))).unwrap();

    assert_eq!(engine.in_flight().len(), 2);
    assert!(!engine.in_flight().contains(&header.block_hash()));
    assert_eq!(engine.node().active_height(), 1);
}

#[test]
fn test_peer_id_reusable_only_after_disconnect() {
    let peer = NodeId(4);
    let mut engine = engine(MockChain::with_headers_only(5));
    connect_synced(&mut engine, peer);
    engine.send_messages(peer).unwrap();
    assert_eq!(engine.in_flight().len(), 5);

    assert_panics_with(
        AssertUnwindSafe(|| engine.connect(peer, test_address(2020))),
        "registered twice",
    );

    assert!(engine.disconnect(peer));
    connect_synced(&mut engine, peer);
    assert_eq!(engine.peer(peer).unwrap().blocks_in_flight(), 0);
    engine.send_messages(peer).unwrap();
    assert_eq!(engine.in_flight().len(), 5);
}
