//! Transaction and header relay scenarios driven through the service.

use std::sync::Arc;

use block_sync::test_utils::{
    test_address, MockChain, MockClock, RecordingObserver, RecordingTransport,
};
use block_sync::{
    Checkpoints, InvItem, NodeId, OutboundMessage, PeerMessage, SyncConfig, SyncEngine, SyncService,
};
use test_utils::{create_header_chain, create_tx_chain, random_block_hash, random_txid};

const PEER: NodeId = NodeId(1);

type Fixture = (
    SyncService<MockChain, RecordingTransport>,
    Arc<RecordingTransport>,
    Arc<RecordingObserver>,
);

fn service(chain: MockChain) -> Fixture {
    let clock = Arc::new(MockClock::at_secs(chain.tip_time() + 60));
    let observer = RecordingObserver::new();
    let mut engine =
        SyncEngine::new(SyncConfig::default(), chain, Checkpoints::default(), clock).unwrap();
    engine.add_observer(observer.clone());
    let transport = Arc::new(RecordingTransport::default());
    (SyncService::new(engine, transport.clone()), transport, observer)
}

#[tokio::test]
async fn test_out_of_order_transactions_resolve() {
    let root = random_txid();
    let mut chain = MockChain::with_active_chain(5);
    chain.add_confirmed(root);
    let txs = create_tx_chain(root, 3);
    let (service, transport, observer) = service(chain);
    service.connect(PEER, test_address(5)).await;

    service.handle_message(PEER, PeerMessage::Tx(Arc::new(txs[2].clone()))).await.unwrap();
    service.handle_message(PEER, PeerMessage::Tx(Arc::new(txs[1].clone()))).await.unwrap();

    // each orphan asks for its own missing parent
    let requested: Vec<InvItem> = transport
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter_map(|(_, message)| match message {
            OutboundMessage::GetData(items) => Some(items.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(requested, vec![InvItem::Tx(txs[1].txid()), InvItem::Tx(txs[0].txid())]);
    assert_eq!(service.engine().lock().await.orphans().len(), 2);

    service.handle_message(PEER, PeerMessage::Tx(Arc::new(txs[0].clone()))).await.unwrap();

    let engine = service.engine();
    let engine = engine.lock().await;
    assert!(engine.orphans().is_empty());
    assert_eq!(engine.node().mempool_len(), 3);
    assert_eq!(observer.relayed(), txs.iter().map(|tx| tx.txid()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_unconnecting_headers_ask_for_gap() {
    let chain = MockChain::with_active_chain(5);
    let start_time = chain.tip_time() as u32;
    let (service, transport, _) = service(chain);
    service.connect(PEER, test_address(5)).await;

    let headers = create_header_chain(random_block_hash(), 5, start_time);
    service.handle_message(PEER, PeerMessage::Headers(headers)).await.unwrap();

    assert!(transport.commands_to(PEER).contains(&"getheaders"));
    let engine = service.engine();
    let engine = engine.lock().await;
    let state = engine.peer(PEER).unwrap();
    assert_eq!(state.unconnecting_headers, 1);
    assert_eq!(state.misbehavior, 0);
    assert!(engine.node().header_batches.is_empty());
}
