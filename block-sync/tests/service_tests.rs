//! Driving the engine through `SyncService` and a recording transport.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use block_sync::test_utils::{test_address, MockChain, MockClock, RecordingTransport};
use block_sync::{
    Checkpoints, InvItem, NetworkError, NetworkResult, NodeId, OutboundMessage, PeerMessage,
    PeerTransport, SyncConfig, SyncEngine, SyncEngineError, SyncService,
};
use test_utils::{assert_commands, assert_error_contains, ErrorInjector};
use tokio_util::sync::CancellationToken;

const PEER: NodeId = NodeId(1);

fn engine(tip_height: i32) -> SyncEngine<MockChain> {
    let chain = MockChain::with_active_chain(tip_height);
    let clock = Arc::new(MockClock::at_secs(chain.tip_time() + 60));
    SyncEngine::new(SyncConfig::default(), chain, Checkpoints::default(), clock).unwrap()
}

#[tokio::test]
async fn test_handle_message_flushes_actions() {
    let transport = Arc::new(RecordingTransport::default());
    let service = SyncService::new(engine(10), transport.clone());
    service.connect(PEER, test_address(10)).await;

    service.handle_message(PEER, PeerMessage::SendHeaders).await.unwrap();

    assert_commands!(transport, PEER, ["getheaders"]);
    let engine = service.engine();
    let mut engine = engine.lock().await;
    assert!(engine.peer(PEER).unwrap().capabilities.prefer_headers);
    assert!(engine.take_actions().is_empty());
}

#[tokio::test]
async fn test_unreachable_peer_is_dropped() {
    let transport = Arc::new(RecordingTransport::default());
    transport.unreachable.lock().unwrap().push(PEER);
    let service = SyncService::new(engine(10), transport.clone());
    service.connect(PEER, test_address(10)).await;

    service.handle_message(PEER, PeerMessage::SendHeaders).await.unwrap();

    let engine = service.engine();
    let engine = engine.lock().await;
    assert_eq!(engine.peer_count(), 0);
    assert_eq!(engine.header_sync().sync_started, 0);
}

#[tokio::test]
async fn test_misbehaving_peer_is_banned() {
    let chain = MockChain::with_active_chain(10);
    let mut headers = chain.build_headers(chain.tip_hash(), 3);
    headers.swap(1, 2);
    let transport = Arc::new(RecordingTransport::default());
    let service = SyncService::new(engine(10), transport.clone());
    service.connect(PEER, test_address(10)).await;

    for _ in 0..4 {
        let result = service.handle_message(PEER, PeerMessage::Headers(headers.clone())).await;
        assert_matches!(result, Err(SyncEngineError::ProtocolViolation { .. }));
    }
    assert!(transport.banned.lock().unwrap().is_empty());

    let _ = service.handle_message(PEER, PeerMessage::Headers(headers)).await;
    assert_eq!(*transport.banned.lock().unwrap(), vec![PEER]);
    assert_eq!(service.engine().lock().await.peer_count(), 0);
}

#[tokio::test]
async fn test_timed_out_peer_releases_blocks() {
    let (first, second) = (NodeId(1), NodeId(2));
    let chain = MockChain::with_headers_only(20);
    let tip = chain.tip_hash();
    let clock = Arc::new(MockClock::at_secs(chain.tip_time() + 60));
    let engine =
        SyncEngine::new(SyncConfig::default(), chain, Checkpoints::default(), clock.clone())
            .unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let service = SyncService::new(engine, transport.clone());
    for peer in [first, second] {
        service.connect(peer, test_address(2020)).await;
    }

    service.handle_message(first, PeerMessage::Inv(vec![InvItem::Block(tip)])).await.unwrap();
    service.handle_message(second, PeerMessage::Inv(vec![InvItem::Block(tip)])).await.unwrap();
    {
        let engine = service.engine();
        let engine = engine.lock().await;
        assert_eq!(engine.peer(first).unwrap().blocks_in_flight(), 20);
        assert_eq!(engine.peer(second).unwrap().blocks_in_flight(), 0);
    }

    // well past the block download timeout
    clock.advance(Duration::from_secs(4000));
    service.tick().await.unwrap();

    assert_eq!(*transport.disconnected.lock().unwrap(), vec![first]);
    {
        let engine = service.engine();
        let engine = engine.lock().await;
        assert_eq!(engine.peer_count(), 1);
        assert!(engine.peer(first).is_none());
        assert!(engine.in_flight().is_empty());
        assert_eq!(engine.header_sync().sync_started, 1);
    }

    service.tick().await.unwrap();
    assert_eq!(*transport.disconnected.lock().unwrap(), vec![first]);
    let engine = service.engine();
    let engine = engine.lock().await;
    assert_eq!(engine.peer(second).unwrap().blocks_in_flight(), 20);
    assert_eq!(engine.in_flight().len(), 20);
}

#[tokio::test]
async fn test_unknown_peer_surfaces_error() {
    let transport = Arc::new(RecordingTransport::default());
    let service = SyncService::new(engine(1), transport.clone());

    let result = service.handle_message(NodeId(9), PeerMessage::SendHeaders).await;
    assert_error_contains!(result, "Unknown peer 9");
    assert!(transport.sent.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_ticks_until_cancelled() {
    let transport = Arc::new(RecordingTransport::default());
    let config = SyncConfig::default().with_tick_interval(Duration::from_millis(100));
    let chain = MockChain::with_active_chain(10);
    let clock = Arc::new(MockClock::at_secs(chain.tip_time() + 60));
    let engine = SyncEngine::new(config, chain, Checkpoints::default(), clock).unwrap();
    let service = SyncService::new(engine, transport.clone());
    service.connect(PEER, test_address(10)).await;

    let token = CancellationToken::new();
    let cancel = token.clone();
    let (result, _) = tokio::join!(service.run(token), async move {
        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
    });

    assert!(result.is_ok());
    // header sync starts once, later ticks have nothing to add
    assert_commands!(transport, PEER, ["getheaders"]);
}

/// Transport whose sends fail while the injector is enabled.
#[derive(Default)]
struct FlakyTransport {
    injector: ErrorInjector,
    inner: RecordingTransport,
}

#[async_trait]
impl PeerTransport for FlakyTransport {
    async fn send(&self, peer: NodeId, message: OutboundMessage) -> NetworkResult<()> {
        if self.injector.should_fail() {
            return Err(NetworkError::SendFailed("connection reset".to_string()));
        }
        self.inner.send(peer, message).await
    }

    async fn disconnect(&self, peer: NodeId) -> NetworkResult<()> {
        self.inner.disconnect(peer).await
    }

    async fn ban(&self, peer: NodeId) -> NetworkResult<()> {
        self.inner.ban(peer).await
    }
}

#[tokio::test]
async fn test_failed_send_keeps_peer() {
    let transport = Arc::new(FlakyTransport::default());
    transport.injector.fail_after(1);
    let engine = engine(10);
    let block_hash = engine.node().hash_at(5);
    let service = SyncService::new(engine, transport.clone());
    service.connect(PEER, test_address(10)).await;

    // block, notfound, then the initial getheaders; only the block gets through
    let request = vec![InvItem::Block(block_hash), InvItem::Tx(test_utils::random_txid())];
    service.handle_message(PEER, PeerMessage::GetData(request)).await.unwrap();

    assert_commands!(transport.inner, PEER, ["block"]);
    let engine = service.engine();
    assert_eq!(engine.lock().await.peer_count(), 1);
}
