//! Async driver connecting the engine to a peer transport.
//!
//! The engine itself is synchronous. [`SyncService`] serializes access to it with a single
//! [`tokio::sync::Mutex`], and performs transport I/O only after the lock is released.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::error::{NetworkError, NetworkResult, SyncResult};
use crate::types::{HandlerOutcome, NodeId, OutboundMessage, PeerAction, PeerAddress, PeerMessage};
use crate::validation::NodeBackend;

/// Connection layer the engine's actions are delivered to.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, peer: NodeId, message: OutboundMessage) -> NetworkResult<()>;

    async fn disconnect(&self, peer: NodeId) -> NetworkResult<()>;

    /// Disconnect and ban the peer's address.
    async fn ban(&self, peer: NodeId) -> NetworkResult<()>;
}

pub struct SyncService<N: NodeBackend, T: PeerTransport> {
    engine: Arc<Mutex<SyncEngine<N>>>,
    transport: Arc<T>,
    tick_interval: Duration,
}

impl<N, T> SyncService<N, T>
where
    N: NodeBackend + Send,
    T: PeerTransport,
{
    pub fn new(engine: SyncEngine<N>, transport: Arc<T>) -> Self {
        let tick_interval = engine.config().tick_interval;
        Self {
            engine: Arc::new(Mutex::new(engine)),
            transport,
            tick_interval,
        }
    }

    /// Shared handle to the engine, for queries and out-of-band calls.
    pub fn engine(&self) -> Arc<Mutex<SyncEngine<N>>> {
        self.engine.clone()
    }

    pub async fn connect(&self, peer: NodeId, address: PeerAddress) {
        self.engine.lock().await.connect(peer, address);
    }

    pub async fn disconnect(&self, peer: NodeId) -> bool {
        self.engine.lock().await.disconnect(peer)
    }

    /// Handle one inbound message and deliver everything it caused.
    pub async fn handle_message(
        &self,
        peer: NodeId,
        message: PeerMessage,
    ) -> SyncResult<HandlerOutcome> {
        let (result, actions) = {
            let mut engine = self.engine.lock().await;
            let result = engine.process_message(peer, message);
            let fatal = matches!(&result, Err(err) if err.is_fatal());
            if !fatal && engine.peer(peer).is_some() {
                if let Err(err) = engine.send_messages(peer) {
                    warn!(peer = %peer, "Send step failed: {}", err);
                }
            }
            (result, engine.take_actions())
        };

        self.flush(actions).await;
        result
    }

    /// Run the send step for every connected peer.
    pub async fn tick(&self) -> SyncResult<()> {
        let actions = {
            let mut engine = self.engine.lock().await;
            for peer in engine.peer_ids() {
                engine.send_messages(peer)?;
            }
            engine.take_actions()
        };
        self.flush(actions).await;
        Ok(())
    }

    /// Deliver `actions` outside the engine lock. Peers we dropped, or found gone, are then
    /// removed from the engine.
    async fn flush(&self, actions: Vec<(NodeId, PeerAction)>) {
        let mut gone = Vec::new();
        for (peer, action) in actions {
            if gone.contains(&peer) {
                continue;
            }
            let dropping = !matches!(action, PeerAction::Send(_));
            let result = match action {
                PeerAction::Send(message) => self.transport.send(peer, message).await,
                PeerAction::Disconnect => self.transport.disconnect(peer).await,
                PeerAction::Ban => self.transport.ban(peer).await,
            };
            match result {
                Ok(()) => {}
                Err(NetworkError::PeerDisconnected) => {
                    debug!(peer = %peer, "Peer went away while flushing actions");
                    gone.push(peer);
                    continue;
                }
                Err(err) => warn!(peer = %peer, "Failed to deliver action: {}", err),
            }
            if dropping {
                gone.push(peer);
            }
        }

        if !gone.is_empty() {
            let mut engine = self.engine.lock().await;
            for peer in gone {
                engine.disconnect(peer);
            }
        }
    }

    /// Tick until `shutdown_token` is cancelled. Returns early on a fatal engine error.
    pub async fn run(&self, shutdown_token: CancellationToken) -> SyncResult<()> {
        let mut interval = time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        info!("Sync service started, tick every {:?}", self.tick_interval);

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    info!("Sync service shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.tick().await?;
                }
            }
        }
    }
}
