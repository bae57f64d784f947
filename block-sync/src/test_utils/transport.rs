use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{NetworkError, NetworkResult};
use crate::service::PeerTransport;
use crate::types::{NodeId, OutboundMessage};

/// Transport that records what the engine asked for.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(NodeId, OutboundMessage)>>,
    pub disconnected: Mutex<Vec<NodeId>>,
    pub banned: Mutex<Vec<NodeId>>,
    /// Sends to these peers fail.
    pub unreachable: Mutex<Vec<NodeId>>,
}

impl RecordingTransport {
    /// Commands sent to `peer`, in order.
    pub fn commands_to(&self, peer: NodeId) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == peer)
            .map(|(_, message)| message.command())
            .collect()
    }
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    async fn send(&self, peer: NodeId, message: OutboundMessage) -> NetworkResult<()> {
        if self.unreachable.lock().unwrap().contains(&peer) {
            return Err(NetworkError::PeerDisconnected);
        }
        self.sent.lock().unwrap().push((peer, message));
        Ok(())
    }

    async fn disconnect(&self, peer: NodeId) -> NetworkResult<()> {
        self.disconnected.lock().unwrap().push(peer);
        Ok(())
    }

    async fn ban(&self, peer: NodeId) -> NetworkResult<()> {
        self.banned.lock().unwrap().push(peer);
        Ok(())
    }
}
