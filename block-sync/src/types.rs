//! Common type definitions for the sync engine.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bitflags::bitflags;
use dashcore::bip152::{
    BlockTransactions, BlockTransactionsRequest, HeaderAndShortIds,
};
use dashcore::{Block, BlockHash, Header, Transaction, Txid};

/// Microseconds since the Unix epoch.
pub type Timestamp = i64;

/// Opaque handle naming a peer connection. Owned by the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable, non-owning handle into the external block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHandle(pub u32);

bitflags! {
    /// Connection properties known when a peer is registered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PeerFlags: u32 {
        /// Peer connected to us.
        const INBOUND = 1 << 0;
        /// Peer is on the operator's whitelist.
        const WHITELISTED = 1 << 1;
        /// Peer was added explicitly by the operator.
        const MANUAL = 1 << 2;
        /// Peer address is local.
        const LOCAL = 1 << 3;
        /// Peer does not serve blocks.
        const CLIENT = 1 << 4;
        /// Connection only exists to fetch addresses.
        const ONE_SHOT = 1 << 5;
        /// Peer advertises segregated-signature support.
        const SEGSIG = 1 << 6;
        /// Peer only wants blocks, no transaction relay.
        const BLOCKS_ONLY = 1 << 7;
    }
}

/// Handshake information about a newly connected peer.
#[derive(Debug, Clone)]
pub struct PeerAddress {
    pub addr: SocketAddr,
    pub flags: PeerFlags,
    /// Best height the peer advertised in its version message.
    pub starting_height: i32,
    /// Negotiated protocol version.
    pub version: i32,
}

impl PeerAddress {
    pub fn new(addr: SocketAddr, starting_height: i32, version: i32) -> Self {
        Self {
            addr,
            flags: PeerFlags::empty(),
            starting_height,
            version,
        }
    }

    pub fn with_flags(mut self, flags: PeerFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Peers we prefer to download blocks from.
    pub fn is_preferred_download(&self) -> bool {
        (!self.flags.contains(PeerFlags::INBOUND) || self.flags.contains(PeerFlags::WHITELISTED))
            && !self.flags.contains(PeerFlags::ONE_SHOT)
            && !self.flags.contains(PeerFlags::CLIENT)
    }
}

/// Inventory vector entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvItem {
    Tx(Txid),
    WitnessTx(Txid),
    Block(BlockHash),
    WitnessBlock(BlockHash),
    CompactBlock(BlockHash),
}

impl InvItem {
    pub fn block_hash(&self) -> Option<BlockHash> {
        match self {
            InvItem::Block(hash) | InvItem::WitnessBlock(hash) | InvItem::CompactBlock(hash) => {
                Some(*hash)
            }
            InvItem::Tx(_) | InvItem::WitnessTx(_) => None,
        }
    }

    pub fn txid(&self) -> Option<Txid> {
        match self {
            InvItem::Tx(txid) | InvItem::WitnessTx(txid) => Some(*txid),
            _ => None,
        }
    }
}

/// The object a `reject` message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedItem {
    Block(BlockHash),
    Tx(Txid),
}

/// A `reject` message queued for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub code: u8,
    pub reason: String,
    pub item: RejectedItem,
}

/// Messages the engine asks the transport to deliver.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    GetHeaders {
        locator: Vec<BlockHash>,
        stop: BlockHash,
    },
    /// Ask for `count` headers walking down from `height`.
    GetRHeaders {
        height: u32,
        count: u32,
    },
    Headers(Vec<Header>),
    RHeaders {
        height: u32,
        headers: Vec<Header>,
    },
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    Block(Arc<Block>),
    Tx(Arc<Transaction>),
    CmpctBlock(HeaderAndShortIds),
    GetBlockTxn(BlockTransactionsRequest),
    BlockTxn(BlockTransactions),
    Reject(RejectMessage),
}

impl OutboundMessage {
    /// Wire command name.
    pub fn command(&self) -> &'static str {
        match self {
            OutboundMessage::GetHeaders {
                ..
            } => "getheaders",
            OutboundMessage::GetRHeaders {
                ..
            } => "getrheaders",
            OutboundMessage::Headers(_) => "headers",
            OutboundMessage::RHeaders {
                ..
            } => "rheaders",
            OutboundMessage::Inv(_) => "inv",
            OutboundMessage::GetData(_) => "getdata",
            OutboundMessage::NotFound(_) => "notfound",
            OutboundMessage::Block(_) => "block",
            OutboundMessage::Tx(_) => "tx",
            OutboundMessage::CmpctBlock(_) => "cmpctblock",
            OutboundMessage::GetBlockTxn(_) => "getblocktxn",
            OutboundMessage::BlockTxn(_) => "blocktxn",
            OutboundMessage::Reject(_) => "reject",
        }
    }
}

/// Decoded messages handed to the engine by the dispatch layer.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    Headers(Vec<Header>),
    RHeaders {
        height: u32,
        headers: Vec<Header>,
    },
    CmpctBlock(HeaderAndShortIds),
    BlockTxn(BlockTransactions),
    GetBlockTxn(BlockTransactionsRequest),
    GetHeaders {
        locator: Vec<BlockHash>,
        stop: BlockHash,
    },
    GetRHeaders {
        height: u32,
        count: u32,
    },
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    Tx(Arc<Transaction>),
    Block(Arc<Block>),
    SendCmpct {
        announce: bool,
        version: u64,
    },
    SendHeaders,
}

impl PeerMessage {
    /// Wire command name.
    pub fn command(&self) -> &'static str {
        match self {
            PeerMessage::Headers(_) => "headers",
            PeerMessage::RHeaders {
                ..
            } => "rheaders",
            PeerMessage::CmpctBlock(_) => "cmpctblock",
            PeerMessage::BlockTxn(_) => "blocktxn",
            PeerMessage::GetBlockTxn(_) => "getblocktxn",
            PeerMessage::GetHeaders {
                ..
            } => "getheaders",
            PeerMessage::GetRHeaders {
                ..
            } => "getrheaders",
            PeerMessage::Inv(_) => "inv",
            PeerMessage::GetData(_) => "getdata",
            PeerMessage::Tx(_) => "tx",
            PeerMessage::Block(_) => "block",
            PeerMessage::SendCmpct {
                ..
            } => "sendcmpct",
            PeerMessage::SendHeaders => "sendheaders",
        }
    }
}

/// Something the connection layer must do on behalf of the engine.
#[derive(Debug, Clone)]
pub enum PeerAction {
    Send(OutboundMessage),
    Disconnect,
    /// Disconnect and add the peer address to the ban list.
    Ban,
}

/// Result of a handled message when no violation occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Processed,
    /// Message was valid but dropped, e.g. requests received during initial block download.
    Ignored,
}

/// Per-peer statistics exposed to the RPC layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStateStats {
    pub misbehavior_score: i32,
    /// Height of the best block known to the peer, -1 if none.
    pub sync_height: i32,
    /// Height of the last block we have in common with the peer, -1 if none.
    pub common_height: i32,
    pub heights_in_flight: Vec<i32>,
}

/// Header sync progress reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderProgress {
    /// Headers known, counting the reverse buffer.
    pub header_count: i32,
    pub best_header_height: i32,
    pub best_partial_height: i32,
    pub reverse_buffered: usize,
    pub probable_height: i32,
}
