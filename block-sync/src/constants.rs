//! Wire-level constants shared by every node speaking the sync protocol.
//!
//! Changing any of these breaks interoperability with other implementations.

use std::time::Duration;

/// Maximum number of headers in a single `headers` message.
pub const MAX_HEADERS_RESULTS: usize = 2000;

/// Maximum number of headers in a single `rheaders` message.
pub const MAX_RHEADERS_RESULTS: usize = 4000;

/// Maximum depth below the tip at which a block is served as `cmpctblock`.
pub const MAX_CMPCTBLOCK_DEPTH: i32 = 5;

/// Maximum depth below the tip at which `getblocktxn` is answered with `blocktxn`.
pub const MAX_BLOCKTXN_DEPTH: i32 = 10;

/// Number of blocks that can be requested from a single peer at once.
pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 64;

/// Size of the block download window past the last common block with a peer.
pub const BLOCK_DOWNLOAD_WINDOW: i32 = 1024;

/// Short header batches (announcements) are below this size.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;

/// Every multiple of this many unconnecting announcements costs the peer a penalty.
pub const MAX_UNCONNECTING_HEADERS: u32 = 200;

/// Maximum number of entries in an `inv` or `getdata` message.
pub const MAX_INV_SZ: usize = 50_000;

/// Minimum protocol version that understands `getrheaders`.
pub const REVERSEHEADERS_VERSION: i32 = 70016;

/// Minimum time a block download may take before the peer is dropped.
pub const MIN_BLOCK_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20);

/// A header tip younger than this is considered close to the present.
pub const HEADER_TIP_NEAR_PRESENT: Duration = Duration::from_secs(24 * 60 * 60);

/// Blocks older than this relative to the best header are not served off the active chain.
pub const HISTORICAL_BLOCK_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Walk size used when scanning ahead of the last common block.
pub const FIND_BLOCKS_MIN_CHUNK: i32 = 128;

/// Maximum number of transactions answered with `getdata` in one message.
pub const MAX_GETDATA_BATCH: usize = 1000;

/// Reject codes carried in `reject` messages.
pub mod reject_codes {
    pub const MALFORMED: u16 = 0x01;
    pub const INVALID: u16 = 0x10;
    pub const OBSOLETE: u16 = 0x11;
    pub const DUPLICATE: u16 = 0x12;
    pub const NONSTANDARD: u16 = 0x40;
    pub const INSUFFICIENTFEE: u16 = 0x42;
    pub const CHECKPOINT: u16 = 0x43;
    /// Codes at or above this value are never sent over the wire.
    pub const INTERNAL: u16 = 0x100;
    pub const MAX_REASON_LENGTH: usize = 111;
}

/// Misbehavior penalties for protocol violations.
pub mod misbehavior_scores {
    /// Oversized `inv`, `getdata`, `headers` or `rheaders` message
    pub const OVERSIZED_MESSAGE: i32 = 20;

    /// Header batch whose headers do not chain onto each other
    pub const NON_CONTINUOUS_HEADERS: i32 = 20;

    /// Every `MAX_UNCONNECTING_HEADERS` unconnecting announcements
    pub const UNCONNECTING_HEADERS: i32 = 20;

    /// Reverse headers that break the chain or disagree with a checkpoint
    pub const INVALID_REVERSE_HEADERS: i32 = 100;

    /// `getrheaders` asking for heights we cannot have
    pub const INVALID_RHEADERS_REQUEST: i32 = 100;

    /// Structurally invalid compact block or block transactions
    pub const INVALID_COMPACT_BLOCK: i32 = 100;

    /// `getblocktxn` index outside the block
    pub const OUT_OF_BOUNDS_TX_INDEX: i32 = 100;
}
