//! Peer block and header synchronization engine.
//!
//! This crate decides which blocks to request from which peers and when. It covers:
//!
//! - Forward, reverse (checkpoint-anchored) and partial header sync
//! - A download scheduler with per-peer in-flight tracking, stall detection and timeouts
//! - Compact block (BIP152) reconstruction from the mempool
//! - Orphan transaction quarantine with cascading acceptance
//! - Misbehavior scoring and ban decisions
//! - Priority block downloads delivered in request order
//!
//! Consensus validation, the block index, the mempool and block storage are provided by
//! the node through [`validation::NodeBackend`]. The engine never performs I/O; it queues
//! [`types::PeerAction`]s that [`service::SyncService`] delivers through a
//! [`service::PeerTransport`].
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use block_sync::{Checkpoints, SyncConfig, SyncEngine, SyncService, SystemClock};
//! use tokio_util::sync::CancellationToken;
//!
//! let clock = Arc::new(SystemClock);
//! let engine = SyncEngine::new(SyncConfig::default(), node, Checkpoints::default(), clock)?;
//! let service = SyncService::new(engine, transport);
//! service.run(CancellationToken::new()).await?;
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod chain;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mempool;
pub mod peer;
pub mod service;
pub mod sync;
pub mod types;
pub mod validation;

// Re-export main types for convenience
pub use chain::{BlockIndex, Checkpoints};
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{
    ConfigError, LoggingError, LoggingResult, NetworkError, NetworkResult, SyncEngineError,
    SyncResult,
};
pub use logging::{init_console_logging, init_logging, LogFileConfig, LoggingConfig, LoggingGuard};
pub use service::{PeerTransport, SyncService};
pub use tracing::level_filters::LevelFilter;
pub use types::{
    BlockHandle, HandlerOutcome, InvItem, NodeId, OutboundMessage, PeerAction, PeerAddress,
    PeerFlags, PeerMessage,
};
pub use validation::{Clock, NodeBackend, SyncObserver, SystemClock};

/// Current version of the block-sync library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
