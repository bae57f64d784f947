//! Error types for the block synchronization engine.

use std::io;
use thiserror::Error;

use crate::types::NodeId;

/// Main error type for the sync engine.
#[derive(Debug, Error)]
pub enum SyncEngineError {
    /// A peer broke the protocol. The penalty has already been applied to its score.
    #[error("Protocol violation by peer {peer}: {reason} (penalty {penalty})")]
    ProtocolViolation {
        peer: NodeId,
        reason: String,
        penalty: i32,
    },

    /// A bounded resource was exhausted; the offending item was dropped or evicted.
    #[error("Resource limit reached: {0}")]
    ResourceLimit(String),

    /// A recoverable condition; the engine fell back to a heavier request.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Unrecoverable state, the node must stop.
    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl SyncEngineError {
    /// Returns a static string representing the error category based on the variant
    pub fn category(&self) -> &'static str {
        match self {
            SyncEngineError::ProtocolViolation {
                ..
            } => "protocol",
            SyncEngineError::ResourceLimit(_) => "resource",
            SyncEngineError::Transient(_) => "transient",
            SyncEngineError::Fatal(_) => "fatal",
            SyncEngineError::UnknownPeer(_) => "peer",
            SyncEngineError::Config(_) => "config",
            SyncEngineError::Logging(_) => "logging",
            SyncEngineError::Network(_) => "network",
        }
    }

    /// Whether the error requires the node to shut down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncEngineError::Fatal(_))
    }
}

/// Configuration validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    DirectoryCreation(#[from] io::Error),

    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),

    #[error("Log rotation failed: {0}")]
    RotationFailed(String),
}

/// Errors raised by the transport behind [`crate::service::PeerTransport`].
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Result with SyncEngineError.
pub type SyncResult<T> = std::result::Result<T, SyncEngineError>;

/// Type alias for logging operation results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;

/// Type alias for transport operation results.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = SyncEngineError::ProtocolViolation {
            peer: NodeId(3),
            reason: "non-continuous headers sequence".to_string(),
            penalty: 20,
        };
        assert_eq!(err.category(), "protocol");
        assert!(err.to_string().contains("peer 3"));
        assert!(err.to_string().contains("penalty 20"));

        assert_eq!(SyncEngineError::Transient("collision".into()).category(), "transient");
        assert_eq!(SyncEngineError::ResourceLimit("orphans".into()).category(), "resource");
        assert!(SyncEngineError::Fatal("missing block".into()).is_fatal());
        assert!(!SyncEngineError::UnknownPeer(NodeId(1)).is_fatal());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: SyncEngineError = ConfigError::InvalidValue {
            field: "ban_score_threshold",
            reason: "must be > 0".to_string(),
        }
        .into();
        assert_eq!(err.category(), "config");
        assert!(err.to_string().contains("ban_score_threshold"));
    }
}
