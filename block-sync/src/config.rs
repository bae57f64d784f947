//! Configuration for the sync engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Misbehavior score at which a peer is disconnected and banned.
    pub ban_score_threshold: i32,

    /// Maximum number of orphan transactions kept after a sweep.
    pub max_orphan_transactions: usize,

    /// How long an orphan transaction lives before it is swept.
    pub orphan_expire_time: Duration,

    /// Minimum time between two orphan expiry sweeps.
    pub orphan_expire_interval: Duration,

    /// Orphans at or above this weight are refused.
    pub max_orphan_tx_weight: u64,

    /// Capacity of the extra transaction ring used for compact block reconstruction.
    pub block_reconstruction_extra_txn: usize,

    /// Time a peer gets to answer a header request before it is dropped.
    pub headers_download_timeout: Duration,

    /// Block download timeout in block intervals.
    pub block_download_timeout_base: u32,

    /// Extra block intervals granted per other peer with validated downloads.
    pub block_download_timeout_per_peer: u32,

    /// Time a peer may hold back the download window before it is dropped.
    pub block_stalling_timeout: Duration,

    /// Expected time between blocks.
    pub pow_target_spacing: Duration,

    // Sync strategies
    /// Use checkpoint-anchored reverse header sync when possible.
    pub reverse_headers: bool,

    /// Download block bodies automatically. When false only priority requests are served.
    pub full_sync_mode: bool,

    /// Light client mode: priority drain failures reset the scan instead of aborting.
    pub spv_mode: bool,

    // Transaction relay
    /// Accept and relay loose transactions.
    pub relay_transactions: bool,

    /// Accept transactions from whitelisted peers even when relay is off.
    pub whitelist_relay: bool,

    /// Period of the async tick driving outbound requests and timeouts.
    pub tick_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ban_score_threshold: 100,
            max_orphan_transactions: 100,
            orphan_expire_time: Duration::from_secs(20 * 60),
            orphan_expire_interval: Duration::from_secs(5 * 60),
            max_orphan_tx_weight: 400_000,
            block_reconstruction_extra_txn: 100,
            headers_download_timeout: Duration::from_secs(2 * 60),
            block_download_timeout_base: 10,
            block_download_timeout_per_peer: 5,
            block_stalling_timeout: Duration::from_secs(2),
            pow_target_spacing: Duration::from_secs(300),
            reverse_headers: true,
            full_sync_mode: true,
            spv_mode: false,
            relay_transactions: true,
            whitelist_relay: true,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl SyncConfig {
    /// Configuration for a light client: header sync plus priority downloads only.
    pub fn spv() -> Self {
        Self {
            full_sync_mode: false,
            spv_mode: true,
            relay_transactions: false,
            ..Self::default()
        }
    }

    pub fn with_ban_score_threshold(mut self, threshold: i32) -> Self {
        self.ban_score_threshold = threshold;
        self
    }

    pub fn with_max_orphan_transactions(mut self, max: usize) -> Self {
        self.max_orphan_transactions = max;
        self
    }

    pub fn with_orphan_expiry(mut self, expire_time: Duration, interval: Duration) -> Self {
        self.orphan_expire_time = expire_time;
        self.orphan_expire_interval = interval;
        self
    }

    pub fn with_headers_download_timeout(mut self, timeout: Duration) -> Self {
        self.headers_download_timeout = timeout;
        self
    }

    pub fn with_block_stalling_timeout(mut self, timeout: Duration) -> Self {
        self.block_stalling_timeout = timeout;
        self
    }

    pub fn with_pow_target_spacing(mut self, spacing: Duration) -> Self {
        self.pow_target_spacing = spacing;
        self
    }

    pub fn with_reverse_headers(mut self, enabled: bool) -> Self {
        self.reverse_headers = enabled;
        self
    }

    pub fn with_full_sync_mode(mut self, enabled: bool) -> Self {
        self.full_sync_mode = enabled;
        self
    }

    pub fn with_spv_mode(mut self, enabled: bool) -> Self {
        self.spv_mode = enabled;
        self
    }

    pub fn with_relay_transactions(mut self, enabled: bool) -> Self {
        self.relay_transactions = enabled;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Block download timeout for a peer given how many other peers have validated downloads.
    pub fn block_download_timeout(&self, other_validated_peers: u32) -> Duration {
        let intervals = self
            .block_download_timeout_base
            .saturating_add(
                self.block_download_timeout_per_peer.saturating_mul(other_validated_peers),
            );
        let timeout = self.pow_target_spacing.saturating_mul(intervals);
        timeout.max(crate::constants::MIN_BLOCK_DOWNLOAD_TIMEOUT)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ban_score_threshold <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "ban_score_threshold",
                reason: "must be > 0".to_string(),
            });
        }

        if self.orphan_expire_interval > self.orphan_expire_time {
            return Err(ConfigError::InvalidValue {
                field: "orphan_expire_interval",
                reason: format!(
                    "must not exceed orphan_expire_time ({:?} > {:?})",
                    self.orphan_expire_interval, self.orphan_expire_time
                ),
            });
        }

        if self.max_orphan_tx_weight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_orphan_tx_weight",
                reason: "must be > 0".to_string(),
            });
        }

        if self.pow_target_spacing.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "pow_target_spacing",
                reason: "must be > 0".to_string(),
            });
        }

        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "tick_interval",
                reason: "must be > 0".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ban_score_threshold, 100);
        assert_eq!(config.max_orphan_transactions, 100);
        assert!(config.reverse_headers);
        assert!(config.full_sync_mode);
    }

    #[test]
    fn test_spv_config() {
        let config = SyncConfig::spv();
        assert!(config.spv_mode);
        assert!(!config.full_sync_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SyncConfig::default().with_ban_score_threshold(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "ban_score_threshold",
                ..
            })
        ));

        let config = SyncConfig::default()
            .with_orphan_expiry(Duration::from_secs(60), Duration::from_secs(120));
        assert!(config.validate().is_err());

        let config = SyncConfig::default().with_pow_target_spacing(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_block_download_timeout() {
        let config = SyncConfig::default();
        // 10 intervals of 300s
        assert_eq!(config.block_download_timeout(0), Duration::from_secs(3000));
        // plus 5 intervals per other peer
        assert_eq!(config.block_download_timeout(2), Duration::from_secs(6000));

        let fast = SyncConfig::default().with_pow_target_spacing(Duration::from_secs(1));
        assert_eq!(fast.block_download_timeout(0), Duration::from_secs(20));
    }

    #[test]
    fn test_serde_roundtrip_with_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"ban_score_threshold": 50}"#).unwrap();
        assert_eq!(config.ban_score_threshold, 50);
        assert_eq!(config.max_orphan_transactions, 100);
    }
}
