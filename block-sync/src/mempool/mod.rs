//! Transaction quarantine.

pub mod orphan_pool;
pub mod recent_rejects;

pub use orphan_pool::{OrphanPoolStats, OrphanTransactionPool, OrphanTx};
pub use recent_rejects::RecentRejects;
