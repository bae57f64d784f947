//! Block and header download.

pub mod compact;
pub mod headers;
pub mod priority;
pub mod scheduler;

pub use compact::{ExtraTxCache, FillStatus, PartiallyDownloadedBlock};
pub use headers::{HeaderSyncCoordinator, ReverseHeaderBuffer, ReverseHeadersError};
pub use priority::{PriorityBlockRequest, PriorityCallback, PriorityDownloadQueue};
pub use scheduler::{InFlightIndex, Received, Selection};
