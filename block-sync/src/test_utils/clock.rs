use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::types::Timestamp;
use crate::validation::Clock;

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct MockClock {
    now: AtomicI64,
}

impl MockClock {
    pub fn at_secs(secs: i64) -> Self {
        Self {
            now: AtomicI64::new(secs * 1_000_000),
        }
    }

    pub fn set_secs(&self, secs: i64) {
        self.now.store(secs * 1_000_000, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_micros() as i64, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_micros(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
