//! Failure injection and panic assertions

use std::panic::{self, UnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Fails calls on demand, optionally after letting a number of them through.
#[derive(Debug, Default)]
pub struct ErrorInjector {
    failing: AtomicBool,
    passes_left: AtomicUsize,
}

impl ErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    /// Let the next `n` calls through, then fail every call.
    pub fn fail_after(&self, n: usize) {
        self.passes_left.store(n, Ordering::SeqCst);
        self.enable();
    }

    pub fn should_fail(&self) -> bool {
        let passed = self
            .passes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        !passed && self.failing.load(Ordering::SeqCst)
    }
}

/// Run `f`, which must panic with a message containing `expected`.
pub fn assert_panics_with<F: FnOnce() + UnwindSafe>(f: F, expected: &str) {
    let payload = match panic::catch_unwind(f) {
        Ok(()) => panic!("expected a panic containing '{}'", expected),
        Err(payload) => payload,
    };
    let message = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or_default();
    assert!(message.contains(expected), "panic '{}' does not mention '{}'", message, expected);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_injector_toggles() {
        let injector = ErrorInjector::new();
        assert!(!injector.should_fail());

        injector.enable();
        assert!(injector.should_fail());

        injector.disable();
        assert!(!injector.should_fail());
    }

    #[test]
    fn test_error_injector_fail_after() {
        let injector = ErrorInjector::new();
        injector.fail_after(2);
        assert!(!injector.should_fail());
        assert!(!injector.should_fail());
        assert!(injector.should_fail());
        assert!(injector.should_fail());
    }

    #[test]
    #[should_panic(expected = "expected a panic")]
    fn test_assert_panics_with_no_panic() {
        assert_panics_with(|| {}, "anything");
    }
}
