//! Cooperative cancellation flag
//!
//! The only per-job state written from more than one thread. The coordinator
//! raises it; the running job polls it through [`JobContext::is_aborted`].
//!
//! [`JobContext::is_aborted`]: super::JobContext::is_aborted

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, clonable abort flag for one job
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; never interrupts the worker.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_visible_through_clones() {
        let handle = AbortHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_aborted());

        handle.abort();
        assert!(clone.is_aborted());
        assert!(!AbortHandle::new().is_aborted());
    }

    #[test]
    fn test_abort_from_another_thread() {
        let handle = AbortHandle::new();
        let remote = handle.clone();
        std::thread::spawn(move || remote.abort()).join().unwrap();
        assert!(handle.is_aborted());
    }
}
