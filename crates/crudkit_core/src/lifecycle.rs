//! Guarded, idempotent disposal.
//!
//! # Responsibility
//! - Run a teardown routine exactly once, no matter how many callers race.
//! - Let owners reject use after disposal.
//!
//! # Invariants
//! - The teardown closure runs at most once per `Lifecycle`.
//! - Once disposal has started, `ensure_not_disposed` fails.

use crate::error::{CrudError, CrudResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Open/disposed state machine shared by disposable owners.
#[derive(Debug, Default)]
pub struct Lifecycle {
    disposing: AtomicBool,
    disposed: AtomicBool,
    gate: Mutex<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `teardown` if this is the first disposal request.
    ///
    /// Returns `Some` with the teardown result for the single caller that
    /// performed it and `None` for every other caller.
    pub fn dispose_with<R>(&self, teardown: impl FnOnce() -> R) -> Option<R> {
        if self.is_closing() {
            return None;
        }

        let _gate = self.gate.lock();
        if self.is_closing() {
            return None;
        }

        self.disposing.store(true, Ordering::Release);
        let result = teardown();
        self.disposed.store(true, Ordering::Release);
        Some(result)
    }

    /// Fails with `CrudError::AlreadyDisposed` once disposal has started.
    pub fn ensure_not_disposed(&self) -> CrudResult<()> {
        if self.is_closing() {
            return Err(CrudError::AlreadyDisposed);
        }
        Ok(())
    }

    /// Returns whether teardown has completed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn is_closing(&self) -> bool {
        self.disposed.load(Ordering::Acquire) || self.disposing.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::Lifecycle;
    use crate::error::CrudError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn repeated_dispose_runs_teardown_once() {
        let lifecycle = Lifecycle::new();
        let mut runs = 0;

        assert_eq!(lifecycle.dispose_with(|| { runs += 1; 7 }), Some(7));
        assert_eq!(lifecycle.dispose_with(|| { runs += 1; 8 }), None);
        assert_eq!(runs, 1);
        assert!(lifecycle.is_disposed());
    }

    #[test]
    fn ensure_not_disposed_fails_after_dispose() {
        let lifecycle = Lifecycle::new();
        lifecycle.ensure_not_disposed().unwrap();

        lifecycle.dispose_with(|| ());
        assert!(matches!(
            lifecycle.ensure_not_disposed(),
            Err(CrudError::AlreadyDisposed)
        ));
    }

    #[test]
    fn concurrent_dispose_runs_teardown_once() {
        let lifecycle = Arc::new(Lifecycle::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                let runs = Arc::clone(&runs);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    lifecycle.dispose_with(|| {
                        runs.fetch_add(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        let performed = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(Option::is_some)
            .count();

        assert_eq!(performed, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_observes_disposing_state() {
        let lifecycle = Lifecycle::new();
        lifecycle.dispose_with(|| {
            assert!(lifecycle.ensure_not_disposed().is_err());
            assert!(!lifecycle.is_disposed());
        });
    }
}
