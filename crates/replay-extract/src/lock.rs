//! Single-flight guard for extraction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Admits at most one extraction at a time.
///
/// A second request while one is in flight is refused, not queued.
#[derive(Debug, Clone, Default)]
pub struct ExtractionLock {
    busy: Arc<AtomicBool>,
}

impl ExtractionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock, or `None` if an extraction is in flight.
    pub fn try_acquire(&self) -> Option<ExtractionGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExtractionGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Holds the [`ExtractionLock`]; releases it on drop, including unwinding.
#[derive(Debug)]
pub struct ExtractionGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for ExtractionGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused() {
        let lock = ExtractionLock::new();

        let guard = lock.try_acquire();
        assert!(guard.is_some());
        assert!(lock.is_busy());
        assert!(lock.try_acquire().is_none());

        drop(guard);
        assert!(!lock.is_busy());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn test_released_on_panic() {
        let lock = ExtractionLock::new();
        let shared = lock.clone();

        let result = std::thread::spawn(move || {
            let _guard = shared.try_acquire().unwrap();
            panic!("extraction blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!lock.is_busy());
    }

    #[test]
    fn test_concurrent_acquire_admits_one() {
        let lock = ExtractionLock::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    lock.try_acquire()
                })
            })
            .collect();

        let guards: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(guards.iter().filter(|g| g.is_some()).count(), 1);
    }
}
