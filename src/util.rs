use crossbeam_utils::{Backoff, CachePadded};

use crate::sync::{AtomicBool, Ordering};

/// A thin cache-padded spin lock.
///
/// Used where the critical section is a couple of pointer moves: pool
/// removal and the shared free-list. Waiters spin with exponential backoff;
/// nothing ever parks.
pub(crate) struct PaddedLock {
    locked: CachePadded<AtomicBool>,
}

impl PaddedLock {
    pub fn new() -> Self {
        PaddedLock {
            locked: CachePadded::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn lock(&self) {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();

            #[cfg(loom)]
            loom::thread::yield_now();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        let was_locked = self.locked.swap(false, Ordering::Release);
        debug_assert!(was_locked);
    }
}
