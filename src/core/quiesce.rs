//! Quiescence detection.
//!
//! The driver terminates when every worker simultaneously observes the
//! work-list empty. Workers that run out of work go through a two-phase
//! protocol:
//!
//! 1. observe a `pop` returning nothing (local chunks gone, all pools
//!    scanned empty) and increment the idle counter;
//! 2. keep polling the pools; on any sign of work, decrement the counter
//!    *before* attempting to pop, so that a worker holding an item is never
//!    counted idle; if the pop comes back empty, re-increment and resume
//!    polling.
//!
//! The counter reaching the worker count is the linearization point: the
//! last incrementing worker just scanned every pool empty, every other
//! worker is inside the polling loop and holds nothing, and polling alone
//! never creates work, so the empty state is permanent.

use crossbeam_utils::CachePadded;

use crate::sync::{AtomicUsize, Ordering};

pub(crate) struct Terminator {
    idle: CachePadded<AtomicUsize>,
    num_workers: usize,
}

impl Terminator {
    pub fn new(num_workers: usize) -> Self {
        Terminator {
            idle: CachePadded::new(AtomicUsize::new(0)),
            num_workers,
        }
    }

    /// Phase 1: the caller has just observed its pop come back empty and
    /// holds no items.
    pub fn enter_idle(&self) {
        let prev = self.idle.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev < self.num_workers);
    }

    /// Phase 2 exit: the caller is about to re-attempt a pop.
    pub fn leave_idle(&self) {
        let prev = self.idle.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    pub fn all_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst) == self.num_workers
    }
}


#[cfg(loom)]
mod loom_tests {
    use super::*;
    use crate::sync::{Arc, AtomicUsize, Ordering};

    // Two workers draining a shared counter of items. A worker that takes an
    // item while marked idle must leave the barrier first; the model checks
    // that both workers agree on quiescence and that no item is lost.
    #[test]
    fn barrier_agrees_under_interleaving() {
        loom::model(|| {
            let term = Arc::new(Terminator::new(2));
            let work = Arc::new(AtomicUsize::new(1));
            let done = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for _ in 0..2 {
                let term = term.clone();
                let work = work.clone();
                let done = done.clone();
                handles.push(loom::thread::spawn(move || {
                    let take = |work: &AtomicUsize| loop {
                        let n = work.load(Ordering::SeqCst);
                        if n == 0 {
                            return false;
                        }
                        if work
                            .compare_exchange(n, n - 1, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            return true;
                        }
                    };

                    let mut executed = 0;
                    loop {
                        if take(&work) {
                            executed += 1;
                            continue;
                        }

                        term.enter_idle();
                        loop {
                            if term.all_idle() {
                                done.fetch_add(1, Ordering::SeqCst);
                                return executed;
                            }
                            if work.load(Ordering::SeqCst) > 0 {
                                term.leave_idle();
                                break;
                            }
                            loom::thread::yield_now();
                        }
                    }
                }));
            }

            let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(total, 1);
            assert_eq!(done.load(Ordering::SeqCst), 2);
        });
    }
}
