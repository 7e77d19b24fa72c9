//! Per-worker and per-socket storage.
//!
//! These are the building blocks the work-lists use for their private chunk
//! slots and their shared pools, and they are also useful on their own for
//! the usual accumulate-locally-merge-at-the-end patterns.
//!
//! `PerWorker` hands out mutable access to exactly one slot per worker: the
//! `&mut Context` argument is the proof of identity, so no locking is
//! involved. `PerSocket` entries are shared by all workers of a socket and
//! therefore only hand out `&T` for `T: Sync`.

use std::cell::UnsafeCell;

use crossbeam_utils::CachePadded;

use crate::core::context::Context;

pub struct PerWorker<T> {
    entries: Vec<CachePadded<UnsafeCell<T>>>,
}

unsafe impl<T: Send> Send for PerWorker<T> {}
// Concurrent access is restricted to disjoint slots (see `local_mut`), which
// is why T only needs Send.
unsafe impl<T: Send> Sync for PerWorker<T> {}

impl<T> PerWorker<T> {
    pub fn new(num_workers: usize, mut init: impl FnMut(usize) -> T) -> Self {
        PerWorker {
            entries: (0..num_workers)
                .map(|i| CachePadded::new(UnsafeCell::new(init(i))))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exclusive access to the calling worker's slot.
    ///
    /// Workers have distinct indices and each worker's `Context` exists
    /// exactly once, so borrowing it mutably proves no other access to this
    /// slot is possible for the duration of the returned borrow.
    #[inline]
    pub fn local_mut<'a>(&'a self, ctx: &'a mut Context) -> &'a mut T {
        let entry = &self.entries[ctx.index()];
        unsafe { &mut *entry.get() }
    }

    /// Shared access to any slot. Only available when `T` synchronizes its
    /// own interior (pools, atomic counters, ...).
    #[inline]
    pub fn remote(&self, index: usize) -> &T
    where
        T: Sync,
    {
        unsafe { &*self.entries[index].get() }
    }

    /// Visit every slot. Requires `&mut self`, i.e. the parallel region is
    /// over and the caller is the only one left.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().map(|e| e.get_mut())
    }
}

pub struct PerSocket<T> {
    entries: Vec<CachePadded<T>>,
}

impl<T> PerSocket<T> {
    pub fn new(num_sockets: usize, mut init: impl FnMut(usize) -> T) -> Self {
        PerSocket {
            entries: (0..num_sockets).map(|i| CachePadded::new(init(i))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The calling worker's socket entry.
    #[inline]
    pub fn local<'a>(&'a self, ctx: &Context) -> &'a T
    where
        T: Sync,
    {
        &self.entries[ctx.socket()]
    }

    #[inline]
    pub fn remote(&self, socket: usize) -> &T
    where
        T: Sync,
    {
        &self.entries[socket]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().map(|e| &mut **e)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::core::topology::Topology;

    #[test]
    fn per_worker_accumulate_and_merge() {
        let topo = Topology::detect();
        let n = 4;
        let mut counts = PerWorker::new(n, |_| 0u64);

        std::thread::scope(|s| {
            let counts = &counts;
            for i in 0..n {
                let topo = topo.clone();
                s.spawn(move || {
                    let mut ctx = Context::new(i as u32, n as u32, &topo);
                    for _ in 0..1000 {
                        *counts.local_mut(&mut ctx) += 1;
                    }
                });
            }
        });

        let total: u64 = counts.iter_mut().map(|c| *c).sum();
        assert_eq!(total, 4000);
    }

    #[test]
    fn per_socket_shared_entries() {
        use crate::sync::{AtomicUsize, Ordering};

        let topo = Topology::with_sockets(2);
        let sockets = PerSocket::new(2, |_| AtomicUsize::new(0));

        std::thread::scope(|s| {
            let sockets = &sockets;
            for i in 0..4u32 {
                let topo = topo.clone();
                s.spawn(move || {
                    let ctx = Context::new(i, 4, &topo);
                    sockets.local(&ctx).fetch_add(1, Ordering::Relaxed);
                });
            }
        });

        assert_eq!(sockets.remote(0).load(Ordering::Relaxed), 2);
        assert_eq!(sockets.remote(1).load(Ordering::Relaxed), 2);
    }
}
