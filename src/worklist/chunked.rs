//! The chunked work-list family.
//!
//! Items live in fixed-capacity chunks; workers push into and pop from
//! their own private chunks and only touch a shared pool when a chunk fills
//! up or runs dry, so the per-item cost is a couple of ring operations.
//! The pool shape (LIFO/FIFO) decides chunk-level ordering, the `IS_STACK`
//! flag decides item-level ordering, and `DISTRIBUTED` replicates the pool
//! per socket with work-stealing between sockets.
//!
//! Chunk memory comes from the process-wide sized allocator, so every
//! work-list of one item type shares chunks, recycled through the freeing
//! thread's shard.

use std::ptr::{self, NonNull};

use crate::core::context::Context;
use crate::core::runtime::Runtime;
use crate::core::storage::{PerSocket, PerWorker};
use crate::mem::{FixedSizeHeap, OutOfMemory, MIN_ALIGN};
use crate::sync::AtomicPtr;
use crate::worklist::pool::{ChunkPool, ChunkQueue, ChunkStack, PoolNode};
use crate::worklist::range::InitialRange;
use crate::worklist::ring::FixedRing;
use crate::worklist::{WorkList, DEFAULT_CHUNK_SIZE};

/// A ring of items plus its pool link. The unit of transfer between
/// workers: a chunk is always owned by exactly one worker slot, one pool,
/// or the allocator's free list.
pub struct Chunk<T, const N: usize> {
    ring: FixedRing<T, N>,
    link: AtomicPtr<Chunk<T, N>>,
}

impl<T, const N: usize> Chunk<T, N> {
    fn new() -> Self {
        Chunk {
            ring: FixedRing::new(),
            link: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

unsafe impl<T, const N: usize> PoolNode for Chunk<T, N> {
    fn link(&self) -> &AtomicPtr<Self> {
        &self.link
    }
}

// A worker's private pair of chunks. `next` takes pushes; `cur` serves pops
// in queue mode. Stack mode only ever uses `next`.
struct Slot<T, const N: usize> {
    cur: *mut Chunk<T, N>,
    next: *mut Chunk<T, N>,
}

unsafe impl<T: Send, const N: usize> Send for Slot<T, N> {}

impl<T, const N: usize> Slot<T, N> {
    fn new() -> Self {
        Slot {
            cur: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

/// Common machinery of all chunked work-lists; use through the aliases
/// ([`ChunkedLifo`], [`SocketChunkedFifo`], ...).
pub struct ChunkedMaster<T, P, const IS_STACK: bool, const DISTRIBUTED: bool, const N: usize>
where
    P: ChunkPool<Chunk<T, N>>,
{
    heap: FixedSizeHeap,
    slots: PerWorker<Slot<T, N>>,
    pools: PerSocket<P>,
}

impl<T, P, const IS_STACK: bool, const DISTRIBUTED: bool, const N: usize>
    ChunkedMaster<T, P, IS_STACK, DISTRIBUTED, N>
where
    T: Send,
    P: ChunkPool<Chunk<T, N>>,
{
    // Chunks come out of 8-byte-aligned allocator cells; items that want
    // more alignment than that don't fit this container.
    const CHUNK_FITS: () = assert!(N > 0 && std::mem::align_of::<Chunk<T, N>>() <= MIN_ALIGN);

    /// A work-list sized for the given runtime's workers and sockets. All
    /// pushes and pops must come from contexts of a region of that runtime.
    pub fn new(rt: &Runtime) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CHUNK_FITS;

        let num_pools = if DISTRIBUTED { rt.num_sockets() } else { 1 };
        ChunkedMaster {
            heap: FixedSizeHeap::for_size(std::mem::size_of::<Chunk<T, N>>()),
            slots: PerWorker::new(rt.num_workers(), |_| Slot::new()),
            pools: PerSocket::new(num_pools, |_| P::default()),
        }
    }

    #[inline]
    fn pool_index(&self, ctx: &Context) -> usize {
        if DISTRIBUTED {
            ctx.socket()
        } else {
            0
        }
    }

    #[inline]
    fn local_pool(&self, ctx: &Context) -> &P {
        self.pools.remote(self.pool_index(ctx))
    }

    fn make_chunk(heap: FixedSizeHeap) -> Result<NonNull<Chunk<T, N>>, OutOfMemory> {
        let raw = heap.allocate()?.cast::<Chunk<T, N>>();
        unsafe { raw.as_ptr().write(Chunk::new()) };
        Ok(raw)
    }

    // Chunk must be owned by the caller; drops leftover items.
    unsafe fn free_chunk(&self, chunk: NonNull<Chunk<T, N>>) {
        ptr::drop_in_place(chunk.as_ptr());
        self.heap.deallocate(chunk.cast());
    }

    fn emplace(
        heap: FixedSizeHeap,
        pool: &P,
        slot: &mut Slot<T, N>,
        item: T,
        published: &mut u64,
    ) -> Result<(), OutOfMemory> {
        let mut item = item;
        if !slot.next.is_null() {
            match unsafe { (*slot.next).ring.push_back(item) } {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    // Full: publish it and start a fresh one.
                    item = rejected;
                    pool.push(unsafe { NonNull::new_unchecked(slot.next) });
                    *published += 1;
                    slot.next = ptr::null_mut();
                }
            }
        }

        let chunk = Self::make_chunk(heap)?;
        let pushed = unsafe { (*chunk.as_ptr()).ring.push_back(item) };
        debug_assert!(pushed.is_ok());
        slot.next = chunk.as_ptr();
        Ok(())
    }

    pub fn push(&self, ctx: &mut Context, item: T) -> Result<(), OutOfMemory> {
        let heap = self.heap;
        let pool = self.local_pool(ctx);
        let mut published = 0;
        let slot = self.slots.local_mut(ctx);
        let result = Self::emplace(heap, pool, slot, item, &mut published);
        ctx.stats.chunks_published += published;
        result
    }

    pub fn push_range(
        &self,
        ctx: &mut Context,
        items: impl IntoIterator<Item = T>,
    ) -> Result<(), OutOfMemory> {
        for item in items {
            self.push(ctx, item)?;
        }
        Ok(())
    }

    /// Seed the work-list before any workers exist. Exclusive access stands
    /// in for worker identity; everything lands in worker 0's slot and the
    /// first pool.
    pub fn fill(&mut self, items: impl IntoIterator<Item = T>) -> Result<(), OutOfMemory> {
        let heap = self.heap;
        let pool = self.pools.remote(0);
        let slot = self.slots.iter_mut().next().expect("no worker slots");
        let mut published = 0;
        for item in items {
            Self::emplace(heap, pool, slot, item, &mut published)?;
        }
        Ok(())
    }

    pub fn pop(&self, ctx: &mut Context) -> Option<T> {
        if IS_STACK {
            self.pop_stack(ctx)
        } else {
            self.pop_queue(ctx)
        }
    }

    /// Publish the worker's fill chunk to its pool right away, making the
    /// items visible to everyone. Idempotent.
    pub fn flush(&self, ctx: &mut Context) {
        let pool = self.local_pool(ctx);
        let slot = self.slots.local_mut(ctx);
        let next = slot.next;
        slot.next = ptr::null_mut();
        if let Some(chunk) = NonNull::new(next) {
            pool.push(chunk);
            ctx.stats.chunks_published += 1;
        }
    }

    /// Whether any pool currently holds chunks. Racy by nature; used by
    /// idle workers to decide if a re-pop is worth leaving the quiescence
    /// barrier for.
    pub fn has_visible_work(&self) -> bool {
        (0..self.pools.len()).any(|i| !self.pools.remote(i).is_empty())
    }

    fn pop_stack(&self, ctx: &mut Context) -> Option<T> {
        let start = self.pool_index(ctx);

        let slot = self.slots.local_mut(ctx);
        if !slot.next.is_null() {
            if let Some(item) = unsafe { (*slot.next).ring.pop_back() } {
                return Some(item);
            }
            unsafe { self.free_chunk(NonNull::new_unchecked(slot.next)) };
            slot.next = ptr::null_mut();
        }

        let (chunk, item, stolen) = self.draw_chunk(start)?;
        self.slots.local_mut(ctx).next = chunk.as_ptr();
        if stolen {
            ctx.stats.chunks_stolen += 1;
        } else {
            ctx.stats.chunks_popped += 1;
        }
        Some(item)
    }

    fn pop_queue(&self, ctx: &mut Context) -> Option<T> {
        let start = self.pool_index(ctx);

        let slot = self.slots.local_mut(ctx);
        if !slot.cur.is_null() {
            if let Some(item) = unsafe { (*slot.cur).ring.pop_front() } {
                return Some(item);
            }
            unsafe { self.free_chunk(NonNull::new_unchecked(slot.cur)) };
            slot.cur = ptr::null_mut();
        }

        if let Some((chunk, item, stolen)) = self.draw_chunk(start) {
            self.slots.local_mut(ctx).cur = chunk.as_ptr();
            if stolen {
                ctx.stats.chunks_stolen += 1;
            } else {
                ctx.stats.chunks_popped += 1;
            }
            return Some(item);
        }

        // Nothing shared anywhere: drain the chunk we were still filling.
        let slot = self.slots.local_mut(ctx);
        if !slot.next.is_null() {
            let chunk = slot.next;
            slot.next = ptr::null_mut();
            slot.cur = chunk;
            if let Some(item) = unsafe { (*chunk).ring.pop_front() } {
                return Some(item);
            }
            unsafe { self.free_chunk(NonNull::new_unchecked(chunk)) };
            slot.cur = ptr::null_mut();
        }
        None
    }

    // Take chunks out of the pools, own socket first and then upward with
    // wrap-around, until one with items appears. Chunks flushed empty are
    // freed along the way.
    fn draw_chunk(&self, start: usize) -> Option<(NonNull<Chunk<T, N>>, T, bool)> {
        let num_pools = self.pools.len();
        for i in 0..num_pools {
            let index = (start + i) % num_pools;
            let pool = self.pools.remote(index);
            while let Some(chunk) = pool.pop() {
                let item = unsafe {
                    let ring = &mut (*chunk.as_ptr()).ring;
                    if IS_STACK {
                        ring.pop_back()
                    } else {
                        ring.pop_front()
                    }
                };
                match item {
                    Some(item) => return Some((chunk, item, index != start)),
                    None => unsafe { self.free_chunk(chunk) },
                }
            }
        }
        None
    }
}

impl<T, P, const IS_STACK: bool, const DISTRIBUTED: bool, const N: usize> Drop
    for ChunkedMaster<T, P, IS_STACK, DISTRIBUTED, N>
where
    P: ChunkPool<Chunk<T, N>>,
{
    fn drop(&mut self) {
        let heap = self.heap;
        for i in 0..self.pools.len() {
            while let Some(chunk) = self.pools.remote(i).pop() {
                unsafe {
                    ptr::drop_in_place(chunk.as_ptr());
                    heap.deallocate(chunk.cast());
                }
            }
        }
        for slot in self.slots.iter_mut() {
            for chunk in [slot.cur, slot.next] {
                if !chunk.is_null() {
                    unsafe {
                        ptr::drop_in_place(chunk);
                        heap.deallocate(NonNull::new_unchecked(chunk).cast());
                    }
                }
            }
            slot.cur = ptr::null_mut();
            slot.next = ptr::null_mut();
        }
    }
}

impl<T, P, const IS_STACK: bool, const DISTRIBUTED: bool, const N: usize> WorkList<T>
    for ChunkedMaster<T, P, IS_STACK, DISTRIBUTED, N>
where
    T: Send,
    P: ChunkPool<Chunk<T, N>>,
{
    fn push(&self, ctx: &mut Context, item: T) -> Result<(), OutOfMemory> {
        ChunkedMaster::push(self, ctx, item)
    }

    fn pop(&self, ctx: &mut Context) -> Option<T> {
        ChunkedMaster::pop(self, ctx)
    }

    fn flush(&self, ctx: &mut Context) {
        ChunkedMaster::flush(self, ctx)
    }

    fn has_visible_work(&self) -> bool {
        ChunkedMaster::has_visible_work(self)
    }

    fn push_initial<R: InitialRange<T>>(
        &self,
        ctx: &mut Context,
        range: &R,
    ) -> Result<(), OutOfMemory> {
        for item in range.local_iter(ctx) {
            ChunkedMaster::push(self, ctx, item)?;
        }
        Ok(())
    }
}

/// A global LIFO of chunks of some fixed size.
pub type ChunkedLifo<T, const N: usize = DEFAULT_CHUNK_SIZE> =
    ChunkedMaster<T, ChunkStack<Chunk<T, N>>, true, false, N>;

/// A global FIFO of chunks of some fixed size.
pub type ChunkedFifo<T, const N: usize = DEFAULT_CHUNK_SIZE> =
    ChunkedMaster<T, ChunkQueue<Chunk<T, N>>, false, false, N>;

/// Per-socket LIFO pools with stealing; a more scalable [`ChunkedLifo`].
pub type SocketChunkedLifo<T, const N: usize = DEFAULT_CHUNK_SIZE> =
    ChunkedMaster<T, ChunkStack<Chunk<T, N>>, true, true, N>;

/// Per-socket FIFO pools with stealing; a more scalable [`ChunkedFifo`].
pub type SocketChunkedFifo<T, const N: usize = DEFAULT_CHUNK_SIZE> =
    ChunkedMaster<T, ChunkQueue<Chunk<T, N>>, false, true, N>;

/// Per-socket pools for callers agnostic to ordering: FIFO between chunks
/// for fairness, LIFO within a chunk for locality.
pub type SocketChunkedBag<T, const N: usize = DEFAULT_CHUNK_SIZE> =
    ChunkedMaster<T, ChunkQueue<Chunk<T, N>>, true, true, N>;
