//! Process-wide sized allocators.
//!
//! Chunk allocation wants one scalable allocator per element size, shared by
//! every work-list instance of that size: a registry maps size to a
//! per-thread free-list-over-bump stack, created on first request and kept
//! for the life of the process. Installation takes a lock; lookups hit a
//! thread-local cache and stay lock-free afterwards.

use std::cell::{RefCell, UnsafeCell};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock};

use crossbeam_utils::CachePadded;

use crate::mem::heap::{BumpHeap, FreeListHeap, Heap, PageHeap, MIN_ALIGN};
use crate::mem::OutOfMemory;

/// Hard cap on the number of threads that may allocate *at the same time*.
/// Per-thread shards are fixed arrays indexed by a leased thread index.
pub const MAX_ALLOC_THREADS: usize = 256;

// Leased on a thread's first allocation, returned when the thread exits.
// Workers are short-lived (one set per parallel region), so recycling is
// what keeps the dense index space bounded; a successor thread inheriting
// a shard also inherits its free blocks, which is harmless because blocks
// of one sized heap are interchangeable.
struct IndexLease(usize);

impl Drop for IndexLease {
    fn drop(&mut self) {
        FREE_INDICES.lock().unwrap().push(self.0);
    }
}

static FREE_INDICES: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// Dense index of the calling thread, stable for the thread's lifetime.
pub(crate) fn thread_index() -> usize {
    static NEXT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
    thread_local! {
        static LEASE: IndexLease = {
            let index = FREE_INDICES
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
            assert!(
                index < MAX_ALLOC_THREADS,
                "more than {} threads allocating at once",
                MAX_ALLOC_THREADS
            );
            IndexLease(index)
        };
    }
    LEASE.with(|lease| lease.0)
}

// Debug guard on a shard: a shard may only ever be entered by the thread
// currently leasing its index, so any overlap means the lease machinery
// handed one index to two live threads. Cheap enough to run on every
// allocation in debug builds; release builds drop the field entirely.
#[cfg(debug_assertions)]
struct ShardOwnership {
    busy: std::sync::atomic::AtomicBool,
}

#[cfg(debug_assertions)]
impl ShardOwnership {
    fn new() -> Self {
        ShardOwnership {
            busy: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn enter(&self, index: usize) {
        use std::sync::atomic::Ordering;
        let clash = self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err();
        assert!(
            !clash,
            "allocator shard {} entered by two threads; an index lease was duplicated",
            index
        );
    }

    fn exit(&self) {
        use std::sync::atomic::Ordering;
        self.busy.store(false, Ordering::Release);
    }
}

struct Shard<H> {
    heap: UnsafeCell<H>,
    #[cfg(debug_assertions)]
    ownership: ShardOwnership,
}

impl<H: Heap + Default> Default for Shard<H> {
    fn default() -> Self {
        Shard {
            heap: UnsafeCell::new(H::default()),
            #[cfg(debug_assertions)]
            ownership: ShardOwnership::new(),
        }
    }
}

/// One inner heap per thread; every operation acts on the caller's own
/// shard, so no operation ever contends.
///
/// Cross-thread deallocation is allowed and lands in the *caller's* shard:
/// the recycled block will be handed out from there, while the underlying
/// pages stay owned by whichever thread originally mapped them.
pub struct PerThreadHeap<H: Heap> {
    shards: Vec<CachePadded<Shard<H>>>,
}

unsafe impl<H: Heap + Send> Send for PerThreadHeap<H> {}
unsafe impl<H: Heap + Send> Sync for PerThreadHeap<H> {}

impl<H: Heap + Default> Default for PerThreadHeap<H> {
    fn default() -> Self {
        PerThreadHeap {
            shards: (0..MAX_ALLOC_THREADS)
                .map(|_| CachePadded::new(Shard::default()))
                .collect(),
        }
    }
}

impl<H: Heap> PerThreadHeap<H> {
    /// Run `f` on the calling thread's shard.
    #[inline]
    pub fn with_local<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        let index = thread_index();
        let shard = &self.shards[index];

        #[cfg(debug_assertions)]
        shard.ownership.enter(index);
        let result = f(unsafe { &mut *shard.heap.get() });
        #[cfg(debug_assertions)]
        shard.ownership.exit();

        result
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.with_local(|heap| heap.allocate(size))
    }

    /// # Safety
    ///
    /// Same contract as [`Heap::deallocate`], except the block may have been
    /// allocated from any thread's shard of this heap.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.with_local(|heap| unsafe { heap.deallocate(ptr, size) })
    }

    pub fn clear(&mut self) {
        for shard in &mut self.shards {
            shard.heap.get_mut().clear();
        }
    }
}

impl<H: Heap> Heap for PerThreadHeap<H> {
    const ALLOC_SIZE: usize = H::ALLOC_SIZE;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        PerThreadHeap::allocate(&*self, size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        PerThreadHeap::deallocate(&*self, ptr, size)
    }

    fn clear(&mut self) {
        PerThreadHeap::clear(self)
    }
}

// The canonical scalable stack: recycle per thread, bump within pages.
type SizedHeap = PerThreadHeap<FreeListHeap<BumpHeap<PageHeap>>>;

struct Registry {
    map: Mutex<BTreeMap<usize, &'static SizedHeap>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

thread_local! {
    static LOCAL_CACHE: RefCell<BTreeMap<usize, &'static SizedHeap>> =
        RefCell::new(BTreeMap::new());
}

fn heap_for_size(size: usize) -> &'static SizedHeap {
    LOCAL_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if let Some(heap) = cache.get(&size) {
            return *heap;
        }

        let registry = REGISTRY.get_or_init(|| Registry {
            map: Mutex::new(BTreeMap::new()),
        });
        let heap = *registry
            .map
            .lock()
            .unwrap()
            .entry(size)
            .or_insert_with(|| Box::leak(Box::new(SizedHeap::default())));
        cache.insert(size, heap);
        heap
    })
}

/// A handle on the process-wide allocator for one block size.
///
/// Serves exactly that size: this is what makes recycled blocks always
/// interchangeable. Anything variable-sized belongs in a
/// [`VariableSizeHeap`]. Handles for the same size compare equal; copies
/// are free.
#[derive(Copy, Clone)]
pub struct FixedSizeHeap {
    heap: &'static SizedHeap,
    size: usize,
}

impl FixedSizeHeap {
    pub fn for_size(size: usize) -> Self {
        // Block must fit the recycling link and sizes share entries at
        // 8-byte granularity.
        let size = size.max(MIN_ALIGN).div_ceil(MIN_ALIGN) * MIN_ALIGN;
        FixedSizeHeap {
            heap: heap_for_size(size),
            size,
        }
    }

    /// The (rounded) block size this handle serves.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn allocate(&self) -> Result<NonNull<u8>, OutOfMemory> {
        self.heap.allocate(self.size)
    }

    /// # Safety
    ///
    /// `ptr` must come from `allocate` on a handle equal to this one, and
    /// must not be used afterwards. Any thread may free any block.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.heap.deallocate(ptr, self.size)
    }
}

impl PartialEq for FixedSizeHeap {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.heap, other.heap)
    }
}

impl Eq for FixedSizeHeap {}

impl std::fmt::Debug for FixedSizeHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedSizeHeap").field("size", &self.size).finish()
    }
}

/// Scalable allocation of task-local data: a per-thread bump allocator.
///
/// Individual deallocation is a no-op; everything comes back at once via
/// `clear` (or drop). Allocations larger than a page are refused — callers
/// streaming big objects use `allocate_partial` and take the page-tail
/// pieces as they come.
pub struct VariableSizeHeap {
    shards: PerThreadHeap<BumpHeap<PageHeap>>,
}

impl VariableSizeHeap {
    pub fn new() -> Self {
        VariableSizeHeap {
            shards: PerThreadHeap::default(),
        }
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.shards.allocate(size)
    }

    /// Allocate up to `size` bytes contiguously, returning how many were
    /// actually provided (at least 8, at most `size` rounded up).
    pub fn allocate_partial(&self, size: usize) -> Result<(NonNull<u8>, usize), OutOfMemory> {
        self.shards.with_local(|heap| heap.allocate_partial(size))
    }

    pub fn clear(&mut self) {
        self.shards.clear();
    }
}

impl Default for VariableSizeHeap {
    fn default() -> Self {
        Self::new()
    }
}
