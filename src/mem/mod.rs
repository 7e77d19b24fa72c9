//! Memory management: the page source and the heap building blocks layered
//! on top of it.
//!
//! Everything here exists to make chunk and task-local allocation cheap and
//! scalable: pages come from the OS in large aligned slabs and stay with the
//! thread that mapped them, and allocators compose as small monomorphized
//! layers (free-list over bump over pages) so the hot paths inline flat.

pub mod heap;
pub mod page;
pub mod sized;

pub use heap::{
    BlockHeap, BumpHeap, BumpWithFallbackHeap, FreeListHeap, Heap, LockedHeap, MallocHeap,
    OwnerTaggedHeap, PageHeap, SelfLockFreeListHeap, ZeroHeap, MIN_ALIGN,
};
pub use page::{
    interleaved_alloc, interleaved_free, page_alloc, page_free, page_in, page_in_read_only,
    pages_allocated, pages_allocated_by_current_thread, preallocate_pages, HUGE_PAGE_SIZE,
};
pub use sized::{FixedSizeHeap, PerThreadHeap, VariableSizeHeap, MAX_ALLOC_THREADS};

/// The OS (or a test budget) refused to hand out more memory.
///
/// Allocation failure is fatal for whatever operation triggered it; there
/// are no retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl std::fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("out of memory")
    }
}

impl std::error::Error for OutOfMemory {}
