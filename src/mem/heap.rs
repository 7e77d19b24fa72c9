//! Composable heap layers.
//!
//! Each layer owns its source and adds one concern: recycling, bump
//! allocation, carving pages into fixed cells, zeroing, owner tagging,
//! locking. The layers are generic so a full stack like
//! free-list-over-bump-over-pages monomorphizes into straight-line code.
//!
//! Alignment contract: every layer hands out 8-byte aligned blocks, and
//! blocks must be at least pointer sized so the recycling layers can thread
//! an intrusive list through them.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};

use crate::mem::page;
use crate::mem::OutOfMemory;
use crate::sync::{AtomicPtr, Ordering};
use crate::util::PaddedLock;

/// Alignment every heap guarantees, and the granularity sizes are rounded
/// up to.
pub const MIN_ALIGN: usize = 8;

const fn round_up(size: usize) -> usize {
    (size + MIN_ALIGN - 1) & !(MIN_ALIGN - 1)
}

pub trait Heap {
    /// The one block size this heap serves, or 0 when it serves any size.
    const ALLOC_SIZE: usize;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this same heap with this `size`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize);

    /// Return everything recycling layers are holding to the layer below.
    /// After as many deallocates as allocates, this restores the heap to its
    /// state at construction.
    fn clear(&mut self) {}
}

/// The system malloc, as a heap layer.
#[derive(Default)]
pub struct MallocHeap;

impl Heap for MallocHeap {
    const ALLOC_SIZE: usize = 0;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        NonNull::new(unsafe { libc::malloc(size.max(1)) } as *mut u8).ok_or(OutOfMemory)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _size: usize) {
        libc::free(ptr.as_ptr() as *mut libc::c_void);
    }
}

/// The base source for the scalable stacks: whole pages from the page
/// source.
#[derive(Default)]
pub struct PageHeap;

impl Heap for PageHeap {
    const ALLOC_SIZE: usize = page::HUGE_PAGE_SIZE;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        debug_assert!(size <= Self::ALLOC_SIZE);
        page::page_alloc()
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _size: usize) {
        page::page_free(ptr);
    }
}

struct FreeNode {
    next: *mut FreeNode,
}

/// Recycle deallocated blocks on an intrusive LIFO before going back to the
/// source. All blocks through one instance must share a size.
pub struct FreeListHeap<S: Heap> {
    source: S,
    head: *mut FreeNode,
}

// The intrusive pointers only ever reference blocks this heap owns.
unsafe impl<S: Heap + Send> Send for FreeListHeap<S> {}

impl<S: Heap + Default> Default for FreeListHeap<S> {
    fn default() -> Self {
        FreeListHeap { source: S::default(), head: ptr::null_mut() }
    }
}

impl<S: Heap> Heap for FreeListHeap<S> {
    const ALLOC_SIZE: usize = S::ALLOC_SIZE;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        if !self.head.is_null() {
            let node = self.head;
            self.head = unsafe { (*node).next };
            return Ok(unsafe { NonNull::new_unchecked(node as *mut u8) });
        }
        self.source.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size >= std::mem::size_of::<FreeNode>());
        let node = ptr.as_ptr() as *mut FreeNode;
        (*node).next = self.head;
        self.head = node;
    }

    fn clear(&mut self) {
        while !self.head.is_null() {
            let node = self.head;
            unsafe {
                self.head = (*node).next;
                self.source
                    .deallocate(NonNull::new_unchecked(node as *mut u8), S::ALLOC_SIZE);
            }
        }
        self.source.clear();
    }
}

impl<S: Heap> Drop for FreeListHeap<S> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A shared free-list usable from any thread.
///
/// Both sides take the same thin lock. The original allocate-only locking
/// scheme this is modeled on leaves the successor read racing with a
/// concurrent push; serializing both sides costs nothing measurable here
/// because this heap only sees cross-thread frees, never the hot path.
pub struct SelfLockFreeListHeap<S: Heap> {
    head: AtomicPtr<FreeNode>,
    lock: PaddedLock,
    source: UnsafeCell<S>,
}

unsafe impl<S: Heap + Send> Send for SelfLockFreeListHeap<S> {}
unsafe impl<S: Heap + Send> Sync for SelfLockFreeListHeap<S> {}

impl<S: Heap + Default> Default for SelfLockFreeListHeap<S> {
    fn default() -> Self {
        SelfLockFreeListHeap {
            head: AtomicPtr::new(ptr::null_mut()),
            lock: PaddedLock::new(),
            source: UnsafeCell::new(S::default()),
        }
    }
}

impl<S: Heap> SelfLockFreeListHeap<S> {
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.lock.lock();
        let node = self.head.load(Ordering::Relaxed);
        let result = if node.is_null() {
            unsafe { (*self.source.get()).allocate(size) }
        } else {
            unsafe { self.head.store((*node).next, Ordering::Relaxed) };
            Ok(unsafe { NonNull::new_unchecked(node as *mut u8) })
        };
        self.lock.unlock();
        result
    }

    /// # Safety
    ///
    /// Same contract as [`Heap::deallocate`].
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size >= std::mem::size_of::<FreeNode>());
        let node = ptr.as_ptr() as *mut FreeNode;
        self.lock.lock();
        (*node).next = self.head.load(Ordering::Relaxed);
        self.head.store(node, Ordering::Relaxed);
        self.lock.unlock();
    }

    pub fn clear(&mut self) {
        let mut node = *self.head.get_mut();
        *self.head.get_mut() = ptr::null_mut();
        while !node.is_null() {
            unsafe {
                let next = (*node).next;
                (*self.source.get())
                    .deallocate(NonNull::new_unchecked(node as *mut u8), S::ALLOC_SIZE);
                node = next;
            }
        }
    }
}

impl<S: Heap> Heap for SelfLockFreeListHeap<S> {
    const ALLOC_SIZE: usize = S::ALLOC_SIZE;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        SelfLockFreeListHeap::allocate(&*self, size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        SelfLockFreeListHeap::deallocate(&*self, ptr, size)
    }

    fn clear(&mut self) {
        SelfLockFreeListHeap::clear(self)
    }
}

impl<S: Heap> Drop for SelfLockFreeListHeap<S> {
    fn drop(&mut self) {
        self.clear();
    }
}

// Chain link kept at the start of every page a bump or block heap has
// consumed, so clear() can give them all back.
struct PageLink {
    next: *mut PageLink,
}

const PAGE_LINK: usize = round_up(std::mem::size_of::<PageLink>());

/// Bump allocation through pages of the source heap.
///
/// The offset only ever moves forward within a page; individual deallocation
/// is a no-op and memory comes back via `clear`.
pub struct BumpHeap<S: Heap> {
    source: S,
    head: *mut PageLink,
    offset: usize,
}

unsafe impl<S: Heap + Send> Send for BumpHeap<S> {}

impl<S: Heap + Default> Default for BumpHeap<S> {
    fn default() -> Self {
        BumpHeap { source: S::default(), head: ptr::null_mut(), offset: 0 }
    }
}

impl<S: Heap> BumpHeap<S> {
    fn refill(&mut self) -> Result<(), OutOfMemory> {
        let page = self.source.allocate(S::ALLOC_SIZE)?;
        let link = page.as_ptr() as *mut PageLink;
        unsafe { (*link).next = self.head };
        self.head = link;
        self.offset = PAGE_LINK;
        Ok(())
    }

    #[inline]
    fn bump(&mut self, bytes: usize) -> NonNull<u8> {
        debug_assert!(self.offset + bytes <= S::ALLOC_SIZE);
        let ptr = unsafe { (self.head as *mut u8).add(self.offset) };
        self.offset += bytes;
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Allocate up to `size` bytes, possibly less when the current page is
    /// nearly full. Returns the block and how many bytes of it are usable;
    /// callers streaming large objects call this repeatedly.
    pub fn allocate_partial(&mut self, size: usize) -> Result<(NonNull<u8>, usize), OutOfMemory> {
        let mut aligned = round_up(size).min(S::ALLOC_SIZE - PAGE_LINK);
        if self.head.is_null() || self.offset == S::ALLOC_SIZE {
            self.refill()?;
        }
        aligned = aligned.min(S::ALLOC_SIZE - self.offset);
        let ptr = self.bump(aligned);
        Ok((ptr, aligned.min(size)))
    }
}

impl<S: Heap> Heap for BumpHeap<S> {
    const ALLOC_SIZE: usize = 0;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let aligned = round_up(size);
        if aligned > S::ALLOC_SIZE - PAGE_LINK {
            return Err(OutOfMemory);
        }
        if self.head.is_null() || self.offset + aligned > S::ALLOC_SIZE {
            self.refill()?;
        }
        Ok(self.bump(aligned))
    }

    unsafe fn deallocate(&mut self, _ptr: NonNull<u8>, _size: usize) {}

    fn clear(&mut self) {
        while !self.head.is_null() {
            let link = self.head;
            unsafe {
                self.head = (*link).next;
                self.source
                    .deallocate(NonNull::new_unchecked(link as *mut u8), S::ALLOC_SIZE);
            }
        }
        self.offset = 0;
        self.source.clear();
    }
}

impl<S: Heap> Drop for BumpHeap<S> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A bump heap that routes requests too large for one source page to the
/// system malloc, so the source's page size is never exceeded.
pub struct BumpWithFallbackHeap<S: Heap> {
    bump: BumpHeap<S>,
    fallback_head: *mut PageLink,
}

unsafe impl<S: Heap + Send> Send for BumpWithFallbackHeap<S> {}

impl<S: Heap + Default> Default for BumpWithFallbackHeap<S> {
    fn default() -> Self {
        BumpWithFallbackHeap {
            bump: BumpHeap::default(),
            fallback_head: ptr::null_mut(),
        }
    }
}

impl<S: Heap> Heap for BumpWithFallbackHeap<S> {
    const ALLOC_SIZE: usize = 0;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let aligned = round_up(size);
        if aligned <= S::ALLOC_SIZE - PAGE_LINK {
            return self.bump.allocate(size);
        }

        let raw = unsafe { libc::malloc(PAGE_LINK + aligned) } as *mut u8;
        let link = NonNull::new(raw).ok_or(OutOfMemory)?.as_ptr() as *mut PageLink;
        unsafe {
            (*link).next = self.fallback_head;
            self.fallback_head = link;
            Ok(NonNull::new_unchecked(raw.add(PAGE_LINK)))
        }
    }

    unsafe fn deallocate(&mut self, _ptr: NonNull<u8>, _size: usize) {}

    fn clear(&mut self) {
        self.bump.clear();
        while !self.fallback_head.is_null() {
            let link = self.fallback_head;
            unsafe {
                self.fallback_head = (*link).next;
                libc::free(link as *mut libc::c_void);
            }
        }
    }
}

impl<S: Heap> Drop for BumpWithFallbackHeap<S> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Carve source pages into cells of one compile-time size.
///
/// Deallocation is a no-op; recycling is the job of a `FreeListHeap` on
/// top.
pub struct BlockHeap<const ELEM_SIZE: usize, S: Heap> {
    source: S,
    head: *mut PageLink,
    index: usize,
}

unsafe impl<const ELEM_SIZE: usize, S: Heap + Send> Send for BlockHeap<ELEM_SIZE, S> {}

impl<const ELEM_SIZE: usize, S: Heap> BlockHeap<ELEM_SIZE, S> {
    const STRIDE: usize = round_up(ELEM_SIZE);
    const CELLS: usize = (S::ALLOC_SIZE - PAGE_LINK) / Self::STRIDE;
}

impl<const ELEM_SIZE: usize, S: Heap + Default> Default for BlockHeap<ELEM_SIZE, S> {
    fn default() -> Self {
        BlockHeap { source: S::default(), head: ptr::null_mut(), index: 0 }
    }
}

impl<const ELEM_SIZE: usize, S: Heap> Heap for BlockHeap<ELEM_SIZE, S> {
    const ALLOC_SIZE: usize = ELEM_SIZE;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        debug_assert_eq!(size, ELEM_SIZE);
        if self.head.is_null() || self.index == Self::CELLS {
            let page = self.source.allocate(S::ALLOC_SIZE)?;
            let link = page.as_ptr() as *mut PageLink;
            unsafe { (*link).next = self.head };
            self.head = link;
            self.index = 0;
        }

        let ptr = unsafe {
            (self.head as *mut u8).add(PAGE_LINK + self.index * Self::STRIDE)
        };
        self.index += 1;
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn deallocate(&mut self, _ptr: NonNull<u8>, _size: usize) {}

    fn clear(&mut self) {
        while !self.head.is_null() {
            let link = self.head;
            unsafe {
                self.head = (*link).next;
                self.source
                    .deallocate(NonNull::new_unchecked(link as *mut u8), S::ALLOC_SIZE);
            }
        }
        self.index = 0;
        self.source.clear();
    }
}

impl<const ELEM_SIZE: usize, S: Heap> Drop for BlockHeap<ELEM_SIZE, S> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Make a non-thread-safe heap shareable by wrapping every operation in a
/// mutex.
pub struct LockedHeap<H: Heap> {
    inner: std::sync::Mutex<H>,
}

impl<H: Heap + Default> Default for LockedHeap<H> {
    fn default() -> Self {
        LockedHeap { inner: std::sync::Mutex::new(H::default()) }
    }
}

impl<H: Heap> LockedHeap<H> {
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.inner.lock().unwrap().allocate(size)
    }

    /// # Safety
    ///
    /// Same contract as [`Heap::deallocate`].
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.inner.lock().unwrap().deallocate(ptr, size)
    }
}

impl<H: Heap> Heap for LockedHeap<H> {
    const ALLOC_SIZE: usize = H::ALLOC_SIZE;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.inner.get_mut().unwrap().allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        self.inner.get_mut().unwrap().deallocate(ptr, size)
    }

    fn clear(&mut self) {
        self.inner.get_mut().unwrap().clear()
    }
}

/// Zero every block before handing it out.
#[derive(Default)]
pub struct ZeroHeap<H: Heap> {
    inner: H,
}

impl<H: Heap> Heap for ZeroHeap<H> {
    const ALLOC_SIZE: usize = H::ALLOC_SIZE;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let ptr = self.inner.allocate(size)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        self.inner.deallocate(ptr, size)
    }

    fn clear(&mut self) {
        self.inner.clear()
    }
}

/// Prepend a hidden header recording the owning heap, so `owner(ptr)` can
/// route a block back to where it came from in O(1). The instance must not
/// move while any of its blocks are live.
pub struct OwnerTaggedHeap<S: Heap> {
    source: S,
}

const OWNER_TAG: usize = round_up(std::mem::size_of::<*mut ()>());

impl<S: Heap + Default> Default for OwnerTaggedHeap<S> {
    fn default() -> Self {
        OwnerTaggedHeap { source: S::default() }
    }
}

impl<S: Heap> OwnerTaggedHeap<S> {
    /// The heap a tagged block was allocated from.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `OwnerTaggedHeap::allocate` and still be live.
    pub unsafe fn owner(ptr: NonNull<u8>) -> *mut Self {
        let header = ptr.as_ptr().sub(OWNER_TAG) as *mut *mut Self;
        *header
    }
}

impl<S: Heap> Heap for OwnerTaggedHeap<S> {
    // The tag makes blocks bigger than what the caller asked for, so this
    // layer cannot present a fixed size.
    const ALLOC_SIZE: usize = 0;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let raw = self.source.allocate(size + OWNER_TAG)?;
        unsafe {
            let header = raw.as_ptr() as *mut *mut Self;
            *header = self as *mut Self;
            Ok(NonNull::new_unchecked(raw.as_ptr().add(OWNER_TAG)))
        }
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        debug_assert_eq!(Self::owner(ptr), self as *mut Self);
        let raw = NonNull::new_unchecked(ptr.as_ptr().sub(OWNER_TAG));
        self.source.deallocate(raw, size + OWNER_TAG);
    }

    fn clear(&mut self) {
        self.source.clear()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn free_list_recycles_blocks() {
        let mut heap: FreeListHeap<MallocHeap> = Default::default();

        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        unsafe {
            heap.deallocate(a, 64);
            heap.deallocate(b, 64);
        }

        // LIFO: most recently freed block comes back first.
        assert_eq!(heap.allocate(64).unwrap(), b);
        assert_eq!(heap.allocate(64).unwrap(), a);
        unsafe {
            heap.deallocate(a, 64);
            heap.deallocate(b, 64);
        }
    }

    #[test]
    fn bump_is_monotone_and_aligned() {
        let mut heap: BumpHeap<PageHeap> = Default::default();

        // These all fit in one page, so the offset strictly advances.
        let mut last = 0usize;
        for size in [1, 7, 8, 24, 100, 4096] {
            let ptr = heap.allocate(size).unwrap().as_ptr() as usize;
            assert_eq!(ptr % MIN_ALIGN, 0);
            assert!(ptr > last);
            last = ptr;
        }

        heap.clear();
        // After clear the next allocation starts at a page boundary again.
        let ptr = heap.allocate(8).unwrap().as_ptr() as usize;
        assert_eq!(ptr % page::HUGE_PAGE_SIZE, PAGE_LINK);
    }

    #[test]
    fn bump_rejects_oversized() {
        let mut heap: BumpHeap<PageHeap> = Default::default();
        assert!(heap.allocate(page::HUGE_PAGE_SIZE).is_err());
    }

    #[test]
    fn bump_partial_covers_page_tails() {
        let mut heap: BumpHeap<PageHeap> = Default::default();

        // Walk to near the end of a page, then ask for more than remains.
        let almost = page::HUGE_PAGE_SIZE - PAGE_LINK - 24;
        heap.allocate(almost).unwrap();

        let (_, got) = heap.allocate_partial(1000).unwrap();
        assert_eq!(got, 24);

        // The next partial comes from a fresh page and is served in full.
        let (_, got) = heap.allocate_partial(1000).unwrap();
        assert_eq!(got, 1000);
    }

    #[test]
    fn fallback_takes_oversized_requests() {
        let mut heap: BumpWithFallbackHeap<PageHeap> = Default::default();

        let small = heap.allocate(128).unwrap();
        let large = heap.allocate(3 * page::HUGE_PAGE_SIZE).unwrap();
        unsafe {
            small.as_ptr().write(1);
            large.as_ptr().write(2);
            large.as_ptr().add(3 * page::HUGE_PAGE_SIZE - 1).write(3);
        }
    }

    #[test]
    fn block_heap_hands_out_distinct_cells() {
        let mut heap: BlockHeap<48, PageHeap> = Default::default();

        let mut cells = Vec::new();
        for _ in 0..1000 {
            let ptr = heap.allocate(48).unwrap();
            assert_eq!(ptr.as_ptr() as usize % MIN_ALIGN, 0);
            cells.push(ptr.as_ptr() as usize);
        }
        cells.sort_unstable();
        cells.dedup();
        assert_eq!(cells.len(), 1000);
    }

    #[test]
    fn zero_heap_zeroes() {
        let mut heap: ZeroHeap<BumpHeap<PageHeap>> = Default::default();
        let ptr = heap.allocate(256).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn owner_tag_round_trips() {
        let mut heap: OwnerTaggedHeap<MallocHeap> = Default::default();
        let expected = &mut heap as *mut OwnerTaggedHeap<MallocHeap>;

        let a = heap.allocate(32).unwrap();
        let b = heap.allocate(1024).unwrap();
        unsafe {
            assert_eq!(OwnerTaggedHeap::<MallocHeap>::owner(a), expected);
            assert_eq!(OwnerTaggedHeap::<MallocHeap>::owner(b), expected);
            heap.deallocate(a, 32);
            heap.deallocate(b, 1024);
        }
    }

    #[test]
    fn locked_heap_shares_a_bump_stack() {
        let heap: LockedHeap<BumpHeap<PageHeap>> = Default::default();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let ptr = heap.allocate(64).unwrap();
                        unsafe { ptr.as_ptr().write(0x11) };
                    }
                });
            }
        });
    }

    #[test]
    fn self_lock_free_list_is_shareable() {
        let heap: SelfLockFreeListHeap<MallocHeap> = Default::default();

        // Seed some blocks.
        let seed: Vec<_> = (0..16).map(|_| heap.allocate(64).unwrap()).collect();
        for ptr in seed {
            unsafe { heap.deallocate(ptr, 64) };
        }

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        let ptr = heap.allocate(64).unwrap();
                        unsafe {
                            ptr.as_ptr().write(0x5a);
                            heap.deallocate(ptr, 64);
                        }
                    }
                });
            }
        });
    }

    #[test]
    fn clear_restores_construction_state() {
        let mut heap: FreeListHeap<BumpHeap<PageHeap>> = Default::default();

        let ptrs: Vec<_> = (0..64).map(|_| heap.allocate(512).unwrap()).collect();
        let mapped = page::pages_allocated_by_current_thread();
        for ptr in ptrs {
            unsafe { heap.deallocate(ptr, 512) };
        }
        heap.clear();

        // Pages went back to the thread stash, so a rebuilt stack maps
        // nothing new.
        let mut again: FreeListHeap<BumpHeap<PageHeap>> = Default::default();
        let _ = again.allocate(512).unwrap();
        assert_eq!(page::pages_allocated_by_current_thread(), mapped);
    }
}
