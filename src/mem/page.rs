//! The page source: large aligned slabs of memory, handed out per thread.
//!
//! Pages are 2 MiB and aligned to their size. Each thread keeps a stash of
//! pages it released, and serves new requests from the stash before asking
//! the OS. Huge-page mappings are attempted once and silently given up on if
//! the kernel refuses them; everything behaves the same on ordinary pages,
//! just with more TLB pressure.
//!
//! Pages never move between threads and are only returned to the OS when the
//! owning thread exits.

use std::cell::RefCell;
use std::ptr::NonNull;

use crate::mem::OutOfMemory;
use crate::sync::{AtomicBool, AtomicUsize, Ordering};

pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

static TOTAL_PAGES: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static STASH: RefCell<PageStash> = RefCell::new(PageStash {
        free: Vec::new(),
        mapped: 0,
        #[cfg(test)]
        budget: None,
    });
}

struct PageStash {
    free: Vec<NonNull<u8>>,
    mapped: usize,
    // Test hook: how many more pages this thread may obtain before the
    // source reports OutOfMemory.
    #[cfg(test)]
    budget: Option<usize>,
}

impl Drop for PageStash {
    fn drop(&mut self) {
        for page in self.free.drain(..) {
            unsafe { os_unmap(page.as_ptr(), HUGE_PAGE_SIZE) };
        }
    }
}

/// Get one page, aligned to `HUGE_PAGE_SIZE`.
pub fn page_alloc() -> Result<NonNull<u8>, OutOfMemory> {
    STASH.with(|stash| {
        let mut stash = stash.borrow_mut();

        #[cfg(test)]
        if let Some(budget) = stash.budget.as_mut() {
            if *budget == 0 {
                return Err(OutOfMemory);
            }
            *budget -= 1;
        }

        if let Some(page) = stash.free.pop() {
            return Ok(page);
        }

        profiling::scope!("page_alloc(os)");
        let page = os_map_page().ok_or(OutOfMemory)?;
        stash.mapped += 1;
        TOTAL_PAGES.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    })
}

/// Return a page to the calling thread's stash. The page stays mapped.
pub fn page_free(page: NonNull<u8>) {
    debug_assert_eq!(page.as_ptr() as usize % HUGE_PAGE_SIZE, 0);
    STASH.with(|stash| stash.borrow_mut().free.push(page));
}

/// Map `n` pages up front into the calling thread's stash, so a parallel
/// phase doesn't pay first-touch costs.
pub fn preallocate_pages(n: usize) -> Result<(), OutOfMemory> {
    for _ in 0..n {
        let page = page_alloc()?;
        page_free(page);
    }
    Ok(())
}

/// Total pages mapped by the process so far.
pub fn pages_allocated() -> usize {
    TOTAL_PAGES.load(Ordering::Relaxed)
}

/// Pages mapped by the calling thread so far.
pub fn pages_allocated_by_current_thread() -> usize {
    STASH.with(|stash| stash.borrow().mapped)
}

#[cfg(test)]
pub(crate) fn set_page_budget(budget: Option<usize>) {
    STASH.with(|stash| stash.borrow_mut().budget = budget);
}

/// Touch every page of `[ptr, ptr + len)` at the given stride to force
/// residency.
pub fn page_in(ptr: *mut u8, len: usize, stride: usize) {
    assert!(stride > 0);
    let mut offset = 0;
    while offset < len {
        unsafe {
            let p = ptr.add(offset);
            std::ptr::write_volatile(p, std::ptr::read_volatile(p));
        }
        offset += stride;
    }
}

/// Read-only variant of [`page_in`], usable on write-protected mappings.
pub fn page_in_read_only(ptr: *const u8, len: usize, stride: usize) {
    assert!(stride > 0);
    let mut offset = 0;
    while offset < len {
        unsafe {
            std::ptr::read_volatile(ptr.add(offset));
        }
        offset += stride;
    }
}

/// Allocate a block whose physical pages are bound round-robin over NUMA
/// nodes: over the first `num_sockets` nodes, or over every node when
/// `None`. Without NUMA support this is an ordinary mapping.
pub fn interleaved_alloc(bytes: usize, num_sockets: Option<u32>) -> Result<NonNull<u8>, OutOfMemory> {
    let bytes = round_up(bytes.max(1), page_size());
    let ptr = unsafe { os_map(bytes) }.ok_or(OutOfMemory)?;

    #[cfg(target_os = "linux")]
    unsafe {
        bind_interleaved(ptr.as_ptr(), bytes, num_sockets);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = num_sockets;

    Ok(ptr)
}

pub fn interleaved_free(ptr: NonNull<u8>, bytes: usize) {
    let bytes = round_up(bytes.max(1), page_size());
    unsafe { os_unmap(ptr.as_ptr(), bytes) };
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

// ---------------------------------------------------------------------------
// OS mapping
// ---------------------------------------------------------------------------

static HUGE_PAGES_BROKEN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
fn os_map_page() -> Option<NonNull<u8>> {
    #[cfg(target_os = "linux")]
    if !HUGE_PAGES_BROKEN.load(Ordering::Relaxed) {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                HUGE_PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if ptr != libc::MAP_FAILED {
            return NonNull::new(ptr as *mut u8);
        }
        HUGE_PAGES_BROKEN.store(true, Ordering::Relaxed);
    }

    // Ordinary pages; mmap only guarantees page alignment, so over-map and
    // trim down to a HUGE_PAGE_SIZE-aligned window.
    unsafe {
        let span = HUGE_PAGE_SIZE * 2;
        let raw = os_map(span)?.as_ptr();

        let addr = raw as usize;
        let aligned = round_up(addr, HUGE_PAGE_SIZE);
        let head = aligned - addr;
        let tail = span - head - HUGE_PAGE_SIZE;

        if head > 0 {
            libc::munmap(raw as *mut libc::c_void, head);
        }
        if tail > 0 {
            libc::munmap((aligned + HUGE_PAGE_SIZE) as *mut libc::c_void, tail);
        }

        NonNull::new(aligned as *mut u8)
    }
}

#[cfg(unix)]
unsafe fn os_map(size: usize) -> Option<NonNull<u8>> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr as *mut u8)
    }
}

#[cfg(unix)]
unsafe fn os_unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

#[cfg(not(unix))]
fn os_map_page() -> Option<NonNull<u8>> {
    unsafe { os_map(HUGE_PAGE_SIZE) }
}

#[cfg(not(unix))]
unsafe fn os_map(size: usize) -> Option<NonNull<u8>> {
    let layout = std::alloc::Layout::from_size_align(size, HUGE_PAGE_SIZE).ok()?;
    NonNull::new(std::alloc::alloc_zeroed(layout))
}

#[cfg(not(unix))]
unsafe fn os_unmap(ptr: *mut u8, size: usize) {
    let layout = std::alloc::Layout::from_size_align(size, HUGE_PAGE_SIZE).unwrap();
    std::alloc::dealloc(ptr, layout);
}

#[cfg(target_os = "linux")]
unsafe fn bind_interleaved(ptr: *mut u8, len: usize, num_sockets: Option<u32>) {
    const MPOL_INTERLEAVE: libc::c_long = 3;

    let nodes = num_sockets.unwrap_or(64).min(64);
    let mask: u64 = if nodes >= 64 { !0 } else { (1u64 << nodes) - 1 };

    // Best effort: on kernels or machines without NUMA the call fails and
    // the mapping keeps its default (first-touch) policy.
    libc::syscall(
        libc::SYS_mbind,
        ptr as *mut libc::c_void,
        len as libc::c_ulong,
        MPOL_INTERLEAVE,
        &mask as *const u64,
        65 as libc::c_ulong,
        0 as libc::c_uint,
    );
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn pages_are_aligned_and_reused() {
        let a = page_alloc().unwrap();
        assert_eq!(a.as_ptr() as usize % HUGE_PAGE_SIZE, 0);

        page_free(a);
        let b = page_alloc().unwrap();
        // The stash serves the most recently freed page first.
        assert_eq!(a, b);
        page_free(b);
    }

    #[test]
    fn pages_are_writable_end_to_end() {
        let page = page_alloc().unwrap();
        unsafe {
            page.as_ptr().write(0xab);
            page.as_ptr().add(HUGE_PAGE_SIZE - 1).write(0xcd);
            assert_eq!(page.as_ptr().read(), 0xab);
            assert_eq!(page.as_ptr().add(HUGE_PAGE_SIZE - 1).read(), 0xcd);
        }
        page_in(page.as_ptr(), HUGE_PAGE_SIZE, 4096);
        page_in_read_only(page.as_ptr(), HUGE_PAGE_SIZE, 4096);
        page_free(page);
    }

    #[test]
    fn preallocation_counts_pages() {
        std::thread::spawn(|| {
            assert_eq!(pages_allocated_by_current_thread(), 0);
            preallocate_pages(3).unwrap();
            assert_eq!(pages_allocated_by_current_thread(), 3);
            // Stashed pages are handed back out without new mappings.
            let p = page_alloc().unwrap();
            assert_eq!(pages_allocated_by_current_thread(), 3);
            page_free(p);
        })
        .join()
        .unwrap();
        assert!(pages_allocated() >= 3);
    }

    #[test]
    fn budget_surfaces_oom() {
        std::thread::spawn(|| {
            set_page_budget(Some(2));
            let a = page_alloc().unwrap();
            let b = page_alloc().unwrap();
            assert_eq!(page_alloc(), Err(OutOfMemory));

            // The budget gates the source itself, stashed pages included.
            page_free(a);
            assert_eq!(page_alloc(), Err(OutOfMemory));

            set_page_budget(None);
            let c = page_alloc().unwrap();
            page_free(b);
            page_free(c);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn interleaved_mapping_round_trips() {
        let bytes = 3 * 4096 + 17;
        let ptr = interleaved_alloc(bytes, Some(2)).unwrap();
        page_in(ptr.as_ptr(), bytes, 4096);
        interleaved_free(ptr, bytes);

        let ptr = interleaved_alloc(4096, None).unwrap();
        interleaved_free(ptr, 4096);
    }
}
