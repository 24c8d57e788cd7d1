//! Size-classed, thread-caching allocator for a host runtime with
//! speculative parallelism. User chunks come from a *tracked* region the
//! speculation substrate watches; all allocator metadata lives in an
//! *untracked* region it cannot see. Both regions sit at fixed virtual
//! addresses agreed with the host and only ever grow.
//!
//! Allocation tiers: a per-thread cache serves the fast path, refilled in
//! bulk from per-class central freelists, which in turn bump-allocate from
//! the system arena. Requests above the largest size class bypass all of it
//! and go to a best-fit coalescing large heap. No chunk carries a header; a
//! page-indexed size map recovers the class on free.
#![allow(clippy::missing_safety_doc, clippy::new_without_default)]

#[macro_use]
pub mod hooks;

pub mod allocator;
pub mod central;
pub mod defs;
pub mod deque;
pub mod large;
pub mod malloc;
pub mod mmap;
pub mod mutex;

use core::mem::size_of;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use cfg_if::cfg_if;
use parking_lot::lock_api::RawMutex;

use crate::defs::*;
use crate::deque::{BlockedDeque, DQBLOCK_SIZE};
use crate::large::LargeHeap;
use crate::mutex::TicketLock;

cfg_if! {
    if #[cfg(feature = "banked")] {
        pub const CENTRAL_FREE_LIST_BANKS: usize = 4;
        pub type CentralFreeListType = central::BankedCentralFreeList<CENTRAL_FREE_LIST_BANKS>;
    } else {
        pub type CentralFreeListType = central::CentralFreeList;
    }
}

/// Per-thread tier: one deque per class plus a byte count of everything the
/// cache owns. Never shared across threads; on its own cache line so
/// neighboring slots don't false-share.
#[repr(C, align(64))]
pub struct ThreadCache {
    cache_size: usize,
    class_lists: [BlockedDeque<*mut u8>; NUM_SIZE_CLASSES],
}

impl ThreadCache {
    pub const fn new() -> Self {
        ThreadCache {
            cache_size: 0,
            class_lists: [BlockedDeque::NEW; NUM_SIZE_CLASSES],
        }
    }

    #[inline]
    pub fn size(&self, cl: usize) -> u64 {
        self.class_lists[cl].size()
    }

    #[inline]
    pub unsafe fn alloc(&mut self, cl: usize) -> *mut u8 {
        if self.class_lists[cl].empty() {
            (*state()).class_lists[cl].bulk_alloc(&mut self.class_lists[cl]);
            self.cache_size += class_to_size(cl) * self.class_lists[cl].size() as usize;
        }
        let res = self.class_lists[cl].dequeue_back();
        self.cache_size -= class_to_size(cl);
        res
    }

    pub unsafe fn dealloc(&mut self, p: *mut u8, cl: usize) {
        self.class_lists[cl].push_back(p);
        self.cache_size += class_to_size(cl);

        // NOTE: Walking all 255 classes costs ~10K cycles and blows up the
        // L1, but collections are rare enough that it doesn't matter.
        // Remembering the used classes in a bitset halves the worst case yet
        // slows down every bulk_alloc and dealloc slightly, a bad trade.
        if self.cache_size > MAX_THREAD_CACHE_SIZE {
            // Donate ~half of the cache to the central freelists
            for cl in 1..NUM_SIZE_CLASSES {
                let elems = self.class_lists[cl].size() as usize;
                if elems == 0 {
                    continue;
                }
                let elems_to_donate = (elems + 1) / 2;
                (*state()).class_lists[cl].bulk_dealloc(&mut self.class_lists[cl], elems_to_donate);
                self.cache_size -=
                    (elems - self.class_lists[cl].size() as usize) * class_to_size(cl);
            }
        }
    }
}

#[repr(C, align(64))]
pub struct LineAligned<T>(pub T);

/// All process-global allocator state, constructed in place at the start of
/// the untracked region so the host can find it at a known address.
#[repr(C, align(64))]
pub struct AllocState {
    class_lists: [CentralFreeListType; NUM_SIZE_CLASSES],
    large_heap: LargeHeap,
    thread_caches: [ThreadCache; MAX_THREADS],

    /// Read unlocked by valid_chunk; published with release ordering after
    /// the size-map writes of the same arena grant.
    tracked_bump: AtomicUsize,
    tracked_end: usize,

    sizemap_bump: usize,
    sizemap_end: usize,

    sys_alloc_lock: LineAligned<TicketLock>,
}

#[inline]
pub fn state() -> *mut AllocState {
    UNTRACKED_BASE as *mut AllocState
}

/// One byte per tracked page, holding the page's class id (0 = large heap).
/// Written only under the arena lock, read unlocked by do_dealloc.
#[inline]
fn sizemap() -> *mut u8 {
    (UNTRACKED_BASE + size_of::<AllocState>()) as *mut u8
}

/// Class of the chunk containing `p`. `p` must lie in the tracked region.
#[inline]
pub unsafe fn chunk_to_class(p: *const u8) -> u8 {
    *sizemap().add((p as usize - TRACKED_BASE) >> PAGE_BITS)
}

/* Initialization (delicate...) */

// The loader runs constructors in whatever order it likes, and some of them
// allocate; do_alloc checks this guard so the first allocation initializes,
// whoever makes it. Three states: 0 untouched, 1 under construction, 2 ready.
static INIT_STATE: AtomicU8 = AtomicU8::new(0);
const READY: u8 = 2;

#[cfg(test)]
pub(crate) static SYS_ALLOC_CALLS: core::sync::atomic::AtomicU64 =
    core::sync::atomic::AtomicU64::new(0);

/// Idempotent; safe to call from several threads racing their first
/// allocation. Everything is placement-constructed into freshly mapped
/// untracked memory; nothing here may allocate except through the mappings.
pub fn ensure_init() {
    match INIT_STATE.compare_exchange(0, 1, Ordering::Acquire, Ordering::Acquire) {
        Ok(_) => {}
        Err(READY) => return,
        Err(_) => {
            while INIT_STATE.load(Ordering::Acquire) != READY {
                core::hint::spin_loop();
            }
            return;
        }
    }

    unsafe {
        let sz = ((size_of::<AllocState>() + SUPERPAGE_SIZE) >> SUPERPAGE_BITS) << SUPERPAGE_BITS;
        mmap::map_fixed(UNTRACKED_BASE, sz);

        // The state exists now but holds only mmap zeroes; construct every
        // member in place, field by field.
        let gs = state();
        addr_of_mut!((*gs).tracked_bump).write(AtomicUsize::new(TRACKED_BASE));
        addr_of_mut!((*gs).tracked_end).write(TRACKED_BASE);
        addr_of_mut!((*gs).sizemap_bump).write(sizemap() as usize);
        addr_of_mut!((*gs).sizemap_end).write(UNTRACKED_BASE + sz);

        for cl in 1..NUM_SIZE_CLASSES {
            let elems_per_fetch =
                (FETCH_TARGET_SIZE / class_to_size(cl)).clamp(2, DQBLOCK_SIZE as usize) as u32;
            addr_of_mut!((*gs).class_lists[cl])
                .write(CentralFreeListType::new(class_to_size(cl) as u32, elems_per_fetch));
        }
        addr_of_mut!((*gs).class_lists[0]).write(CentralFreeListType::new(0, 0));
        addr_of_mut!((*gs).large_heap).write(LargeHeap::new());

        for tid in 0..MAX_THREADS {
            addr_of_mut!((*gs).thread_caches[tid]).write(ThreadCache::new());
        }

        addr_of_mut!((*gs).sys_alloc_lock).write(LineAligned(TicketLock::new()));
    }

    INIT_STATE.store(READY, Ordering::Release);
}

/* System alloc and sizemap management */

fn extend_region(end: &mut usize, bump: usize, region_base: usize) {
    let mmap_sz = round_up((bump - *end) as u64, SUPERPAGE_SIZE as u64) as usize;
    if *end + mmap_sz > region_base + REGION_SPAN {
        fatal!("region at {:#x} oversubscribed past {} GB", region_base, REGION_SPAN / GB);
    }
    unsafe { mmap::map_fixed(*end, mmap_sz) };
    *end += mmap_sz;
    debug_assert!(*end >= bump);
}

/// Reserves `chunk_size` bytes (rounded up to whole pages, at least 32 of
/// them) of tracked memory plus the matching size-map bytes, tagging the
/// map with the request's class. Returns the reserved [start, end) range.
pub unsafe fn sys_alloc(chunk_size: usize) -> (*mut u8, *mut u8) {
    let min_pages = size_to_pages(chunk_size);
    let pages = min_pages.max(MIN_SYSALLOC_PAGES);
    let alloc_size = pages << PAGE_BITS;
    debug_assert!(alloc_size >= chunk_size);

    let gs = &mut *state();
    gs.sys_alloc_lock.0.lock();
    #[cfg(test)]
    SYS_ALLOC_CALLS.fetch_add(1, Ordering::Relaxed);

    // Grab tracked memory
    let alloc = gs.tracked_bump.load(Ordering::Relaxed);
    let bump = alloc + alloc_size;
    if bump > gs.tracked_end {
        extend_region(&mut gs.tracked_end, bump, TRACKED_BASE);
    }

    // Grab sizemap memory, one byte per page
    gs.sizemap_bump += pages;
    if gs.sizemap_bump > gs.sizemap_end {
        extend_region(&mut gs.sizemap_end, gs.sizemap_bump, UNTRACKED_BASE);
    }

    // Tag the map for small allocs. Large-alloc pages keep class 0, which
    // the fresh zeroed mapping already says.
    if !is_large_alloc(chunk_size) {
        let cl = size_to_class(chunk_size) as u8;
        let base = (alloc - TRACKED_BASE) >> PAGE_BITS;
        for page in 0..pages {
            *sizemap().add(base + page) = cl;
        }
    }

    // Publish after the sizemap writes: an unlocked reader that sees the new
    // bump must also see the map entries for everything below it.
    gs.tracked_bump.store(bump, Ordering::Release);
    gs.sys_alloc_lock.0.unlock();

    #[cfg(feature = "trace")]
    log::trace!("sys_alloc({}) -> {:#x}..{:#x}", chunk_size, alloc, alloc + alloc_size);
    (alloc as *mut u8, (alloc + alloc_size) as *mut u8)
}

/* Internal alloc interface. The external surfaces use only these four.
 * do_dealloc and chunk_size assume the pointer is valid; external callers
 * must first check with valid_chunk.
 */

pub unsafe fn do_alloc(chunk_size: usize) -> *mut u8 {
    // Ensure initialization if other inits (constructors) fire before ours
    if INIT_STATE.load(Ordering::Acquire) != READY {
        ensure_init();
    }
    debug_assert!(chunk_size > 0);
    if !is_large_alloc(chunk_size) {
        let cl = size_to_class(chunk_size);
        let tid = hooks::sys_thread_id() as usize;
        debug_assert!(tid < MAX_THREADS);
        (*state()).thread_caches[tid].alloc(cl)
    } else {
        let sz = (chunk_size + CLASS_QUANTUM - 1) & !(CLASS_QUANTUM - 1);
        (*state()).large_heap.alloc(sz)
    }
}

pub unsafe fn do_dealloc(p: *mut u8) {
    if p.is_null() {
        return;
    }
    let cl = chunk_to_class(p);
    if cl != 0 {
        let tid = hooks::sys_thread_id() as usize;
        (*state()).thread_caches[tid].dealloc(p, cl as usize);
    } else {
        // large-heap-managed chunks have class 0
        (*state()).large_heap.dealloc(p);
    }
}

pub unsafe fn chunk_size(p: *const u8) -> usize {
    let cl = chunk_to_class(p);
    if cl != 0 {
        class_to_size(cl as usize)
    } else {
        (*state()).large_heap.chunk_to_size_noassert(p)
    }
}

/// Whether `p` points into memory this allocator has ever handed out. The
/// bump read pairs with the release publication in sys_alloc.
pub unsafe fn valid_chunk(p: *const u8) -> bool {
    if INIT_STATE.load(Ordering::Acquire) != READY {
        ensure_init();
    }
    let ptr = p as usize;
    ptr >= TRACKED_BASE && ptr <= (*state()).tracked_bump.load(Ordering::Acquire)
}
