//! Central freelists: one per size class (or one per bank per class), shared
//! by every thread cache. Each list owns a bump window handed out by
//! sys_alloc, a deque of returned chunks, and its own ticket lock; the bulk
//! operations move whole deque blocks so a cache refill or donation costs one
//! lock acquisition, not one per chunk.

use core::ptr::null_mut;

use parking_lot::lock_api::RawMutex;

use crate::deque::{BlockedDeque, DQBLOCK_SIZE};
use crate::hooks;
use crate::mutex::TicketLock;
use crate::sys_alloc;

#[repr(C, align(64))]
pub struct CentralFreeList {
    chunk_size: u32,
    elems_per_fetch: u32,
    free_chunks: BlockedDeque<*mut u8>,
    bump_start: *mut u8,
    bump_end: *mut u8,
    lock: TicketLock,
}

impl CentralFreeList {
    pub const fn new(chunk_size: u32, elems_per_fetch: u32) -> Self {
        CentralFreeList {
            chunk_size,
            elems_per_fetch,
            free_chunks: BlockedDeque::NEW,
            bump_start: null_mut(),
            bump_end: null_mut(),
            lock: TicketLock::new(),
        }
    }

    pub unsafe fn alloc(&mut self) -> *mut u8 {
        let cs = self.chunk_size as usize;
        self.lock.lock();
        if !self.free_chunks.empty() {
            let res = self.free_chunks.dequeue_back();
            self.lock.unlock();
            return res;
        }
        if self.bump_start as usize + cs > self.bump_end as usize {
            let (start, end) = sys_alloc(cs);
            self.bump_start = start;
            self.bump_end = end;
        }
        let res = self.bump_start;
        self.bump_start = self.bump_start.add(cs);
        debug_assert!(self.bump_start <= self.bump_end);
        self.lock.unlock();
        res
    }

    pub unsafe fn dealloc(&mut self, p: *mut u8) {
        self.lock.lock();
        self.free_chunks.push_back(p);
        self.lock.unlock();
    }

    /// Transfers up to `elems_per_fetch` chunks into `dst`.
    pub unsafe fn bulk_alloc(&mut self, dst: &mut BlockedDeque<*mut u8>) {
        let cs = self.chunk_size as usize;
        let epf = self.elems_per_fetch as usize;
        self.lock.lock();
        #[cfg(feature = "trace")]
        log::trace!(
            "bulk_alloc cs {} epf {} free {}",
            cs,
            epf,
            self.free_chunks.size()
        );

        // Grab from free_chunks ONLY if the whole fetch can be satisfied.
        // Otherwise, let free_chunks grow from deallocs first.
        if self.free_chunks.size() >= epf as u64 {
            if epf as u64 >= DQBLOCK_SIZE {
                self.free_chunks.steal_front(dst);
            } else {
                for _ in 0..epf {
                    dst.push_back(self.free_chunks.dequeue_back());
                }
            }
            self.lock.unlock();
            return;
        }

        // Fallthrough path: allocate from the bump window, refreshing it from
        // the system arena if a single chunk no longer fits. If the window
        // runs short of a full fetch, satisfy only what fits; partial fetches
        // are rare and acceptable.
        if self.bump_start as usize + cs > self.bump_end as usize {
            let (start, end) = sys_alloc(cs);
            self.bump_start = start;
            self.bump_end = end;
        }
        let start = self.bump_start as usize;
        let mut end = self.bump_end as usize;
        self.bump_start = (start + cs * epf).min(end) as *mut u8;
        self.lock.unlock(); // no need to hold it while filling dst

        if end - start > cs * epf {
            end = start + cs * epf;
        } else {
            let avail_elems = (end - start) / cs;
            end = start + cs * avail_elems;
        }

        let mut cur = start;
        while cur < end {
            dst.push_back(cur as *mut u8);
            cur += cs;
        }
    }

    /// Returns `elems` chunks from the front (cold end) of `src`.
    pub unsafe fn bulk_dealloc(&mut self, src: &mut BlockedDeque<*mut u8>, elems: usize) {
        #[cfg(feature = "trace")]
        log::trace!(
            "bulk_dealloc cs {} elems {} src {}",
            self.chunk_size,
            elems,
            src.size()
        );
        if elems as u64 >= DQBLOCK_SIZE {
            // Move entire blocks front-to-front (fronts are always aligned).
            // The source is spliced outside the critical section.
            let blocks = elems / DQBLOCK_SIZE as usize;
            let spliced = src.splice_front(blocks);
            self.lock.lock();
            self.free_chunks.merge_front(spliced);
            self.lock.unlock();
        } else {
            // Move single elems back-to-back
            self.lock.lock();
            for _ in 0..elems {
                self.free_chunks.push_back(src.dequeue_back());
            }
            self.lock.unlock();
        }
    }
}

/// N sibling freelists per class, one picked per operation by a fresh random
/// draw. Cuts lock contention at the cost of up to N bump windows of reserved
/// capacity per class.
#[repr(C)]
pub struct BankedCentralFreeList<const NB: usize> {
    banks: [CentralFreeList; NB],
}

impl<const NB: usize> BankedCentralFreeList<NB> {
    pub fn new(chunk_size: u32, elems_per_fetch: u32) -> Self {
        BankedCentralFreeList {
            banks: core::array::from_fn(|_| CentralFreeList::new(chunk_size, elems_per_fetch)),
        }
    }

    #[inline]
    fn rb(&self) -> usize {
        (hooks::random_u64() % NB as u64) as usize
    }

    #[inline]
    pub unsafe fn alloc(&mut self) -> *mut u8 {
        let b = self.rb();
        self.banks[b].alloc()
    }

    #[inline]
    pub unsafe fn dealloc(&mut self, p: *mut u8) {
        let b = self.rb();
        self.banks[b].dealloc(p)
    }

    #[inline]
    pub unsafe fn bulk_alloc(&mut self, dst: &mut BlockedDeque<*mut u8>) {
        let b = self.rb();
        self.banks[b].bulk_alloc(dst)
    }

    #[inline]
    pub unsafe fn bulk_dealloc(&mut self, src: &mut BlockedDeque<*mut u8>, elems: usize) {
        let b = self.rb();
        self.banks[b].bulk_dealloc(src, elems)
    }
}
