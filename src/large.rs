//! Manages all large-alloc (class 0) pages. Aims for compact storage by
//! merging neighboring free chunks aggressively: `chunk_sizes` records every
//! known chunk (live or free) by start address, `free_chunk_sets` buckets the
//! free ones by exact length. A chunk is in at most one bucket, and a free
//! chunk never has a free neighbor.

use std::collections::BTreeMap;
use std::hash::{BuildHasherDefault, Hasher};

use indexmap::IndexSet;
use parking_lot::lock_api::RawMutex;

use crate::mutex::TicketLock;
use crate::sys_alloc;

// Chunk addresses hash to themselves; anything stronger is wasted work.
#[derive(Clone, Copy, Debug, Default)]
struct AddrHasher(u64);

impl Hasher for AddrHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 = (self.0 << 8) ^ (byte as u64);
        }
    }

    fn write_u64(&mut self, value: u64) {
        self.0 ^= value;
    }

    fn write_usize(&mut self, value: usize) {
        self.0 ^= value as u64;
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

type BuildAddrHasher = BuildHasherDefault<AddrHasher>;
type AddrSet = IndexSet<usize, BuildAddrHasher>;

#[repr(C, align(64))]
pub struct LargeHeap {
    free_chunk_sets: BTreeMap<usize, AddrSet>,
    chunk_sizes: BTreeMap<usize, usize>,
    lock: TicketLock,
}

impl LargeHeap {
    pub const fn new() -> Self {
        LargeHeap {
            free_chunk_sets: BTreeMap::new(),
            chunk_sizes: BTreeMap::new(),
            lock: TicketLock::new(),
        }
    }

    /// Best-fit allocation: the smallest free chunk that holds `chunk_size`,
    /// or a fresh arena range if none does. Any excess is re-entered as a
    /// free chunk.
    pub unsafe fn alloc(&mut self, chunk_size: usize) -> *mut u8 {
        self.lock.lock();
        let fit = self
            .free_chunk_sets
            .range_mut(chunk_size..)
            .next()
            .map(|(&sz, set)| (sz, set.pop().unwrap()));

        let (start, end) = match fit {
            None => {
                #[cfg(feature = "trace")]
                log::trace!("large: sys_alloc for {}", chunk_size);
                let (s, e) = sys_alloc(chunk_size);
                (s as usize, e as usize)
            }
            Some((sz, addr)) => {
                #[cfg(feature = "trace")]
                log::trace!("large: set[{}] serves {}", sz, chunk_size);
                if self.free_chunk_sets[&sz].is_empty() {
                    self.free_chunk_sets.remove(&sz);
                }
                (addr, addr + sz)
            }
        };
        self.chunk_sizes.insert(start, chunk_size);

        let left = start + chunk_size;
        let remaining = end - left;
        if remaining != 0 {
            self.chunk_sizes.insert(left, remaining);
            self.unlocked_dealloc(left as *mut u8);
        }
        self.lock.unlock();
        start as *mut u8
    }

    pub unsafe fn dealloc(&mut self, p: *mut u8) {
        self.lock.lock();
        self.unlocked_dealloc(p);
        self.lock.unlock();
    }

    /// The only guarantee at this point is that `chunk` isn't invalid memory;
    /// a task may hold a stale pointer to a chunk that no longer exists.
    /// Returns 0 in that case instead of tripping the invalid-free path.
    pub unsafe fn chunk_to_size_noassert(&mut self, chunk: *const u8) -> usize {
        self.lock.lock();
        let size = self.chunk_sizes.get(&(chunk as usize)).copied().unwrap_or(0);
        self.lock.unlock();
        size
    }

    unsafe fn unlocked_dealloc(&mut self, p: *mut u8) {
        let mut chunk = p as usize;
        let mut chunk_size = match self.chunk_sizes.get(&chunk) {
            Some(&sz) => sz,
            None => fatal!(
                "LargeHeap::dealloc: {:p} is not a tracked chunk (app code is likely broken)",
                p
            ),
        };

        // Try to merge with the previous chunk
        let prev_entry = self
            .chunk_sizes
            .range(..chunk)
            .next_back()
            .map(|(&a, &s)| (a, s));
        if let Some((prev, prev_size)) = prev_entry {
            if prev + prev_size == chunk && self.remove_free(prev, prev_size) {
                #[cfg(feature = "trace")]
                log::trace!(
                    "large: merge prev {:#x} {} -> {:#x} {}",
                    chunk,
                    chunk_size,
                    prev,
                    chunk_size + prev_size
                );
                self.chunk_sizes.remove(&chunk);
                chunk = prev;
                chunk_size += prev_size;
                *self.chunk_sizes.get_mut(&chunk).unwrap() = chunk_size;
            }
        }

        // Try to merge with the next chunk
        let next_entry = self
            .chunk_sizes
            .range(chunk + 1..)
            .next()
            .map(|(&a, &s)| (a, s));
        if let Some((next, next_size)) = next_entry {
            if chunk + chunk_size == next && self.remove_free(next, next_size) {
                #[cfg(feature = "trace")]
                log::trace!("large: merge next {:#x} {} +{}", chunk, chunk_size, next_size);
                self.chunk_sizes.remove(&next);
                chunk_size += next_size;
                *self.chunk_sizes.get_mut(&chunk).unwrap() = chunk_size;
            }
        }

        // Merging is eager, so nothing else can merge now; bucket the result.
        self.free_chunk_sets
            .entry(chunk_size)
            .or_default()
            .insert(chunk);
    }

    /// Removes `chunk` from the free bucket of `size` if it is free there.
    fn remove_free(&mut self, chunk: usize, size: usize) -> bool {
        match self.free_chunk_sets.get_mut(&size) {
            Some(set) => {
                let was_free = set.swap_remove(&chunk);
                if was_free && set.is_empty() {
                    self.free_chunk_sets.remove(&size);
                }
                was_free
            }
            None => false,
        }
    }
}
