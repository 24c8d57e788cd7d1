//! Blocked deque used for the alloc freelists: a doubly linked list of
//! 32-slot blocks plus two monotonically-moving 64-bit positions. Bulk moves
//! (steal/splice/merge) shuffle whole blocks between deques without copying
//! elements, which is what makes thread-cache <-> central-list transfers
//! cheap.
//!
//! Blocks live in untracked memory via the host hooks and are owned by
//! exactly one deque at a time; all linkage is raw pointers behind this API.

use core::mem::MaybeUninit;
use core::ptr::null_mut;

use crate::hooks;

/// Elements per block. Keep this a power of 2.
pub const DQBLOCK_SIZE: u64 = 32;
pub const DQBLOCK_MASK: u64 = DQBLOCK_SIZE - 1;

/* Nomenclature: head grows the block list through prev, tail through next. */

#[repr(C)]
pub struct DequeBlock<T> {
    prev: *mut DequeBlock<T>,
    next: *mut DequeBlock<T>,
    elems: [MaybeUninit<T>; DQBLOCK_SIZE as usize],
}

impl<T> DequeBlock<T> {
    unsafe fn alloc() -> *mut Self {
        let p = hooks::untracked_malloc(core::mem::size_of::<Self>()) as *mut Self;
        assert!(!p.is_null());
        (*p).prev = null_mut();
        (*p).next = null_mut();
        p
    }

    unsafe fn dealloc(blk: *mut Self) {
        hooks::untracked_free(blk as *mut u8)
    }
}

pub struct BlockedDeque<T> {
    bhead: *mut DequeBlock<T>,
    btail: *mut DequeBlock<T>,
    /// First USED position.
    phead: u64,
    /// First FREE position.
    ptail: u64,
}

impl<T: Copy> BlockedDeque<T> {
    pub const NEW: Self = BlockedDeque {
        bhead: null_mut(),
        btail: null_mut(),
        phead: 0,
        ptail: 0,
    };

    pub const fn new() -> Self {
        Self::NEW
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.ptail.wrapping_sub(self.phead)
    }

    #[inline]
    pub fn empty(&self) -> bool {
        self.bhead.is_null() // faster than ptail == phead
    }

    fn expand<const HEAD: bool>(&mut self) {
        unsafe {
            let new_block = DequeBlock::alloc();
            if self.bhead.is_null() {
                debug_assert!(self.btail.is_null());
                self.bhead = new_block;
                self.btail = new_block;
            } else if HEAD {
                (*self.bhead).prev = new_block;
                (*new_block).next = self.bhead;
                self.bhead = new_block;
            } else {
                (*self.btail).next = new_block;
                (*new_block).prev = self.btail;
                self.btail = new_block;
            }
        }
    }

    fn shrink<const HEAD: bool>(&mut self) {
        unsafe {
            let block = if HEAD { self.bhead } else { self.btail };
            assert!(!block.is_null());
            if HEAD {
                self.bhead = (*self.bhead).next;
            } else {
                self.btail = (*self.btail).prev;
            }
            DequeBlock::dealloc(block);
        }
    }

    fn reset(&mut self) {
        assert_eq!(self.phead, self.ptail);
        assert_eq!(self.bhead, self.btail);
        unsafe { DequeBlock::dealloc(self.bhead) };
        self.bhead = null_mut();
        self.btail = null_mut();
        self.phead = 0;
        self.ptail = 0;
    }

    #[inline]
    pub fn push_front(&mut self, val: T) {
        if self.phead & DQBLOCK_MASK == 0 {
            self.expand::<true>();
        }
        self.phead = self.phead.wrapping_sub(1);
        unsafe {
            (*self.bhead).elems[(self.phead & DQBLOCK_MASK) as usize].write(val);
        }
    }

    #[inline]
    pub fn push_back(&mut self, val: T) {
        if self.ptail & DQBLOCK_MASK == 0 {
            self.expand::<false>();
        }
        unsafe {
            (*self.btail).elems[(self.ptail & DQBLOCK_MASK) as usize].write(val);
        }
        self.ptail = self.ptail.wrapping_add(1);
    }

    #[inline]
    pub fn front(&self) -> T {
        debug_assert!(!self.empty());
        unsafe { (*self.bhead).elems[(self.phead & DQBLOCK_MASK) as usize].assume_init_read() }
    }

    #[inline]
    pub fn back(&self) -> T {
        debug_assert!(!self.empty());
        unsafe {
            (*self.btail).elems[(self.ptail.wrapping_sub(1) & DQBLOCK_MASK) as usize]
                .assume_init_read()
        }
    }

    #[inline]
    pub fn pop_front(&mut self) {
        assert!(!self.empty());
        self.phead = self.phead.wrapping_add(1);
        if self.phead == self.ptail {
            self.reset();
            return;
        }
        if self.phead & DQBLOCK_MASK == 0 {
            self.shrink::<true>();
        }
    }

    #[inline]
    pub fn pop_back(&mut self) {
        assert!(!self.empty());
        self.ptail = self.ptail.wrapping_sub(1);
        if self.phead == self.ptail {
            self.reset();
            return;
        }
        if self.ptail & DQBLOCK_MASK == 0 {
            self.shrink::<false>();
        }
    }

    /// Equivalent to back() + pop_back(), but one boundary check shorter.
    #[inline]
    pub fn dequeue_back(&mut self) -> T {
        debug_assert!(!self.empty());
        self.ptail = self.ptail.wrapping_sub(1);
        let res = unsafe {
            (*self.btail).elems[(self.ptail & DQBLOCK_MASK) as usize].assume_init_read()
        };
        if self.ptail & DQBLOCK_MASK == 0 {
            if self.bhead == self.btail {
                self.reset();
            } else {
                self.shrink::<false>();
            }
        }
        res
    }

    /// Splices the front of the list off in full blocks. Invariants:
    /// - head must be aligned at block granularity
    /// - the source must keep at least one block (it can't be left empty)
    pub fn splice_front(&mut self, blocks: usize) -> Self {
        assert_eq!(self.phead & DQBLOCK_MASK, 0);
        unsafe {
            let mut splice_point = self.bhead;
            for _ in 1..blocks {
                splice_point = (*splice_point).next;
            }
            assert!(!splice_point.is_null() && !(*splice_point).next.is_null());

            let res = BlockedDeque {
                bhead: self.bhead,
                btail: splice_point,
                phead: 0,
                ptail: blocks as u64 * DQBLOCK_SIZE,
            };

            self.bhead = (*splice_point).next;
            (*splice_point).next = null_mut();
            (*self.bhead).prev = null_mut();
            self.phead = self.phead.wrapping_add(blocks as u64 * DQBLOCK_SIZE);

            res
        }
    }

    /// Merges a list to the front, taking over its blocks. Invariants:
    /// - both heads must be block-aligned
    /// - `list` must not be empty
    pub fn merge_front(&mut self, list: Self) {
        if self.empty() {
            *self = list; // just take over
        } else {
            assert_eq!(self.phead & DQBLOCK_MASK, 0);
            assert_eq!(list.ptail & DQBLOCK_MASK, 0);
            self.phead = self.phead.wrapping_sub(list.size());
            unsafe {
                (*list.btail).next = self.bhead;
                (*self.bhead).prev = list.btail;
            }
            self.bhead = list.bhead;
        }
    }

    /// Steals the front block into an empty `dst`. Invariants:
    /// - must have at least one full block
    pub fn steal_front(&mut self, dst: &mut Self) {
        debug_assert!(dst.empty());
        debug_assert!(self.phead & DQBLOCK_MASK == 0 && self.size() >= DQBLOCK_SIZE);
        dst.bhead = self.bhead;
        dst.btail = self.bhead;
        dst.phead = 0;
        dst.ptail = DQBLOCK_SIZE;

        if self.bhead == self.btail {
            // we're now empty
            self.bhead = null_mut();
            self.btail = null_mut();
            self.phead = 0;
            self.ptail = 0;
        } else {
            unsafe {
                self.bhead = (*self.bhead).next;
                (*self.bhead).prev = null_mut();
            }
            self.phead = self.phead.wrapping_add(DQBLOCK_SIZE);
        }
    }
}
