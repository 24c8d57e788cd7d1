//! Host-runtime hooks. The real host is a simulator that supplies thread ids,
//! zero-cycle untracked memory, randomness, and deferred (speculation-aware)
//! deallocation. Out of the box every hook has a process-local default so the
//! crate runs standalone; a host installs its own table once, before the
//! first allocation.

use core::fmt::{self, Write as _};
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::ptr::null_mut;

use crate::defs::MAX_THREADS;

/// When a deferred deallocation fires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeferKind {
    /// Free the chunk when the enclosing speculative task commits.
    OnCommit,
    /// Free the chunk if the enclosing speculative task aborts.
    OnAbort,
}

pub struct HostHooks {
    /// Stable thread slot in [0, MAX_THREADS).
    pub sys_thread_id: fn() -> u64,
    /// Metadata memory, invisible to the speculation substrate.
    pub untracked_malloc: unsafe fn(usize) -> *mut u8,
    pub untracked_free: unsafe fn(*mut u8),
    /// Uniform pseudo-random draw (bank selection).
    pub random_u64: fn() -> u64,
    /// Post a deallocation to fire on commit or abort of the current task.
    pub enqueue_deferred_dealloc: unsafe fn(*mut u8, DeferKind),
    /// True when the current task can no longer roll back.
    pub is_irrevocable: fn() -> bool,
    /// True when the current task is already bound to abort.
    pub is_doomed: fn() -> bool,
    /// Diagnostic output that touches no heap.
    pub write_std_out: fn(&[u8]),
}

static HOOKS: AtomicPtr<HostHooks> = AtomicPtr::new(null_mut());

/// Installs a hook table. Must happen before the first allocation; the table
/// must live for the rest of the process.
pub fn install(hooks: &'static HostHooks) {
    HOOKS.store(hooks as *const _ as *mut _, Ordering::Release);
}

#[inline]
fn hooks() -> &'static HostHooks {
    let p = HOOKS.load(Ordering::Acquire);
    if p.is_null() {
        &DEFAULT_HOOKS
    } else {
        unsafe { &*p }
    }
}

#[inline]
pub fn sys_thread_id() -> u64 {
    (hooks().sys_thread_id)()
}

#[inline]
pub unsafe fn untracked_malloc(n: usize) -> *mut u8 {
    (hooks().untracked_malloc)(n)
}

#[inline]
pub unsafe fn untracked_free(p: *mut u8) {
    (hooks().untracked_free)(p)
}

#[inline]
pub fn random_u64() -> u64 {
    (hooks().random_u64)()
}

#[inline]
pub unsafe fn enqueue_deferred_dealloc(p: *mut u8, kind: DeferKind) {
    (hooks().enqueue_deferred_dealloc)(p, kind)
}

#[inline]
pub fn is_irrevocable() -> bool {
    (hooks().is_irrevocable)()
}

#[inline]
pub fn is_doomed() -> bool {
    (hooks().is_doomed)()
}

#[inline]
pub fn write_std_out(buf: &[u8]) {
    (hooks().write_std_out)(buf)
}

/* Standalone defaults */

static DEFAULT_HOOKS: HostHooks = HostHooks {
    sys_thread_id: default_thread_id,
    untracked_malloc: default_untracked_malloc,
    untracked_free: default_untracked_free,
    random_u64: default_random_u64,
    enqueue_deferred_dealloc: default_enqueue_deferred_dealloc,
    is_irrevocable: || true,
    is_doomed: || false,
    write_std_out: default_write_std_out,
};

// Thread slots come from a liveness bitmap and are handed back when the
// thread exits, so a slot is exclusive to one live thread no matter how many
// threads the process churns through. A recycled slot inherits the dead
// thread's cache contents; those are just free chunks for the new owner.
const SLOT_WORDS: usize = MAX_THREADS / 64;

#[allow(clippy::declare_interior_mutable_const)]
const SLOT_WORD_INIT: AtomicU64 = AtomicU64::new(0);
static SLOT_BITMAP: [AtomicU64; SLOT_WORDS] = [SLOT_WORD_INIT; SLOT_WORDS];

fn claim_slot() -> u64 {
    for (w, word) in SLOT_BITMAP.iter().enumerate() {
        let mut bits = word.load(Ordering::Relaxed);
        while bits != u64::MAX {
            let bit = (!bits).trailing_zeros() as u64;
            match word.compare_exchange_weak(
                bits,
                bits | 1 << bit,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return w as u64 * 64 + bit,
                Err(cur) => bits = cur,
            }
        }
    }
    die(format_args!("all {} thread slots are live", MAX_THREADS))
}

fn release_slot(slot: u64) {
    SLOT_BITMAP[slot as usize / 64].fetch_and(!(1 << (slot % 64)), Ordering::Release);
}

struct SlotGuard(u64);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        release_slot(self.0);
    }
}

std::thread_local! {
    static SLOT: SlotGuard = SlotGuard(claim_slot());
}

// Frees that run after this thread-local is torn down (late TLS destructors)
// are outside what the standalone default supports; a real host supplies ids
// that live for the whole thread.
fn default_thread_id() -> u64 {
    SLOT.with(|slot| slot.0)
}

unsafe fn default_untracked_malloc(n: usize) -> *mut u8 {
    libc::malloc(n) as *mut u8
}

unsafe fn default_untracked_free(p: *mut u8) {
    libc::free(p as *mut libc::c_void)
}

static RNG_STATE: AtomicU64 = AtomicU64::new(0);

fn default_random_u64() -> u64 {
    // splitmix64 over a shared counter
    let mut z = RNG_STATE
        .fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed)
        .wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

// Without a speculative host no task ever aborts, so an on-abort free must
// never fire, and is_irrevocable()==true routes every on-commit free
// directly. Dropping the request is the whole default.
unsafe fn default_enqueue_deferred_dealloc(_p: *mut u8, _kind: DeferKind) {}

fn default_write_std_out(buf: &[u8]) {
    unsafe {
        libc::write(1, buf.as_ptr() as *const libc::c_void, buf.len());
    }
}

/* Heap-free diagnostics */

struct StackBuf {
    buf: [u8; 1024],
    len: usize,
}

impl fmt::Write for StackBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Formats into a stack buffer, writes through the stdout hook, and aborts.
/// All allocator errors are fatal by design.
pub fn die(args: fmt::Arguments<'_>) -> ! {
    let mut out = StackBuf {
        buf: [0; 1024],
        len: 0,
    };
    let _ = out.write_fmt(args);
    let _ = out.write_str("\n");
    write_std_out(&out.buf[..out.len]);
    std::process::abort();
}

#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::hooks::die(core::format_args!($($arg)*))
    };
}
