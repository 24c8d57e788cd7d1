use core::hint;
use core::sync::atomic::{AtomicU32, Ordering};

use parking_lot::lock_api::{GuardSend, RawMutex};

/* TICKET LOCK: FIFO ordering for fairness under contention.
 * One 32-bit word: low half is the next ticket to hand out, high half is the
 * ticket now being served. Not reentrant. WARNING: breaks past 64K waiters.
 */

const TICKET_MASK: u32 = (1 << 16) - 1;

#[repr(transparent)]
pub struct TicketLock {
    state: AtomicU32,
}

impl TicketLock {
    pub const fn new() -> Self {
        TicketLock {
            state: AtomicU32::new(0),
        }
    }

    #[cfg(test)]
    fn raw(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for TicketLock {
    const INIT: TicketLock = TicketLock::new();
    type GuardMarker = GuardSend;

    fn lock(&self) {
        // Take a ticket: bump the low half, leave the high half alone. A
        // 16-bit fetch-add on the low half would do, but 16-bit xadd is slow
        // on the usual datapaths, so CAS the whole word.
        let ticket;
        loop {
            let val = self.state.load(Ordering::Relaxed);
            let hi = val & (TICKET_MASK << 16);
            let new_lo = val.wrapping_add(1) & TICKET_MASK;
            if self
                .state
                .compare_exchange_weak(val, hi | new_lo, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                ticket = val & TICKET_MASK;
                break;
            }
        }

        while (self.state.load(Ordering::Acquire) >> 16) & TICKET_MASK != ticket {
            hint::spin_loop();
        }
    }

    fn try_lock(&self) -> bool {
        let val = self.state.load(Ordering::Relaxed);
        let hi = (val >> 16) & TICKET_MASK;
        let lo = val & TICKET_MASK;
        let new_lo = lo.wrapping_add(1) & TICKET_MASK;
        // Up for grabs only if nobody is waiting; then take it in one CAS.
        hi == lo
            && self
                .state
                .compare_exchange(val, (hi << 16) | new_lo, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    unsafe fn unlock(&self) {
        // Advancing now-serving wraps cleanly: overflow out of the high half
        // falls off the 32-bit word.
        self.state.fetch_add(1 << 16, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_unlock_cycles() {
        let m = TicketLock::new();
        for i in 1..=3u32 {
            m.lock();
            unsafe { m.unlock() };
            // Each cycle advances both halves in step.
            assert_eq!(m.raw(), i << 16 | i);
        }
    }

    #[test]
    fn try_lock_respects_holder() {
        let m = TicketLock::new();
        assert!(m.try_lock());
        assert!(!m.try_lock());
        unsafe { m.unlock() };
        assert!(m.try_lock());
        unsafe { m.unlock() };
    }

    #[test]
    fn mutual_exclusion() {
        struct Shared {
            lock: TicketLock,
            value: core::cell::UnsafeCell<u64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: TicketLock::new(),
            value: core::cell::UnsafeCell::new(0),
        });

        const THREADS: usize = 8;
        const ITERS: u64 = 10_000;
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..ITERS {
                        shared.lock.lock();
                        unsafe { *shared.value.get() += 1 };
                        unsafe { shared.lock.unlock() };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(unsafe { *shared.value.get() }, THREADS as u64 * ITERS);
    }
}
