//! Fixed-address anonymous mappings backing the tracked and untracked
//! regions. Both regions grow in 2 MB units at addresses agreed with the host
//! runtime, so a failed or relocated mapping is unrecoverable.

use crate::defs::SUPERPAGE_SIZE;

/// Maps `len` bytes read-write at exactly `addr`. The kernel zero-fills
/// anonymous mappings. Fatal on failure or relocation.
pub unsafe fn map_fixed(addr: usize, len: usize) -> *mut u8 {
    debug_assert_eq!(addr & (SUPERPAGE_SIZE - 1), 0);
    debug_assert_eq!(len & (SUPERPAGE_SIZE - 1), 0);

    let mem = libc::mmap(
        addr as *mut libc::c_void,
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
        -1,
        0,
    );
    if mem == libc::MAP_FAILED {
        fatal!("mmap of {} bytes at {:#x} failed (region oversubscribed?)", len, addr);
    }
    if mem as usize != addr {
        fatal!("mmap relocated fixed mapping {:#x} -> {:p}", addr, mem);
    }
    mem as *mut u8
}
