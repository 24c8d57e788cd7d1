//! The malloc-compatible surface: thin adapters over the internal interface
//! (do_alloc, do_dealloc, chunk_size, valid_chunk). Deallocations route
//! through the host's deferred mechanism so a speculative task's frees fire
//! at the right moment: a fresh allocation must be returned if the task
//! aborts, and an explicit free must wait until the task commits.
//!
//! With `--features c_api` every entry point exports unmangled and the crate
//! can stand in for the platform allocator.

use core::ffi::c_void;
use core::ptr::null_mut;

use libc::{c_char, c_int, size_t, EINVAL, ENOMEM, FILE};

use crate::hooks::{self, DeferKind};
use crate::{chunk_size, do_alloc, do_dealloc, valid_chunk};

unsafe fn on_abort_dealloc(ptr: *mut u8) {
    if hooks::is_doomed() {
        do_dealloc(ptr);
    } else {
        hooks::enqueue_deferred_dealloc(ptr, DeferKind::OnAbort);
    }
}

unsafe fn on_commit_dealloc(ptr: *mut u8) {
    if hooks::is_irrevocable() {
        do_dealloc(ptr);
    } else {
        hooks::enqueue_deferred_dealloc(ptr, DeferKind::OnCommit);
    }
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    if size == 0 {
        return null_mut();
    }
    let p = do_alloc(size);
    on_abort_dealloc(p);
    p as *mut c_void
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let sz = match nmemb.checked_mul(size) {
        Some(0) | None => return null_mut(),
        Some(sz) => sz,
    };
    let p = do_alloc(sz);
    on_abort_dealloc(p);
    // Recycled chunks carry old contents; clear the request, not the class.
    p.write_bytes(0, sz);
    p as *mut c_void
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if ptr.is_null() {
        return malloc(size);
    }
    let old = ptr as *mut u8;
    if !valid_chunk(old) {
        fatal!("realloc: {:p} is not a chunk of this allocator", ptr);
    }
    if size == 0 {
        on_commit_dealloc(old);
        return null_mut();
    }

    let old_size = chunk_size(old);
    // If it fits and we're not wasting too much space, do nothing
    if old_size >= size && old_size / 2 <= size {
        return ptr;
    }

    let new_ptr = do_alloc(size);
    on_abort_dealloc(new_ptr);
    core::ptr::copy_nonoverlapping(old, new_ptr, size.min(old_size));
    on_commit_dealloc(old);
    new_ptr as *mut c_void
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    on_commit_dealloc(ptr as *mut u8);
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    free(ptr)
}

/// Alignments up to the 64-byte class quantum come for free from class
/// alignment; larger requests pass validation but still get 64-byte-aligned
/// chunks.
#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    // On failure, posix_memalign leaves *memptr alone
    if size == 0 {
        *memptr = null_mut();
    } else if alignment == 0
        || alignment & (alignment - 1) != 0
        || alignment % core::mem::size_of::<*mut c_void>() != 0
    {
        return EINVAL;
    } else {
        let ptr = malloc(size);
        if ptr.is_null() {
            return ENOMEM;
        }
        *memptr = ptr;
    }
    0
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    let mut ptr = null_mut();
    if posix_memalign(&mut ptr, alignment, size) != 0 {
        ptr = null_mut();
    }
    ptr
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    aligned_alloc(alignment, size)
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn strdup(src: *const c_char) -> *mut c_char {
    if src.is_null() {
        return null_mut();
    }
    let len = libc::strlen(src);
    let dst = malloc(len + 1) as *mut c_char;
    if !dst.is_null() {
        core::ptr::copy_nonoverlapping(src, dst, len + 1);
    }
    dst
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    if !valid_chunk(ptr as *const u8) {
        fatal!("malloc_usable_size: {:p} is not a chunk of this allocator", ptr);
    }
    chunk_size(ptr as *const u8)
}

/* Unimplemented entries below. Programs rarely use these, so rather than
 * implementing the library in full, we do them on demand. */

fn abort_unimplemented(func: &str) -> ! {
    fatal!("Aborting: allocator function unimplemented: {}", func)
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn valloc(_size: size_t) -> *mut c_void {
    abort_unimplemented("valloc")
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn pvalloc(_size: size_t) -> *mut c_void {
    abort_unimplemented("pvalloc")
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn malloc_get_state() -> *mut c_void {
    abort_unimplemented("malloc_get_state")
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn malloc_set_state(_state: *mut c_void) -> c_int {
    abort_unimplemented("malloc_set_state")
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn malloc_info(_options: c_int, _stream: *mut FILE) -> c_int {
    abort_unimplemented("malloc_info")
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn malloc_stats() {
    abort_unimplemented("malloc_stats")
}

#[cfg_attr(feature = "c_api", no_mangle)]
pub unsafe extern "C" fn malloc_trim(_pad: size_t) -> c_int {
    abort_unimplemented("malloc_trim")
}
