use cfg_if::cfg_if;

pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = 1024 * MB;

/// A page is the minimum amount of space devoted to fixed-size chunks.
pub const PAGE_BITS: usize = 15; // 32 KB
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// 256 freelists with sizes 64 B - 16 KB in 64-byte increments.
/// Class 0 is reserved for large-heap pages.
pub const NUM_SIZE_CLASSES: usize = 256;
pub const CLASS_SHIFT: usize = 6;
pub const CLASS_QUANTUM: usize = 1 << CLASS_SHIFT;

/// The host runtime supports 2048 threads tops.
pub const MAX_THREADS: usize = 2048;

/// A thread cache that grows beyond this donates to the central freelists.
pub const MAX_THREAD_CACHE_SIZE: usize = 4096 * KB;

/// Thread caches try to fetch this much data per central list access.
pub const FETCH_TARGET_SIZE: usize = 32 * KB;

/// Minimum pages handed out per sys_alloc. Reduces freelist fragmentation and
/// arena lock traffic (32*32KB*256 = 256MB overage worst case, i.e. every
/// freelist holding a single element).
pub const MIN_SYSALLOC_PAGES: usize = 32;

/// OS mappings are extended in 2 MB units so the kernel can use superpages.
pub const SUPERPAGE_BITS: usize = 21;
pub const SUPERPAGE_SIZE: usize = 1 << SUPERPAGE_BITS;

/// Each region spans at most 512 GB by convention with the host runtime.
pub const REGION_SPAN: usize = 512 * GB;

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        // Keep in sync with the host runtime's tracked/untracked segments:
        // 512 GB tracked + 512 GB untracked, leaving the first 512 GB of each
        // segment to the host.
        pub const TRACKED_BASE: usize = 0x0a80_0000_0000;
        pub const UNTRACKED_BASE: usize = 0x0b80_0000_0000;
    } else {
        compile_error!("the fixed tracked/untracked layout needs a 64-bit address space");
    }
}

#[inline]
pub const fn size_to_pages(sz: usize) -> usize {
    (sz + PAGE_SIZE - 1) >> PAGE_BITS
}

#[inline]
pub const fn size_to_class(sz: usize) -> usize {
    (sz + CLASS_QUANTUM - 1) >> CLASS_SHIFT
}

#[inline]
pub const fn class_to_size(cl: usize) -> usize {
    cl << CLASS_SHIFT
}

#[inline]
pub const fn is_large_alloc(sz: usize) -> bool {
    size_to_class(sz) >= NUM_SIZE_CLASSES
}

#[inline(always)]
pub const fn round_down(x: u64, n: u64) -> u64 {
    let x = x as i64;
    let n = n as i64;
    (x & -n) as u64
}

#[inline(always)]
pub const fn round_up(x: u64, n: u64) -> u64 {
    round_down(x.wrapping_add(n).wrapping_sub(1), n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_round_trip() {
        for sz in 1..=class_to_size(NUM_SIZE_CLASSES - 1) {
            let cl = size_to_class(sz);
            assert!(cl >= 1 && cl < NUM_SIZE_CLASSES);
            let granted = class_to_size(cl);
            assert!(granted >= sz);
            assert!(granted - sz < CLASS_QUANTUM);
            assert_eq!(granted % CLASS_QUANTUM, 0);
        }
    }

    #[test]
    fn large_boundary() {
        // 255 * 64 = 16320 is the largest small size
        assert_eq!(size_to_class(16320), 255);
        assert!(!is_large_alloc(16320));
        assert!(is_large_alloc(16321));
        assert!(is_large_alloc(1 << 20));
        assert!(!is_large_alloc(1));
    }

    #[test]
    fn exact_multiples_stay_put() {
        assert_eq!(size_to_class(64), 1);
        assert_eq!(size_to_class(65), 2);
        assert_eq!(size_to_class(128), 2);
        assert_eq!(class_to_size(size_to_class(4096)), 4096);
    }

    #[test]
    fn pages_and_rounding() {
        assert_eq!(size_to_pages(1), 1);
        assert_eq!(size_to_pages(PAGE_SIZE), 1);
        assert_eq!(size_to_pages(PAGE_SIZE + 1), 2);
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_down(127, 64), 64);
    }
}
