use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use test_log::test;

use specalloc::defs::{CLASS_QUANTUM, TRACKED_BASE};
use specalloc::{chunk_size, do_alloc, do_dealloc, valid_chunk};

#[test]
fn class_sizes_and_cache_reuse() {
    unsafe {
        let sizes = [48usize, 64, 65, 16320, 16321];
        let expected = [64usize, 64, 128, 16320, 16384];
        let ptrs: Vec<*mut u8> = sizes.iter().map(|&s| do_alloc(s)).collect();

        for (&p, &want) in ptrs.iter().zip(&expected) {
            assert!(valid_chunk(p));
            assert_eq!(chunk_size(p), want);
            assert_eq!(p as usize % CLASS_QUANTUM, 0);
        }

        for &p in &ptrs {
            do_dealloc(p);
        }

        // The small sizes come back out of the same class caches: 48 and 64
        // share class 1, 65 is alone in class 2.
        let again: Vec<*mut u8> = sizes.iter().map(|&s| do_alloc(s)).collect();
        let class1_before: HashSet<usize> = [ptrs[0] as usize, ptrs[1] as usize].into();
        let class1_after: HashSet<usize> = [again[0] as usize, again[1] as usize].into();
        assert_eq!(class1_before, class1_after);
        assert_eq!(again[2], ptrs[2]);
        assert_eq!(again[3], ptrs[3]);

        for &p in &again {
            do_dealloc(p);
        }
    }
}

#[test]
fn validity_bounds() {
    unsafe {
        assert!(!valid_chunk(core::ptr::null()));
        assert!(!valid_chunk((TRACKED_BASE - 64) as *const u8));
        let p = do_alloc(512);
        assert!(valid_chunk(p));
        do_dealloc(p);
    }
}

#[test]
fn live_chunks_never_overlap() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xd15701);
    unsafe {
        let mut live: Vec<(usize, usize)> = Vec::new();
        for _ in 0..400 {
            let sz = if rng.gen_bool(0.9) {
                rng.gen_range(1..=16320)
            } else {
                rng.gen_range(16321..=256 * 1024)
            };
            let p = do_alloc(sz);
            assert!(valid_chunk(p));
            assert_eq!(p as usize % CLASS_QUANTUM, 0);
            live.push((p as usize, chunk_size(p)));
        }

        let mut sorted = live.clone();
        sorted.sort();
        for w in sorted.windows(2) {
            assert!(
                w[0].0 + w[0].1 <= w[1].0,
                "chunks overlap: {:#x}+{} vs {:#x}",
                w[0].0,
                w[0].1,
                w[1].0
            );
        }

        for (p, _) in live {
            do_dealloc(p as *mut u8);
        }
    }
}

#[test]
fn contents_survive_a_full_shuffle() {
    // basicalloc-style stress: random alloc/free with per-slot fill bytes;
    // a clobbered pattern would betray overlapping chunks immediately.
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xa110c);
    unsafe {
        let mut slots: Vec<Option<(*mut u8, usize, u8)>> = vec![None; 64];
        for step in 0..4000u32 {
            let i = rng.gen_range(0..slots.len());
            match slots[i].take() {
                None => {
                    let sz = rng.gen_range(1..=4096usize);
                    let fill = (step % 251) as u8;
                    let p = do_alloc(sz);
                    p.write_bytes(fill, sz);
                    slots[i] = Some((p, sz, fill));
                }
                Some((p, sz, fill)) => {
                    for off in 0..sz {
                        assert_eq!(*p.add(off), fill, "clobbered at {:p}+{}", p, off);
                    }
                    do_dealloc(p);
                }
            }
        }
        for slot in slots.into_iter().flatten() {
            do_dealloc(slot.0);
        }
    }
}

#[test]
fn threads_share_the_heap_safely() {
    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            std::thread::spawn(move || unsafe {
                let mut rng = rand::rngs::StdRng::seed_from_u64(t);
                let mut held = Vec::new();
                for _ in 0..2000 {
                    if held.is_empty() || rng.gen_bool(0.6) {
                        let sz = rng.gen_range(1..=8192usize);
                        let p = do_alloc(sz);
                        assert!(valid_chunk(p));
                        p.write_bytes(t as u8, sz.min(64));
                        held.push(p);
                    } else {
                        let idx = rng.gen_range(0..held.len());
                        do_dealloc(held.swap_remove(idx));
                    }
                }
                for p in held {
                    do_dealloc(p);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

mod c_surface {
    use super::*;
    use test_log::test;
    use core::ffi::c_void;
    use specalloc::malloc::{
        aligned_alloc, calloc, free, malloc, malloc_usable_size, posix_memalign, realloc, strdup,
    };

    #[test]
    fn zero_size_is_null() {
        unsafe {
            assert!(malloc(0).is_null());
            assert!(calloc(0, 16).is_null());
            assert!(calloc(16, 0).is_null());
            free(core::ptr::null_mut()); // no-op
        }
    }

    #[test]
    fn calloc_zero_fills_recycled_chunks() {
        unsafe {
            let p = malloc(256) as *mut u8;
            p.write_bytes(0xee, 256);
            free(p as *mut c_void);

            let q = calloc(16, 16) as *mut u8;
            assert!(core::slice::from_raw_parts(q, 256).iter().all(|&b| b == 0));
            free(q as *mut c_void);

            // element-count overflow
            assert!(calloc(usize::MAX, 2).is_null());
        }
    }

    #[test]
    fn realloc_reuses_within_the_class_window() {
        unsafe {
            let p = malloc(100);
            assert_eq!(malloc_usable_size(p), 128);
            // fits, and wastes at most half: stays put
            assert_eq!(realloc(p, 128), p);
            assert_eq!(realloc(p, 64), p);
            // too small for the chunk: moves
            let q = realloc(p, 32);
            assert_ne!(q, p);
            // growth moves and preserves contents
            (q as *mut u8).write_bytes(0x5a, 32);
            let r = realloc(q, 50_000);
            assert!(core::slice::from_raw_parts(r as *const u8, 32)
                .iter()
                .all(|&b| b == 0x5a));
            assert_eq!(realloc(r, 0), core::ptr::null_mut());
        }
    }

    #[test]
    fn memalign_family() {
        unsafe {
            let mut out: *mut c_void = core::ptr::null_mut();
            assert_eq!(posix_memalign(&mut out, 64, 100), 0);
            assert_eq!(out as usize % 64, 0);
            free(out);

            // zero size parks a null without failing
            let mut out2: *mut c_void = 0x1 as *mut c_void;
            assert_eq!(posix_memalign(&mut out2, 64, 0), 0);
            assert!(out2.is_null());

            // not a power of two / not a pointer multiple
            assert_eq!(posix_memalign(&mut out, 48, 100), libc::EINVAL);
            assert_eq!(posix_memalign(&mut out, 2, 100), libc::EINVAL);
            assert_eq!(posix_memalign(&mut out, 0, 100), libc::EINVAL);

            let p = aligned_alloc(32, 200);
            assert!(!p.is_null());
            assert_eq!(p as usize % 32, 0);
            free(p);

            assert!(aligned_alloc(48, 200).is_null());
        }
    }

    #[test]
    fn strdup_copies_the_terminator() {
        unsafe {
            let src = b"tracked region\0";
            let dup = strdup(src.as_ptr() as *const libc::c_char);
            assert!(!dup.is_null());
            assert_eq!(libc::strcmp(dup, src.as_ptr() as *const libc::c_char), 0);
            assert_eq!(*dup.add(14), 0);
            free(dup as *mut c_void);
        }
    }

    #[test]
    fn usable_size_reports_the_class() {
        unsafe {
            let p = malloc(1000);
            assert_eq!(malloc_usable_size(p), 1024);
            free(p);
            let p = malloc(100_000);
            assert_eq!(malloc_usable_size(p), 100_032);
            free(p);
        }
    }
}
