use specalloc::defs::{class_to_size, size_to_class};

fn main() {
    let sizes: Vec<usize> = (1usize..=8).map(class_to_size).collect();
    println!("first classes: {:?}", sizes);
    println!("16320 -> class {}, 16321 is large", size_to_class(16320));

    unsafe {
        let a = specalloc::do_alloc(48);
        let b = specalloc::do_alloc(4096);
        let c = specalloc::do_alloc(1 << 20);
        println!(
            "48 -> {:p} ({} B), 4096 -> {:p} ({} B), 1M -> {:p} ({} B)",
            a,
            specalloc::chunk_size(a),
            b,
            specalloc::chunk_size(b),
            c,
            specalloc::chunk_size(c),
        );
        specalloc::do_dealloc(a);
        specalloc::do_dealloc(b);
        specalloc::do_dealloc(c);

        // Freed chunks come straight back out of the thread cache
        let a2 = specalloc::do_alloc(48);
        println!("48 again -> {:p} (reused: {})", a2, a2 == a);
        specalloc::do_dealloc(a2);
    }
}
