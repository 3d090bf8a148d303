mod common;

use common::{Machine, read, va};
use kernel_alloc::heap::{Heap, HeapError, HeapFlags, RecordKind, ZoneClass, halloc, hfree};

#[test]
fn requests_are_sorted_into_size_classes() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    let tiny = heap.allocate(64).expect("tiny");
    assert_eq!(heap.zone_count_of(ZoneClass::Tiny), 1);

    let small = [heap.allocate(65).expect("small"), heap.allocate(256).expect("small")];
    assert_eq!(heap.zone_count_of(ZoneClass::Small), 1);

    let medium = [heap.allocate(257).expect("medium"), heap.allocate(2048).expect("medium")];
    assert_eq!(heap.zone_count_of(ZoneClass::Medium), 1);

    let large = heap.allocate(2049).expect("large");
    assert_eq!(heap.zone_count_of(ZoneClass::Large), 1);
    assert_eq!(heap.zone_count(), 4);

    for at in [tiny, large].into_iter().chain(small).chain(medium) {
        heap.free(at).expect("free");
    }
    assert_eq!(heap.zone_count(), 0);
}

#[test]
fn zone_pages_follow_the_class() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    let kept = [1, 100, 1000, 5000].map(|size| heap.allocate(size).expect("allocate"));

    let mut pages = Vec::new();
    heap.inspect(|zone| pages.push((zone.class(), zone.pages())));
    assert_eq!(
        pages,
        [(ZoneClass::Tiny, 2), (ZoneClass::Small, 6), (ZoneClass::Medium, 21), (ZoneClass::Large, 3)]
    );

    for at in kept {
        heap.free(at).expect("free");
    }
}

#[test]
fn freeing_the_last_allocation_destroys_the_zone() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);
    let before = m.free_frames();

    let at = heap.allocate(40).expect("allocate");
    assert_eq!(heap.zone_count(), 1);
    assert_eq!(m.free_frames(), before - 2);

    heap.free(at).expect("free");
    assert_eq!(heap.zone_count(), 0);
    assert_eq!(m.free_frames(), before);
    assert!(vm.kernel_space().resolve_address(at).is_err());
}

#[test]
fn freed_space_is_reused_first_fit() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    let a = heap.allocate(100).expect("a");
    let b = heap.allocate(100).expect("b");
    assert_eq!(b.as_u32() - a.as_u32(), 100 + 16);

    heap.free(a).expect("free a");
    let c = heap.allocate(90).expect("c");
    assert_eq!(c, a);
    assert_eq!(heap.zone_count(), 1);

    heap.free(b).expect("free b");
    heap.free(c).expect("free c");
}

#[test]
fn tiny_zones_hand_out_records_in_table_order() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    // The first carved record is split; the next request takes the second
    // carved record rather than the split-off remainder.
    let a = heap.allocate(40).expect("a");
    let b = heap.allocate(40).expect("b");
    assert_eq!(b.as_u32() - a.as_u32(), 255);

    heap.free(a).expect("free");
    heap.free(b).expect("free");
}

#[test]
fn freed_tiny_record_is_reused_in_place() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    let a = heap.allocate(40).expect("a");
    let b = heap.allocate(40).expect("b");
    heap.free(a).expect("free a");

    let c = heap.allocate(35).expect("c");
    assert_eq!(c, a);
    assert_eq!(heap.zone_count_of(ZoneClass::Tiny), 1);
    assert_eq!(heap.zone_count(), 1);

    heap.free(b).expect("free b");
    heap.free(c).expect("free c");
    assert_eq!(heap.zone_count(), 0);
}

#[test]
fn aligned_heap_rounds_requests_up() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);
    assert!(heap.flags().contains(HeapFlags::ALIGNED));

    let a = heap.allocate(101).expect("a");
    let b = heap.allocate(65).expect("b");
    assert_eq!(b.as_u32() - a.as_u32(), 104 + 16);

    let mut used = Vec::new();
    heap.inspect(|zone| {
        used.extend(zone.records().filter(|r| r.kind == RecordKind::Used).map(|r| (r.offset, r.size)));
    });
    used.sort_unstable();
    assert_eq!(used, [(0, 120), (120, 84)]);

    heap.free(a).expect("free");
    heap.free(b).expect("free");
}

#[test]
fn unaligned_heap_keeps_exact_sizes() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::new(&vm, HeapFlags::empty());

    let a = heap.allocate(101).expect("a");
    let b = heap.allocate(65).expect("b");
    assert_eq!(b.as_u32() - a.as_u32(), 101 + 16);

    heap.free(a).expect("free");
    heap.free(b).expect("free");
}

#[test]
fn zero_sized_requests_are_rejected() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);
    assert_eq!(heap.allocate(0), Err(HeapError::InvalidArgument));
    assert_eq!(heap.zone_count(), 0);
}

#[test]
fn unknown_pointers_are_reported() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    let keep = heap.allocate(16).expect("keep");
    let at = heap.allocate(16).expect("at");

    assert_eq!(heap.free(va(0x1234_5000)), Err(HeapError::UnknownPointer(va(0x1234_5000))));
    // Inside a zone, but not the start of an allocation.
    assert_eq!(heap.free(at + 4), Err(HeapError::UnknownPointer(at + 4)));

    heap.free(at).expect("free");
    assert_eq!(heap.free(at), Err(HeapError::UnknownPointer(at)));

    heap.free(keep).expect("free");
}

#[test]
#[should_panic(expected = "hfree")]
fn hfree_panics_on_unknown_pointers() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);
    hfree(&heap, va(0x0040_0000));
}

#[test]
fn halloc_and_hfree_round_trip() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    let at = halloc(&heap, 128).expect("halloc");
    unsafe { vm.write_bytes(at, &[0x5A; 128]) };
    assert_eq!(read(&vm, at, 128), [0x5A; 128]);
    hfree(&heap, at);
    assert_eq!(heap.zone_count(), 0);
}

#[test]
fn secure_heap_zeroes_on_allocate_and_free() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::new(&vm, HeapFlags::SECURE | HeapFlags::ALIGNED);

    let keep = heap.allocate(32).expect("keep");
    let at = heap.allocate(32).expect("at");
    unsafe { vm.write_bytes(at, &[0xAB; 32]) };

    heap.free(at).expect("free");
    assert_eq!(read(&vm, at, 32), [0; 32]);

    unsafe { vm.write_bytes(at, &[0xCD; 32]) };
    let again = heap.allocate(32).expect("again");
    assert_eq!(again, at);
    assert_eq!(read(&vm, again, 32), [0; 32]);

    heap.free(again).expect("free");
    heap.free(keep).expect("free");
}

#[test]
fn forced_defragmentation_merges_neighbours_once() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    let blocks: Vec<_> = (0..5).map(|_| heap.allocate(100).expect("allocate")).collect();
    for &at in &blocks[..3] {
        heap.free(at).expect("free");
    }

    assert_eq!(heap.defragment(), 2);
    assert_eq!(heap.defragment(), 0);

    let mut free = Vec::new();
    heap.inspect(|zone| {
        assert_eq!(zone.changes(), 0);
        free.extend(zone.records().filter(|r| r.kind == RecordKind::Free).map(|r| (r.offset, r.size)));
    });
    assert!(free.contains(&(0, 348)));

    // The merged record serves a request none of its parts could.
    assert_eq!(heap.allocate(250).expect("merged"), blocks[0]);
    assert_eq!(heap.zone_count(), 1);
}

#[test]
fn enough_frees_trigger_defragmentation() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    let blocks: Vec<_> = (0..21).map(|_| heap.allocate(100).expect("allocate")).collect();
    assert_eq!(heap.zone_count_of(ZoneClass::Small), 1);

    for &at in &blocks[..19] {
        heap.free(at).expect("free");
    }
    heap.inspect(|zone| {
        assert_eq!(zone.changes(), 19);
        assert_eq!(zone.free_allocations(), 20);
    });

    heap.free(blocks[19]).expect("free");
    heap.inspect(|zone| {
        assert_eq!(zone.changes(), 0);
        assert_eq!(zone.allocations(), 3);
        assert_eq!(zone.free_allocations(), 2);
    });

    heap.free(blocks[20]).expect("free");
    assert_eq!(heap.zone_count(), 0);
}

#[test]
fn large_requests_get_a_zone_each() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    let a = heap.allocate(5000).expect("a");
    let b = heap.allocate(5000).expect("b");
    assert_eq!(heap.zone_count_of(ZoneClass::Large), 2);

    unsafe { vm.fill(a, 5000, 0x11) };
    unsafe { vm.fill(b, 5000, 0x22) };
    assert!(read(&vm, a, 5000).iter().all(|&x| x == 0x11));

    heap.free(a).expect("free");
    assert_eq!(heap.zone_count_of(ZoneClass::Large), 1);
    heap.free(b).expect("free");
}

#[test]
fn inspect_reports_zone_bounds() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    let at = heap.allocate(8).expect("allocate");
    heap.inspect(|zone| {
        assert_eq!(zone.begin(), zone.base() + 4096);
        assert_eq!(zone.end(), zone.base() + 2 * 4096);
        assert!(zone.begin() <= at && at < zone.end());
        assert_eq!(zone.free_size(), 4096 - 24);
        assert_eq!(zone.max_allocations(), 1013);
    });
    heap.free(at).expect("free");
}

#[test]
fn dropping_the_heap_returns_every_zone() {
    let m = Machine::new();
    let vm = m.boot();
    let before = m.free_frames();

    {
        let heap = Heap::init(&vm);
        for size in [8, 200, 1500, 9000, 8, 200] {
            heap.allocate(size).expect("allocate");
        }
        assert!(m.free_frames() < before);
    }

    assert_eq!(m.free_frames(), before);
}

#[test]
fn concurrent_users_never_share_memory() {
    let m = Machine::new();
    let vm = m.boot();
    let heap = Heap::init(&vm);

    std::thread::scope(|s| {
        for id in 1..=4u8 {
            let heap = &heap;
            let vm = &vm;
            s.spawn(move || {
                for round in 0..10 {
                    let size = 24 + u32::from(id) * 8 + round * 4;
                    let blocks: Vec<_> = (0..16).map(|_| heap.allocate(size).expect("allocate")).collect();
                    for &at in &blocks {
                        unsafe { vm.fill(at, size, id) };
                    }
                    for &at in &blocks {
                        assert!(read(vm, at, size as usize).iter().all(|&x| x == id));
                        heap.free(at).expect("free");
                    }
                }
            });
        }
    });

    assert_eq!(heap.zone_count(), 0);
}
