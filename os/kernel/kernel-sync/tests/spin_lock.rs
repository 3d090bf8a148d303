use kernel_sync::SpinLock;
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u32);
    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());

    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn failed_try_lock_leaves_the_holder_alone() {
    let l = SpinLock::new(1u8);

    let held = l.try_lock().expect("uncontended");
    assert!(l.try_lock().is_none());
    // A failed attempt must not release the existing holder.
    assert!(l.is_locked());
    assert_eq!(*held, 1);

    drop(held);
    assert!(l.try_lock().is_some());
}

#[test]
fn guard_knows_its_lock() {
    let kernel = SpinLock::new(());
    let other = SpinLock::new(());

    let g = kernel.lock();
    assert!(g.guards(&kernel));
    assert!(!g.guards(&other));
}

#[test]
fn nested_locks_in_fixed_order() {
    // Own directory first, kernel directory second.
    let own = SpinLock::new(Vec::<u32>::new());
    let kernel = SpinLock::new(Vec::<u32>::new());

    {
        let mut o = own.lock();
        let mut k = kernel.lock();
        o.push(1);
        k.push(2);
    }

    assert_eq!(own.into_inner(), [1]);
    assert_eq!(kernel.into_inner(), [2]);
}

#[test]
fn debug_does_not_block_while_locked() {
    let l = SpinLock::new(7u16);
    assert_eq!(format!("{l:?}"), "SpinLock { data: 7 }");

    let _g = l.lock();
    assert_eq!(format!("{l:?}"), "SpinLock { data: <locked> }");
}

#[test]
fn with_lock_and_get_mut() {
    let mut l = SpinLock::<Vec<u8>>::default();
    l.get_mut().push(1);
    let len = l.with_lock(|v| {
        v.push(2);
        v.len()
    });
    assert_eq!(len, 2);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}
