//! Integration tests for the [`hp`](hazptr_collections::hp) module,
//! exercised through the public API only.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use hazptr_collections::hp::{Config, HazardPointers};

#[test]
fn reclamation_deferred_until_reader_clears() {
    let freed = Arc::new(AtomicUsize::new(0));
    let freed_in_callback = Arc::clone(&freed);
    let hp: Arc<HazardPointers<u64>> = Arc::new(HazardPointers::new(Config::default(), move |ptr| {
        freed_in_callback.fetch_add(1, Ordering::Relaxed);
        unsafe { drop(Box::from_raw(ptr.as_ptr())) };
    }));

    let node = Box::into_raw(Box::new(7u64));
    let addr = node as usize;

    let (reader_ready_tx, reader_ready_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();

    let reader_hp = Arc::clone(&hp);
    let reader = thread::spawn(move || {
        reader_hp.protect_ptr(0, addr);
        reader_ready_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        reader_hp.clear_one(0);
    });

    reader_ready_rx.recv().unwrap();
    hp.retire(NonNull::new(node).unwrap());
    assert_eq!(freed.load(Ordering::Relaxed), 0, "a protected node must not be reclaimed yet");

    release_tx.send(()).unwrap();
    reader.join().unwrap();

    // a subsequent retire triggers a rescan that now finds the node free.
    let other = Box::into_raw(Box::new(8u64));
    hp.retire(NonNull::new(other).unwrap());
    assert_eq!(freed.load(Ordering::Relaxed), 2);
}

#[test]
fn many_threads_protect_and_retire_concurrently() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let freed = Arc::new(AtomicUsize::new(0));
    let freed2 = Arc::clone(&freed);
    let hp: Arc<HazardPointers<usize>> = Arc::new(HazardPointers::new(
        Config::with_params(THREADS, 1, 0),
        move |ptr| {
            freed2.fetch_add(1, Ordering::Relaxed);
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        },
    ));

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let hp = Arc::clone(&hp);
        handles.push(thread::spawn(move || {
            for i in 0..ROUNDS {
                let ptr = Box::into_raw(Box::new(i));
                hp.protect_ptr(0, ptr as usize);
                hp.clear_one(0);
                hp.retire(NonNull::new(ptr).unwrap());
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(freed.load(Ordering::Relaxed), THREADS * ROUNDS);
}
