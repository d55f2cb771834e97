//! Integration tests for [`Deque`], exercised through the public API only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use hazptr_collections::Deque;

#[test]
fn fifo_on_one_side() {
    let deque = Deque::new();
    deque.push_right('A');
    deque.push_right('B');
    deque.push_right('C');

    assert_eq!(deque.pop_left(), Some('A'));
    assert_eq!(deque.pop_left(), Some('B'));
    assert_eq!(deque.pop_left(), Some('C'));
    assert_eq!(deque.pop_left(), None);
}

#[test]
fn lifo_on_one_side() {
    let deque = Deque::new();
    deque.push_right('A');
    deque.push_right('B');

    assert_eq!(deque.pop_right(), Some('B'));
    assert_eq!(deque.pop_right(), Some('A'));
    assert_eq!(deque.pop_right(), None);
}

/// Four threads (two right-biased pushers/poppers, two left-biased) hammer a
/// shared deque; the total of popped `MAGIC` sentinels plus whatever is left
/// in the deque must equal the number of successful pushes.
#[test]
fn interleaved_push_pop() {
    const MAGIC: u64 = 0xC0FFEE;
    const OPS_PER_THREAD: usize = 5_000;

    let deque = Arc::new(Deque::new());
    let pushes = Arc::new(AtomicUsize::new(0));
    let pops = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();

    for _ in 0..2 {
        let deque = Arc::clone(&deque);
        let pushes = Arc::clone(&pushes);
        handles.push(thread::spawn(move || {
            for _ in 0..OPS_PER_THREAD {
                deque.push_right(MAGIC);
                pushes.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for _ in 0..2 {
        let deque = Arc::clone(&deque);
        let pushes = Arc::clone(&pushes);
        handles.push(thread::spawn(move || {
            for _ in 0..OPS_PER_THREAD {
                deque.push_left(MAGIC);
                pushes.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for _ in 0..2 {
        let deque = Arc::clone(&deque);
        let pops = Arc::clone(&pops);
        handles.push(thread::spawn(move || {
            for _ in 0..OPS_PER_THREAD {
                if let Some(v) = deque.pop_left() {
                    assert_eq!(v, MAGIC);
                    pops.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for _ in 0..2 {
        let deque = Arc::clone(&deque);
        let pops = Arc::clone(&pops);
        handles.push(thread::spawn(move || {
            for _ in 0..OPS_PER_THREAD {
                if let Some(v) = deque.pop_right() {
                    assert_eq!(v, MAGIC);
                    pops.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    let remaining = deque.len_unsynchronized();
    assert_eq!(pops.load(Ordering::Relaxed) + remaining, pushes.load(Ordering::Relaxed));

    // drain whatever is left; every value must still be the sentinel.
    while let Some(v) = deque.pop_left() {
        assert_eq!(v, MAGIC);
    }
}

/// Instrumented payload whose `Drop` increments a shared counter, the same
/// idiom the teacher crate's `tests/integration.rs` uses to turn "did this
/// get freed" into an assertion instead of a hope.
struct DropCount(Arc<AtomicUsize>);
impl Drop for DropCount {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn drop_reclaims_every_node_exactly_once() {
    const COUNT: usize = 100;
    let dropped = Arc::new(AtomicUsize::new(0));

    let deque = Deque::new();
    for _ in 0..COUNT {
        deque.push_right(DropCount(Arc::clone(&dropped)));
    }
    drop(deque);

    assert_eq!(dropped.load(Ordering::Relaxed), COUNT);
}
