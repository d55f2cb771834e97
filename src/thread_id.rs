//! Process-wide dense thread identifiers.
//!
//! All [`HazardPointers`](crate::hp::HazardPointers) instances in a process
//! share the same id namespace, exactly as the reference implementation's
//! file-scope `tid_v_base`/`tid_v` statics do: a thread registers itself
//! once, the first time it touches *any* registry, and reuses that id for
//! every registry it subsequently interacts with.

use core::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: usize = NEXT_ID.fetch_add(1, Ordering::Relaxed);
}

/// Returns the dense id assigned to the calling thread, assigning one (via a
/// monotonic counter) the first time it is requested.
#[inline]
pub(crate) fn current() -> usize {
    THREAD_ID.with(|&id| id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn stable_within_thread() {
        assert_eq!(current(), current());
    }

    #[test]
    fn distinct_across_threads() {
        let a = current();
        let b = thread::spawn(current).join().unwrap();
        assert_ne!(a, b);
    }
}
