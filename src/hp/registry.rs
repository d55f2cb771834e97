//! The hazard pointer table and per-thread retired-pointer lists.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::cell::UnsafeCell;
use std::fmt;

use crossbeam_utils::CachePadded;

use crate::hp::config::{Config, MAX_HPS_CAP};
use crate::thread_id;

/// `0` is never a valid node address, so it doubles as "this slot protects
/// nothing".
const FREE: usize = 0;

type Row = CachePadded<[AtomicUsize; MAX_HPS_CAP]>;
type RetiredRow<T> = CachePadded<UnsafeCell<Vec<NonNull<T>>>>;

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardPointers
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A hazard pointer registry: a `max_threads x max_hps_per_thread` table of
/// pinned addresses plus one retired-pointer list per thread.
///
/// Every node type reclaimed through hazard pointers gets its own registry
/// instance (an [`OrderedSet`](crate::ordered_set::OrderedSet) owns exactly
/// one), rather than sharing a single process-wide table, matching the
/// reference implementation where `ll_list_new` allocates a private
/// `ll_hp_t`.
pub struct HazardPointers<T> {
    config: Config,
    table: Box<[Row]>,
    retired: Box<[RetiredRow<T>]>,
    delete_fn: Box<dyn Fn(NonNull<T>) + Send + Sync>,
}

// SAFETY: `table` is read by every thread and written only at the writer's
// own row. `retired` rows are an `UnsafeCell` for interior mutability, but
// each row is touched only by the thread that owns it (enforced by indexing
// through `thread_id::current()`), so concurrent access to the registry as a
// whole is still race-free.
unsafe impl<T> Sync for HazardPointers<T> {}
unsafe impl<T> Send for HazardPointers<T> {}

impl<T> fmt::Debug for HazardPointers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardPointers").field("config", &self.config).finish()
    }
}

/********** impl inherent *************************************************************************/

impl<T> HazardPointers<T> {
    /// Creates a new registry. `delete_fn` is invoked exactly once for every
    /// pointer passed to [`retire`](HazardPointers::retire), once no hazard
    /// pointer protects it any longer.
    #[inline]
    pub fn new(config: Config, delete_fn: impl Fn(NonNull<T>) + Send + Sync + 'static) -> Self {
        let table = (0..config.max_threads())
            .map(|_| CachePadded::new([0; MAX_HPS_CAP].map(AtomicUsize::new)))
            .collect();
        let retired = (0..config.max_threads())
            .map(|_| CachePadded::new(UnsafeCell::new(Vec::new())))
            .collect();

        Self { config, table, retired, delete_fn: Box::new(delete_fn) }
    }

    /// Returns the registry's configuration.
    #[inline]
    pub fn config(&self) -> Config {
        self.config
    }

    /// Stores `0` (no protection) into every slot owned by the calling
    /// thread, with release ordering.
    #[inline]
    pub fn clear(&self) {
        for slot in self.row(self.tid()).iter() {
            slot.store(FREE, Ordering::Release);
        }
    }

    /// Stores `0` into slot `i` owned by the calling thread, with release
    /// ordering.
    #[inline]
    pub fn clear_one(&self, i: usize) {
        self.row(self.tid())[i].store(FREE, Ordering::Release);
    }

    /// Repeatedly loads `atom`, publishes the observed address into slot
    /// `i`, and re-reads `atom` until two consecutive reads agree, at which
    /// point the returned address is safely pinned against reclamation.
    ///
    /// `atom` must only ever hold unmarked addresses (or `0`); the caller is
    /// responsible for stripping the mark bit before protecting a link.
    #[inline]
    pub fn protect(&self, i: usize, atom: &AtomicUsize) -> usize {
        let slot = &self.row(self.tid())[i];
        let mut seen = atom.load(Ordering::SeqCst);
        loop {
            slot.store(seen, Ordering::SeqCst);
            let now = atom.load(Ordering::SeqCst);
            if now == seen {
                return now;
            }
            seen = now;
        }
    }

    /// Unconditionally installs `ptr` in slot `i` and returns it.
    #[inline]
    pub fn protect_ptr(&self, i: usize, ptr: usize) -> usize {
        self.row(self.tid())[i].store(ptr, Ordering::Relaxed);
        ptr
    }

    /// Same as [`protect_ptr`](HazardPointers::protect_ptr), but with
    /// release ordering, for publishing a pin the caller has just acquired
    /// by other means (e.g. a prior [`protect`](HazardPointers::protect)
    /// call on a different slot).
    #[inline]
    pub fn protect_release(&self, i: usize, ptr: usize) -> usize {
        self.row(self.tid())[i].store(ptr, Ordering::Release);
        ptr
    }

    /// Appends `ptr` to the calling thread's retired list and attempts a
    /// reclamation scan once at least `scan_threshold` pointers are
    /// pending.
    #[inline]
    pub fn retire(&self, ptr: NonNull<T>) {
        let t = self.tid();
        // SAFETY: `retired[t]` is only ever accessed by thread `t`.
        let row = unsafe { &mut *self.retired[t].get() };
        row.push(ptr);

        if (row.len() as u32) < self.config.scan_threshold() {
            return;
        }

        self.scan(row);
    }

    /// Scans every hazard slot in the table and reclaims every entry in
    /// `row` that is not currently protected, preserving the relative order
    /// of whatever is not yet safe to reclaim.
    fn scan(&self, row: &mut Vec<NonNull<T>>) {
        // (REG:1) this `SeqCst` load pairs with the `SeqCst` stores in
        // `protect`/`protect_ptr`/`protect_release`, establishing that any
        // hazard published before this scan began is observed by it.
        row.retain(|&ptr| {
            let addr = ptr.as_ptr() as usize;
            let protected =
                self.table.iter().any(|row| row.iter().any(|slot| slot.load(Ordering::SeqCst) == addr));
            if protected {
                true
            } else {
                (self.delete_fn)(ptr);
                false
            }
        });
    }

    #[inline]
    fn row(&self, tid: usize) -> &[AtomicUsize; MAX_HPS_CAP] {
        &self.table[tid]
    }

    /// Returns the calling thread's dense id, asserting the contract that no
    /// more than `max_threads` distinct threads ever use this registry.
    #[inline]
    fn tid(&self) -> usize {
        let t = thread_id::current();
        assert!(
            t < self.config.max_threads(),
            "thread id {} exceeds configured max_threads {}",
            t,
            self.config.max_threads()
        );
        t
    }
}

/********** impl Drop ******************************************************************************/

impl<T> Drop for HazardPointers<T> {
    /// Reclaims every still-retired pointer unconditionally. The caller must
    /// ensure all worker threads have quiesced before this runs, exactly as
    /// the original `ll_hp_destroy` requires of its caller.
    #[inline]
    fn drop(&mut self) {
        for row in self.retired.iter_mut() {
            for ptr in row.get_mut().drain(..) {
                (self.delete_fn)(ptr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::hp::Config;

    #[test]
    fn protect_and_retire_without_readers() {
        let freed = Arc::new(AtomicUsize::new(0));
        let freed2 = Arc::clone(&freed);
        let hp: HazardPointers<u32> = HazardPointers::new(Config::default(), move |ptr| {
            freed2.fetch_add(1, Ordering::Relaxed);
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        });

        let boxed = Box::into_raw(Box::new(42u32));
        hp.retire(NonNull::new(boxed).unwrap());
        assert_eq!(freed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn retire_deferred_while_protected() {
        let freed = Arc::new(AtomicUsize::new(0));
        let freed2 = Arc::clone(&freed);
        let hp: HazardPointers<u32> = HazardPointers::new(Config::default(), move |ptr| {
            freed2.fetch_add(1, Ordering::Relaxed);
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        });

        let boxed = Box::into_raw(Box::new(7u32));
        let addr = boxed as usize;

        // the calling thread itself holds the hazard, so a retire on the same
        // thread must not reclaim it.
        hp.protect_ptr(0, addr);
        hp.retire(NonNull::new(boxed).unwrap());
        assert_eq!(freed.load(Ordering::Relaxed), 0, "protected pointer must not be reclaimed");

        hp.clear_one(0);
        // trigger another scan by retiring a second (unprotected) pointer.
        let other = Box::into_raw(Box::new(8u32));
        hp.retire(NonNull::new(other).unwrap());
        assert_eq!(freed.load(Ordering::Relaxed), 2, "both pointers must now be reclaimed");
    }

    #[test]
    fn cross_thread_hazard_blocks_reclamation() {
        let freed = Arc::new(AtomicUsize::new(0));
        let freed2 = Arc::clone(&freed);
        let hp: Arc<HazardPointers<u32>> = Arc::new(HazardPointers::new(Config::default(), move |ptr| {
            freed2.fetch_add(1, Ordering::Relaxed);
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }));

        let boxed = Box::into_raw(Box::new(99u32));
        let addr = boxed as usize;

        let reader_hp = Arc::clone(&hp);
        let (tx, rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let reader = thread::spawn(move || {
            reader_hp.protect_ptr(0, addr);
            tx.send(()).unwrap();
            release_rx.recv().unwrap();
            reader_hp.clear_one(0);
        });

        rx.recv().unwrap();
        hp.retire(NonNull::new(boxed).unwrap());
        assert_eq!(freed.load(Ordering::Relaxed), 0, "a hazard on another thread must block reclamation");

        release_tx.send(()).unwrap();
        reader.join().unwrap();

        let other = Box::into_raw(Box::new(100u32));
        hp.retire(NonNull::new(other).unwrap());
        assert_eq!(freed.load(Ordering::Relaxed), 2);
    }
}
