//! A lock-free doubly-linked deque, reclaimed by per-node reference counting
//! rather than hazard pointers (the Sundell-Tsigas algorithm).
//!
//! Every node carries a `refct_claim` counter: the upper bits are an
//! ordinary external reference count (stepped by two per reference), and the
//! low bit is a "claim" flag that flips once the count would otherwise hit
//! zero, marking the node as mid-reclamation. `copy`/`release`/`read`/
//! `read_del` are the only primitives allowed to touch that counter; every
//! other operation goes through them so that a node's memory is freed
//! exactly once, by whichever `release` call observes the count drop to the
//! claim state.
//!
//! `head` and `tail` are permanent sentinels that self-loop (`head.prev ==
//! head`, `tail.next == tail`) and cross-reference each other when the deque
//! is empty; their reference counts are seeded to account for those four
//! structural edges plus the [`Deque`] handle's own hold, and they are only
//! ever freed by [`Drop for Deque`](Deque), never through the normal
//! `release` path.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::tagged::{is_marked, mark, unmark};

/// Self-loops (2) + cross-edges to the other sentinel (2) + the [`Deque`]
/// handle's own permanent hold (2).
const SENTINEL_INITIAL_REFCT: usize = 6;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Node<T> {
    value: UnsafeCell<Option<T>>,
    prev: AtomicUsize,
    next: AtomicUsize,
    refct_claim: AtomicUsize,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> NonNull<Self> {
        let node = Box::new(Self {
            value: UnsafeCell::new(value),
            prev: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            // a freshly created node starts with exactly one reference: the
            // local variable that is about to link it in.
            refct_claim: AtomicUsize::new(2),
        });
        // SAFETY: just allocated via `Box::into_raw`.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }
}

// only used for single-threaded construction/teardown of the sentinels.
unsafe impl<T> Send for Node<T> {}
unsafe impl<T> Sync for Node<T> {}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Deque
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free double-ended queue of values.
pub struct Deque<T> {
    head: NonNull<Node<T>>,
    tail: NonNull<Node<T>>,
}

// SAFETY: all shared mutation goes through atomics or the refcount
// protocol; crossing `T` across threads is gated on `T: Send` as usual.
unsafe impl<T: Send> Send for Deque<T> {}
unsafe impl<T: Send> Sync for Deque<T> {}

impl<T> Default for Deque<T>
where
    T: Send + 'static,
{
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deque<T>
where
    T: Send + 'static,
{
    /// Creates a new, empty deque.
    pub fn new() -> Self {
        let head = Box::into_raw(Box::new(Node {
            value: UnsafeCell::new(None),
            prev: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            refct_claim: AtomicUsize::new(SENTINEL_INITIAL_REFCT),
        }));
        let tail = Box::into_raw(Box::new(Node {
            value: UnsafeCell::new(None),
            prev: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            refct_claim: AtomicUsize::new(SENTINEL_INITIAL_REFCT),
        }));

        // SAFETY: both pointers were just allocated; this is the only
        // thread with access to them before the function returns.
        unsafe {
            (*head).prev.store(head as usize, Ordering::Relaxed);
            (*head).next.store(tail as usize, Ordering::Relaxed);
            (*tail).prev.store(head as usize, Ordering::Relaxed);
            (*tail).next.store(tail as usize, Ordering::Relaxed);
        }

        Self { head: unsafe { NonNull::new_unchecked(head) }, tail: unsafe { NonNull::new_unchecked(tail) } }
    }

    /********** reference-counting primitives ******************************************************/

    #[inline]
    fn copy(&self, n: NonNull<Node<T>>) -> NonNull<Node<T>> {
        // SAFETY: precondition is that the caller already holds a reference.
        unsafe { n.as_ref() }.refct_claim.fetch_add(2, Ordering::Relaxed);
        n
    }

    fn release(&self, n: NonNull<Node<T>>) {
        // SAFETY: precondition is that the caller holds the reference being
        // given up.
        let old = unsafe { n.as_ref() }.refct_claim.fetch_sub(2, Ordering::AcqRel);
        if old == 2 {
            // the decrement just observed above is the unique one that
            // brought the count to zero; no other thread can be mid-way
            // through acquiring a fresh reference to `n`; see `read`.
            unsafe { n.as_ref() }.refct_claim.store(1, Ordering::Release);
            self.release_references(n);
            // SAFETY: this is the only `release` call that could ever see
            // `old == 2` for this node, so reclaiming it here is unique.
            unsafe { drop(Box::from_raw(n.as_ptr())) };
        }
    }

    fn release_references(&self, n: NonNull<Node<T>>) {
        let prev = unmark(unsafe { n.as_ref() }.prev.load(Ordering::Acquire));
        let next = unmark(unsafe { n.as_ref() }.next.load(Ordering::Acquire));
        if prev != 0 {
            self.release(unsafe { NonNull::new_unchecked(prev as *mut Node<T>) });
        }
        if next != 0 {
            self.release(unsafe { NonNull::new_unchecked(next as *mut Node<T>) });
        }
    }

    /// Acquires a reference to the live node currently named by `link`, or
    /// `None` if that node is logically deleted.
    fn read(&self, link: &AtomicUsize) -> Option<NonNull<Node<T>>> {
        loop {
            let val = link.load(Ordering::Acquire);
            let addr = unmark(val);
            // SAFETY: every link always names a still-allocated node (its
            // own reference, or a sentinel's permanent one, keeps it alive).
            let node = unsafe { NonNull::new_unchecked(addr as *mut Node<T>) };
            unsafe { node.as_ref() }.refct_claim.fetch_add(2, Ordering::Acquire);
            if link.load(Ordering::Acquire) == val {
                if is_marked(val) {
                    self.release(node);
                    return None;
                }
                return Some(node);
            }
            self.release(node);
        }
    }

    /// Like [`read`](Self::read), but returns the node even if it is
    /// logically deleted; used by the deletion helpers, which must be able
    /// to walk through already-marked nodes.
    fn read_del(&self, link: &AtomicUsize) -> NonNull<Node<T>> {
        loop {
            let val = link.load(Ordering::Acquire);
            let addr = unmark(val);
            let node = unsafe { NonNull::new_unchecked(addr as *mut Node<T>) };
            unsafe { node.as_ref() }.refct_claim.fetch_add(2, Ordering::Acquire);
            if link.load(Ordering::Acquire) == val {
                return node;
            }
            self.release(node);
        }
    }

    /********** push **********************************************************************************/

    /// Pushes `value` onto the right (tail) end.
    pub fn push_right(&self, value: T) {
        let next = self.copy(self.tail);
        let prev = self
            .read(&unsafe { next.as_ref() }.prev)
            .expect("tail.prev is never logically deleted");
        self.push_between(prev, next, value);
    }

    /// Pushes `value` onto the left (head) end.
    pub fn push_left(&self, value: T) {
        let prev = self.copy(self.head);
        let next = self
            .read(&unsafe { prev.as_ref() }.next)
            .expect("head.next is never logically deleted");
        self.push_between(prev, next, value);
    }

    /// Links a fresh node holding `value` between `prev` and `next`, which
    /// must be adjacent (`prev.next == next`) at some point during the call;
    /// consumes both references.
    fn push_between(&self, mut prev: NonNull<Node<T>>, next: NonNull<Node<T>>, value: T) {
        let node = Node::boxed(Some(value));
        let next_addr = next.as_ptr() as usize;

        loop {
            let prev_next = unsafe { prev.as_ref() }.next.load(Ordering::Acquire);
            if unmark(prev_next) != next_addr {
                prev = self.help_insert(prev, next);
                continue;
            }

            // SAFETY: `node` is not yet reachable from any other thread.
            unsafe {
                (*node.as_ptr()).prev.store(prev.as_ptr() as usize, Ordering::Relaxed);
                (*node.as_ptr()).next.store(next_addr, Ordering::Relaxed);
            }

            if unsafe { prev.as_ref() }
                .next
                .compare_exchange(next_addr, node.as_ptr() as usize, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.copy(node);
                break;
            }
            std::hint::spin_loop();
        }

        self.push_common(node, next);
    }

    /// Finalizes the back-pointer of `next` (which must equal `n.next`) to
    /// point at `n`, repairing via [`help_insert`](Self::help_insert) if a
    /// concurrent deletion raced ahead of us.
    fn push_common(&self, n: NonNull<Node<T>>, next: NonNull<Node<T>>) {
        loop {
            let link1 = unsafe { next.as_ref() }.prev.load(Ordering::Acquire);
            if is_marked(link1) || unsafe { n.as_ref() }.next.load(Ordering::Acquire) != next.as_ptr() as usize {
                break;
            }
            if unsafe { next.as_ref() }
                .prev
                .compare_exchange(link1, n.as_ptr() as usize, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.copy(n);
                self.release(unsafe { NonNull::new_unchecked(unmark(link1) as *mut Node<T>) });
                if is_marked(unsafe { n.as_ref() }.prev.load(Ordering::Acquire)) {
                    let p = self.copy(n);
                    let fixed = self.help_insert(p, next);
                    self.release(fixed);
                }
                break;
            }
            std::hint::spin_loop();
        }
        self.release(next);
        self.release(n);
    }

    /********** pop ***********************************************************************************/

    /// Removes and returns the leftmost value, or `None` if the deque is
    /// empty.
    pub fn pop_left(&self) -> Option<T> {
        let mut prev = self.copy(self.head);
        loop {
            let node = match self.read(&unsafe { prev.as_ref() }.next) {
                Some(n) => n,
                None => continue,
            };

            if node.as_ptr() == self.tail.as_ptr() {
                self.release(node);
                self.release(prev);
                return None;
            }

            let link1 = unsafe { node.as_ref() }.next.load(Ordering::Acquire);
            if is_marked(link1) {
                self.help_delete(node);
                self.release(node);
                continue;
            }

            if unsafe { node.as_ref() }
                .next
                .compare_exchange(link1, mark(link1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.help_delete(node);
                let next = self.read_del(&unsafe { node.as_ref() }.next);
                let fixed_prev = self.help_insert(prev, next);
                self.release(fixed_prev);
                self.release(next);

                // SAFETY: `node` is logically deleted and this is the
                // unique thread that won the CAS above, so taking its
                // value happens exactly once.
                let value = unsafe { (*node.as_ref().value.get()).take() };
                self.remove_cross_reference(node);
                self.release(node);
                return value;
            }

            self.release(node);
            std::hint::spin_loop();
        }
    }

    /// Removes and returns the rightmost value, or `None` if the deque is
    /// empty.
    pub fn pop_right(&self) -> Option<T> {
        let mut next = self.copy(self.tail);
        loop {
            let node = match self.read(&unsafe { next.as_ref() }.prev) {
                Some(n) => n,
                None => continue,
            };

            if node.as_ptr() == self.head.as_ptr() {
                self.release(node);
                self.release(next);
                return None;
            }

            let link1 = unsafe { node.as_ref() }.next.load(Ordering::Acquire);
            if is_marked(link1) {
                self.help_delete(node);
                self.release(node);
                continue;
            }

            if unsafe { node.as_ref() }
                .next
                .compare_exchange(link1, mark(link1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.help_delete(node);
                let prev = self.read_del(&unsafe { node.as_ref() }.prev);
                let fixed_next = self.help_insert(prev, next);
                self.release(fixed_next);
                self.release(prev);

                let value = unsafe { (*node.as_ref().value.get()).take() };
                self.remove_cross_reference(node);
                self.release(node);
                return value;
            }

            self.release(node);
            std::hint::spin_loop();
        }
    }

    /********** deletion helpers ************************************************************************/

    /// Completes the logical deletion of `node` (already marked on `next`)
    /// by marking `prev` too, then physically unlinks it from whichever
    /// live predecessor it can find.
    fn help_delete(&self, node: NonNull<Node<T>>) {
        loop {
            let link1 = unsafe { node.as_ref() }.prev.load(Ordering::Acquire);
            if is_marked(link1) {
                break;
            }
            if unsafe { node.as_ref() }
                .prev
                .compare_exchange(link1, mark(link1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        let mut prev = self.read_del(&unsafe { node.as_ref() }.prev);
        let mut next = self.read_del(&unsafe { node.as_ref() }.next);
        let mut lastlink = false;

        while prev.as_ptr() != next.as_ptr() {
            if is_marked(unsafe { next.as_ref() }.next.load(Ordering::Acquire)) {
                let new_next = self.read_del(&unsafe { next.as_ref() }.next);
                self.release(next);
                next = new_next;
                continue;
            }

            match self.read(&unsafe { prev.as_ref() }.next) {
                None => {
                    if !lastlink {
                        self.help_delete(prev);
                        lastlink = true;
                    }
                    let new_prev = self.read_del(&unsafe { prev.as_ref() }.prev);
                    self.release(prev);
                    prev = new_prev;
                }
                Some(prev2) if prev2.as_ptr() != node.as_ptr() => {
                    self.release(prev);
                    prev = prev2;
                    lastlink = false;
                }
                Some(prev2) => {
                    self.release(prev2);
                    let node_addr = node.as_ptr() as usize;
                    let next_addr = next.as_ptr() as usize;
                    if unsafe { prev.as_ref() }
                        .next
                        .compare_exchange(node_addr, next_addr, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        self.copy(next);
                        self.release(node);
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        }

        self.release(prev);
        self.release(next);
    }

    /// Restores `node.prev == prev` when a concurrent deletion has left it
    /// stale, walking right from `prev` until finding the link that
    /// actually reaches `node`. Consumes `prev`'s reference and returns a
    /// (possibly different) live reference that does point at `node`.
    fn help_insert(&self, mut prev: NonNull<Node<T>>, node: NonNull<Node<T>>) -> NonNull<Node<T>> {
        let mut last: Option<NonNull<Node<T>>> = None;

        loop {
            let prev_next = unsafe { prev.as_ref() }.next.load(Ordering::Acquire);
            if is_marked(prev_next) {
                if let Some(l) = last {
                    self.help_delete(prev);
                    let repaired = unmark(unsafe { prev.as_ref() }.next.load(Ordering::Acquire));
                    let _ = unsafe { l.as_ref() }.next.compare_exchange(
                        prev.as_ptr() as usize,
                        repaired,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                    self.release(prev);
                    prev = l;
                    last = None;
                } else {
                    let prev2 = self.read_del(&unsafe { prev.as_ref() }.prev);
                    self.release(prev);
                    prev = prev2;
                }
                continue;
            }

            let next = match self.read(&unsafe { prev.as_ref() }.next) {
                Some(n) => n,
                None => continue,
            };

            if next.as_ptr() != node.as_ptr() {
                if let Some(l) = last {
                    self.release(l);
                }
                last = Some(prev);
                prev = next;
                continue;
            }
            self.release(next);

            let link1 = unsafe { node.as_ref() }.prev.load(Ordering::Acquire);
            if is_marked(link1) {
                break;
            }
            if unsafe { node.as_ref() }
                .prev
                .compare_exchange(link1, prev.as_ptr() as usize, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.copy(prev);
                self.release(unsafe { NonNull::new_unchecked(unmark(link1) as *mut Node<T>) });
                if is_marked(unsafe { prev.as_ref() }.prev.load(Ordering::Acquire)) {
                    continue;
                }
                break;
            }
            std::hint::spin_loop();
        }

        if let Some(l) = last {
            self.release(l);
        }
        prev
    }

    /// Rewrites `node`'s own (now purely historical) links to point, marked,
    /// at the nearest still-reachable neighbors, so that its last reference
    /// drops without tugging on live nodes.
    fn remove_cross_reference(&self, node: NonNull<Node<T>>) {
        loop {
            let prev_addr = unmark(unsafe { node.as_ref() }.prev.load(Ordering::Acquire));
            let prev = unsafe { NonNull::new_unchecked(prev_addr as *mut Node<T>) };
            let prev_deleted = is_marked(unsafe { prev.as_ref() }.next.load(Ordering::Acquire));

            let next_addr = unmark(unsafe { node.as_ref() }.next.load(Ordering::Acquire));
            let next = unsafe { NonNull::new_unchecked(next_addr as *mut Node<T>) };
            let next_deleted = is_marked(unsafe { next.as_ref() }.prev.load(Ordering::Acquire));

            if !prev_deleted && !next_deleted {
                break;
            }

            if prev_deleted {
                let prev2 = self.read_del(&unsafe { prev.as_ref() }.prev);
                unsafe { node.as_ref() }.prev.store(mark(prev2.as_ptr() as usize), Ordering::Release);
                self.release(prev2);
                self.release(prev);
            }
            if next_deleted {
                let next2 = self.read_del(&unsafe { next.as_ref() }.next);
                unsafe { node.as_ref() }.next.store(mark(next2.as_ptr() as usize), Ordering::Release);
                self.release(next2);
                self.release(next);
            }
        }
    }

    /// Walks the chain under no concurrent mutation and counts live nodes.
    /// Intended for tests and diagnostics.
    #[doc(hidden)]
    pub fn len_unsynchronized(&self) -> usize {
        let mut count = 0;
        let mut curr = unmark(unsafe { self.head.as_ref() }.next.load(Ordering::Relaxed));
        while curr != self.tail.as_ptr() as usize {
            count += 1;
            curr = unmark(unsafe { (*(curr as *const Node<T>)).next.load(Ordering::Relaxed) });
        }
        count
    }
}

impl<T> Drop for Deque<T> {
    fn drop(&mut self) {
        // No other thread may still be operating on `self` (the caller's
        // responsibility, matching `destroy` in the reference
        // implementation), so the chain is walked and freed directly,
        // bypassing the refcount protocol entirely.
        unsafe {
            let mut curr = self.head.as_ptr();
            loop {
                let next = unmark((*curr).next.load(Ordering::Relaxed)) as *mut Node<T>;
                let is_tail = curr == self.tail.as_ptr();
                drop(Box::from_raw(curr));
                if is_tail {
                    break;
                }
                curr = next;
            }
        }
    }
}

impl<T> std::fmt::Debug for Deque<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deque").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_on_one_side() {
        let deque = Deque::new();
        deque.push_right('a');
        deque.push_right('b');
        deque.push_right('c');
        assert_eq!(deque.pop_left(), Some('a'));
        assert_eq!(deque.pop_left(), Some('b'));
        assert_eq!(deque.pop_left(), Some('c'));
        assert_eq!(deque.pop_left(), None);
    }

    #[test]
    fn lifo_on_one_side() {
        let deque = Deque::new();
        deque.push_right('a');
        deque.push_right('b');
        assert_eq!(deque.pop_right(), Some('b'));
        assert_eq!(deque.pop_right(), Some('a'));
        assert_eq!(deque.pop_right(), None);
    }

    #[test]
    fn push_left_then_pop_right() {
        let deque = Deque::new();
        deque.push_left(1);
        deque.push_left(2);
        deque.push_left(3);
        // left-pushes land closest to head first, so a right-pop drains the
        // earliest push last.
        assert_eq!(deque.pop_right(), Some(1));
        assert_eq!(deque.pop_right(), Some(2));
        assert_eq!(deque.pop_right(), Some(3));
        assert_eq!(deque.pop_right(), None);
    }

    #[test]
    fn length_tracks_push_pop() {
        let deque = Deque::new();
        assert_eq!(deque.len_unsynchronized(), 0);
        deque.push_right(1);
        deque.push_right(2);
        assert_eq!(deque.len_unsynchronized(), 2);
        deque.pop_left();
        assert_eq!(deque.len_unsynchronized(), 1);
    }
}
