//! The per-worker local deque: LIFO for the owner, FIFO for thieves.
//!
//! Structurally a Chase-Lev deque, with two departures from the classic
//! lock-free design: the backing buffer grows instead of being fixed size,
//! and a short-held "foreign lock" serializes the operations that aren't
//! safe to leave fully lock-free once growth and out-of-order removal are in
//! the mix (buffer growth itself, [`LocalDeque::find_and_remove`], a
//! contended owner pop, and theft). The owner's fast-path push and the
//! common-case pop never take the lock.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};

use spin::Mutex as SpinLock;

use crate::item::Work;

const INITIAL_CAPACITY: usize = 32;
const MAX_CAPACITY: usize = 1 << 20;

/// Once `top` reaches this value, the next push rebases both indices back
/// down near zero instead of risking an overflow on further increments. In
/// practice no real workload pushes anywhere near `isize::MAX` times; this
/// exists so the rebase path has defined behavior and is exercisable by
/// tests rather than being purely theoretical.
const OVERFLOW_SENTINEL: isize = isize::MAX - 4;

// -----------------------------------------------------------------------------
// Buffer

/// A fixed-size power-of-two ring buffer of slots. Once published, a buffer
/// is never resized in place; growth allocates a new one and copies across
/// under the foreign lock.
struct Buffer {
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<Work>>]>,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Buffer { mask: capacity - 1, slots }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Writes `value` into the slot for index `i`. The caller must own
    /// exclusive access to that slot (either as sole producer at `tail`, or
    /// holding the foreign lock).
    unsafe fn write(&self, i: isize, value: Work) {
        let slot = &self.slots[i as usize & self.mask];
        unsafe { (*slot.get()).write(value) };
    }

    /// Reads the slot for index `i` out without checking liveness; caller
    /// must know a value was written there and not yet taken.
    unsafe fn read(&self, i: isize) -> Work {
        let slot = &self.slots[i as usize & self.mask];
        unsafe { (*slot.get()).assume_init_read() }
    }
}

// -----------------------------------------------------------------------------
// LocalDeque

/// Outcome of a [`LocalDeque::steal`] attempt.
#[derive(Debug)]
pub enum StealOutcome {
    /// An item was removed and is now owned by the caller.
    Stolen(Work),
    /// The deque was empty at the time of the attempt.
    Empty,
    /// Another thief (or the owner) currently holds the foreign lock, or a
    /// racing owner pop already claimed the last item. The caller should
    /// treat this the same as `Empty` for scanning purposes, but it is
    /// reported separately since a retry might succeed where `Empty` won't.
    Contended,
}

/// A growable work-stealing deque owned by exactly one worker thread.
///
/// The owner calls [`push`](Self::push) and [`pop`](Self::pop) from its own
/// dispatch loop; any thread (including the owner itself, via
/// [`find_and_remove`](Self::find_and_remove)) may call [`steal`](Self::steal)
/// or `find_and_remove`.
pub struct LocalDeque {
    /// Next free slot index; only the owner ever writes this.
    top: AtomicIsize,
    /// Next slot to steal from; advanced by both the owner (on contended
    /// pop) and thieves.
    bottom: AtomicIsize,
    buffer: AtomicPtr<Buffer>,
    foreign_lock: SpinLock<()>,
    #[cfg(debug_assertions)]
    owner: std::thread::ThreadId,
}

// SAFETY: the owner-only operations assert thread identity in debug builds;
// every other field is synchronized through atomics or `foreign_lock`.
unsafe impl Send for LocalDeque {}
unsafe impl Sync for LocalDeque {}

impl LocalDeque {
    pub fn new() -> Self {
        let buffer = Box::into_raw(Box::new(Buffer::new(INITIAL_CAPACITY)));
        LocalDeque {
            top: AtomicIsize::new(0),
            bottom: AtomicIsize::new(0),
            buffer: AtomicPtr::new(buffer),
            foreign_lock: SpinLock::new(()),
            #[cfg(debug_assertions)]
            owner: std::thread::current().id(),
        }
    }

    #[inline]
    fn assert_owner(&self) {
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            std::thread::current().id(),
            self.owner,
            "push/pop called from a thread other than the deque's owner"
        );
    }

    /// Pushes a new item onto the owner's end. Only ever called by the
    /// owning worker.
    pub fn push(&self, value: Work) {
        self.assert_owner();

        let top = self.top.load(Ordering::Relaxed);
        if top >= OVERFLOW_SENTINEL {
            self.rebase_overflow();
            return self.push(value);
        }

        let bottom = self.bottom.load(Ordering::Acquire);
        // SAFETY: the buffer pointer is only ever replaced by `grow`, which
        // keeps the old one alive until no thief can still be using it.
        let buf = unsafe { &*self.buffer.load(Ordering::Acquire) };

        let len = top - bottom;
        if len as usize >= buf.capacity() {
            self.grow(top, bottom);
            self.push(value);
            return;
        }

        // SAFETY: slot `top` is past every index a thief could be reading,
        // since `len < capacity` and the owner is the sole writer here.
        unsafe { buf.write(top, value) };
        self.top.store(top + 1, Ordering::Release);
    }

    #[cold]
    fn grow(&self, top: isize, bottom: isize) {
        let _guard = self.foreign_lock.lock();

        let old_ptr = self.buffer.load(Ordering::Acquire);
        // SAFETY: still the live buffer; we hold the foreign lock so no
        // thief can be mid-steal against the index range we're about to move.
        let old = unsafe { &*old_ptr };

        let len = (top - bottom) as usize;
        let new_capacity = (old.capacity() * 2).max(INITIAL_CAPACITY);
        assert!(new_capacity <= MAX_CAPACITY, "local deque exceeded its maximum capacity");

        let new_buf = Buffer::new(new_capacity);
        for i in bottom..top {
            // SAFETY: every index in `[bottom, top)` was written by a prior
            // push and not yet consumed, by definition of `len`.
            unsafe {
                let value = old.read(i);
                new_buf.write(i, value);
            }
        }
        debug_assert_eq!(len, (top - bottom) as usize);

        let new_ptr = Box::into_raw(Box::new(new_buf));
        self.buffer.store(new_ptr, Ordering::Release);

        // Safe to free immediately: every non-owner access to `old_ptr` also
        // takes `foreign_lock`, and we still hold it.
        // SAFETY: `old_ptr` came from a prior `Box::into_raw` in `new`/`grow`.
        drop(unsafe { Box::from_raw(old_ptr) });
    }

    /// Rebases `top`/`bottom` back down near zero, physically compacting the
    /// live range into the same-capacity buffer so slot addresses match the
    /// new indices. Unlike `grow`, this changes the index base, so (unlike
    /// growth) the old physical slot positions can't just be reused as-is.
    #[cold]
    fn rebase_overflow(&self) {
        let _guard = self.foreign_lock.lock();

        let top = self.top.load(Ordering::Relaxed);
        if top < OVERFLOW_SENTINEL {
            // Another push already rebased while we waited for the lock.
            return;
        }
        let bottom = self.bottom.load(Ordering::Relaxed);

        let old_ptr = self.buffer.load(Ordering::Acquire);
        // SAFETY: still the live buffer, guarded by the lock we hold.
        let old = unsafe { &*old_ptr };

        let len = top - bottom;
        let compacted = Buffer::new(old.capacity());
        for (offset, i) in (bottom..top).enumerate() {
            // SAFETY: every index in `[bottom, top)` holds a live value.
            unsafe {
                let value = old.read(i);
                compacted.write(offset as isize, value);
            }
        }

        let new_ptr = Box::into_raw(Box::new(compacted));
        self.buffer.store(new_ptr, Ordering::Release);
        // SAFETY: `old_ptr` came from a prior `Box::into_raw`.
        drop(unsafe { Box::from_raw(old_ptr) });

        self.bottom.store(0, Ordering::Relaxed);
        self.top.store(len, Ordering::Release);
    }

    #[cfg(test)]
    fn inject_indices_near_overflow(&self) {
        self.bottom.store(OVERFLOW_SENTINEL, Ordering::Relaxed);
        self.top.store(OVERFLOW_SENTINEL, Ordering::Relaxed);
    }

    /// Pops the most recently pushed item, if any. Only ever called by the
    /// owning worker.
    pub fn pop(&self) -> Option<Work> {
        self.assert_owner();

        let top = self.top.load(Ordering::Relaxed);
        if top == self.bottom.load(Ordering::Relaxed) {
            return None;
        }

        let new_top = top - 1;
        self.top.store(new_top, Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::SeqCst);

        if new_top > bottom {
            // Plenty of slack between the two ends; no thief can be racing
            // us for this slot.
            let buf = unsafe { &*self.buffer.load(Ordering::Acquire) };
            return Some(unsafe { buf.read(new_top) });
        }

        if new_top < bottom {
            // Already empty; restore `top` and report nothing.
            self.top.store(bottom, Ordering::Relaxed);
            return None;
        }

        // Exactly one item left: a thief might be racing us for it. Settle
        // the race under the foreign lock, same as a thief would.
        let _guard = self.foreign_lock.lock();
        let result = if self
            .bottom
            .compare_exchange(bottom, bottom + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            let buf = unsafe { &*self.buffer.load(Ordering::Acquire) };
            Some(unsafe { buf.read(new_top) })
        } else {
            None
        };
        self.top.store(bottom + 1, Ordering::Relaxed);
        result
    }

    /// Attempts to remove one item from the thief's end. Safe to call from
    /// any thread, including the owner (used by [`find_and_remove`] callers
    /// elsewhere in the dispatch loop to treat the local deque like any
    /// other victim when it's otherwise empty).
    pub fn steal(&self) -> StealOutcome {
        let Some(_guard) = self.foreign_lock.try_lock() else {
            return StealOutcome::Contended;
        };

        let bottom = self.bottom.load(Ordering::Acquire);
        let top = self.top.load(Ordering::SeqCst);

        if bottom >= top {
            return StealOutcome::Empty;
        }

        let buf = unsafe { &*self.buffer.load(Ordering::Acquire) };
        // SAFETY: `bottom` is within `[bottom, top)`, which the lock above
        // protects from a concurrent owner `grow`/contended `pop`.
        let value = unsafe { buf.read(bottom) };

        if self
            .bottom
            .compare_exchange(bottom, bottom + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            StealOutcome::Stolen(value)
        } else {
            // The owner's contended pop beat us to it; the value we read is
            // actually still owned by that racing pop. Leak nothing: write
            // it back before reporting contention.
            unsafe { buf.write(bottom, value) };
            StealOutcome::Contended
        }
    }

    /// Scans the deque for an item satisfying `predicate` and removes it if
    /// found, preserving the relative order of the remaining items.
    ///
    /// This is the only operation that can remove from the middle of the
    /// deque; it always takes the foreign lock; callers should not expect it
    /// to be cheap.
    pub fn find_and_remove(&self, mut predicate: impl FnMut(&Work) -> bool) -> Option<Work> {
        self.assert_owner();
        let _guard = self.foreign_lock.lock();

        let bottom = self.bottom.load(Ordering::Acquire);
        let top = self.top.load(Ordering::Acquire);
        if bottom >= top {
            return None;
        }

        let buf = unsafe { &*self.buffer.load(Ordering::Acquire) };

        let mut found_at = None;
        for i in bottom..top {
            // SAFETY: every index in `[bottom, top)` holds a live value, and
            // we hold the foreign lock so nothing else is reading it.
            let value = unsafe { &*(buf.slots[i as usize & buf.mask].get() as *const MaybeUninit<Work>) };
            let value = unsafe { value.assume_init_ref() };
            if predicate(value) {
                found_at = Some(i);
                break;
            }
        }

        let found_at = found_at?;
        let removed = unsafe { buf.read(found_at) };

        // Shift everything above the removed slot down by one to close the
        // gap, then shrink `top`. Items below `found_at` (closer to the
        // thief end) are left untouched.
        for i in found_at..top - 1 {
            unsafe {
                let next = buf.read(i + 1);
                buf.write(i, next);
            }
        }
        self.top.store(top - 1, Ordering::Release);

        Some(removed)
    }

    /// `true` if the deque looked empty at the moment of the call. Racy by
    /// nature; intended only for heuristics like deciding whether to scan
    /// this deque as a steal victim.
    pub fn is_empty(&self) -> bool {
        let bottom = self.bottom.load(Ordering::Acquire);
        let top = self.top.load(Ordering::Acquire);
        bottom >= top
    }

    /// An approximate count of pending items, for diagnostics.
    pub fn len_estimate(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Acquire);
        let top = self.top.load(Ordering::Acquire);
        (top - bottom).max(0) as usize
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        unsafe { (*self.buffer.load(Ordering::Acquire)).capacity() }
    }
}

impl Default for LocalDeque {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalDeque {
    fn drop(&mut self) {
        let bottom = *self.bottom.get_mut();
        let top = *self.top.get_mut();
        let buf_ptr = *self.buffer.get_mut();
        // SAFETY: `&mut self` proves no other reference to this deque (and
        // hence no concurrent thief) can exist.
        let buf = unsafe { &*buf_ptr };
        for i in bottom..top {
            unsafe { drop(buf.read(i)) };
        }
        drop(unsafe { Box::from_raw(buf_ptr) });
    }
}

impl std::fmt::Debug for LocalDeque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDeque").field("len", &self.len_estimate()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Work;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use std::sync::Arc;

    fn counted(counter: &Arc<AtomicUsize>) -> Work {
        let counter = counter.clone();
        Work::from_fn(move || {
            counter.fetch_add(1, O::SeqCst);
        })
    }

    #[test]
    fn local_pop_is_lifo() {
        let counter = Arc::new(AtomicUsize::new(0));
        let deque = LocalDeque::new();
        let order = Arc::new(SpinLock::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            deque.push(Work::from_fn(move || order.lock().push(i)));
        }
        while let Some(w) = deque.pop() {
            w.execute();
        }

        assert_eq!(*order.lock(), vec![4, 3, 2, 1, 0]);
        let _ = counted(&counter);
    }

    #[test]
    fn steal_is_fifo_relative_to_push_order() {
        let deque = LocalDeque::new();
        let order = Arc::new(SpinLock::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            deque.push(Work::from_fn(move || order.lock().push(i)));
        }

        for _ in 0..5 {
            match deque.steal() {
                StealOutcome::Stolen(w) => w.execute(),
                other => panic!("expected a stolen item, got {other:?}"),
            }
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn steal_on_empty_reports_empty() {
        let deque = LocalDeque::new();
        assert!(matches!(deque.steal(), StealOutcome::Empty));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let deque = LocalDeque::new();
        let start_capacity = deque.capacity();
        for _ in 0..(start_capacity * 4) {
            deque.push(Work::from_fn(|| {}));
        }
        assert!(deque.capacity() > start_capacity);
        let mut popped = 0;
        while deque.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, start_capacity * 4);
    }

    #[test]
    fn push_past_overflow_sentinel_rebases_indices() {
        let deque = LocalDeque::new();
        deque.inject_indices_near_overflow();

        let order = Arc::new(SpinLock::new(Vec::new()));
        {
            let order = order.clone();
            deque.push(Work::from_fn(move || order.lock().push("pushed")));
        }

        assert!(deque.top.load(Ordering::Relaxed) < OVERFLOW_SENTINEL);
        let popped = deque.pop().expect("the item pushed right after rebase survives it");
        popped.execute();
        assert_eq!(*order.lock(), vec!["pushed"]);
    }

    #[test]
    fn find_and_remove_preserves_relative_order() {
        let deque = LocalDeque::new();
        let order = Arc::new(SpinLock::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            deque.push(Work::from_fn(move || order.lock().push(i)));
        }

        let mut calls = 0;
        let removed = deque.find_and_remove(|_| {
            calls += 1;
            calls == 3
        });
        assert!(removed.is_some());
        removed.unwrap().execute();

        while let Some(w) = deque.pop() {
            w.execute();
        }
        assert_eq!(*order.lock(), vec![2, 4, 3, 1, 0]);
    }

    #[test]
    fn concurrent_owner_pop_and_thieves_see_each_item_once() {
        const ITEMS: usize = 20_000;
        let deque = Arc::new(LocalDeque::new());
        for _ in 0..ITEMS {
            deque.push(Work::from_fn(|| {}));
        }

        let total = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let deque = deque.clone();
                let total = total.clone();
                scope.spawn(move || loop {
                    match deque.steal() {
                        StealOutcome::Stolen(w) => {
                            w.execute();
                            total.fetch_add(1, O::SeqCst);
                        }
                        StealOutcome::Empty => break,
                        StealOutcome::Contended => continue,
                    }
                });
            }

            // The owner keeps popping on the same thread that created the
            // deque, racing the stealers above for the last few items.
            while let Some(w) = deque.pop() {
                w.execute();
                total.fetch_add(1, O::SeqCst);
            }
        });

        assert_eq!(total.load(O::SeqCst), ITEMS);
    }
}
