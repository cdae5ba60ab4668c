//! The tiered shared FIFO used for the main global queue, the high-priority
//! queue, and each assignable global queue.
//!
//! An unbounded MPMC FIFO built as a block-linked list with idle-block reuse,
//! rather than a ring buffer (which can't grow) or a plain segment queue
//! (which reallocates a fresh segment every time one fills). Producers and
//! consumers only ever contend on a short per-end spin lock; there is no
//! whole-queue lock.
use std::fmt;
use std::mem::MaybeUninit;
use std::panic::{RefUnwindSafe, UnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering::Acquire, Ordering::Release};

use crossbeam_utils::CachePadded;
use spin::Mutex as SpinLock;

const BLOCK_SIZE: usize = 64;

// -----------------------------------------------------------------------------
// Block

/// A single queue block, holding up to `BLOCK_SIZE` items.
struct Block<T> {
    /// `.0`: index of the next slot to pop. `.1`: cached copy of the tail
    /// bitmap, refreshed from `tail_state.1` only when it looks stale.
    head_cache: CachePadded<(usize, u64)>,
    /// `.0`: index of the next slot to fill. `.1`: a bit is set once the
    /// corresponding slot has been published.
    tail_state: CachePadded<(usize, AtomicU64)>,
    slots: [MaybeUninit<T>; BLOCK_SIZE],
    /// Link to the next block, null while this is the tail block.
    next: *mut Block<T>,
}

impl<T> Block<T> {
    #[cold]
    #[inline(never)]
    fn new() -> Box<Self> {
        Box::new(Block::<T> {
            head_cache: CachePadded::new((0, 0)),
            tail_state: CachePadded::new((0, AtomicU64::new(0))),
            // SAFETY: an array of `MaybeUninit` needs no initialization.
            slots: unsafe { MaybeUninit::uninit().assume_init() },
            next: ptr::null_mut(),
        })
    }

    fn reset(&mut self) {
        self.head_cache.0 = 0;
        self.head_cache.1 = 0;
        self.tail_state.0 = 0;
        self.tail_state.1.store(0, Release);
        self.next = ptr::null_mut();
    }
}

impl<T> Drop for Block<T> {
    fn drop(&mut self) {
        let start = self.head_cache.0;
        let end = self.tail_state.0;
        if start < end {
            // SAFETY: only slots in `[head, tail)` were ever written.
            unsafe {
                ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                    self.slots.as_mut_ptr().add(start) as *mut T,
                    end - start,
                ));
            }
        }
    }
}

// -----------------------------------------------------------------------------
// IdleQueue

/// A small pool of detached, reusable blocks, bounded so bursty workloads
/// can't pin down unbounded memory.
struct IdleQueue<T> {
    blocks: SpinLock<Vec<Box<Block<T>>>>,
    max_len: usize,
}

impl<T> IdleQueue<T> {
    const fn new(max_len: usize) -> Self {
        IdleQueue { blocks: SpinLock::new(Vec::new()), max_len }
    }

    /// Returns a detached block to the pool, dropping it if the pool is full.
    ///
    /// We drop the incoming block rather than the oldest one on overflow: its
    /// data is fresh in cache, while the oldest entry's isn't.
    fn recycle(&self, ptr: *mut Block<T>) {
        // SAFETY: caller transfers a uniquely-owned, fully detached block.
        let boxed = unsafe { Box::from_raw(ptr) };
        let mut blocks = self.blocks.lock();
        if blocks.len() < self.max_len {
            blocks.push(boxed);
        }
        drop(blocks);
    }

    /// Takes a block from the pool, freshly reset, allocating one if empty.
    fn take(&self) -> *mut Block<T> {
        let reused = self.blocks.lock().pop();
        match reused {
            Some(mut boxed) => {
                boxed.reset();
                Box::leak(boxed)
            }
            None => Box::leak(Block::<T>::new()),
        }
    }
}

// -----------------------------------------------------------------------------
// SharedQueue

/// An unbounded, lock-free-in-the-common-case MPMC FIFO.
///
/// Per-producer enqueue order is preserved; there is no ordering guarantee
/// across distinct producers. `try_dequeue` never blocks.
pub struct SharedQueue<T> {
    head: CachePadded<SpinLock<(*mut Block<T>, usize)>>,
    tail: CachePadded<SpinLock<(*mut Block<T>, usize)>>,
    idle: IdleQueue<T>,
}

// SAFETY: all mutable access to blocks goes through `head`/`tail`'s locks, or
// (for detached blocks) through the `idle` pool's lock.
unsafe impl<T: Send> Send for SharedQueue<T> {}
unsafe impl<T: Send> Sync for SharedQueue<T> {}
impl<T> UnwindSafe for SharedQueue<T> {}
impl<T> RefUnwindSafe for SharedQueue<T> {}

impl<T> Drop for SharedQueue<T> {
    fn drop(&mut self) {
        let mut ptr = self.head.lock().0;
        while !ptr.is_null() {
            // SAFETY: every live block is reachable exactly once from `head`
            // via `next` links, and nothing else still references it.
            unsafe {
                let boxed = Box::from_raw(ptr);
                ptr = boxed.next;
            }
        }
    }
}

impl<T> SharedQueue<T> {
    /// The idle pool keeps at most this many spare blocks around.
    const DEFAULT_IDLE_LIMIT: usize = 8;

    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::with_idle_limit(Self::DEFAULT_IDLE_LIMIT)
    }

    /// Creates an empty queue with a custom idle-block pool size.
    ///
    /// `idle_limit == 0` disables block reuse entirely (every detached block
    /// is freed immediately, like a plain segment queue).
    pub fn with_idle_limit(idle_limit: usize) -> Self {
        let block = Box::leak(Block::<T>::new());
        Self {
            head: CachePadded::new(SpinLock::new((block, 0))),
            tail: CachePadded::new(SpinLock::new((block, 0))),
            idle: IdleQueue::new(idle_limit),
        }
    }

    /// Appends `value` to the tail of the queue. Never blocks for long: the
    /// only contention is a short spin lock shared with other producers.
    pub fn enqueue(&self, value: T) {
        let mut guard = self.tail.lock();
        // SAFETY: `guard.0` always points at a live block.
        let block = unsafe { &mut *guard.0 };

        let index = block.tail_state.0;
        debug_assert!(index < BLOCK_SIZE);

        // SAFETY: `index` is within bounds and not yet published.
        unsafe { ptr::write(block.slots.as_mut_ptr().add(index) as *mut T, value) };

        if index + 1 == BLOCK_SIZE {
            let new_block = self.idle.take();
            block.next = new_block;
            guard.0 = new_block;
        }

        // The bit flag publishes the slot with `Release`; consumers pair this
        // with an `Acquire` load before reading it back.
        block.tail_state.0 = index + 1;
        block.tail_state.1.fetch_or(1 << index, Release);
    }

    /// Removes and returns the item at the head of the queue, or `None` if
    /// the queue currently appears empty. Never blocks.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut guard = self.head.lock();
        // SAFETY: `guard.0` always points at a live block.
        let block = unsafe { &mut *guard.0 };

        let index = block.head_cache.0;
        debug_assert!(index < BLOCK_SIZE);

        let bit = 1_u64 << index;
        if block.head_cache.1 & bit == 0 {
            block.head_cache.1 = block.tail_state.1.load(Acquire);
            if block.head_cache.1 & bit == 0 {
                return None;
            }
        }

        // SAFETY: the bit check above proves this slot was published.
        let value = unsafe { ptr::read(block.slots.as_ptr().add(index) as *mut T) };
        block.head_cache.0 = index + 1;

        if index + 1 == BLOCK_SIZE {
            let old = block as *mut Block<T>;
            let next = block.next;
            debug_assert!(!next.is_null(), "a full block always has a successor linked by enqueue");
            guard.0 = next;
            drop(guard);
            self.idle.recycle(old);
        }

        Some(value)
    }

    /// An approximate count, useful only for diagnostics. Concurrent
    /// producers/consumers may make this stale the instant it's read.
    pub fn len_estimate(&self) -> usize {
        let head_guard = self.head.lock();
        let head_ptr = head_guard.0;
        let head_index = unsafe { (*head_ptr).head_cache.0 };
        drop(head_guard);

        let tail_guard = self.tail.lock();
        let tail_ptr = tail_guard.0;
        let tail_index = unsafe { (*tail_ptr).tail_state.0 };
        drop(tail_guard);

        if ptr::eq(head_ptr, tail_ptr) {
            tail_index.saturating_sub(head_index)
        } else {
            // Best-effort: we don't walk the block chain under two locks at
            // once, so just report what's left in the head block.
            BLOCK_SIZE.saturating_sub(head_index)
        }
    }

    /// `true` if the queue looked empty at the moment of the call.
    pub fn is_empty(&self) -> bool {
        let mut guard = self.head.lock();
        let block = unsafe { &mut *guard.0 };
        let index = block.head_cache.0;
        let bit = 1_u64 << index;
        if block.head_cache.1 & bit == 0 {
            block.head_cache.1 = block.tail_state.1.load(Acquire);
            return block.head_cache.1 & bit == 0;
        }
        false
    }
}

impl<T> Default for SharedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SharedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("SharedQueue { .. }")
    }
}
