//! The top-level handle tying every shared structure together: the tiered
//! queues, the assignment table, the deque registry, and the controller
//! boundary.
//!
//! This is the type applications (or, more precisely, the out-of-scope
//! submission surface built on top of this crate) hold onto. It owns
//! nothing that runs on its own — no threads, no timers — it just wires the
//! pieces other modules operate on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::assignment::AssignmentTable;
use crate::controller::ThreadCountController;
use crate::dispatcher::{self, DispatchOutcome, QuantumOutcome};
use crate::item::Work;
use crate::latch::ThreadRequestLatch;
use crate::registry::Registry;
use crate::shared_queue::SharedQueue;
use crate::worker::WorkerHandle;

/// Per-queue worker cap from [`crate::assignment`]; above this many
/// processors, queues start getting added rather than just workers piling
/// onto existing ones.
const WORKERS_PER_ASSIGNABLE_QUEUE: usize = 16;

/// Below this processor count, there is exactly one global queue and no
/// assignable tier at all.
const ASSIGNABLE_TIER_THRESHOLD: usize = 32;

fn assignable_queue_count(processor_count: usize) -> usize {
    if processor_count <= ASSIGNABLE_TIER_THRESHOLD {
        0
    } else {
        processor_count.div_ceil(WORKERS_PER_ASSIGNABLE_QUEUE)
    }
}

/// Where a pending item was observed by [`WorkQueueAggregate::enumerate_items`].
///
/// Carries no information about the item itself, only its tier (and, for the
/// two tiers with more than one queue, which one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingLocation {
    HighPriority,
    Assignable(usize),
    Main,
    Local(usize),
}

/// The full set of shared state the dispatch loop reads and writes,
/// independent of any one worker.
pub struct WorkQueueAggregate {
    pub(crate) registry: Registry,
    pub(crate) assignment: Arc<AssignmentTable>,
    pub(crate) main_queue: SharedQueue<Work>,
    pub(crate) high_priority_queue: SharedQueue<Work>,
    pub(crate) assignable_queues: Vec<SharedQueue<Work>>,
    pub(crate) may_have_high_priority_work: AtomicBool,
    /// Coalesces "please wake a worker" requests across every enqueue path
    /// and every worker's idle path. Released exactly once per dispatcher
    /// entry, in [`crate::worker::WorkerHandle::enter`].
    pub(crate) thread_request_latch: ThreadRequestLatch,
    pub(crate) controller: Arc<dyn ThreadCountController>,
}

impl WorkQueueAggregate {
    /// Builds a fresh aggregate sized from `controller.processor_count()`.
    pub fn new(controller: Arc<dyn ThreadCountController>) -> Self {
        let processors = controller.processor_count();
        let assignable_count = assignable_queue_count(processors);

        WorkQueueAggregate {
            registry: Registry::new(),
            assignment: Arc::new(AssignmentTable::new(assignable_count, processors.max(1))),
            main_queue: SharedQueue::new(),
            high_priority_queue: SharedQueue::new(),
            assignable_queues: (0..assignable_count).map(|_| SharedQueue::new()).collect(),
            may_have_high_priority_work: AtomicBool::new(false),
            thread_request_latch: ThreadRequestLatch::new(),
            controller,
        }
    }

    /// Registers a new worker, binding it into the registry and (if the
    /// assignable tier exists) onto a queue. The returned handle must be
    /// kept alive for the worker's entire run; dropping it tears down the
    /// registration.
    pub fn spawn_worker(self: &Arc<Self>, worker_id: usize) -> WorkerHandle {
        WorkerHandle::enter(worker_id, self.clone())
    }

    /// Submits `item` for execution.
    ///
    /// If `prefer_local` is set and the caller is itself a worker thread
    /// currently inside a [`WorkerHandle`], the item is pushed directly onto
    /// that worker's own deque instead of the main global queue. This is
    /// the fast path for work a worker spawns for itself (continuations,
    /// fan-out), and it means the item can be picked up without crossing to
    /// a shared structure at all.
    pub fn enqueue(&self, item: Work, prefer_local: bool) {
        if prefer_local {
            if let Some(state) = crate::worker::current() {
                state.deque.push(item);
                self.arm_and_request();
                return;
            }
        }
        self.main_queue.enqueue(item);
        self.arm_and_request();
    }

    /// Submits `item` to the high-priority tier, checked ahead of every
    /// other shared queue in the dispatch order.
    pub fn enqueue_high_priority(&self, item: Work) {
        self.high_priority_queue.enqueue(item);
        self.may_have_high_priority_work.store(true, Ordering::Release);
        self.arm_and_request();
    }

    /// Arms the shared wake latch and, if this call won the arm race, asks
    /// the controller for another worker. Every enqueue path ends with this.
    fn arm_and_request(&self) {
        if self.thread_request_latch.arm() {
            self.controller.request_worker();
        }
    }

    /// Scans the calling worker's own local deque for an item matching
    /// `predicate` and removes it if found. Returns `None` immediately (no
    /// scan) if the caller isn't currently a worker thread.
    ///
    /// Intended for cancellation: pulling a specific queued item back out
    /// before it runs, without disturbing the rest of the deque's order.
    pub fn local_find_and_pop(&self, predicate: impl FnMut(&Work) -> bool) -> Option<Work> {
        crate::worker::current().and_then(|state| state.deque.find_and_remove(predicate))
    }

    /// Reports every pending item's location, in the same priority order
    /// [`dispatcher`] searches: high-priority, assignable, main, then each
    /// registered worker's local deque.
    ///
    /// The core never inspects a work item's contents (see [`crate::item`]),
    /// so each entry is a placeholder naming *where* an item was observed,
    /// not what it is — the same "may yield a NULL the caller must filter"
    /// spirit as the source, just without pretending the opaque [`Work`]
    /// handle supports peeking. Built eagerly rather than as a true lazy
    /// iterator: every queue here is guarded by a short-held spin lock, and
    /// a lazy iterator would have to hold one of those locks open across
    /// however long the caller takes between `next()` calls, which would let
    /// an idle caller stall every worker touching that queue.
    pub fn enumerate_items(&self) -> Vec<PendingLocation> {
        let mut out = Vec::with_capacity(self.pending_count());
        out.extend(std::iter::repeat_n(PendingLocation::HighPriority, self.high_priority_queue.len_estimate()));
        for (index, queue) in self.assignable_queues.iter().enumerate() {
            out.extend(std::iter::repeat_n(PendingLocation::Assignable(index), queue.len_estimate()));
        }
        out.extend(std::iter::repeat_n(PendingLocation::Main, self.main_queue.len_estimate()));
        for registration in self.registry.snapshot().iter() {
            let count = registration.deque.len_estimate();
            out.extend(std::iter::repeat_n(PendingLocation::Local(registration.worker_id), count));
        }
        out
    }

    /// An approximate total of everything currently queued: every shared
    /// queue plus every registered worker's local deque. Racy by
    /// construction; meant for diagnostics and load-shedding heuristics, not
    /// exact accounting.
    pub fn pending_count(&self) -> usize {
        let mut total = self.main_queue.len_estimate() + self.high_priority_queue.len_estimate();
        for queue in &self.assignable_queues {
            total += queue.len_estimate();
        }
        for registration in self.registry.snapshot().iter() {
            total += registration.deque.len_estimate();
        }
        total
    }

    /// Runs one [`dispatcher::dispatch_once`] against this aggregate for
    /// `handle`'s worker.
    pub fn dispatch_once(&self, handle: &WorkerHandle) -> DispatchOutcome {
        dispatcher::dispatch_once(self, handle)
    }

    /// Runs a full dispatch quantum for `handle`'s worker; see
    /// [`dispatcher::run_quantum`].
    pub fn run_quantum(&self, handle: &WorkerHandle) -> QuantumOutcome {
        dispatcher::run_quantum(self, handle)
    }
}
