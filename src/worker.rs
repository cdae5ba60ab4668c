//! Per-worker state and the scoped handle that wires a worker into the
//! shared structures for the duration of its lifetime.
//!
//! A worker's local deque must be registered for theft while the worker is
//! alive and unregistered the instant it stops, on every exit path: a
//! normal return, a propagated panic, or anything in between. Rather than
//! relying on a finalizer to eventually notice the thread died, registration
//! is tied to the lifetime of a guard value so the compiler enforces
//! cleanup through ordinary RAII.

use std::sync::Arc;

use crate::aggregate::WorkQueueAggregate;
use crate::local_deque::LocalDeque;
use crate::xor_shift::XorShift64Star;

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<WorkerState>>> = const { std::cell::RefCell::new(None) };
}

/// Returns the [`WorkerState`] for the worker currently executing on this
/// thread, if any.
///
/// Used by [`crate::aggregate::WorkQueueAggregate::enqueue`]'s
/// `prefer_local` path and by
/// [`crate::aggregate::WorkQueueAggregate::local_find_and_pop`] to reach the
/// calling thread's own deque without the caller having to pass a handle
/// through every call site.
pub fn current() -> Option<Arc<WorkerState>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// The state a single worker thread owns for the lifetime of its dispatch
/// loop.
pub struct WorkerState {
    pub worker_id: usize,
    pub deque: Arc<LocalDeque>,
    pub rng: XorShift64Star,
    /// Alternates which tier (high-priority vs. everything else) gets first
    /// look at the start of a dispatch iteration.
    pub high_priority_turn: std::cell::Cell<bool>,
    /// `true` once this worker has won entry into the high-priority
    /// drain mode; see [`crate::dispatcher`]'s high-priority gating.
    pub high_priority_mode: std::cell::Cell<bool>,
    /// Cached `controller.logging_enabled()`, refreshed once per
    /// [`crate::dispatcher::run_quantum`] call rather than on every dispatched
    /// item, so a `tracing` subscriber swap only takes effect at a quantum
    /// boundary.
    pub logging_enabled: std::cell::Cell<bool>,
}

impl WorkerState {
    fn new(worker_id: usize) -> Self {
        let rng = XorShift64Star::fixed();
        rng.randomize();
        WorkerState {
            worker_id,
            deque: Arc::new(LocalDeque::new()),
            rng,
            high_priority_turn: std::cell::Cell::new(true),
            high_priority_mode: std::cell::Cell::new(false),
            logging_enabled: std::cell::Cell::new(false),
        }
    }
}

/// An RAII handle binding a [`WorkerState`] into an aggregate's registry and
/// (optionally) its assignment table for as long as it's alive.
///
/// Dropping it (including via unwind) transfers any remaining local items
/// to the main global queue, unregisters the deque, and releases any
/// assignable-queue slot, so a worker that panics mid-dispatch still leaves
/// the shared structures in a consistent, drainable state.
pub struct WorkerHandle {
    pub state: Arc<WorkerState>,
    aggregate: Arc<WorkQueueAggregate>,
}

impl WorkerHandle {
    /// Registers a fresh worker: creates its deque, publishes it into the
    /// registry, and attempts an assignable-queue binding if the aggregate
    /// has any assignable queues configured.
    pub fn enter(worker_id: usize, aggregate: Arc<WorkQueueAggregate>) -> Self {
        let state = Arc::new(WorkerState::new(worker_id));
        aggregate.registry.register(worker_id, state.deque.clone());
        aggregate.assignment.assign(worker_id);
        // Every dispatcher entry releases the shared latch once, before any
        // dequeue is attempted, so a subsequent idle result can re-arm it.
        aggregate.thread_request_latch.release();
        CURRENT.with(|cell| *cell.borrow_mut() = Some(state.clone()));
        WorkerHandle { state, aggregate }
    }

    pub fn assigned_queue(&self) -> Option<usize> {
        self.aggregate.assignment.assigned_queue(self.state.worker_id)
    }

    pub fn try_reassign(&self) -> bool {
        self.aggregate.assignment.try_reassign(self.state.worker_id)
    }

    /// Moves every item still on this worker's local deque onto the main
    /// global queue, arming the wake latch once if anything moved.
    fn drain_local_to_main(&self) {
        let mut drained_any = false;
        while let Some(item) = self.state.deque.pop() {
            self.aggregate.main_queue.enqueue(item);
            drained_any = true;
        }
        if drained_any && self.aggregate.thread_request_latch.arm() {
            self.aggregate.controller.request_worker();
        }
    }

    /// Retires this worker in place, without tearing down its registration:
    /// remaining local items are drained to the main global queue and its
    /// assignable-queue binding (if any) is released. Called when the
    /// external controller's completion verdict asks the dispatcher to stop
    /// (see [`crate::controller::ThreadCountController::notify_completion`]);
    /// the handle itself is left intact, since the caller decides separately
    /// whether to drop it.
    pub(crate) fn retire_in_place(&self) {
        self.drain_local_to_main();
        self.aggregate.assignment.unassign(self.state.worker_id);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        CURRENT.with(|cell| {
            let mut cell = cell.borrow_mut();
            if matches!(cell.as_ref(), Some(current) if Arc::ptr_eq(current, &self.state)) {
                *cell = None;
            }
        });

        self.drain_local_to_main();
        self.aggregate.assignment.unassign(self.state.worker_id);
        self.aggregate.registry.unregister(self.state.worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::RecordingController;
    use crate::item::Work;

    fn aggregate(processors: usize) -> Arc<WorkQueueAggregate> {
        Arc::new(WorkQueueAggregate::new(Arc::new(RecordingController::with_processors(processors))))
    }

    #[test]
    fn entering_registers_and_dropping_unregisters() {
        let agg = aggregate(4);

        {
            let handle = WorkerHandle::enter(0, agg.clone());
            assert_eq!(agg.registry.len(), 1);
            assert_eq!(handle.state.worker_id, 0);
        }

        assert_eq!(agg.registry.len(), 0);
    }

    #[test]
    fn unwind_during_dispatch_still_unregisters() {
        let agg = aggregate(4);

        let result = std::panic::catch_unwind({
            let agg = agg.clone();
            move || {
                let _handle = WorkerHandle::enter(0, agg);
                panic!("simulated dispatch failure");
            }
        });

        assert!(result.is_err());
        assert_eq!(agg.registry.len(), 0);
    }

    #[test]
    fn assignable_binding_follows_worker_lifetime() {
        let agg = aggregate(64);

        let handle = WorkerHandle::enter(0, agg.clone());
        assert_eq!(handle.assigned_queue(), Some(0));
        drop(handle);
        assert_eq!(agg.assignment.assigned_queue(0), None);
    }

    #[test]
    fn exiting_drains_local_items_to_the_main_queue() {
        let agg = aggregate(4);
        let handle = WorkerHandle::enter(0, agg.clone());
        handle.state.deque.push(Work::from_fn(|| {}));
        handle.state.deque.push(Work::from_fn(|| {}));

        drop(handle);

        assert!(agg.main_queue.try_dequeue().is_some());
        assert!(agg.main_queue.try_dequeue().is_some());
        assert!(agg.main_queue.try_dequeue().is_none());
    }
}
