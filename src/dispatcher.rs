//! The dispatch loop: the fixed priority order a worker checks for its next
//! item, and the bookkeeping that wraps running one.
//!
//! Priority order, checked once per call to [`dispatch_once`]:
//! own local deque, then the high-priority queue (gated so it's skipped
//! entirely once it looks empty, with an alternation flag so a
//! perpetually-busy high-priority queue can't starve everything else), then
//! this worker's assigned queue (if any), then the main global queue, then
//! the other assignable queues in random order, then theft from another
//! worker's local deque, also in random order.
//!
//! None of this promises FIFO ordering across producers, or fairness
//! between items: the order above is a search order for *a* runnable item,
//! not a scheduling guarantee.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::aggregate::WorkQueueAggregate;
use crate::item::Work;
use crate::local_deque::StealOutcome;
use crate::worker::WorkerHandle;

/// How long a worker keeps dispatching in one stretch before re-checking
/// whether it should yield back to the controller.
pub const DISPATCH_QUANTUM: Duration = Duration::from_millis(30);

/// What happened on one call to [`dispatch_once`].
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// An item was found and run, and the controller's completion verdict
    /// said to keep going.
    Executed,
    /// Nothing was found anywhere in the priority chain.
    Idle,
    /// An item was found and run, but the controller's completion verdict
    /// asked this worker to retire. Local items have already been drained to
    /// the main global queue and the assignable-queue binding released; the
    /// caller decides whether to drop the [`WorkerHandle`] or keep it
    /// (now unassigned) around.
    Retired,
}

/// What happened after running a full quantum's worth of [`dispatch_once`]
/// calls via [`run_quantum`].
#[derive(Debug, PartialEq, Eq)]
pub enum QuantumOutcome {
    /// The quantum's time budget was used up while there was still work.
    QuantumExpired,
    /// The controller asked the worker to yield early.
    Yielded,
    /// The priority chain came up empty.
    Retired,
    /// The controller's completion verdict asked this worker to retire; see
    /// [`DispatchOutcome::Retired`].
    ControllerRetired,
}

/// High-priority tier, gated by a per-worker mode bit layered over the
/// shared `may_have_high_priority_work` flag.
///
/// A worker already in high-priority mode keeps draining that queue until it
/// looks empty, then drops out of the mode. A worker not yet in the mode
/// only enters it by winning the compare-exchange that flips the shared flag
/// from armed (1) to clear (0); if its subsequent dequeue then comes up
/// empty, it re-publishes the flag as armed for the next worker to try,
/// without itself entering the mode.
fn try_high_priority(aggregate: &WorkQueueAggregate, handle: &WorkerHandle) -> Option<Work> {
    let state = &handle.state;

    if state.high_priority_mode.get() {
        match aggregate.high_priority_queue.try_dequeue() {
            Some(item) => return Some(item),
            None => {
                state.high_priority_mode.set(false);
                return None;
            }
        }
    }

    if aggregate
        .may_have_high_priority_work
        .compare_exchange(true, false, Ordering::Acquire, Ordering::Acquire)
        .is_err()
    {
        return None;
    }

    match aggregate.high_priority_queue.try_dequeue() {
        Some(item) => {
            state.high_priority_mode.set(true);
            Some(item)
        }
        None => {
            aggregate.may_have_high_priority_work.store(true, Ordering::Release);
            None
        }
    }
}

/// Tier (c): this worker's own bound assignable queue, if it has one.
fn try_assigned_queue(aggregate: &WorkQueueAggregate, handle: &WorkerHandle) -> Option<Work> {
    let assigned = handle.assigned_queue()?;
    aggregate.assignable_queues[assigned].try_dequeue()
}

/// Tier (e): every *other* assignable queue, in randomized rotation.
fn try_other_assignable(aggregate: &WorkQueueAggregate, handle: &WorkerHandle) -> Option<Work> {
    let assigned = handle.assigned_queue();
    let count = aggregate.assignable_queues.len();
    if count == 0 {
        return None;
    }

    let start = handle.state.rng.next_usize(count);
    for offset in 0..count {
        let idx = (start + offset) % count;
        if Some(idx) == assigned {
            continue;
        }
        if let Some(item) = aggregate.assignable_queues[idx].try_dequeue() {
            return Some(item);
        }
    }
    None
}

fn try_steal(aggregate: &WorkQueueAggregate, handle: &WorkerHandle) -> Option<Work> {
    let snapshot = aggregate.registry.snapshot();
    let victims = snapshot
        .iter()
        .filter(|registration| registration.worker_id != handle.state.worker_id)
        .collect::<Vec<_>>();

    if victims.is_empty() {
        return None;
    }

    let start = handle.state.rng.next_usize(victims.len());
    for offset in 0..victims.len() {
        let idx = (start + offset) % victims.len();
        if let StealOutcome::Stolen(item) = victims[idx].deque.steal() {
            return Some(item);
        }
    }
    None
}

/// Finds and runs one item following the fixed priority order, or reports
/// that none was available.
///
/// Either way, this call ends by arming the shared request latch and (if
/// this call won the arm race) asking the controller for another worker:
/// finding an item amplifies the request in case more work is coming, and
/// finding nothing asks for help in case work arrives after this worker
/// stops looking.
pub fn dispatch_once(aggregate: &WorkQueueAggregate, handle: &WorkerHandle) -> DispatchOutcome {
    let state = &handle.state;

    // High priority work is checked first on alternating iterations only.
    // A tier that stays perpetually non-empty would otherwise starve every
    // other tier forever; alternating guarantees normal work gets looked at
    // at least every other iteration regardless of how busy the
    // high-priority queue is.
    let this_turn_favors_high_priority = state.high_priority_turn.get();
    state.high_priority_turn.set(!this_turn_favors_high_priority);

    let item = state.deque.pop().or_else(|| {
        if this_turn_favors_high_priority {
            try_high_priority(aggregate, handle)
                .or_else(|| try_assigned_queue(aggregate, handle))
                .or_else(|| aggregate.main_queue.try_dequeue())
                .or_else(|| try_other_assignable(aggregate, handle))
        } else {
            try_assigned_queue(aggregate, handle)
                .or_else(|| aggregate.main_queue.try_dequeue())
                .or_else(|| try_other_assignable(aggregate, handle))
                .or_else(|| try_high_priority(aggregate, handle))
        }
        .or_else(|| try_steal(aggregate, handle))
    });

    match item {
        Some(item) => {
            // Amplification: a found item may mean more work is coming, so
            // re-arm the shared latch and wake another worker if this call
            // wins the race.
            if aggregate.thread_request_latch.arm() {
                aggregate.controller.request_worker();
            }
            if state.logging_enabled.get() {
                tracing::trace!(worker_id = state.worker_id, "dispatching item");
            }
            item.execute();
            if aggregate.controller.notify_completion() {
                DispatchOutcome::Executed
            } else {
                handle.retire_in_place();
                DispatchOutcome::Retired
            }
        }
        None => {
            if aggregate.thread_request_latch.arm() {
                aggregate.controller.request_worker();
            }
            DispatchOutcome::Idle
        }
    }
}

/// Runs [`dispatch_once`] in a loop until the quantum's time budget is
/// spent, the controller asks the worker to yield, or the priority chain
/// comes up empty.
///
/// Every worker checks `should_yield_from_dispatch` between items rather
/// than mid-item: a running [`crate::item::WorkItem`] always runs to
/// completion once started.
pub fn run_quantum(aggregate: &WorkQueueAggregate, handle: &WorkerHandle) -> QuantumOutcome {
    handle.state.logging_enabled.set(aggregate.controller.logging_enabled());
    let deadline = Instant::now() + DISPATCH_QUANTUM;

    loop {
        if aggregate.controller.should_yield_from_dispatch() {
            return QuantumOutcome::Yielded;
        }

        match dispatch_once(aggregate, handle) {
            DispatchOutcome::Executed => {
                if Instant::now() >= deadline {
                    handle.try_reassign();
                    return QuantumOutcome::QuantumExpired;
                }
            }
            DispatchOutcome::Idle => return QuantumOutcome::Retired,
            DispatchOutcome::Retired => return QuantumOutcome::ControllerRetired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::WorkQueueAggregate;
    use crate::controller::test_support::RecordingController;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use std::sync::Arc;

    fn aggregate_with_processors(count: usize) -> (Arc<WorkQueueAggregate>, Arc<RecordingController>) {
        let controller = Arc::new(RecordingController::with_processors(count));
        let aggregate = Arc::new(WorkQueueAggregate::new(controller.clone()));
        (aggregate, controller)
    }

    #[test]
    fn own_deque_takes_priority_over_global() {
        let (aggregate, _controller) = aggregate_with_processors(4);
        let handle = aggregate.spawn_worker(0);
        let order = Arc::new(spin::Mutex::new(Vec::new()));

        {
            let order = order.clone();
            aggregate.main_queue.enqueue(Work::from_fn(move || order.lock().push("global")));
        }
        {
            let order = order.clone();
            handle.state.deque.push(Work::from_fn(move || order.lock().push("local")));
        }

        assert_eq!(dispatch_once(&aggregate, &handle), DispatchOutcome::Executed);
        assert_eq!(*order.lock(), vec!["local"]);
        assert_eq!(dispatch_once(&aggregate, &handle), DispatchOutcome::Executed);
        assert_eq!(*order.lock(), vec!["local", "global"]);
    }

    #[test]
    fn high_priority_is_checked_before_main_queue() {
        let (aggregate, _controller) = aggregate_with_processors(4);
        let handle = aggregate.spawn_worker(0);
        let order = Arc::new(spin::Mutex::new(Vec::new()));

        {
            let order = order.clone();
            aggregate.main_queue.enqueue(Work::from_fn(move || order.lock().push("main")));
        }
        {
            let order = order.clone();
            aggregate.enqueue_high_priority(Work::from_fn(move || order.lock().push("high")));
        }

        dispatch_once(&aggregate, &handle);
        assert_eq!(*order.lock(), vec!["high"]);
    }

    #[test]
    fn idle_worker_requests_another_thread_once() {
        let (aggregate, controller) = aggregate_with_processors(4);
        let handle = aggregate.spawn_worker(0);

        assert_eq!(dispatch_once(&aggregate, &handle), DispatchOutcome::Idle);
        assert_eq!(dispatch_once(&aggregate, &handle), DispatchOutcome::Idle);
        assert_eq!(controller.requests.load(O::SeqCst), 1);

        // Finding and running an item re-arms the latch too (amplification),
        // but the latch is already armed from the idle calls above, so this
        // doesn't produce a second request.
        handle.state.deque.push(Work::from_fn(|| {}));
        assert_eq!(dispatch_once(&aggregate, &handle), DispatchOutcome::Executed);
        assert_eq!(controller.requests.load(O::SeqCst), 1);

        // Nothing releases the latch again short of a fresh dispatcher
        // entry, so a further idle result still doesn't request a second
        // worker.
        assert_eq!(dispatch_once(&aggregate, &handle), DispatchOutcome::Idle);
        assert_eq!(controller.requests.load(O::SeqCst), 1);
    }

    #[test]
    fn steals_from_another_workers_deque_when_otherwise_empty() {
        let (aggregate, _controller) = aggregate_with_processors(4);
        let producer = aggregate.spawn_worker(0);
        let consumer = aggregate.spawn_worker(1);

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = ran.clone();
            producer.state.deque.push(Work::from_fn(move || {
                ran.fetch_add(1, O::SeqCst);
            }));
        }

        for _ in 0..5 {
            assert_eq!(dispatch_once(&aggregate, &consumer), DispatchOutcome::Executed);
        }
        assert_eq!(ran.load(O::SeqCst), 5);
    }

    #[test]
    fn controller_retire_verdict_drains_local_queue_and_unassigns() {
        let (aggregate, controller) = aggregate_with_processors(64);
        let handle = aggregate.spawn_worker(0);
        assert_eq!(handle.assigned_queue(), Some(0));

        handle.state.deque.push(Work::from_fn(|| {}));
        handle.state.deque.push(Work::from_fn(|| {}));
        controller.keep_running.store(false, O::SeqCst);

        assert_eq!(dispatch_once(&aggregate, &handle), DispatchOutcome::Retired);

        assert_eq!(handle.assigned_queue(), None);
        assert!(aggregate.main_queue.try_dequeue().is_some());
        assert!(aggregate.main_queue.try_dequeue().is_some());
        assert!(aggregate.main_queue.try_dequeue().is_none());
    }

    #[test]
    fn run_quantum_reports_controller_retired() {
        let (aggregate, controller) = aggregate_with_processors(4);
        let handle = aggregate.spawn_worker(0);
        handle.state.deque.push(Work::from_fn(|| {}));
        controller.keep_running.store(false, O::SeqCst);

        assert_eq!(run_quantum(&aggregate, &handle), QuantumOutcome::ControllerRetired);
    }
}
