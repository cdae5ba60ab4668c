//! The assignment table: which assignable global queue each worker feeds
//! from, and how many workers currently feed from each.
//!
//! Assignable queues only exist once the machine is big enough that a single
//! global queue would become a contention point (`processor_count > 32`);
//! below that threshold the table has zero queues and every lookup is a
//! no-op. Each queue is capped at 16 assigned workers so that, even on very
//! large machines, no single assignable queue's contention grows without
//! bound.

use spin::Mutex as SpinLock;

/// Per-queue worker cap. Chosen so a machine with hundreds of cores still
/// only contends a given assignable queue among a small, bounded group.
const MAX_WORKERS_PER_QUEUE: u32 = 16;

/// Tracks which assignable queue (if any) each worker is bound to, and how
/// many workers are currently bound to each queue.
pub struct AssignmentTable {
    /// `counts[q]` is the number of workers currently assigned to queue `q`.
    counts: SpinLock<Vec<u32>>,
    /// `assignments[worker_id]` is `Some(queue)` if that worker is bound.
    assignments: SpinLock<Vec<Option<usize>>>,
}

impl AssignmentTable {
    /// Builds a table with `queue_count` assignable queues (`0` disables
    /// assignment entirely) and room for `worker_capacity` workers.
    pub fn new(queue_count: usize, worker_capacity: usize) -> Self {
        AssignmentTable {
            counts: SpinLock::new(vec![0; queue_count]),
            assignments: SpinLock::new(vec![None; worker_capacity]),
        }
    }

    pub fn queue_count(&self) -> usize {
        self.counts.lock().len()
    }

    fn ensure_worker_slot(assignments: &mut Vec<Option<usize>>, worker_id: usize) {
        if worker_id >= assignments.len() {
            assignments.resize(worker_id + 1, None);
        }
    }

    /// Binds `worker_id` to the first assignable queue (scanned left to
    /// right) whose count is below the per-queue cap, incrementing that
    /// queue's count. Returns `None` if there are no assignable queues, or
    /// if every queue is already at the per-queue cap.
    ///
    /// This packs workers onto the earliest queues first: queue 0 fills to
    /// the cap before queue 1 ever gets a worker, and so on. When every
    /// queue is at capacity, the worker is left unassigned rather than
    /// placed on an over-full queue; it falls back to the main global queue
    /// until a slot frees up.
    pub fn assign(&self, worker_id: usize) -> Option<usize> {
        let mut counts = self.counts.lock();
        if counts.is_empty() {
            return None;
        }

        let target = counts.iter().position(|&c| c < MAX_WORKERS_PER_QUEUE)?;
        counts[target] += 1;
        drop(counts);

        let mut assignments = self.assignments.lock();
        Self::ensure_worker_slot(&mut assignments, worker_id);
        assignments[worker_id] = Some(target);

        Some(target)
    }

    /// Releases `worker_id`'s current assignment, if any, decrementing that
    /// queue's count.
    pub fn unassign(&self, worker_id: usize) {
        let mut assignments = self.assignments.lock();
        if worker_id >= assignments.len() {
            return;
        }
        if let Some(queue) = assignments[worker_id].take() {
            drop(assignments);
            let mut counts = self.counts.lock();
            counts[queue] = counts[queue].saturating_sub(1);
        }
    }

    /// Returns `worker_id`'s currently assigned queue, if any.
    pub fn assigned_queue(&self, worker_id: usize) -> Option<usize> {
        let assignments = self.assignments.lock();
        assignments.get(worker_id).copied().flatten()
    }

    /// Attempts to move `worker_id` onto an earlier, non-full queue without
    /// blocking. Returns `true` if a move happened. Used by the dispatcher's
    /// periodic rebalancing check, which should never stall waiting on this
    /// table if another worker is mid-assignment.
    ///
    /// Skipped entirely for a worker already on queue 0 (nothing earlier to
    /// move to) or whose current queue has only this one bound worker
    /// (moving it would just relocate the same single worker). Otherwise
    /// scans only the queues before the worker's current one, left to right,
    /// for the first with room — the same first-fit policy `assign` uses, so
    /// earlier queues refill as workers on later queues retire.
    pub fn try_reassign(&self, worker_id: usize) -> bool {
        let Some(mut counts) = self.counts.try_lock() else {
            return false;
        };
        if counts.is_empty() {
            return false;
        }

        let Some(mut assignments) = self.assignments.try_lock() else {
            return false;
        };
        Self::ensure_worker_slot(&mut assignments, worker_id);
        let Some(current) = assignments[worker_id] else {
            return false;
        };
        if current == 0 {
            return false;
        }
        if counts[current] <= 1 {
            return false;
        }

        let Some(target) = counts[..current].iter().position(|&c| c < MAX_WORKERS_PER_QUEUE) else {
            return false;
        };

        counts[current] = counts[current].saturating_sub(1);
        counts[target] += 1;
        assignments[worker_id] = Some(target);
        true
    }
}

impl Default for AssignmentTable {
    fn default() -> Self {
        Self::new(0, 0)
    }
}
