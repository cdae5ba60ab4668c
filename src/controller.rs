//! The boundary between this crate and everything it deliberately doesn't
//! own: how many OS threads exist, when they sleep or wake, timers, I/O, and
//! the public submission surface applications call into.
//!
//! The dispatch loop only ever reaches outward through this trait. Nothing
//! in this crate spawns a thread, starts a timer, or decides pool sizing;
//! all of that is the implementor's job.

/// Everything the dispatch core needs from its surrounding runtime.
///
/// A typical implementation owns the thread-count heuristics, a timer
/// wheel for starvation detection, and the public `submit`/`queue` API that
/// application code actually calls; this trait is the narrow slice of that
/// surface the dispatcher touches directly.
pub trait ThreadCountController: Send + Sync {
    /// Requests that another worker thread be made available to drain
    /// pending work, because the caller is about to go idle and work may
    /// still be arriving. Called at most once per idle window, already
    /// coalesced by [`crate::latch::ThreadRequestLatch`] before reaching
    /// here.
    fn request_worker(&self);

    /// Reports that a unit of work finished executing on the calling
    /// worker, and asks whether that worker should keep dispatching.
    ///
    /// Returning `false` asks the dispatcher to retire the calling worker
    /// immediately: any remaining local items are moved to the main global
    /// queue, the assignable-queue binding (if any) is released, and
    /// [`crate::dispatcher::dispatch_once`] reports
    /// [`crate::dispatcher::DispatchOutcome::Retired`] instead of
    /// [`crate::dispatcher::DispatchOutcome::Executed`].
    fn notify_completion(&self) -> bool;

    /// Polled periodically (at dispatch quantum boundaries) to ask whether
    /// the current worker should yield back to the runtime instead of
    /// continuing to pull more work this quantum, e.g. because the host
    /// wants to reclaim the thread or enforce a cooperative scheduling
    /// slice.
    fn should_yield_from_dispatch(&self) -> bool;

    /// `true` if per-worker diagnostic tracking (queue lengths, assignment
    /// churn) should be recorded. Left to the controller so the cost can be
    /// skipped entirely when nobody's watching.
    fn worker_tracking_enabled(&self) -> bool;

    /// `true` if structured log events should be emitted from the dispatch
    /// loop. Checked at quantum boundaries rather than per item, since a
    /// `tracing` subscriber swap mid-quantum is not something this crate
    /// needs to react to immediately.
    fn logging_enabled(&self) -> bool;

    /// The number of logical processors the controller wants the core to
    /// size its assignable-queue tier against. Not necessarily the raw
    /// hardware count: a controller may cap this for testing or for
    /// cgroup-constrained environments.
    fn processor_count(&self) -> usize;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::ThreadCountController;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct RecordingController {
        pub(crate) requests: AtomicUsize,
        pub(crate) completions: AtomicUsize,
        pub(crate) yield_now: AtomicBool,
        pub(crate) processors: AtomicUsize,
        /// Verdict `notify_completion` hands back. Defaults to `true`
        /// ("keep going") via [`Self::with_processors`]; tests that want a
        /// retire verdict flip it with [`std::sync::atomic::AtomicBool::store`].
        pub(crate) keep_running: AtomicBool,
    }

    impl RecordingController {
        pub(crate) fn with_processors(count: usize) -> Self {
            RecordingController {
                processors: AtomicUsize::new(count),
                keep_running: AtomicBool::new(true),
                ..Default::default()
            }
        }
    }

    impl ThreadCountController for RecordingController {
        fn request_worker(&self) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_completion(&self) -> bool {
            self.completions.fetch_add(1, Ordering::SeqCst);
            self.keep_running.load(Ordering::SeqCst)
        }

        fn should_yield_from_dispatch(&self) -> bool {
            self.yield_now.load(Ordering::SeqCst)
        }

        fn worker_tracking_enabled(&self) -> bool {
            false
        }

        fn logging_enabled(&self) -> bool {
            false
        }

        fn processor_count(&self) -> usize {
            self.processors.load(Ordering::SeqCst).max(1)
        }
    }
}
