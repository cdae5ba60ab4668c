//! Shared `ThreadCountController` test double for integration tests. Mirrors
//! `dispatch_core::controller::test_support::RecordingController`, which is
//! only compiled into unit test builds of the crate itself and so isn't
//! reachable from here.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dispatch_core::ThreadCountController;

#[derive(Default)]
pub struct RecordingController {
    pub requests: AtomicUsize,
    pub completions: AtomicUsize,
    pub yield_now: AtomicBool,
    pub processors: AtomicUsize,
    pub keep_running: AtomicBool,
}

impl RecordingController {
    pub fn with_processors(count: usize) -> Self {
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
