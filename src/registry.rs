//! The deque registry: the set of local deques a thief can scan.
//!
//! Registration and unregistration are rare (they only happen as workers
//! join and leave the pool); scanning for a steal victim happens on every
//! dispatch iteration across every worker. The registry is built around that
//! asymmetry: writers publish a whole new immutable snapshot, readers just
//! load the current snapshot and iterate it without taking any lock.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::local_deque::LocalDeque;

/// A worker's slot in the registry, identifying which deque belongs to
/// which registered worker.
pub struct Registration {
    pub worker_id: usize,
    pub deque: Arc<LocalDeque>,
}

/// Holds an atomically-swappable snapshot of all currently registered
/// per-worker deques.
///
/// Cloning a [`Registry`] is cheap (it's a handle around an `Arc`), so a copy
/// can be held by every worker alongside its own deque reference.
#[derive(Clone)]
pub struct Registry {
    snapshot: Arc<ArcSwap<Vec<Registration>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { snapshot: Arc::new(ArcSwap::from_pointee(Vec::new())) }
    }

    /// Adds `deque` under `worker_id` to the registry, publishing a new
    /// snapshot. `worker_id` must not already be registered.
    pub fn register(&self, worker_id: usize, deque: Arc<LocalDeque>) {
        self.snapshot.rcu(|current| {
            debug_assert!(
                current.iter().all(|r| r.worker_id != worker_id),
                "worker {worker_id} registered twice"
            );
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().map(|r| Registration { worker_id: r.worker_id, deque: r.deque.clone() }));
            next.push(Registration { worker_id, deque: deque.clone() });
            next
        });
    }

    /// Removes `worker_id` from the registry, publishing a new snapshot. A
    /// no-op if the worker was already absent (idempotent, so it's safe to
    /// call from a panic-unwind cleanup path that might race a normal exit).
    pub fn unregister(&self, worker_id: usize) {
        self.snapshot.rcu(|current| {
            current
                .iter()
                .filter(|r| r.worker_id != worker_id)
                .map(|r| Registration { worker_id: r.worker_id, deque: r.deque.clone() })
                .collect::<Vec<_>>()
        });
    }

    /// Loads the current snapshot for iteration. The returned guard pins the
    /// snapshot that was live at the time of the call; deques registered or
    /// unregistered afterward won't be reflected until the next `snapshot()`
    /// call.
    pub fn snapshot(&self) -> arc_swap::Guard<Arc<Vec<Registration>>> {
        self.snapshot.load()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_round_trip() {
        let registry = Registry::new();
        assert!(registry.is_empty());

        registry.register(0, Arc::new(LocalDeque::new()));
        registry.register(1, Arc::new(LocalDeque::new()));
        assert_eq!(registry.len(), 2);

        registry.unregister(0);
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].worker_id, 1);
    }

    #[test]
    fn unregister_missing_worker_is_a_no_op() {
        let registry = Registry::new();
        registry.register(0, Arc::new(LocalDeque::new()));
        registry.unregister(99);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_is_stable_while_held_across_a_mutation() {
        let registry = Registry::new();
        registry.register(0, Arc::new(LocalDeque::new()));
        let held = registry.snapshot();
        registry.register(1, Arc::new(LocalDeque::new()));
        assert_eq!(held.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
    }
}
