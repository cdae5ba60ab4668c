//! Core work dispatch engine for a general-purpose worker thread pool.
//!
//! This crate is the part of a thread pool that decides *what runs next on
//! a given worker thread*: per-worker local deques, a tiered set of shared
//! queues, work stealing between workers, and the dispatch loop that ties
//! them together. It deliberately does not own thread lifecycle, pool
//! sizing, timers, or a public submission API — those live on the other
//! side of [`controller::ThreadCountController`], which is the only way
//! this crate reaches outward.
//!
//! # Layout
//!
//! - [`item`] — the opaque [`item::Work`] handle moved through every queue.
//! - [`local_deque`] — the growable, Chase-Lev-style per-worker deque.
//! - [`shared_queue`] — the unbounded MPMC FIFO backing the tiered queues.
//! - [`registry`] — the copy-on-write set of local deques visible to thieves.
//! - [`assignment`] — binds workers to assignable global queues on big machines.
//! - [`latch`] — coalesces "please wake another worker" requests.
//! - [`worker`] — per-worker state and its scoped registration lifetime.
//! - [`dispatcher`] — the fixed priority search order for the next item.
//! - [`aggregate`] — [`aggregate::WorkQueueAggregate`], the handle tying it all together.
//! - [`controller`] — the trait boundary to the surrounding runtime.

pub mod aggregate;
pub mod assignment;
pub mod controller;
pub mod dispatcher;
pub mod item;
pub mod latch;
pub mod local_deque;
pub mod registry;
pub mod shared_queue;
pub mod worker;
mod xor_shift;

pub use aggregate::{PendingLocation, WorkQueueAggregate};
pub use controller::ThreadCountController;
pub use dispatcher::{DispatchOutcome, QuantumOutcome};
pub use item::{Work, WorkItem};
pub use worker::WorkerHandle;
