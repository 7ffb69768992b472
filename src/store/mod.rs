//! Durable store plumbing shared by the queue, negotiator, and aggregator.

mod atomic;

pub use atomic::{recover_interrupted_writes, AtomicWriter};
