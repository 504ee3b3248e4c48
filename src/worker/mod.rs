//! # Worker Pool
//!
//! A fixed set of reactor threads. Each worker owns a Tokio current-thread runtime driven
//! through a [`tokio::task::LocalSet`], and a FIFO run queue fed by [`WorkerPool::submit`].
//!
//! Workers own no connection state. Socket drivers are spawned onto a worker with
//! `tokio::task::spawn_local` from inside a submitted task, which pins them to that thread.

mod pool;

pub use pool::{Task, WorkerPool};

use std::fmt;

/// Index of a worker thread inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    /// Position of the worker in the pool.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}
