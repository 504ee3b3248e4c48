//! # Contexts
//!
//! A context is the unit of thread affinity: an opaque id that, once bound, is pinned to
//! exactly one worker thread for its whole lifetime. All callback logic for a connection runs
//! on the thread its context is bound to, so connection state can be mutated without contention.
//!
//! - [`ContextRegistry`] maps ids to workers and is the only sanctioned way to hand work to
//!   another thread ([`ContextRegistry::execute_on_context`]).
//! - [`current`] reports which context the calling thread is executing on behalf of.

mod registry;

pub use registry::ContextRegistry;

use std::cell::Cell;
use std::fmt;

/// Opaque identifier of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

thread_local! {
    static CURRENT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// The context the calling thread is currently running on behalf of.
///
/// `None` outside of any dispatched task or callback, e.g. on the main thread.
pub fn current() -> Option<ContextId> {
    CURRENT.with(|c| c.get())
}

/// Makes `context` current until the returned guard is dropped.
pub(crate) fn enter(context: ContextId) -> ContextScope {
    let previous = CURRENT.with(|c| c.replace(Some(context)));
    ContextScope { previous }
}

/// Restores the previously current context on drop.
pub(crate) struct ContextScope {
    previous: Option<ContextId>,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}
