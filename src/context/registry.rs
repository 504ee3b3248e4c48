use super::ContextId;
use crate::error::NetError;
use crate::worker::{Task, WorkerId, WorkerPool};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Maps context ids to the worker thread each one is pinned to.
///
/// Cheap to clone; clones share the same bindings.
#[derive(Clone)]
pub struct ContextRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    pool: Arc<WorkerPool>,
    next_id: AtomicU64,
    /// `None` until the context is bound.
    bindings: DashMap<ContextId, Option<WorkerId>>,
}

impl ContextRegistry {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pool,
                next_id: AtomicU64::new(1),
                bindings: DashMap::new(),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    /// Allocates a fresh, unbound context.
    pub fn create_context(&self) -> ContextId {
        let id = ContextId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.bindings.insert(id, None);
        trace!(context = %id, "Context created");
        id
    }

    /// Pins `context` to `worker`.
    ///
    /// Rebinding to the same worker is a no-op. Rebinding to another worker fails with
    /// [`NetError::ContextMigration`] and leaves the existing binding untouched.
    pub fn bind_context(&self, context: ContextId, worker: WorkerId) -> Result<(), NetError> {
        if !self.inner.pool.contains(worker) {
            return Err(NetError::UnknownWorker(worker));
        }
        let mut binding = self
            .inner
            .bindings
            .get_mut(&context)
            .ok_or(NetError::UnknownContext(context))?;
        let current = *binding;
        match current {
            None => {
                *binding = Some(worker);
                debug!(context = %context, %worker, "Context bound");
                Ok(())
            }
            Some(bound) if bound == worker => Ok(()),
            Some(bound) => Err(NetError::ContextMigration {
                context,
                bound,
                requested: worker,
            }),
        }
    }

    /// Creates a context and binds it to the worker the transport already chose for a channel.
    pub fn associate_context_with_worker(&self, worker: WorkerId) -> Result<ContextId, NetError> {
        let context = self.create_context();
        if let Err(e) = self.bind_context(context, worker) {
            self.inner.bindings.remove(&context);
            return Err(e);
        }
        Ok(context)
    }

    /// Creates a context bound to the next worker in round-robin order.
    pub fn create_and_associate_context(&self) -> ContextId {
        let worker = self.inner.pool.next_worker();
        let context = self.create_context();
        self.inner.bindings.insert(context, Some(worker));
        debug!(context = %context, %worker, "Context bound");
        context
    }

    /// The worker `context` is bound to, if it is live and bound.
    pub fn worker_of(&self, context: ContextId) -> Option<WorkerId> {
        self.inner.bindings.get(&context).and_then(|b| *b)
    }

    pub fn is_live(&self, context: ContextId) -> bool {
        self.inner.bindings.contains_key(&context)
    }

    pub fn len(&self) -> usize {
        self.inner.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bindings.is_empty()
    }

    /// Queues `task` on the thread `context` is bound to.
    ///
    /// The task is always queued, never run inline, so it observes every task submitted
    /// earlier from the same thread.
    pub fn execute_on_context(
        &self,
        context: ContextId,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), NetError> {
        let worker = self
            .worker_of(context)
            .ok_or(NetError::UnknownContext(context))?;
        self.inner
            .pool
            .submit(worker, Task::on_context(context, task))
    }

    /// Removes the mapping. Returns `false` for an unknown id.
    pub fn destroy_context(&self, context: ContextId) -> bool {
        let removed = self.inner.bindings.remove(&context).is_some();
        if removed {
            trace!(context = %context, "Context destroyed");
        }
        removed
    }

    /// Fails with [`NetError::WrongThread`] unless the caller runs on the thread `context`
    /// is bound to.
    pub fn check_thread(&self, context: ContextId) -> Result<(), NetError> {
        let worker = self
            .worker_of(context)
            .ok_or(NetError::UnknownContext(context))?;
        if self.inner.pool.is_current(worker) {
            Ok(())
        } else {
            Err(NetError::WrongThread { context })
        }
    }

    /// Drops every binding. Returns how many contexts were still live.
    pub(crate) fn clear(&self) -> usize {
        let live = self.inner.bindings.len();
        self.inner.bindings.clear();
        live
    }
}
