use super::WorkerId;
use crate::context::{self, ContextId};
use crate::error::{panic_message, NetError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A unit of work queued on a worker.
///
/// When the task carries a context, that context is current on the worker thread
/// for the duration of the call (see [`crate::context::current`]).
pub struct Task {
    context: Option<ContextId>,
    run: Box<dyn FnOnce() + Send>,
}

impl Task {
    pub fn new(run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            context: None,
            run: Box::new(run),
        }
    }

    pub fn on_context(context: ContextId, run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            context: Some(context),
            run: Box::new(run),
        }
    }

    /// Runs the task, containing any panic so that it never unwinds through the event loop.
    fn run(self, worker: WorkerId) {
        let ctx = self.context;
        let _scope = ctx.map(context::enter);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(self.run)) {
            error!(%worker, context = ?ctx, panic = %panic_message(payload.as_ref()), "Task panicked");
        }
    }
}

enum Job {
    Run(Task),
    Shutdown,
}

struct Worker {
    id: WorkerId,
    thread: ThreadId,
    sender: mpsc::UnboundedSender<Job>,
}

/// Fixed-size pool of reactor threads.
///
/// The only mutable bookkeeping after construction is the round-robin cursor used by
/// [`WorkerPool::next_worker`] and the join handles consumed by [`WorkerPool::shutdown`].
pub struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl WorkerPool {
    /// Starts `size` worker threads named `{thread_name}-{index}`. A size of zero is treated as one.
    pub fn new(size: usize, thread_name: &str) -> Result<Self, NetError> {
        let size = size.max(1);
        let mut pool = Self {
            workers: Vec::with_capacity(size),
            next: AtomicUsize::new(0),
            handles: Mutex::new(Vec::with_capacity(size)),
            shut_down: AtomicBool::new(false),
        };

        for index in 0..size {
            // On failure `pool` is dropped, which stops the workers already started.
            let (worker, handle) = spawn_worker(WorkerId(index), thread_name)?;
            pool.workers.push(worker);
            pool.handles.get_mut().push(handle);
        }

        info!(workers = size, "Worker pool started");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers.iter().map(|w| w.id)
    }

    /// Picks a worker for a new unit of load, round-robin.
    pub fn next_worker(&self) -> WorkerId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        WorkerId(n % self.workers.len())
    }

    /// The worker running on the calling thread, if any.
    pub fn current_worker(&self) -> Option<WorkerId> {
        let me = thread::current().id();
        self.workers.iter().find(|w| w.thread == me).map(|w| w.id)
    }

    pub fn is_current(&self, worker: WorkerId) -> bool {
        self.workers
            .get(worker.0)
            .is_some_and(|w| w.thread == thread::current().id())
    }

    pub fn contains(&self, worker: WorkerId) -> bool {
        worker.0 < self.workers.len()
    }

    /// Appends a task to the FIFO run queue of `worker`.
    ///
    /// Tasks submitted from one thread run in submission order. The task is always queued,
    /// even when the caller is already on `worker`.
    pub fn submit(&self, worker: WorkerId, task: Task) -> Result<(), NetError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(NetError::RuntimeShutdown);
        }
        let target = self
            .workers
            .get(worker.0)
            .ok_or(NetError::RuntimeShutdown)?;
        target
            .sender
            .send(Job::Run(task))
            .map_err(|_| NetError::RuntimeShutdown)
    }

    /// Stops every worker after the tasks already queued have run, then joins the threads.
    ///
    /// When called from a worker thread, that thread is signalled but not joined.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down worker pool...");
        for worker in &self.workers {
            let _ = worker.sender.send(Job::Shutdown);
        }

        let me = thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.thread().id() == me {
                warn!("Worker pool shut down from one of its own threads; not joining it");
                continue;
            }
            if let Err(e) = handle.join() {
                error!(panic = %panic_message(e.as_ref()), "Worker thread failed");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            for worker in &self.workers {
                let _ = worker.sender.send(Job::Shutdown);
            }
        }
    }
}

fn spawn_worker(id: WorkerId, thread_name: &str) -> Result<(Worker, JoinHandle<()>), NetError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (sender, receiver) = mpsc::unbounded_channel();
    let handle = thread::Builder::new()
        .name(format!("{thread_name}-{}", id.0))
        .spawn(move || run_worker(id, runtime, receiver))?;
    let worker = Worker {
        id,
        thread: handle.thread().id(),
        sender,
    };
    Ok((worker, handle))
}

/// The event loop of one reactor thread.
fn run_worker(
    id: WorkerId,
    runtime: tokio::runtime::Runtime,
    mut receiver: mpsc::UnboundedReceiver<Job>,
) {
    debug!(worker = %id, "Worker started");
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        while let Some(job) = receiver.recv().await {
            match job {
                Job::Run(task) => task.run(id),
                Job::Shutdown => break,
            }
        }
    });
    debug!(worker = %id, "Worker stopped");
}
