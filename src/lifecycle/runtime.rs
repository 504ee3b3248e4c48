use super::config::RuntimeConfig;
use crate::context::{self, ContextId, ContextRegistry};
use crate::error::NetError;
use crate::mailbox::ActorMailbox;
use crate::net::{Server, ServerOptions};
use crate::worker::{WorkerId, WorkerPool};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// The reactor runtime: worker pool, context registry, actor mailbox and support runtime.
///
/// `Runtime` replaces process-wide singletons. It is created once at startup, cloned into
/// every [`Server`] and [`Socket`](crate::net::Socket), and stopped explicitly with
/// [`Runtime::shutdown`].
///
/// # Example
///
/// ```ignore
/// let runtime = Runtime::new(RuntimeConfig::with_workers(4))?;
/// let server = runtime.server();
/// server.connect_handler(|socket| {
///     let echo = socket.clone();
///     socket.data_handler(move |data| Ok(echo.write(data)?))?;
///     Ok(())
/// });
/// server.listen(8080, "127.0.0.1")?;
/// // ...
/// server.close_with(|| println!("closed"));
/// runtime.shutdown();
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    contexts: ContextRegistry,
    mailbox: ActorMailbox,
    support: Mutex<Option<tokio::runtime::Runtime>>,
    support_handle: Handle,
}

impl Runtime {
    /// Starts the worker threads and the support runtime.
    pub fn new(config: RuntimeConfig) -> Result<Self, NetError> {
        config.validate()?;
        let pool = Arc::new(WorkerPool::new(config.worker_threads, &config.thread_name)?);
        let support = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.support_threads)
            .thread_name(format!("{}-support", config.thread_name))
            .enable_all()
            .build()?;
        let support_handle = support.handle().clone();

        let contexts = ContextRegistry::new(pool);
        let mailbox = ActorMailbox::new(contexts.clone());
        info!(
            workers = config.worker_threads,
            support = config.support_threads,
            "Runtime started"
        );
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                contexts,
                mailbox,
                support: Mutex::new(Some(support)),
                support_handle,
            }),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.inner.contexts
    }

    pub fn mailbox(&self) -> &ActorMailbox {
        &self.inner.mailbox
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        self.inner.contexts.pool()
    }

    /// Handle of the support runtime hosting accept loops and background work.
    pub fn support_handle(&self) -> Handle {
        self.inner.support_handle.clone()
    }

    /// A new, unconfigured server on this runtime.
    pub fn server(&self) -> Server {
        Server::new(self.clone())
    }

    pub fn server_with_options(&self, options: ServerOptions) -> Server {
        Server::with_options(self.clone(), options)
    }

    pub fn create_context(&self) -> ContextId {
        self.inner.contexts.create_context()
    }

    pub fn bind_context(&self, context: ContextId, worker: WorkerId) -> Result<(), NetError> {
        self.inner.contexts.bind_context(context, worker)
    }

    pub fn associate_context_with_worker(&self, worker: WorkerId) -> Result<ContextId, NetError> {
        self.inner.contexts.associate_context_with_worker(worker)
    }

    pub fn create_and_associate_context(&self) -> ContextId {
        self.inner.contexts.create_and_associate_context()
    }

    pub fn execute_on_context(
        &self,
        context: ContextId,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), NetError> {
        self.inner.contexts.execute_on_context(context, task)
    }

    pub fn destroy_context(&self, context: ContextId) -> bool {
        self.inner.contexts.destroy_context(context)
    }

    pub fn check_thread(&self, context: ContextId) -> Result<(), NetError> {
        self.inner.contexts.check_thread(context)
    }

    /// The context the calling thread is running on behalf of.
    pub fn current_context(&self) -> Option<ContextId> {
        context::current()
    }

    /// Runs blocking or CPU-heavy work off the reactor threads.
    pub fn execute_in_background<F, R>(&self, task: F) -> tokio::task::JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.inner.support_handle.spawn_blocking(task)
    }

    /// Stops the runtime.
    ///
    /// Workers finish the tasks queued before this call and are joined (except the calling
    /// thread, if it is a worker). Remaining contexts are destroyed and the support runtime is
    /// stopped without waiting for its tasks. Idempotent.
    pub fn shutdown(&self) {
        info!("Shutting down runtime...");
        self.pool().shutdown();

        let remaining = self.inner.contexts.clear();
        if remaining > 0 {
            debug!(contexts = remaining, "Destroyed remaining contexts");
        }

        let support = self.inner.support.lock().take();
        if let Some(support) = support {
            support.shutdown_background();
        }
        info!("Runtime shutdown complete.");
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        // Dropping a Tokio runtime inside async code panics.
        if let Some(support) = self.support.get_mut().take() {
            support.shutdown_background();
        }
    }
}
