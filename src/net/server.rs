//! # Server
//!
//! Owns the listening endpoint and the live-connection set.
//!
//! ## Accepting
//!
//! The accept loop runs on the runtime's support threads. Each accepted stream gets the
//! configured socket options, is handed to the next worker in round-robin order, and on that
//! worker goes through the pipeline (TLS handshake), gets a context bound to the worker, and is
//! wrapped in a [`Socket`]. The connect handler runs right after, on the same thread, before
//! any data is read.
//!
//! ## Closing
//!
//! Closing asks every live socket to close on its own thread, waits until the live set is
//! empty and no accepted connection is still being set up, then stops the accept loop and
//! releases the endpoint. Connections accepted after the close started are dropped. See [`Server::close_with`]
//! for where the completion callback runs.

use super::driver;
use super::handler::ConnectHandler;
use super::options::ServerOptions;
use super::pipeline::{Pipeline, StreamStage};
use super::socket::{Socket, SocketId, SocketParams};
use super::stream::ConnStream;
use crate::context::{self, ContextId};
use crate::error::{HandlerResult, NetError};
use crate::lifecycle::Runtime;
use crate::worker::{Task, WorkerId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

/// Default host for [`Server::listen_port`].
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Pause after a failed `accept`, e.g. when the process runs out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A TCP listener whose connections are spread across the runtime's workers.
///
/// Cheap to clone; clones control the same listener.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    runtime: Runtime,
    options: Mutex<ServerOptions>,
    connect_handler: Mutex<Option<ConnectHandler>>,
    stages: Mutex<Vec<Arc<dyn StreamStage>>>,
    /// Set by the first `listen` attempt and never reset.
    listening: AtomicBool,
    closing: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    live: DashMap<SocketId, Socket>,
    /// Connections handed to a worker whose `establish` has not finished.
    establishing: AtomicUsize,
    drained: Notify,
    acceptor: Mutex<Option<AcceptorHandle>>,
}

struct AcceptorHandle {
    stop: oneshot::Sender<()>,
    done: oneshot::Receiver<()>,
}

impl Server {
    pub fn new(runtime: Runtime) -> Self {
        Self::with_options(runtime, ServerOptions::default())
    }

    pub fn with_options(runtime: Runtime, options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                runtime,
                options: Mutex::new(options),
                connect_handler: Mutex::new(None),
                stages: Mutex::new(Vec::new()),
                listening: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                live: DashMap::new(),
                establishing: AtomicUsize::new(0),
                drained: Notify::new(),
                acceptor: Mutex::new(None),
            }),
        }
    }

    /// Replaces the configuration table. Takes effect at the next `listen`.
    pub fn configure(&self, options: ServerOptions) -> Result<(), NetError> {
        options.validate()?;
        *self.inner.options.lock() = options;
        Ok(())
    }

    pub fn options(&self) -> ServerOptions {
        self.inner.options.lock().clone()
    }

    /// Sets the callback invoked for every accepted connection.
    pub fn connect_handler(
        &self,
        handler: impl Fn(Socket) -> HandlerResult + Send + Sync + 'static,
    ) {
        *self.inner.connect_handler.lock() = Some(Arc::new(handler));
    }

    /// Appends a stage run on every accepted stream after the TLS handshake.
    pub fn add_stage(&self, stage: Arc<dyn StreamStage>) {
        self.inner.stages.lock().push(stage);
    }

    /// Binds `host:port` and starts accepting. Returns the bound address.
    ///
    /// Only the first call on an instance may proceed; every later call fails with
    /// [`NetError::AlreadyListening`], even when the first one failed.
    #[tracing::instrument(skip(self))]
    pub fn listen(&self, port: u16, host: &str) -> Result<SocketAddr, NetError> {
        if self.inner.listening.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyListening);
        }

        let options = self.options();
        options.validate()?;
        let addr = resolve(host, port)?;
        let stages = self.inner.stages.lock().clone();
        let pipeline = Arc::new(Pipeline::for_options(&options, &stages)?);

        let std_listener = bind(addr, &options)?;
        let support = self.inner.runtime.support_handle();
        let listener = {
            let _guard = support.enter();
            TcpListener::from_std(std_listener)?
        };
        let local_addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local_addr);

        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        *self.inner.acceptor.lock() = Some(AcceptorHandle {
            stop: stop_tx,
            done: done_rx,
        });
        support.spawn(accept_loop(
            Arc::clone(&self.inner),
            listener,
            options,
            pipeline,
            stop_rx,
            done_tx,
        ));

        info!(addr = %local_addr, "Listening");
        Ok(local_addr)
    }

    /// [`listen`](Self::listen) on all interfaces.
    pub fn listen_port(&self, port: u16) -> Result<SocketAddr, NetError> {
        self.listen(port, DEFAULT_HOST)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// The bound address, once `listen` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.live.len()
    }

    /// Starts a graceful close in the background.
    pub fn close(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.support_handle().spawn(inner.close_gracefully());
    }

    /// Closes every live socket, then the listening endpoint, then runs `done`.
    ///
    /// - Called on a context: `done` is dispatched onto that context. If the close destroyed
    ///   the context (closing from one of the server's own sockets), `done` runs on the
    ///   context's worker instead.
    /// - Called on a worker outside any context: `done` is queued on that worker.
    /// - Called anywhere else: blocks until the close completes, then runs `done` inline.
    pub fn close_with(&self, done: impl FnOnce() + Send + 'static) {
        let runtime = self.inner.runtime.clone();
        let inner = Arc::clone(&self.inner);

        let bound = context::current()
            .and_then(|ctx| runtime.contexts().worker_of(ctx).map(|worker| (ctx, worker)));
        if let Some((ctx, worker)) = bound {
            let support = runtime.support_handle();
            support.spawn(async move {
                inner.close_gracefully().await;
                deliver_on_context(&runtime, ctx, worker, Box::new(done));
            });
            return;
        }

        if let Some(worker) = runtime.pool().current_worker() {
            let support = runtime.support_handle();
            support.spawn(async move {
                inner.close_gracefully().await;
                if let Err(e) = runtime.pool().submit(worker, Task::new(done)) {
                    error!(%worker, error = %e, "Close callback dropped");
                }
            });
            return;
        }

        futures::executor::block_on(inner.close_gracefully());
        done();
    }

    /// Completes once every live socket is closed and the endpoint is released.
    pub async fn close_async(&self) {
        Arc::clone(&self.inner).close_gracefully().await;
    }
}

/// Runs `done` on `ctx`, or on `worker` when `ctx` no longer exists.
fn deliver_on_context(
    runtime: &Runtime,
    ctx: ContextId,
    worker: WorkerId,
    done: Box<dyn FnOnce() + Send>,
) {
    let slot = Arc::new(Mutex::new(Some(done)));
    let queued = Arc::clone(&slot);
    let dispatched = runtime.execute_on_context(ctx, move || {
        if let Some(done) = queued.lock().take() {
            done();
        }
    });
    if dispatched.is_err() {
        let Some(done) = slot.lock().take() else {
            return;
        };
        debug!(context = %ctx, %worker, "Context gone; running close callback on its worker");
        if let Err(e) = runtime.pool().submit(worker, Task::new(done)) {
            error!(%worker, error = %e, "Close callback dropped");
        }
    }
}

impl ServerInner {
    async fn close_gracefully(self: Arc<Self>) {
        self.closing.store(true, Ordering::SeqCst);

        let sockets: Vec<Socket> = self.live.iter().map(|entry| entry.value().clone()).collect();
        info!(connections = sockets.len(), "Closing server...");
        for socket in sockets {
            let target = socket.clone();
            if let Err(e) = self
                .runtime
                .execute_on_context(socket.context(), move || target.inner().begin_close())
            {
                debug!(socket = %socket.id(), error = %e, "Socket unreachable; forgetting it");
                self.forget(socket.id(), socket.context());
            }
        }

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // A finished setup has already inserted its socket, so read the counter first.
            if self.establishing.load(Ordering::SeqCst) == 0 && self.live.is_empty() {
                break;
            }
            notified.await;
        }

        let acceptor = self.acceptor.lock().take();
        if let Some(acceptor) = acceptor {
            let _ = acceptor.stop.send(());
            let _ = acceptor.done.await;
        }
        info!("Server closed");
    }

    /// Removes a torn-down socket and destroys its context.
    fn forget(&self, id: SocketId, ctx: ContextId) {
        self.live.remove(&id);
        self.runtime.destroy_context(ctx);
        debug!(socket = %id, remaining = self.live.len(), "Connection removed");
        self.drained.notify_waiters();
    }

    /// Support-thread half of accepting: options, then hand-off to a worker.
    fn dispatch(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        options: &ServerOptions,
        pipeline: &Arc<Pipeline>,
    ) -> Result<(), NetError> {
        let setup = SetupGuard::new(self);
        if self.closing.load(Ordering::SeqCst) {
            debug!(%peer, "Server closing; dropping new connection");
            return Ok(());
        }
        if let Err(e) = options.apply_to_stream(&stream) {
            warn!(%peer, error = %e, "Failed to apply socket options");
        }
        let std_stream = stream.into_std()?;
        let worker = self.runtime.pool().next_worker();

        let server = Arc::clone(self);
        let pipeline = Arc::clone(pipeline);
        let watermarks = (options.write_high_water_mark, options.write_low_water_mark);
        self.runtime.pool().submit(
            worker,
            Task::new(move || {
                tokio::task::spawn_local(async move {
                    server.establish(std_stream, peer, worker, pipeline, watermarks).await;
                    drop(setup);
                });
            }),
        )
    }

    /// Worker half of accepting. Runs on `worker`.
    async fn establish(
        self: Arc<Self>,
        std_stream: std::net::TcpStream,
        peer: SocketAddr,
        worker: WorkerId,
        pipeline: Arc<Pipeline>,
        (high_water_mark, low_water_mark): (usize, usize),
    ) {
        let stream = match TcpStream::from_std(std_stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%peer, error = %e, "Failed to register connection");
                return;
            }
        };
        let stream = match pipeline.run(ConnStream::Plain(stream)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%peer, error = %e, "Connection setup failed; dropping");
                return;
            }
        };
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(%peer, error = %e, "Connection lost during setup");
                return;
            }
        };

        let ctx = match self.runtime.associate_context_with_worker(worker) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(%peer, %worker, error = %e, "Failed to bind context");
                return;
            }
        };
        let params = SocketParams {
            context: ctx,
            worker,
            peer_addr: peer,
            local_addr,
            tls: stream.is_tls(),
            high_water_mark,
            low_water_mark,
        };
        let server = Arc::downgrade(&self);
        let hook = move |id: SocketId, ctx: ContextId| {
            if let Some(server) = Weak::upgrade(&server) {
                server.forget(id, ctx);
            }
        };
        let (socket, io) = match Socket::open(self.runtime.clone(), params, hook) {
            Ok(opened) => opened,
            Err(e) => {
                error!(%peer, error = %e, "Failed to open socket");
                self.runtime.destroy_context(ctx);
                return;
            }
        };

        self.live.insert(socket.id(), socket.clone());
        debug!(socket = %socket.id(), context = %ctx, %peer, "Connection accepted");

        let handler = self.connect_handler.lock().clone();
        if let Some(handler) = handler {
            let accepted = socket.clone();
            socket
                .inner()
                .guarded("connect", move || handler(accepted));
        }
        driver::spawn(&socket, stream, io);

        if self.closing.load(Ordering::SeqCst) {
            socket.inner().begin_close();
        }
    }
}

/// Counts one connection as being set up until dropped.
struct SetupGuard {
    server: Arc<ServerInner>,
}

impl SetupGuard {
    fn new(server: &Arc<ServerInner>) -> Self {
        server.establishing.fetch_add(1, Ordering::SeqCst);
        Self {
            server: Arc::clone(server),
        }
    }
}

impl Drop for SetupGuard {
    fn drop(&mut self) {
        self.server.establishing.fetch_sub(1, Ordering::SeqCst);
        self.server.drained.notify_waiters();
    }
}

async fn accept_loop(
    server: Arc<ServerInner>,
    listener: TcpListener,
    options: ServerOptions,
    pipeline: Arc<Pipeline>,
    mut stop: oneshot::Receiver<()>,
    done: oneshot::Sender<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = server.dispatch(stream, peer, &options, &pipeline) {
                        warn!(%peer, error = %e, "Failed to hand off connection");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
    let addr = listener.local_addr().ok();
    drop(listener);
    info!(?addr, "Listener closed");
    let _ = done.send(());
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    let resolved = (host, port).to_socket_addrs().and_then(|mut addrs| {
        addrs.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found")
        })
    });
    resolved.map_err(|source| {
        error!(host, port, error = %source, "Host resolution failed");
        NetError::HostResolution {
            host: host.to_string(),
            source,
        }
    })
}

fn bind(addr: SocketAddr, options: &ServerOptions) -> Result<std::net::TcpListener, NetError> {
    use socket2::{Domain, Protocol, Socket as RawSocket, Type};

    let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(options.reuse_address)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let backlog = i32::try_from(options.accept_backlog).unwrap_or(i32::MAX);
    socket.listen(backlog)?;
    Ok(socket.into())
}
