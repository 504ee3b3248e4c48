//! # Socket
//!
//! Per-connection state machine. A socket is `Open` until it is closed locally, the peer
//! closes the stream, or the transport fails; it then passes through `Closing` (local close
//! only) to the terminal `Closed` state.
//!
//! ## Thread affinity
//!
//! Every operation checks that it runs on the worker the socket's context is bound to and
//! fails with [`NetError::WrongThread`], without side effects, everywhere else. Foreign
//! threads write through [`Socket::write_actor`].
//!
//! ## Callbacks
//!
//! Handlers are taken out of their slot while they run and put back afterwards, so a handler
//! may freely call back into the socket, including replacing itself. A handler replaced while
//! running is dropped once it returns; no handler is put back after the socket has closed.
//!
//! ## Backpressure
//!
//! Bytes passed to [`Socket::write`] count as pending until the writer task has flushed them.
//! Crossing the high watermark makes the socket unwritable; falling to the low watermark makes
//! it writable again and fires the drain handler.

use super::backpressure::{InterestChange, WriteWatermarks};
use super::handler::{self, Handlers};
use crate::context::{self, ContextId};
use crate::error::{panic_message, HandlerResult, NetError};
use crate::lifecycle::Runtime;
use crate::mailbox::ActorHandle;
use crate::worker::WorkerId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

struct SocketState {
    phase: Phase,
    watermarks: WriteWatermarks,
}

/// Work for the writer task, consumed in order.
pub(crate) enum Outbound {
    Data {
        bytes: Bytes,
        done: Option<Box<dyn FnOnce() + Send>>,
    },
    File(PathBuf),
    Close,
}

/// The driver-side ends of a freshly opened socket.
pub(crate) struct SocketIo {
    pub(crate) outbound: mpsc::UnboundedReceiver<Outbound>,
    pub(crate) stop: watch::Receiver<bool>,
}

type TeardownHook = Box<dyn FnOnce(SocketId, ContextId) + Send>;

/// A connected TCP (or TLS) stream pinned to one context.
///
/// Cheap to clone; clones refer to the same connection.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

pub(crate) struct SocketInner {
    id: SocketId,
    context: ContextId,
    worker: WorkerId,
    runtime: Runtime,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    tls: bool,
    state: Mutex<SocketState>,
    handlers: Mutex<Handlers>,
    outbound: mpsc::UnboundedSender<Outbound>,
    stop: watch::Sender<bool>,
    write_actor: ActorHandle<Bytes>,
    on_teardown: Mutex<Option<TeardownHook>>,
}

/// Connection details captured before the socket is built.
pub(crate) struct SocketParams {
    pub(crate) context: ContextId,
    pub(crate) worker: WorkerId,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) tls: bool,
    pub(crate) high_water_mark: usize,
    pub(crate) low_water_mark: usize,
}

impl Socket {
    /// Builds an open socket and registers its write actor on `params.context`.
    pub(crate) fn open(
        runtime: Runtime,
        params: SocketParams,
        on_teardown: impl FnOnce(SocketId, ContextId) + Send + 'static,
    ) -> Result<(Socket, SocketIo), NetError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let target: Arc<OnceLock<Weak<SocketInner>>> = Arc::new(OnceLock::new());
        let actor_target = Arc::clone(&target);
        let actor_id = runtime
            .mailbox()
            .register_actor_on(params.context, move |bytes: Bytes| {
                let Some(socket) = actor_target.get().and_then(Weak::upgrade) else {
                    return;
                };
                let socket = Socket { inner: socket };
                if let Err(e) = socket.write(bytes) {
                    debug!(socket = %socket.id(), error = %e, "Dropping queued write");
                }
            })?;
        let write_actor = runtime.mailbox().handle(actor_id);

        let inner = Arc::new(SocketInner {
            id: SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)),
            context: params.context,
            worker: params.worker,
            runtime,
            peer_addr: params.peer_addr,
            local_addr: params.local_addr,
            tls: params.tls,
            state: Mutex::new(SocketState {
                phase: Phase::Open,
                watermarks: WriteWatermarks::new(params.high_water_mark, params.low_water_mark),
            }),
            handlers: Mutex::new(Handlers::default()),
            outbound: outbound_tx,
            stop: stop_tx,
            write_actor,
            on_teardown: Mutex::new(Some(Box::new(on_teardown))),
        });
        let _ = target.set(Arc::downgrade(&inner));

        debug!(socket = %inner.id, context = %inner.context, peer = %inner.peer_addr, "Socket opened");
        let io = SocketIo {
            outbound: outbound_rx,
            stop: stop_rx,
        };
        Ok((Socket { inner }, io))
    }

    pub(crate) fn inner(&self) -> &Arc<SocketInner> {
        &self.inner
    }

    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    pub fn context(&self) -> ContextId {
        self.inner.context
    }

    pub fn worker(&self) -> WorkerId {
        self.inner.worker
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.inner.tls
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().phase == Phase::Open
    }

    /// Whether pending outbound bytes are below the high watermark.
    pub fn is_writable(&self) -> bool {
        self.inner.state.lock().watermarks.is_writable()
    }

    /// Outbound bytes queued but not yet flushed.
    pub fn pending_bytes(&self) -> usize {
        self.inner.state.lock().watermarks.pending()
    }

    /// Handle through which any thread can queue writes for this socket.
    pub fn write_actor(&self) -> ActorHandle<Bytes> {
        self.inner.write_actor.clone()
    }

    fn check_thread(&self) -> Result<(), NetError> {
        if self.inner.runtime.pool().is_current(self.inner.worker) {
            Ok(())
        } else {
            Err(NetError::WrongThread {
                context: self.inner.context,
            })
        }
    }

    /// Queues `data` for the peer.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), NetError> {
        self.check_thread()?;
        self.inner.enqueue(data.into(), None)
    }

    /// Queues `data` and runs `on_complete` on this thread once the bytes are flushed to the
    /// transport.
    pub fn write_then(
        &self,
        data: impl Into<Bytes>,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Result<(), NetError> {
        self.check_thread()?;
        self.inner.enqueue(data.into(), Some(Box::new(on_complete)))
    }

    pub fn write_str(&self, text: &str) -> Result<(), NetError> {
        self.write(Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn write_str_then(
        &self,
        text: &str,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Result<(), NetError> {
        self.write_then(Bytes::copy_from_slice(text.as_bytes()), on_complete)
    }

    /// Streams the file at `path` behind the writes already queued.
    ///
    /// The file is read in chunks by the writer task and does not count against the
    /// watermarks. A file that cannot be read is reported to the exception handler.
    pub fn send_file(&self, path: impl Into<PathBuf>) -> Result<(), NetError> {
        self.check_thread()?;
        if self.inner.state.lock().phase != Phase::Open {
            return Err(NetError::SocketClosed);
        }
        self.inner
            .outbound
            .send(Outbound::File(path.into()))
            .map_err(|_| NetError::SocketClosed)
    }

    pub fn data_handler(
        &self,
        handler: impl FnMut(Bytes) -> HandlerResult + Send + 'static,
    ) -> Result<(), NetError> {
        self.check_thread()?;
        self.inner.handlers.lock().data = Some(Box::new(handler));
        Ok(())
    }

    /// Runs once when the peer closes its side of the stream.
    pub fn end_handler(
        &self,
        handler: impl FnMut() -> HandlerResult + Send + 'static,
    ) -> Result<(), NetError> {
        self.check_thread()?;
        self.inner.handlers.lock().end = Some(Box::new(handler));
        Ok(())
    }

    /// Registers the backpressure-relief handler.
    ///
    /// If the socket is writable right now the handler is also invoked once before this
    /// returns.
    pub fn drain_handler(
        &self,
        handler: impl FnMut() -> HandlerResult + Send + 'static,
    ) -> Result<(), NetError> {
        self.check_thread()?;
        self.inner.handlers.lock().drain = Some(Box::new(handler));
        if self.inner.is_open_and_writable() {
            self.inner.call_drain();
        }
        Ok(())
    }

    /// Runs once when the socket reaches `Closed`, whatever the cause.
    pub fn closed_handler(
        &self,
        handler: impl FnMut() -> HandlerResult + Send + 'static,
    ) -> Result<(), NetError> {
        self.check_thread()?;
        self.inner.handlers.lock().closed = Some(Box::new(handler));
        Ok(())
    }

    /// Sink for transport errors and for failures of this socket's callbacks.
    pub fn exception_handler(
        &self,
        handler: impl FnMut(NetError) + Send + 'static,
    ) -> Result<(), NetError> {
        self.check_thread()?;
        self.inner.handlers.lock().exception = Some(Box::new(handler));
        Ok(())
    }

    /// Stops accepting writes and closes the connection once the queued writes are flushed.
    ///
    /// Idempotent.
    pub fn close(&self) -> Result<(), NetError> {
        self.check_thread()?;
        self.inner.begin_close();
        Ok(())
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("context", &self.inner.context)
            .field("peer", &self.inner.peer_addr)
            .finish()
    }
}

impl SocketInner {
    pub(crate) fn id(&self) -> SocketId {
        self.id
    }

    fn enqueue(self: &Arc<Self>, bytes: Bytes, done: Option<Box<dyn FnOnce() + Send>>) -> Result<(), NetError> {
        let len = bytes.len();
        let change = {
            let mut state = self.state.lock();
            if state.phase != Phase::Open {
                return Err(NetError::SocketClosed);
            }
            self.outbound
                .send(Outbound::Data { bytes, done })
                .map_err(|_| NetError::SocketClosed)?;
            state.watermarks.enqueued(len)
        };
        trace!(socket = %self.id, len, "Write queued");
        if let Some(change) = change {
            self.interest_changed(change);
        }
        Ok(())
    }

    pub(crate) fn begin_close(&self) {
        let mut state = self.state.lock();
        if state.phase != Phase::Open {
            return;
        }
        state.phase = Phase::Closing;
        debug!(socket = %self.id, "Closing");
        let _ = self.outbound.send(Outbound::Close);
    }

    fn is_open_and_writable(&self) -> bool {
        let state = self.state.lock();
        state.phase == Phase::Open && state.watermarks.is_writable()
    }

    /// Called by the writer after `len` bytes were flushed.
    pub(crate) fn on_written(self: &Arc<Self>, len: usize) {
        let change = self.state.lock().watermarks.written(len);
        if let Some(change) = change {
            self.interest_changed(change);
        }
    }

    /// Redispatches a writability flip onto the owning context.
    fn interest_changed(self: &Arc<Self>, change: InterestChange) {
        trace!(socket = %self.id, ?change, "Interest changed");
        let socket = Arc::clone(self);
        if let Err(e) = self
            .runtime
            .execute_on_context(self.context, move || socket.on_interest_changed(change))
        {
            trace!(socket = %self.id, error = %e, "Interest change not delivered");
        }
    }

    fn on_interest_changed(&self, change: InterestChange) {
        if change == InterestChange::BecameWritable && self.is_open_and_writable() {
            self.call_drain();
        }
    }

    fn call_drain(&self) {
        self.with_handler("drain", |h| &mut h.drain, |drain| drain());
    }

    pub(crate) fn on_data(&self, chunk: Bytes) {
        if self.state.lock().phase != Phase::Open {
            trace!(socket = %self.id, len = chunk.len(), "Discarding data after close");
            return;
        }
        let delivered = self.with_handler("data", |h| &mut h.data, |data| data(chunk));
        if !delivered {
            trace!(socket = %self.id, "No data handler registered");
        }
    }

    /// The peer closed its side: end handler once, then a local close.
    pub(crate) fn on_remote_end(&self) {
        if self.state.lock().phase == Phase::Closed {
            return;
        }
        debug!(socket = %self.id, "Remote end closed");
        self.with_handler("end", |h| &mut h.end, |end| end());
        self.begin_close();
    }

    /// Runs a user callback under this socket's context, reporting failures to the exception
    /// handler. Returns `false` when no handler of that kind is registered.
    pub(crate) fn with_handler<H>(
        &self,
        name: &'static str,
        slot: fn(&mut Handlers) -> &mut Option<H>,
        call: impl FnOnce(&mut H) -> HandlerResult,
    ) -> bool {
        let taken = slot(&mut self.handlers.lock()).take();
        let Some(mut handler) = taken else {
            return false;
        };
        self.guarded(name, || call(&mut handler));

        if self.state.lock().phase != Phase::Closed {
            let mut handlers = self.handlers.lock();
            let current = slot(&mut handlers);
            if current.is_none() {
                *current = Some(handler);
            }
        }
        true
    }

    /// Runs `call` with this socket's context current and routes any failure to the
    /// exception handler.
    pub(crate) fn guarded(&self, name: &'static str, call: impl FnOnce() -> HandlerResult) {
        let _scope = context::enter(self.context);
        if let Err(e) = handler::invoke(name, call) {
            self.report(e);
        }
    }

    /// Delivers `err` to the exception handler, or logs it when none is registered.
    pub(crate) fn report(&self, err: NetError) {
        let taken = self.handlers.lock().exception.take();
        let Some(mut sink) = taken else {
            error!(socket = %self.id, context = %self.context, error = %err, "Unhandled socket error");
            return;
        };

        let _scope = context::enter(self.context);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink(err))) {
            error!(socket = %self.id, panic = %panic_message(payload.as_ref()), "Exception handler panicked");
        }
        if self.state.lock().phase != Phase::Closed {
            let mut handlers = self.handlers.lock();
            if handlers.exception.is_none() {
                handlers.exception = Some(sink);
            }
        }
    }

    /// Moves the socket to `Closed`. Runs once; later calls are no-ops.
    ///
    /// `cause` is set for transport failures and goes to the exception handler before the
    /// closed handler runs.
    pub(crate) fn teardown(&self, cause: Option<NetError>) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
        }
        let _ = self.stop.send(true);
        self.runtime.mailbox().unregister_actor(self.write_actor.id());

        if let Some(err) = cause {
            debug!(socket = %self.id, error = %err, "Socket failed");
            self.report(err);
        }
        let closed = self.handlers.lock().closed.take();
        if let Some(mut closed) = closed {
            self.guarded("closed", || closed());
        }
        self.handlers.lock().clear();

        let hook = self.on_teardown.lock().take();
        if let Some(hook) = hook {
            hook(self.id, self.context);
        }
        debug!(socket = %self.id, context = %self.context, "Socket closed");
    }
}
