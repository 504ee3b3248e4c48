//! # Reactor Net
//!
//! > **A thread-affine TCP/TLS reactor for Rust.**
//!
//! This crate accepts and drives many TCP (optionally TLS) connections across a small, fixed
//! pool of worker threads, and guarantees that every callback for a given connection runs on
//! exactly one thread for the connection's whole lifetime.
//!
//! ## 🏗️ Design Philosophy
//!
//! ### Why pin connections to threads?
//!
//! A connection's handlers can then mutate its state without locks, while the pool as a whole
//! still scales across cores. The price is that crossing threads must be explicit:
//! - **Contexts**: each connection owns a context bound to one worker. Work for it is queued
//!   with [`execute_on_context`](lifecycle::Runtime::execute_on_context), the only sanctioned
//!   way across.
//! - **Actors**: foreign threads talk to a context through typed mailbox actors; every socket
//!   exposes one for writes.
//! - **Checks, not conventions**: socket operations called off the owning thread fail with
//!   [`NetError::WrongThread`] and do nothing.
//!
//! ## 🚀 Core Concepts
//!
//! ### Explicit runtime
//! There are no globals. A [`Runtime`](lifecycle::Runtime) is built at startup, cloned into
//! servers and sockets, and shut down explicitly.
//!
//! ### Errors stay with their connection
//! Handlers return [`HandlerResult`]. Errors and panics from a handler, and transport failures,
//! are routed to the socket's exception handler; they never unwind into a worker's event loop.
//! Errors with no handler registered are logged at `error`.
//!
//! ## 🗺️ Module Tour
//!
//! ### 1. Threads ([`worker`])
//! - **Role**: the fixed pool of reactor threads, each a Tokio current-thread runtime with a
//!   FIFO run queue.
//! - **Key items**: [`WorkerPool`](worker::WorkerPool), [`WorkerId`](worker::WorkerId).
//!
//! ### 2. Affinity ([`context`])
//! - **Role**: binds contexts to workers and dispatches work onto them.
//! - **Key items**: [`ContextRegistry`](context::ContextRegistry), [`current`](context::current).
//!
//! ### 3. Handoff ([`mailbox`])
//! - **Role**: per-actor, FIFO, single-flight delivery onto an actor's context.
//! - **Key items**: [`ActorMailbox`](mailbox::ActorMailbox), [`ActorHandle`](mailbox::ActorHandle).
//!
//! ### 4. Networking ([`net`])
//! - **Role**: listener, per-connection state machine, backpressure, TLS wrapper and options.
//! - **Key items**: [`Server`](net::Server), [`Socket`](net::Socket),
//!   [`ServerOptions`](net::ServerOptions).
//!
//! ### 5. The Orchestrator ([`lifecycle`])
//! - **Role**: builds and stops the runtime; sets up tracing.
//! - **Key items**: [`Runtime`](lifecycle::Runtime), [`setup_tracing`](lifecycle::setup_tracing).
//!
//! ## 🚀 Quick Start
//!
//! ```ignore
//! use reactor_net::lifecycle::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let server = runtime.server();
//! server.connect_handler(|socket| {
//!     let echo = socket.clone();
//!     socket.data_handler(move |data| Ok(echo.write(data)?))?;
//!     Ok(())
//! });
//! server.listen(7000, "127.0.0.1")?;
//! ```
//!
//! ### Running Tests
//!
//! ```bash
//! RUST_LOG=debug cargo test
//! ```

pub mod context;
pub mod error;
pub mod lifecycle;
pub mod mailbox;
pub mod net;
pub mod worker;

pub use error::{HandlerError, HandlerResult, NetError};
