//! # Networking
//!
//! The listener and per-connection layers of the reactor.
//!
//! - [`Server`] binds the endpoint, spreads accepted connections across workers and drives
//!   graceful shutdown.
//! - [`Socket`] is the per-connection state machine: handlers, writes, backpressure, close.
//! - [`ServerOptions`] and [`TlsOptions`] form the configuration table.
//! - [`StreamStage`] and [`Pipeline`] compose what runs between `accept` and the socket,
//!   with [`TlsStage`] as the built-in stage.

mod backpressure;
mod driver;
mod handler;
pub mod options;
pub mod pipeline;
mod server;
mod socket;
mod stream;
pub mod tls;

pub use handler::{ConnectHandler, DataHandler, EventHandler, ExceptionHandler};
pub use options::{ClientAuth, ServerOptions, TlsOptions};
pub use pipeline::{Pipeline, StreamStage};
pub use server::{Server, DEFAULT_HOST};
pub use socket::{Socket, SocketId};
pub use stream::ConnStream;
pub use tls::TlsStage;
