//! # Errors
//!
//! This module defines the error taxonomy shared by every component of the reactor.
//! Programming-contract violations (`WrongThread`, `AlreadyListening`, `ContextMigration`)
//! are always reported, never fixed up. Transport failures and user-callback failures are
//! routed to the per-connection exception sink by the dispatch boundary in [`crate::net`].

use crate::context::ContextId;
use crate::mailbox::ActorId;
use crate::worker::WorkerId;

/// Error produced by a user callback.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of every user callback (data, end, drain, closed and connect handlers).
pub type HandlerResult = Result<(), HandlerError>;

/// Errors raised by the reactor core.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// An operation was invoked from a thread other than the one the context is pinned to.
    #[error("operation on context {context} invoked off its owning thread")]
    WrongThread { context: ContextId },

    #[error("listen already called on this server")]
    AlreadyListening,

    #[error("unknown or unbound context: {0}")]
    UnknownContext(ContextId),

    #[error("no such worker in the pool: {0}")]
    UnknownWorker(WorkerId),

    /// Contexts never migrate between workers.
    #[error("context {context} is bound to worker {bound}, cannot rebind to worker {requested}")]
    ContextMigration {
        context: ContextId,
        bound: WorkerId,
        requested: WorkerId,
    },

    #[error("failed to resolve host {host}")]
    HostResolution {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid TLS configuration: {0}")]
    TlsConfig(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("socket is closed")]
    SocketClosed,

    #[error("no context is current on this thread")]
    NoCurrentContext,

    #[error("unknown actor: {0}")]
    UnknownActor(ActorId),

    #[error("actor {actor} expects messages of type {expected}")]
    MessageType {
        actor: ActorId,
        expected: &'static str,
    },

    #[error("runtime has been shut down")]
    RuntimeShutdown,

    #[error("{handler} handler failed: {source}")]
    Handler {
        handler: &'static str,
        #[source]
        source: HandlerError,
    },

    #[error("{handler} handler panicked: {message}")]
    HandlerPanicked {
        handler: &'static str,
        message: String,
    },
}

impl From<toml::de::Error> for NetError {
    fn from(err: toml::de::Error) -> Self {
        NetError::Config(err.to_string())
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
