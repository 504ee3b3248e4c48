//! # Actor Mailbox
//!
//! The sanctioned channel for handing work to a context from a thread that does not own it.
//!
//! An actor is a message handler bound to one context. [`ActorMailbox::send`] never calls the
//! handler directly: it queues the delivery on the owning thread through
//! [`ContextRegistry::execute_on_context`](crate::context::ContextRegistry::execute_on_context).
//! This gives two guarantees:
//!
//! - messages from one submitting thread reach the handler in submission order;
//! - a handler is never invoked while a previous invocation of it is still running.
//!
//! [`ActorHandle`] is a typed, cloneable front for one actor, used for example by sockets to
//! accept writes from foreign threads.

mod actor;
mod client;

pub use actor::ActorMailbox;
pub use client::ActorHandle;

use std::fmt;

/// Unique identifier of a registered actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.0)
    }
}
