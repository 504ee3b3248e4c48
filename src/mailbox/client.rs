use super::{ActorId, ActorMailbox};
use crate::error::NetError;
use std::fmt;
use std::marker::PhantomData;

/// A typed handle to one actor.
///
/// Holds only the mailbox and the id, so it is cheap to clone and can be moved to any
/// thread. Sending through a handle cannot fail with [`NetError::MessageType`].
pub struct ActorHandle<M> {
    mailbox: ActorMailbox,
    id: ActorId,
    _message: PhantomData<fn(M)>,
}

impl<M: Send + 'static> ActorHandle<M> {
    pub(crate) fn new(mailbox: ActorMailbox, id: ActorId) -> Self {
        Self {
            mailbox,
            id,
            _message: PhantomData,
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Queues `message` for the actor's owning thread.
    pub fn send(&self, message: M) -> Result<(), NetError> {
        self.mailbox.send(self.id, message)
    }

    /// Whether the actor is still registered.
    pub fn is_registered(&self) -> bool {
        self.mailbox.context_of(self.id).is_some()
    }
}

impl<M> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            id: self.id,
            _message: PhantomData,
        }
    }
}

impl<M> fmt::Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle").field("id", &self.id).finish()
    }
}
