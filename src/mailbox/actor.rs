use super::{ActorHandle, ActorId};
use crate::context::{self, ContextId, ContextRegistry};
use crate::error::NetError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type ErasedHandler = Box<dyn FnMut(Box<dyn Any + Send>) + Send>;

struct ActorSlot {
    context: ContextId,
    message_type: TypeId,
    type_name: &'static str,
    active: AtomicBool,
    handler: Mutex<ErasedHandler>,
}

impl ActorSlot {
    /// Runs on the owning thread.
    fn deliver(&self, id: ActorId, message: Box<dyn Any + Send>) {
        if !self.active.load(Ordering::Acquire) {
            debug!(actor = %id, "Dropping message for unregistered actor");
            return;
        }
        let mut handler = self.handler.lock();
        (*handler)(message);
    }
}

/// Registry of actors keyed by [`ActorId`].
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct ActorMailbox {
    inner: Arc<MailboxInner>,
}

struct MailboxInner {
    contexts: ContextRegistry,
    next_id: AtomicU64,
    actors: DashMap<ActorId, Arc<ActorSlot>>,
}

impl ActorMailbox {
    pub fn new(contexts: ContextRegistry) -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                contexts,
                next_id: AtomicU64::new(1),
                actors: DashMap::new(),
            }),
        }
    }

    /// Registers `handler` bound to the calling context.
    ///
    /// Fails with [`NetError::NoCurrentContext`] when called outside any context.
    pub fn register_actor<M, F>(&self, handler: F) -> Result<ActorId, NetError>
    where
        M: Send + 'static,
        F: FnMut(M) + Send + 'static,
    {
        let context = context::current().ok_or(NetError::NoCurrentContext)?;
        self.register_actor_on(context, handler)
    }

    /// Registers `handler` bound to an explicit, already bound context.
    pub fn register_actor_on<M, F>(&self, context: ContextId, mut handler: F) -> Result<ActorId, NetError>
    where
        M: Send + 'static,
        F: FnMut(M) + Send + 'static,
    {
        if self.inner.contexts.worker_of(context).is_none() {
            return Err(NetError::UnknownContext(context));
        }

        let id = ActorId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let erased: ErasedHandler = Box::new(move |message: Box<dyn Any + Send>| {
            match message.downcast::<M>() {
                Ok(message) => handler(*message),
                Err(_) => warn!(actor = %id, "Discarding message of unexpected type"),
            }
        });
        let slot = ActorSlot {
            context,
            message_type: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            active: AtomicBool::new(true),
            handler: Mutex::new(erased),
        };
        self.inner.actors.insert(id, Arc::new(slot));
        debug!(actor = %id, context = %context, message = std::any::type_name::<M>(), "Actor registered");
        Ok(id)
    }

    /// Registers a handler on the calling context and returns a typed handle to it.
    pub fn spawn<M, F>(&self, handler: F) -> Result<ActorHandle<M>, NetError>
    where
        M: Send + 'static,
        F: FnMut(M) + Send + 'static,
    {
        let id = self.register_actor(handler)?;
        Ok(self.handle(id))
    }

    /// A typed handle to an already registered actor.
    pub fn handle<M: Send + 'static>(&self, id: ActorId) -> ActorHandle<M> {
        ActorHandle::new(self.clone(), id)
    }

    /// Queues `message` for delivery on the actor's owning thread.
    pub fn send<M: Send + 'static>(&self, id: ActorId, message: M) -> Result<(), NetError> {
        let slot = self
            .inner
            .actors
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(NetError::UnknownActor(id))?;
        if slot.message_type != TypeId::of::<M>() {
            return Err(NetError::MessageType {
                actor: id,
                expected: slot.type_name,
            });
        }

        let context = slot.context;
        let message: Box<dyn Any + Send> = Box::new(message);
        self.inner
            .contexts
            .execute_on_context(context, move || slot.deliver(id, message))
    }

    /// Removes the actor. Messages already queued for it are dropped on arrival.
    pub fn unregister_actor(&self, id: ActorId) -> bool {
        match self.inner.actors.remove(&id) {
            Some((_, slot)) => {
                slot.active.store(false, Ordering::Release);
                debug!(actor = %id, "Actor unregistered");
                true
            }
            None => false,
        }
    }

    /// The context an actor is bound to.
    pub fn context_of(&self, id: ActorId) -> Option<ContextId> {
        self.inner.actors.get(&id).map(|s| s.context)
    }

    pub fn len(&self) -> usize {
        self.inner.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.actors.is_empty()
    }
}
