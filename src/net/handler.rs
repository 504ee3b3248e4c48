//! # Dispatch Boundary
//!
//! Every user callback is invoked through [`invoke`], which turns both a returned error and a
//! panic into a [`NetError`]. Nothing a callback does can unwind into a worker's event loop.

use super::socket::Socket;
use crate::error::{panic_message, HandlerResult, NetError};
use bytes::Bytes;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub type DataHandler = Box<dyn FnMut(Bytes) -> HandlerResult + Send>;
pub type EventHandler = Box<dyn FnMut() -> HandlerResult + Send>;
pub type ExceptionHandler = Box<dyn FnMut(NetError) + Send>;

/// Invoked on the new socket's owning thread once per accepted connection.
pub type ConnectHandler = Arc<dyn Fn(Socket) -> HandlerResult + Send + Sync>;

/// The callbacks registered on one socket. At most one of each; registering replaces.
#[derive(Default)]
pub(crate) struct Handlers {
    pub(crate) data: Option<DataHandler>,
    pub(crate) end: Option<EventHandler>,
    pub(crate) drain: Option<EventHandler>,
    pub(crate) closed: Option<EventHandler>,
    pub(crate) exception: Option<ExceptionHandler>,
}

impl Handlers {
    pub(crate) fn clear(&mut self) {
        *self = Handlers::default();
    }
}

pub(crate) fn invoke(handler: &'static str, call: impl FnOnce() -> HandlerResult) -> Result<(), NetError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(NetError::Handler { handler, source }),
        Err(payload) => Err(NetError::HandlerPanicked {
            handler,
            message: panic_message(payload.as_ref()),
        }),
    }
}
