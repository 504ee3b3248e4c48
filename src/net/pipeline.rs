//! # Connection Pipeline
//!
//! An accepted connection passes through an ordered list of [`StreamStage`]s on its owning
//! worker before a [`Socket`](super::Socket) is built around it. The TLS wrapper is the only
//! built-in stage; user stages registered with
//! [`Server::add_stage`](super::Server::add_stage) run after it.

use super::options::ServerOptions;
use super::stream::ConnStream;
use super::tls::TlsStage;
use crate::error::NetError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

/// One transformation of a freshly accepted stream.
///
/// A stage that fails drops the connection; the connect handler is never invoked for it.
#[async_trait]
pub trait StreamStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, stream: ConnStream) -> Result<ConnStream, NetError>;
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn StreamStage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the stage list for `options`: TLS first when enabled, then `extra` in order.
    pub fn for_options(
        options: &ServerOptions,
        extra: &[Arc<dyn StreamStage>],
    ) -> Result<Self, NetError> {
        let mut pipeline = Self::new();
        if options.tls.tls {
            pipeline = pipeline.with_stage(Arc::new(TlsStage::from_options(&options.tls)?));
        }
        for stage in extra {
            pipeline = pipeline.with_stage(Arc::clone(stage));
        }
        Ok(pipeline)
    }

    pub fn with_stage(mut self, stage: Arc<dyn StreamStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn run(&self, mut stream: ConnStream) -> Result<ConnStream, NetError> {
        for stage in &self.stages {
            trace!(stage = stage.name(), "Applying stage");
            stream = stage.apply(stream).await?;
        }
        Ok(stream)
    }
}
