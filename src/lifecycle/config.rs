use crate::error::NetError;
use serde::Deserialize;
use std::num::NonZeroUsize;

/// Sizing of a [`Runtime`](super::Runtime).
///
/// ```toml
/// workerThreads = 4
/// threadName = "edge"
/// supportThreads = 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Number of reactor threads. Defaults to the available parallelism.
    pub worker_threads: usize,
    /// Prefix of the reactor thread names.
    pub thread_name: String,
    /// Threads of the support runtime running accept loops.
    pub support_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            thread_name: "reactor-worker".to_string(),
            support_threads: 2,
        }
    }
}

impl RuntimeConfig {
    pub fn with_workers(worker_threads: usize) -> Self {
        Self {
            worker_threads,
            ..Default::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self, NetError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NetError> {
        if self.worker_threads == 0 {
            return Err(NetError::Config("workerThreads must be at least 1".into()));
        }
        if self.support_threads == 0 {
            return Err(NetError::Config("supportThreads must be at least 1".into()));
        }
        if self.thread_name.is_empty() {
            return Err(NetError::Config("threadName must not be empty".into()));
        }
        Ok(())
    }
}
