//! Runtime construction and lifecycle management.
//!
//! This module owns everything that is process-wide in spirit but explicitly constructed and
//! passed around in practice:
//!
//! - **Runtime**: the worker pool, the context registry, the actor mailbox and the support
//!   runtime that hosts accept loops and background work
//! - **Configuration**: [`RuntimeConfig`], loadable from TOML
//! - **Observability setup**: initializing tracing and logging
//!
//! # Main Components
//!
//! - [`Runtime`] - created once at startup, cloned into every server and socket, and stopped
//!   with [`Runtime::shutdown`]
//! - [`setup_tracing`] - initializes the tracing/logging infrastructure

pub mod config;
pub mod runtime;
pub mod tracing;

pub use config::RuntimeConfig;
pub use runtime::Runtime;
pub use tracing::setup_tracing;
