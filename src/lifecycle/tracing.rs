//! # Observability & Tracing
//!
//! The [`setup_tracing`] function installs a compact `tracing-subscriber` formatter filtered by
//! `RUST_LOG`. The module prefix is hidden (`with_target(false)`); log lines identify what they
//! are about through structured fields instead.
//!
//! ## Fields
//!
//! - `worker`: the reactor thread (`worker-0`, `worker-1`, ...)
//! - `context`: the affinity context (`ctx-7`)
//! - `socket`: the connection (`socket-3`), with `peer` on accept
//! - `actor`: a mailbox actor (`actor-12`)
//!
//! ## Levels
//!
//! ```bash
//! # Lifecycle only: pools, listeners, server close
//! RUST_LOG=info cargo test
//!
//! # Connections opening and closing, contexts bound, actors registered
//! RUST_LOG=debug cargo test
//!
//! # Every read, queued write and watermark flip
//! RUST_LOG=trace cargo test
//!
//! # One component only
//! RUST_LOG=reactor_net::net=debug cargo test
//! ```
//!
//! Errors that no exception handler claimed are logged at `error` with the socket and context
//! they belong to:
//!
//! ```text
//! ERROR Unhandled socket error socket=socket-3 context=ctx-4 error=data handler failed: bad frame
//! ```

/// Installs the global subscriber. Later calls are no-ops, so tests may call it freely.
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}
