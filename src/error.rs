//! Error types for the trace tool.
//!
//! A `thiserror` enumeration for library-level faults that callers branch
//! on, plus `anyhow` at the binary boundary for startup failures that only
//! ever need to be printed and turned into a process exit code.

/// Unified error type for store, proxy, and supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// The store backend failed to read or write an entity.
    #[error("store error: {0}")]
    Store(String),

    /// A request referenced a trace that does not exist.
    #[error("trace not found: {0}")]
    TraceNotFound(String),

    /// Child process failed to start.
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The supervisor was started more than once.
    #[error("supervisor already started")]
    AlreadyStarted,

    /// The proxy listener failed to bind.
    #[error("failed to bind proxy listener on {addr}: {source}")]
    Bind {
        /// The address the listener attempted to bind.
        addr: std::net::SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An upstream HTTP request failed (DNS, connect, TLS, or timeout).
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Wraps any I/O failure not covered by a more specific variant.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for fallible operations within this crate.
pub type TraceResult<T> = Result<T, TraceError>;
