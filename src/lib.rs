//! # a2a-trace — transparent debugging proxy for A2A multi-agent systems.
//!
//! `trace -- <command> [args…]` launches `<command>` with HTTP(S) proxy
//! environment injected, intercepts and classifies Agent-to-Agent
//! (JSON-RPC 2.0 over HTTP) traffic flowing through it, correlates each
//! response with the request it answered, derives insights (slow
//! responses, errors, protocol violations, retry loops), persists a full
//! trace, and streams everything live to observers over a REST + WebSocket
//! control surface.
//!
//! ## Architecture
//!
//! - [`classifier`] — pure, stateless recognition of A2A requests and
//!   parsing of JSON-RPC envelopes / agent cards.
//! - [`proxy`] — the forward proxy that captures request/response pairs
//!   and drives the classifier and analyzer.
//! - [`analyzer`] — single-consumer derivation of insights from the
//!   correlated message stream.
//! - [`hub`] — live fan-out of messages, agents, and insights to
//!   observers, with drop-on-backpressure semantics.
//! - [`store`] — append-only persistence, pluggable between an in-memory
//!   backend and a SQLite-backed one.
//! - [`supervisor`] — launches and owns the lifecycle of the wrapped child
//!   process.
//! - [`control`] — the REST + WebSocket control surface served for the UI
//!   collaborator.

pub mod analyzer;
pub mod cli;
pub mod classifier;
pub mod control;
pub mod error;
pub mod hub;
pub mod model;
pub mod proxy;
pub mod store;
pub mod supervisor;

/// Re-exports of the most commonly used types.
pub mod prelude {
    pub use crate::analyzer::{Analyzer, AnalyzerHandle};
    pub use crate::error::{TraceError, TraceResult};
    pub use crate::hub::Hub;
    pub use crate::model::{
        Agent, AnalyzerSummary, ClassifierVerdict, Direction, Insight, InsightCategory, Message,
        Severity, Trace, TraceExport, TraceStatus,
    };
    pub use crate::proxy::Proxy;
    pub use crate::store::{memory::InMemoryStore, sqlite::SqliteStore, Store};
    pub use crate::supervisor::Supervisor;
}
