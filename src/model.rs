//! Core data model — `Trace`, `Message`, `Agent`, `Insight`.
//!
//! These types are the entities persisted by the [`crate::store`] and
//! broadcast by the [`crate::hub`]. All four derive `Serialize` +
//! `Deserialize` directly on the domain types rather than maintaining a
//! parallel DTO layer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a [`Trace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Completed,
    Error,
}

/// The bounded lifetime of one invocation of the tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub command: String,
    pub status: TraceStatus,
}

impl Trace {
    pub fn new(command: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: chrono::Utc::now(),
            command,
            status: TraceStatus::Running,
        }
    }
}

/// Which side of a request/response pair a [`Message`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

/// One captured HTTP exchange leg (either the request or its response).
///
/// Invariants:
/// - every response's `correlation_id` refers to a prior request in the
///   same trace, and that request's own `correlation_id` equals its `id`;
/// - `timestamp` is monotonic per request→response pair;
/// - messages are immutable once appended to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub trace_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub direction: Direction,
    pub source_agent: String,
    pub target_agent: String,
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub duration_ms: Option<u64>,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub correlation_id: String,
    pub content_type: Option<String>,
    pub body_size: usize,
    /// Whether the classifier recognized this exchange as A2A traffic (a
    /// JSON POST or an agent-card GET). A response carries the same value
    /// as the request it answers. Gates rules, such as `protocol_violation`,
    /// that only make sense for JSON-RPC traffic.
    pub is_a2a: bool,
    /// JSON-RPC id extracted by the classifier, retained for cross-hop
    /// analysis only — never used as the correlation key.
    pub jsonrpc_id: Option<String>,
}

/// An agent discovered via a successful `/.well-known/agent.json` fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub url: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub skills: Vec<String>,
    pub first_seen: chrono::DateTime<chrono::Utc>,
}

/// Severity of a derived [`Insight`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Category of a derived [`Insight`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    SlowResponse,
    Error,
    ProtocolViolation,
    RetryLoop,
    AnalyzerBackpressure,
}

/// An automatically derived observation about the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub trace_id: String,
    pub message_id: Option<String>,
    pub severity: Severity,
    pub category: InsightCategory,
    pub title: String,
    pub details: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Insight {
    pub fn new(
        trace_id: &str,
        message_id: Option<String>,
        severity: Severity,
        category: InsightCategory,
        title: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.to_string(),
            message_id,
            severity,
            category,
            title: title.into(),
            details,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Ephemeral classifier output — never persisted on its own, only used to
/// populate fields on a [`Message`] as it is built.
#[derive(Debug, Clone, Default)]
pub struct ClassifierVerdict {
    pub is_a2a: bool,
    pub method: Option<String>,
    pub jsonrpc_id: Option<String>,
    pub jsonrpc_error: Option<JsonRpcErrorBody>,
}

/// A parsed JSON-RPC 2.0 `error` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A parsed `/.well-known/agent.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub skills: Vec<AgentCardSkill>,
}

/// One entry of an [`AgentCard`]'s `skills` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCardSkill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Self-contained export document produced by `Store::export_trace`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceExport {
    pub trace: Trace,
    pub messages: Vec<Message>,
    pub insights: Vec<Insight>,
}

/// Snapshot summary exposed by the analyzer (`GET /api/summary`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzerSummary {
    pub total_messages: usize,
    pub total_insights: usize,
    pub error_count: usize,
    pub success_count: usize,
    pub avg_duration_ms: f64,
    pub method_counts: HashMap<String, u64>,
    pub agent_error_counts: HashMap<String, u64>,
}
