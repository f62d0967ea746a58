//! Append-only persistence of traces, messages, agents, and insights.
//!
//! The [`Store`] trait is the abstract persistence collaborator the rest of
//! this crate depends on. Writes are serialized per entity kind; reads are
//! consistent with all writes completed before the read (read-your-writes).
//! Two backends are provided: [`memory::InMemoryStore`] (always available)
//! and [`sqlite::SqliteStore`] (used when `--db <path>` is given).

pub mod memory;
pub mod sqlite;

use crate::error::TraceResult;
use crate::model::{Agent, Insight, Message, Trace, TraceExport, TraceStatus};
use async_trait::async_trait;

/// Abstract persistence collaborator.
///
/// Implementors must provide these ordering guarantees: `get_messages`
/// orders by timestamp ascending, `get_agents` orders by first-seen
/// descending, `get_insights` orders by timestamp descending.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_trace(&self, command: String) -> TraceResult<Trace>;
    async fn update_trace_status(&self, id: &str, status: TraceStatus) -> TraceResult<()>;
    async fn get_trace(&self, id: &str) -> TraceResult<Trace>;

    /// Assigns an id if `msg.id` is empty.
    async fn save_message(&self, msg: Message) -> TraceResult<Message>;
    async fn get_messages(&self, trace_id: &str) -> TraceResult<Vec<Message>>;

    /// Upserts on `agent.url`; mutable fields replace the existing row.
    async fn save_agent(&self, agent: Agent) -> TraceResult<Agent>;
    async fn get_agents(&self) -> TraceResult<Vec<Agent>>;

    async fn save_insight(&self, insight: Insight) -> TraceResult<Insight>;
    async fn get_insights(&self, trace_id: &str) -> TraceResult<Vec<Insight>>;

    async fn export_trace(&self, trace_id: &str) -> TraceResult<TraceExport>;
}

/// Build the `TraceExport` document any `Store` implementation can reuse
/// once it has the trace, its messages, and its insights in hand.
pub(crate) fn build_export(trace: Trace, messages: Vec<Message>, insights: Vec<Insight>) -> TraceExport {
    TraceExport {
        trace,
        messages,
        insights,
    }
}
