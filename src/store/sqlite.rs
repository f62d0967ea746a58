//! SQLite-backed `Store`, used when `--db <path>` is given.
//!
//! `rusqlite::Connection` is `!Sync`, so all access goes through a single
//! `tokio::sync::Mutex`-guarded connection — writes are serialized by
//! construction, and reads take the same lock, which trivially satisfies
//! the read-your-writes contract (SQLite itself also serializes within one
//! connection). Uses `rusqlite` with the `bundled` feature so the binary
//! carries its own SQLite rather than depending on the host's.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tokio::task;

use super::{build_export, Store};
use crate::error::{TraceError, TraceResult};
use crate::model::{
    Agent, Direction, Insight, InsightCategory, Message, Severity, Trace, TraceExport, TraceStatus,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> TraceResult<Self> {
        let conn = Connection::open(path).map_err(|e| TraceError::Store(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TraceError::Store(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> TraceResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        // rusqlite's Connection isn't async; running the closure under the
        // held lock keeps semantics simple at this trace tool's scale
        // (one proxy, a handful of concurrent requests). block_in_place
        // requires a multi-thread runtime — the binary's #[tokio::main] is
        // one by default, and this module's own tests are annotated
        // #[tokio::test(flavor = "multi_thread")] to match.
        let guard = self.conn.lock().await;
        task::block_in_place(|| f(&guard)).map_err(|e| TraceError::Store(e.to_string()))
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS traces (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    command TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    direction TEXT NOT NULL,
    source_agent TEXT NOT NULL,
    target_agent TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT NOT NULL,
    duration_ms INTEGER,
    status INTEGER,
    error TEXT,
    correlation_id TEXT NOT NULL,
    content_type TEXT,
    body_size INTEGER NOT NULL,
    is_a2a INTEGER NOT NULL,
    jsonrpc_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_trace ON messages(trace_id, timestamp);
CREATE TABLE IF NOT EXISTS agents (
    url TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    version TEXT NOT NULL,
    skills TEXT NOT NULL,
    first_seen TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS insights (
    id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    message_id TEXT,
    severity TEXT NOT NULL,
    category TEXT NOT NULL,
    title TEXT NOT NULL,
    details TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_insights_trace ON insights(trace_id, timestamp);
"#;

fn status_to_str(status: TraceStatus) -> &'static str {
    match status {
        TraceStatus::Running => "running",
        TraceStatus::Completed => "completed",
        TraceStatus::Error => "error",
    }
}

fn status_from_str(s: &str) -> TraceStatus {
    match s {
        "completed" => TraceStatus::Completed,
        "error" => TraceStatus::Error,
        _ => TraceStatus::Running,
    }
}

fn direction_to_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Request => "request",
        Direction::Response => "response",
    }
}

fn direction_from_str(s: &str) -> Direction {
    if s == "response" {
        Direction::Response
    } else {
        Direction::Request
    }
}

fn severity_to_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "info",
    }
}

fn severity_from_str(s: &str) -> Severity {
    match s {
        "error" => Severity::Error,
        "info" => Severity::Info,
        _ => Severity::Warning,
    }
}

fn category_to_str(category: InsightCategory) -> &'static str {
    match category {
        InsightCategory::SlowResponse => "slow_response",
        InsightCategory::Error => "error",
        InsightCategory::ProtocolViolation => "protocol_violation",
        InsightCategory::RetryLoop => "retry_loop",
        InsightCategory::AnalyzerBackpressure => "analyzer_backpressure",
    }
}

fn category_from_str(s: &str) -> InsightCategory {
    match s {
        "error" => InsightCategory::Error,
        "protocol_violation" => InsightCategory::ProtocolViolation,
        "retry_loop" => InsightCategory::RetryLoop,
        "analyzer_backpressure" => InsightCategory::AnalyzerBackpressure,
        _ => InsightCategory::SlowResponse,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_trace(&self, command: String) -> TraceResult<Trace> {
        let trace = Trace::new(command);
        let row = trace.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO traces (id, started_at, command, status) VALUES (?1, ?2, ?3, ?4)",
                params![
                    row.id,
                    row.started_at.to_rfc3339(),
                    row.command,
                    status_to_str(row.status)
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(trace)
    }

    async fn update_trace_status(&self, id: &str, status: TraceStatus) -> TraceResult<()> {
        let id_owned = id.to_string();
        let changed = self
            .with_conn({
                let id_owned = id_owned.clone();
                move |conn| {
                    conn.execute(
                        "UPDATE traces SET status = ?1 WHERE id = ?2",
                        params![status_to_str(status), id_owned],
                    )
                }
            })
            .await?;
        if changed == 0 {
            return Err(TraceError::TraceNotFound(id_owned));
        }
        Ok(())
    }

    async fn get_trace(&self, id: &str) -> TraceResult<Trace> {
        let id_owned = id.to_string();
        self.with_conn({
            let id_owned = id_owned.clone();
            move |conn| {
                conn.query_row(
                    "SELECT id, started_at, command, status FROM traces WHERE id = ?1",
                    params![id_owned],
                    |row| {
                        Ok(Trace {
                            id: row.get(0)?,
                            started_at: parse_rfc3339(row.get::<_, String>(1)?),
                            command: row.get(2)?,
                            status: status_from_str(&row.get::<_, String>(3)?),
                        })
                    },
                )
            }
        })
        .await
        .map_err(|_| TraceError::TraceNotFound(id_owned))
    }

    async fn save_message(&self, mut msg: Message) -> TraceResult<Message> {
        if msg.id.is_empty() {
            msg.id = uuid::Uuid::new_v4().to_string();
        }
        let row = msg.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, trace_id, timestamp, direction, source_agent, \
                 target_agent, method, url, headers, body, duration_ms, status, error, \
                 correlation_id, content_type, body_size, is_a2a, jsonrpc_id) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                params![
                    row.id,
                    row.trace_id,
                    row.timestamp.to_rfc3339(),
                    direction_to_str(row.direction),
                    row.source_agent,
                    row.target_agent,
                    row.method,
                    row.url,
                    serde_json::to_string(&row.headers).unwrap_or_default(),
                    row.body,
                    row.duration_ms,
                    row.status,
                    row.error,
                    row.correlation_id,
                    row.content_type,
                    row.body_size as i64,
                    row.is_a2a,
                    row.jsonrpc_id,
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(msg)
    }

    async fn get_messages(&self, trace_id: &str) -> TraceResult<Vec<Message>> {
        let trace_id = trace_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, trace_id, timestamp, direction, source_agent, target_agent, method, \
                 url, headers, body, duration_ms, status, error, correlation_id, content_type, \
                 body_size, is_a2a, jsonrpc_id FROM messages WHERE trace_id = ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![trace_id], row_to_message)?;
            rows.collect()
        })
        .await
    }

    async fn save_agent(&self, agent: Agent) -> TraceResult<Agent> {
        let row = agent.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agents (url, name, description, version, skills, first_seen) \
                 VALUES (?1,?2,?3,?4,?5,?6) \
                 ON CONFLICT(url) DO UPDATE SET name=excluded.name, description=excluded.description, \
                 version=excluded.version, skills=excluded.skills",
                params![
                    row.url,
                    row.name,
                    row.description,
                    row.version,
                    serde_json::to_string(&row.skills).unwrap_or_default(),
                    row.first_seen.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(agent)
    }

    async fn get_agents(&self) -> TraceResult<Vec<Agent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT url, name, description, version, skills, first_seen FROM agents \
                 ORDER BY first_seen DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                let skills_json: String = row.get(4)?;
                Ok(Agent {
                    url: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    version: row.get(3)?,
                    skills: serde_json::from_str(&skills_json).unwrap_or_default(),
                    first_seen: parse_rfc3339(row.get::<_, String>(5)?),
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn save_insight(&self, insight: Insight) -> TraceResult<Insight> {
        let row = insight.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO insights (id, trace_id, message_id, severity, category, title, \
                 details, timestamp) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                params![
                    row.id,
                    row.trace_id,
                    row.message_id,
                    severity_to_str(row.severity),
                    category_to_str(row.category),
                    row.title,
                    row.details.to_string(),
                    row.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(insight)
    }

    async fn get_insights(&self, trace_id: &str) -> TraceResult<Vec<Insight>> {
        let trace_id = trace_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, trace_id, message_id, severity, category, title, details, timestamp \
                 FROM insights WHERE trace_id = ?1 ORDER BY timestamp DESC",
            )?;
            let rows = stmt.query_map(params![trace_id], |row| {
                let details_json: String = row.get(6)?;
                Ok(Insight {
                    id: row.get(0)?,
                    trace_id: row.get(1)?,
                    message_id: row.get(2)?,
                    severity: severity_from_str(&row.get::<_, String>(3)?),
                    category: category_from_str(&row.get::<_, String>(4)?),
                    title: row.get(5)?,
                    details: serde_json::from_str(&details_json)
                        .unwrap_or(serde_json::Value::Null),
                    timestamp: parse_rfc3339(row.get::<_, String>(7)?),
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn export_trace(&self, trace_id: &str) -> TraceResult<TraceExport> {
        let trace = self.get_trace(trace_id).await?;
        let messages = self.get_messages(trace_id).await?;
        let insights = self.get_insights(trace_id).await?;
        Ok(build_export(trace, messages, insights))
    }
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let headers_json: String = row.get(8)?;
    Ok(Message {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        timestamp: parse_rfc3339(row.get::<_, String>(2)?),
        direction: direction_from_str(&row.get::<_, String>(3)?),
        source_agent: row.get(4)?,
        target_agent: row.get(5)?,
        method: row.get(6)?,
        url: row.get(7)?,
        headers: serde_json::from_str(&headers_json).unwrap_or_default(),
        body: row.get(9)?,
        duration_ms: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        status: row.get::<_, Option<i64>>(11)?.map(|v| v as u16),
        error: row.get(12)?,
        correlation_id: row.get(13)?,
        content_type: row.get(14)?,
        body_size: row.get::<_, i64>(15)? as usize,
        is_a2a: row.get(16)?,
        jsonrpc_id: row.get(17)?,
    })
}

fn parse_rfc3339(s: String) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;

    fn msg(trace_id: &str, correlation_id: &str) -> Message {
        Message {
            id: String::new(),
            trace_id: trace_id.to_string(),
            timestamp: chrono::Utc::now(),
            direction: Direction::Request,
            source_agent: String::new(),
            target_agent: "agent.local".to_string(),
            method: "tasks/create".to_string(),
            url: "http://agent.local/".to_string(),
            headers: Default::default(),
            body: "{}".to_string(),
            duration_ms: None,
            status: None,
            error: None,
            correlation_id: correlation_id.to_string(),
            content_type: None,
            body_size: 2,
            is_a2a: true,
            jsonrpc_id: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn round_trips_trace_status_and_messages() {
        let store = SqliteStore::open(":memory:").unwrap();
        let trace = store.create_trace("echo hi".to_string()).await.unwrap();
        assert_eq!(trace.status, TraceStatus::Running);

        let saved = store.save_message(msg(&trace.id, &trace.id)).await.unwrap();
        assert!(!saved.id.is_empty());

        store
            .update_trace_status(&trace.id, TraceStatus::Completed)
            .await
            .unwrap();
        let fetched = store.get_trace(&trace.id).await.unwrap();
        assert_eq!(fetched.status, TraceStatus::Completed);

        let messages = store.get_messages(&trace.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].method, "tasks/create");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_status_on_unknown_trace_is_not_found() {
        let store = SqliteStore::open(":memory:").unwrap();
        let result = store.update_trace_status("missing", TraceStatus::Completed).await;
        assert!(matches!(result, Err(TraceError::TraceNotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_agent_upserts_on_url() {
        let store = SqliteStore::open(":memory:").unwrap();
        let agent = Agent {
            url: "http://agent.local".to_string(),
            name: "Bob".to_string(),
            description: String::new(),
            version: "1.0".to_string(),
            skills: vec!["greet".to_string()],
            first_seen: chrono::Utc::now(),
        };
        store.save_agent(agent.clone()).await.unwrap();
        let mut updated = agent.clone();
        updated.version = "2.0".to_string();
        store.save_agent(updated).await.unwrap();

        let agents = store.get_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].version, "2.0");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn export_trace_bundles_messages_and_insights() {
        let store = SqliteStore::open(":memory:").unwrap();
        let trace = store.create_trace("echo hi".to_string()).await.unwrap();
        store.save_message(msg(&trace.id, &trace.id)).await.unwrap();
        store
            .save_insight(Insight::new(
                &trace.id,
                None,
                Severity::Info,
                InsightCategory::SlowResponse,
                "slow",
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        let export = store.export_trace(&trace.id).await.unwrap();
        assert_eq!(export.messages.len(), 1);
        assert_eq!(export.insights.len(), 1);
    }
}

