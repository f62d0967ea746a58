//! In-memory `Store` backend — the default when `--db` is not given.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{build_export, Store};
use crate::error::{TraceError, TraceResult};
use crate::model::{Agent, Insight, Message, Trace, TraceExport, TraceStatus};

/// Guarded by a single mutex per entity kind — writes are serialized,
/// reads always observe every write that completed before them.
#[derive(Default)]
pub struct InMemoryStore {
    traces: Mutex<HashMap<String, Trace>>,
    messages: Mutex<Vec<Message>>,
    agents: Mutex<HashMap<String, Agent>>,
    insights: Mutex<Vec<Insight>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_trace(&self, command: String) -> TraceResult<Trace> {
        let trace = Trace::new(command);
        self.traces
            .lock()
            .unwrap()
            .insert(trace.id.clone(), trace.clone());
        Ok(trace)
    }

    async fn update_trace_status(&self, id: &str, status: TraceStatus) -> TraceResult<()> {
        let mut traces = self.traces.lock().unwrap();
        let trace = traces
            .get_mut(id)
            .ok_or_else(|| TraceError::TraceNotFound(id.to_string()))?;
        trace.status = status;
        Ok(())
    }

    async fn get_trace(&self, id: &str) -> TraceResult<Trace> {
        self.traces
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TraceError::TraceNotFound(id.to_string()))
    }

    async fn save_message(&self, mut msg: Message) -> TraceResult<Message> {
        if msg.id.is_empty() {
            msg.id = uuid::Uuid::new_v4().to_string();
        }
        let mut messages = self.messages.lock().unwrap();
        messages.push(msg.clone());
        Ok(msg)
    }

    async fn get_messages(&self, trace_id: &str) -> TraceResult<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.trace_id == trace_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn save_agent(&self, agent: Agent) -> TraceResult<Agent> {
        let mut agents = self.agents.lock().unwrap();
        let entry = agents
            .entry(agent.url.clone())
            .or_insert_with(|| agent.clone());
        entry.name = agent.name;
        entry.description = agent.description;
        entry.version = agent.version;
        entry.skills = agent.skills;
        Ok(entry.clone())
    }

    async fn get_agents(&self) -> TraceResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.agents.lock().unwrap().values().cloned().collect();
        agents.sort_by_key(|a| std::cmp::Reverse(a.first_seen));
        Ok(agents)
    }

    async fn save_insight(&self, insight: Insight) -> TraceResult<Insight> {
        self.insights.lock().unwrap().push(insight.clone());
        Ok(insight)
    }

    async fn get_insights(&self, trace_id: &str) -> TraceResult<Vec<Insight>> {
        let mut insights: Vec<Insight> = self
            .insights
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.trace_id == trace_id)
            .cloned()
            .collect();
        insights.sort_by_key(|i| std::cmp::Reverse(i.timestamp));
        Ok(insights)
    }

    async fn export_trace(&self, trace_id: &str) -> TraceResult<TraceExport> {
        let trace = self.get_trace(trace_id).await?;
        let messages = self.get_messages(trace_id).await?;
        let insights = self.get_insights(trace_id).await?;
        Ok(build_export(trace, messages, insights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;

    fn msg(trace_id: &str, dir: Direction, ts_secs: i64) -> Message {
        Message {
            id: String::new(),
            trace_id: trace_id.to_string(),
            timestamp: chrono::DateTime::from_timestamp(ts_secs, 0).unwrap(),
            direction: dir,
            source_agent: String::new(),
            target_agent: String::new(),
            method: String::new(),
            url: String::new(),
            headers: Default::default(),
            body: String::new(),
            duration_ms: None,
            status: None,
            error: None,
            correlation_id: "corr".to_string(),
            content_type: None,
            body_size: 0,
            is_a2a: true,
            jsonrpc_id: None,
        }
    }

    #[tokio::test]
    async fn save_message_assigns_id_when_absent() {
        let store = InMemoryStore::new();
        let trace = store.create_trace("echo".to_string()).await.unwrap();
        let saved = store
            .save_message(msg(&trace.id, Direction::Request, 1))
            .await
            .unwrap();
        assert!(!saved.id.is_empty());
    }

    #[tokio::test]
    async fn get_messages_orders_by_timestamp_ascending() {
        let store = InMemoryStore::new();
        let trace = store.create_trace("echo".to_string()).await.unwrap();
        store
            .save_message(msg(&trace.id, Direction::Request, 10))
            .await
            .unwrap();
        store
            .save_message(msg(&trace.id, Direction::Response, 5))
            .await
            .unwrap();
        let messages = store.get_messages(&trace.id).await.unwrap();
        assert_eq!(messages[0].timestamp.timestamp(), 5);
        assert_eq!(messages[1].timestamp.timestamp(), 10);
    }

    #[tokio::test]
    async fn save_agent_upserts_on_url() {
        let store = InMemoryStore::new();
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

    #[tokio::test]
    async fn export_trace_is_stable_across_calls() {
        let store = InMemoryStore::new();
        let trace = store.create_trace("echo".to_string()).await.unwrap();
        store
            .save_message(msg(&trace.id, Direction::Request, 1))
            .await
            .unwrap();
        let a = store.export_trace(&trace.id).await.unwrap();
        let b = store.export_trace(&trace.id).await.unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
