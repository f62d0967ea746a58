//! Hub — live fan-out of messages, agents, and insights to observers.
//!
//! One dispatch point owns the observer set, treated as state owned by
//! exactly one worker rather than a shared-locked map. Each observer has a
//! bounded outbound channel; a full channel means the observer is slow and
//! is dropped rather than allowed to block a publisher. Built on axum's
//! `ws` extractor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::model::{Agent, Insight, Message, TraceStatus};

/// Minimum outbound buffer capacity per observer session.
pub const SESSION_BUFFER_CAPACITY: usize = 256;

/// Envelope broadcast to every observer: `{type, payload}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    Message(Message),
    Agent(Agent),
    Insight(Insight),
    TraceStatus(TraceStatus),
}

type SessionId = u64;

/// Maintains the observer set and fans out serialized envelopes.
pub struct Hub {
    sessions: Mutex<HashMap<SessionId, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new observer session and return its id plus the
    /// receiving half of its outbound channel.
    pub async fn register(&self) -> (SessionId, mpsc::Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_BUFFER_CAPACITY);
        self.sessions.lock().await.insert(id, tx);
        debug!(session_id = id, "observer connected");
        (id, rx)
    }

    pub async fn unregister(&self, id: SessionId) {
        self.sessions.lock().await.remove(&id);
        debug!(session_id = id, "observer disconnected");
    }

    /// Serialize the envelope once and offer it to every session. A
    /// session whose buffer is full is closed and removed — this call
    /// never awaits a slow observer's capacity to free up.
    async fn broadcast(&self, envelope: &Envelope) {
        let payload: Arc<str> = match serde_json::to_string(envelope) {
            Ok(s) => s.into(),
            Err(e) => {
                warn!("failed to serialize hub envelope: {e}");
                return;
            }
        };

        let mut sessions = self.sessions.lock().await;
        let mut dead = Vec::new();
        for (id, tx) in sessions.iter() {
            if tx.try_send(payload.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            sessions.remove(&id);
            debug!(session_id = id, "dropped slow observer");
        }
    }

    pub async fn broadcast_message(&self, msg: &Message) {
        self.broadcast(&Envelope::Message(msg.clone())).await;
    }

    pub async fn broadcast_agent(&self, agent: &Agent) {
        self.broadcast(&Envelope::Agent(agent.clone())).await;
    }

    /// Awaited by the analyzer worker so every insight produced for a
    /// Message is broadcast before the worker advances to the next one.
    pub async fn broadcast_insight(&self, insight: &Insight) {
        self.broadcast(&Envelope::Insight(insight.clone())).await;
    }

    pub async fn broadcast_trace_status(&self, status: TraceStatus) {
        self.broadcast(&Envelope::TraceStatus(status)).await;
    }

    pub async fn observer_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;

    fn sample_message() -> Message {
        Message {
            id: "m1".to_string(),
            trace_id: "t1".to_string(),
            timestamp: chrono::Utc::now(),
            direction: Direction::Request,
            source_agent: String::new(),
            target_agent: String::new(),
            method: "tasks/create".to_string(),
            url: "http://example/".to_string(),
            headers: Default::default(),
            body: "{}".to_string(),
            duration_ms: None,
            status: None,
            error: None,
            correlation_id: "m1".to_string(),
            content_type: None,
            body_size: 2,
            is_a2a: true,
            jsonrpc_id: None,
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_to_registered_observer() {
        let hub = Hub::new();
        let (_id, mut rx) = hub.register().await;
        hub.broadcast_message(&sample_message()).await;
        let payload = rx.recv().await.unwrap();
        assert!(payload.contains("tasks/create"));
    }

    #[tokio::test]
    async fn full_session_buffer_is_dropped_not_blocked() {
        let hub = Hub::new();
        let (id, _rx) = hub.register().await;
        // Never drain `_rx` — fill past capacity and confirm broadcast
        // still returns promptly and the session gets pruned.
        for _ in 0..(SESSION_BUFFER_CAPACITY + 10) {
            hub.broadcast_message(&sample_message()).await;
        }
        assert!(!hub.sessions.lock().await.contains_key(&id));
    }

    #[tokio::test]
    async fn unregister_removes_session() {
        let hub = Hub::new();
        let (id, _rx) = hub.register().await;
        assert_eq!(hub.observer_count().await, 1);
        hub.unregister(id).await;
        assert_eq!(hub.observer_count().await, 0);
    }
}
