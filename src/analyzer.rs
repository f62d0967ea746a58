//! Analyzer — derives insights from the correlated message stream.
//!
//! Consumes each persisted [`Message`] once, in the order the proxy
//! produced it. The analyzer owns its per-trace counters exclusively
//! (message-passing in, no shared-locked maps), fed by a bounded queue so a
//! slow analyzer can never block the proxy: on overflow the oldest queued
//! message is dropped to make room for the new one (drop-oldest), rather
//! than rejecting the message that just arrived.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::hub::Hub;
use crate::model::{AnalyzerSummary, Direction, Insight, InsightCategory, Message, Severity};
use crate::store::Store;

/// Default slow-response threshold.
pub const DEFAULT_SLOW_THRESHOLD_MS: u64 = 1_000;

/// Bounded queue capacity between the proxy and the analyzer worker.
const QUEUE_CAPACITY: usize = 1024;

/// A bounded, single-consumer queue that drops the oldest entry on overflow
/// instead of rejecting the newest one — the inverse of `mpsc`'s
/// `try_send`, which would drop the message just handed in.
struct DropOldestQueue {
    items: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl DropOldestQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
        }
    }

    fn push(&self, msg: Message) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= QUEUE_CAPACITY {
            items.pop_front();
            warn!("analyzer queue full, dropping oldest queued message");
        }
        items.push_back(msg);
        drop(items);
        self.notify.notify_one();
    }

    /// Waits for and pops the oldest message. The `notified()` future is
    /// created before the queue is checked so a `push` that lands between
    /// the check and the await is never missed (see `tokio::sync::Notify`'s
    /// documented check-then-wait pattern).
    async fn pop(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.items.lock().unwrap().pop_front() {
                return msg;
            }
            notified.await;
        }
    }
}

/// Handle used by the proxy to hand a persisted message to the analyzer
/// without waiting for analysis to complete.
#[derive(Clone)]
pub struct AnalyzerHandle {
    queue: Arc<DropOldestQueue>,
}

impl AnalyzerHandle {
    /// Enqueue a message for analysis. Never blocks the caller for more
    /// than a bounded instant: on a full queue, the oldest queued message is
    /// dropped to make room, so the proxy is never stalled and analysis
    /// always keeps the most recent traffic.
    pub fn dispatch(&self, msg: Message) {
        self.queue.push(msg);
    }
}

/// Running per-trace state, exclusively owned by the analyzer's worker
/// task.
#[derive(Default)]
struct Counters {
    method_counts: HashMap<String, u64>,
    agent_error_counts: HashMap<String, u64>,
    total_messages: u64,
    total_insights: u64,
    error_count: u64,
    success_count: u64,
    response_duration_sum_ms: u64,
    response_count: u64,
}

impl Counters {
    fn summary(&self) -> AnalyzerSummary {
        AnalyzerSummary {
            total_messages: self.total_messages as usize,
            total_insights: self.total_insights as usize,
            error_count: self.error_count as usize,
            success_count: self.success_count as usize,
            avg_duration_ms: if self.response_count > 0 {
                self.response_duration_sum_ms as f64 / self.response_count as f64
            } else {
                0.0
            },
            method_counts: self.method_counts.clone(),
            agent_error_counts: self.agent_error_counts.clone(),
        }
    }
}

/// Spawns the analyzer's single-consumer worker and returns a handle the
/// proxy can dispatch messages through, plus a snapshot handle for the
/// control surface.
pub struct Analyzer {
    handle: AnalyzerHandle,
    counters: Arc<tokio::sync::Mutex<Counters>>,
    slow_threshold_ms: u64,
}

impl Analyzer {
    pub fn spawn(store: Arc<dyn Store>, hub: Arc<Hub>, trace_id: String) -> Self {
        Self::spawn_with_threshold(store, hub, trace_id, DEFAULT_SLOW_THRESHOLD_MS)
    }

    pub fn spawn_with_threshold(
        store: Arc<dyn Store>,
        hub: Arc<Hub>,
        trace_id: String,
        slow_threshold_ms: u64,
    ) -> Self {
        let queue = Arc::new(DropOldestQueue::new());
        let counters = Arc::new(tokio::sync::Mutex::new(Counters::default()));

        let worker_queue = queue.clone();
        let worker_counters = counters.clone();
        debug!("analyzer worker for trace {trace_id} starting");
        tokio::spawn(async move {
            loop {
                let msg = worker_queue.pop().await;

                let mut counters = worker_counters.lock().await;
                counters.total_messages += 1;
                let insights = evaluate_rules(&msg, &mut counters, slow_threshold_ms);
                counters.total_insights += insights.len() as u64;
                drop(counters);

                // All insights for this Message are persisted and broadcast
                // before the worker advances to the next queued Message.
                for insight in insights {
                    if let Err(e) = store.save_insight(insight.clone()).await {
                        warn!("failed to persist insight: {e}");
                    }
                    hub.broadcast_insight(&insight).await;
                }
            }
        });

        Self {
            handle: AnalyzerHandle { queue },
            counters,
            slow_threshold_ms,
        }
    }

    pub fn handle(&self) -> AnalyzerHandle {
        self.handle.clone()
    }

    pub async fn summary(&self) -> AnalyzerSummary {
        self.counters.lock().await.summary()
    }

    pub fn slow_threshold_ms(&self) -> u64 {
        self.slow_threshold_ms
    }
}

/// Rule evaluation order is fixed: slow → error → protocol_violation →
/// retry_loop.
fn evaluate_rules(msg: &Message, counters: &mut Counters, slow_threshold_ms: u64) -> Vec<Insight> {
    let mut insights = Vec::new();

    if msg.direction == Direction::Response {
        if let Some(duration) = msg.duration_ms {
            counters.response_duration_sum_ms += duration;
            counters.response_count += 1;

            if duration >= slow_threshold_ms {
                insights.push(Insight::new(
                    &msg.trace_id,
                    Some(msg.id.clone()),
                    Severity::Warning,
                    InsightCategory::SlowResponse,
                    format!("slow response: {duration}ms"),
                    serde_json::json!({
                        "duration_ms": duration,
                        "url": msg.url,
                        "method": msg.method,
                        "suggestion": "investigate upstream latency or raise the slow-response threshold",
                    }),
                ));
            }
        }

        let has_error = msg.error.as_deref().is_some_and(|e| !e.is_empty());
        let is_http_error = msg.status.map(|s| s >= 400).unwrap_or(false);
        if has_error || is_http_error {
            *counters
                .agent_error_counts
                .entry(msg.source_agent.clone())
                .or_insert(0) += 1;

            let severity = match msg.status {
                Some(status) if (400..500).contains(&status) => Severity::Warning,
                _ => Severity::Error,
            };
            counters.error_count += 1;

            insights.push(Insight::new(
                &msg.trace_id,
                Some(msg.id.clone()),
                severity,
                InsightCategory::Error,
                format!(
                    "{} error from {}",
                    msg.status.map(|s| s.to_string()).unwrap_or_default(),
                    msg.source_agent
                ),
                serde_json::json!({
                    "error": msg.error,
                    "status": msg.status,
                    "url": msg.url,
                }),
            ));
        } else {
            counters.success_count += 1;
        }

        // Only A2A-classified exchanges are expected to carry a JSON-RPC
        // envelope — an ordinary JSON REST response proxied alongside A2A
        // traffic has no `jsonrpc`/`id` fields to violate.
        if msg.is_a2a {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&msg.body) {
                if let Some(obj) = value.as_object() {
                    let mut violations = Vec::new();
                    if !obj.contains_key("jsonrpc") {
                        violations.push("missing jsonrpc field");
                    }
                    let has_id = obj.contains_key("id");
                    if !has_id {
                        violations.push("missing id field");
                    }
                    let is_2xx = msg.status.map(|s| (200..300).contains(&s)).unwrap_or(false);
                    if is_2xx && obj.contains_key("result") && !has_id {
                        violations.push("2xx result response carries no id");
                    }
                    if !violations.is_empty() {
                        insights.push(Insight::new(
                            &msg.trace_id,
                            Some(msg.id.clone()),
                            Severity::Warning,
                            InsightCategory::ProtocolViolation,
                            "JSON-RPC protocol violation",
                            serde_json::json!({ "violations": violations }),
                        ));
                    }
                }
            }
        }
    }

    // Counted on the request side only: responses carry the same method
    // name for display, but a "retry" is an occurrence of a call, not of a
    // call-response pair — counting both would fire at 3/5 of the expected
    // occurrence count.
    if msg.direction == Direction::Request && !msg.method.is_empty() {
        let count = counters
            .method_counts
            .entry(msg.method.clone())
            .or_insert(0);
        *count += 1;
        if should_emit_retry_insight(*count) {
            insights.push(Insight::new(
                &msg.trace_id,
                Some(msg.id.clone()),
                Severity::Warning,
                InsightCategory::RetryLoop,
                format!("{} called {} times", msg.method, count),
                serde_json::json!({ "method": msg.method, "call_count": count }),
            ));
        }
    }

    insights
}

/// Fires on every positive multiple of 5 (5th, 10th, 15th, … occurrence).
/// The literal multiple-of-5 behavior is kept rather than backing off
/// emission at large counts, so very high-frequency methods keep surfacing
/// a warning every fifth call — see `DESIGN.md` for the tradeoff.
fn should_emit_retry_insight(count: u64) -> bool {
    count > 0 && count % 5 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_insight_fires_on_every_multiple_of_five_below_ceiling() {
        for n in 1..=10u64 {
            assert_eq!(should_emit_retry_insight(n * 5), true);
        }
    }

    #[test]
    fn retry_insight_does_not_fire_on_non_multiples() {
        assert!(!should_emit_retry_insight(7));
        assert!(!should_emit_retry_insight(0));
    }

    #[test]
    fn retry_insight_fires_on_large_multiples_too() {
        assert!(should_emit_retry_insight(500));
        assert!(!should_emit_retry_insight(501));
    }
}
