//! Derives insights from the correlated message stream.
//!
//! A single worker task consumes every captured message in proxy order and
//! applies the detection rules (slow response, error, protocol violation,
//! retry loop). Insights for one message are persisted and broadcast before
//! the next message is touched. The feed from the proxy is a bounded ring:
//! when the worker falls behind, the oldest pending events are dropped and
//! the gap itself is recorded as an insight — the proxy never waits.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub::EventBroadcaster;
use crate::proxy::classifier::{method_description, rpc_error};
use crate::store::models::{
    Insight, Message, CATEGORY_BACKPRESSURE, CATEGORY_ERROR, CATEGORY_PROTOCOL_VIOLATION,
    CATEGORY_RETRY_LOOP, CATEGORY_SLOW_RESPONSE, SEVERITY_ERROR, SEVERITY_INFO, SEVERITY_WARNING,
};
use crate::store::Store;

/// Responses at or above this duration are flagged as slow.
pub const DEFAULT_SLOW_THRESHOLD_MS: i64 = 1_000;
/// A retry-loop insight fires on every multiple of this per-method call count.
const RETRY_WINDOW: u64 = 5;
/// Feed ring capacity between proxy and worker.
const QUEUE_CAPACITY: usize = 1024;

/// Analyzer snapshot served at `/api/summary`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub total_messages: usize,
    pub total_insights: usize,
    pub error_count: usize,
    pub success_count: usize,
    /// Average over response messages only.
    pub avg_duration_ms: i64,
    pub method_counts: BTreeMap<String, u64>,
    pub agent_error_counts: BTreeMap<String, u64>,
}

/// Cheap handle for feeding the worker and querying its snapshot.
#[derive(Clone)]
pub struct AnalyzerHandle {
    feed: broadcast::Sender<Message>,
    queries: mpsc::Sender<oneshot::Sender<Summary>>,
}

impl AnalyzerHandle {
    /// Queue a message for analysis. Never blocks; oldest events are dropped
    /// if the worker cannot keep up.
    pub fn observe(&self, msg: &Message) {
        let _ = self.feed.send(msg.clone());
    }

    pub async fn summary(&self) -> Summary {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.queries.send(reply_tx).await.is_err() {
            return Summary::default();
        }
        reply_rx.await.unwrap_or_default()
    }
}

/// Spawn the analyzer worker and return its handle.
pub fn spawn(
    store: Store,
    hub: EventBroadcaster,
    trace_id: String,
    slow_threshold_ms: i64,
) -> AnalyzerHandle {
    let (feed_tx, feed_rx) = broadcast::channel(QUEUE_CAPACITY);
    let (query_tx, query_rx) = mpsc::channel(16);

    let worker = Worker::new(store, hub, trace_id, slow_threshold_ms);
    tokio::spawn(worker.run(feed_rx, query_rx));

    AnalyzerHandle {
        feed: feed_tx,
        queries: query_tx,
    }
}

struct Worker {
    store: Store,
    hub: EventBroadcaster,
    trace_id: String,
    slow_threshold_ms: i64,
    method_counts: BTreeMap<String, u64>,
    agent_errors: BTreeMap<String, u64>,
    /// Pending request timestamps, cleared when the response arrives.
    request_times: HashMap<String, DateTime<Utc>>,
}

impl Worker {
    fn new(store: Store, hub: EventBroadcaster, trace_id: String, slow_threshold_ms: i64) -> Self {
        Self {
            store,
            hub,
            trace_id,
            slow_threshold_ms,
            method_counts: BTreeMap::new(),
            agent_errors: BTreeMap::new(),
            request_times: HashMap::new(),
        }
    }

    async fn run(
        mut self,
        mut feed: broadcast::Receiver<Message>,
        mut queries: mpsc::Receiver<oneshot::Sender<Summary>>,
    ) {
        loop {
            tokio::select! {
                biased;

                msg = feed.recv() => match msg {
                    Ok(msg) => self.observe(msg).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.record_overflow(skipped).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                Some(reply) = queries.recv() => {
                    let _ = reply.send(self.summary().await);
                }
            }
        }
        debug!("analyzer stopped");
    }

    async fn observe(&mut self, msg: Message) {
        if msg.is_request() {
            self.request_times.insert(msg.id.clone(), msg.timestamp);
            if !msg.method.is_empty() {
                *self.method_counts.entry(msg.method.clone()).or_insert(0) += 1;
            }
        }

        let mut insights = Vec::new();

        if msg.is_response() {
            self.request_times.remove(&msg.request_id);
            if let Some(i) = self.check_slow(&msg) {
                insights.push(i);
            }
            if let Some(i) = self.check_error(&msg) {
                insights.push(i);
            }
            if let Some(i) = self.check_protocol(&msg) {
                insights.push(i);
            }
        }

        if let Some(i) = self.check_retry_loop(&msg) {
            insights.push(i);
        }

        for mut insight in insights {
            self.emit(&mut insight).await;
        }
    }

    fn check_slow(&self, msg: &Message) -> Option<Insight> {
        if msg.duration_ms < self.slow_threshold_ms {
            return None;
        }
        Some(self.insight(
            &msg.id,
            SEVERITY_WARNING,
            CATEGORY_SLOW_RESPONSE,
            "Slow Response Detected".to_string(),
            json!({
                "duration_ms": msg.duration_ms,
                "url": msg.url,
                "method": msg.method,
                "suggestion": "Consider adding timeout handling or investigating agent performance",
            }),
        ))
    }

    fn check_error(&mut self, msg: &Message) -> Option<Insight> {
        if msg.error.is_empty() && msg.status_code < 400 {
            return None;
        }

        *self
            .agent_errors
            .entry(msg.from_agent.clone())
            .or_insert(0) += 1;

        let severity = if (400..500).contains(&msg.status_code) {
            SEVERITY_WARNING
        } else {
            SEVERITY_ERROR
        };
        let title = if msg.status_code >= 400 {
            format!("HTTP Error {}", msg.status_code)
        } else {
            "A2A Error Response".to_string()
        };

        let mut details = json!({
            "status_code": msg.status_code,
            "error": msg.error,
            "url": msg.url,
            "method": msg.method,
        });
        if let Some(rpc_err) = rpc_error(msg.body.as_bytes()) {
            details["error_code"] = json!(rpc_err.code);
            details["error_message"] = json!(rpc_err.message);
        }

        Some(self.insight(&msg.id, severity, CATEGORY_ERROR, title, details))
    }

    fn check_protocol(&self, msg: &Message) -> Option<Insight> {
        let parsed: Value = serde_json::from_str(&msg.body).ok()?;
        let obj = parsed.as_object()?;

        let mut violations = Vec::new();
        if !obj.contains_key("jsonrpc") {
            violations.push("Missing 'jsonrpc' field".to_string());
        }
        // The id may be absent on notifications, but a 2xx response carrying
        // a result must echo one.
        if !obj.contains_key("id")
            && (200..300).contains(&msg.status_code)
            && obj.contains_key("result")
        {
            violations.push("Missing 'id' field in response".to_string());
        }

        if violations.is_empty() {
            return None;
        }
        Some(self.insight(
            &msg.id,
            SEVERITY_WARNING,
            CATEGORY_PROTOCOL_VIOLATION,
            "A2A Protocol Violation".to_string(),
            json!({ "violations": violations, "url": msg.url }),
        ))
    }

    fn check_retry_loop(&self, msg: &Message) -> Option<Insight> {
        if !msg.is_request() || msg.method.is_empty() {
            return None;
        }
        let count = *self.method_counts.get(&msg.method)?;
        if count == 0 || count % RETRY_WINDOW != 0 {
            return None;
        }
        Some(self.insight(
            &msg.id,
            SEVERITY_WARNING,
            CATEGORY_RETRY_LOOP,
            "Potential Retry Loop Detected".to_string(),
            json!({
                "method": msg.method,
                "description": method_description(&msg.method),
                "call_count": count,
                "suggestion": "Check for proper error handling and backoff logic",
            }),
        ))
    }

    async fn record_overflow(&mut self, skipped: u64) {
        warn!(skipped, "analyzer queue overflowed; oldest events dropped");
        let mut insight = self.insight(
            "",
            SEVERITY_INFO,
            CATEGORY_BACKPRESSURE,
            "Analyzer Queue Overflow".to_string(),
            json!({ "dropped_events": skipped }),
        );
        self.emit(&mut insight).await;
    }

    fn insight(
        &self,
        message_id: &str,
        severity: &str,
        category: &str,
        title: String,
        details: Value,
    ) -> Insight {
        Insight {
            id: Uuid::new_v4().to_string(),
            trace_id: self.trace_id.clone(),
            message_id: message_id.to_string(),
            severity: severity.to_string(),
            category: category.to_string(),
            title,
            details: serde_json::to_string_pretty(&details).unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }

    async fn emit(&self, insight: &mut Insight) {
        match self.store.save_insight(insight).await {
            Ok(()) => {
                self.hub.broadcast_insight(insight);
                debug!(category = %insight.category, title = %insight.title, "insight");
            }
            Err(e) => warn!(err = %e, "failed to save insight"),
        }
    }

    async fn summary(&self) -> Summary {
        let messages = match self.store.get_messages(&self.trace_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(err = %e, "failed to load messages for summary");
                return Summary::default();
            }
        };
        let insights = self.store.get_insights(&self.trace_id).await.unwrap_or_default();

        let mut error_count = 0;
        let mut success_count = 0;
        let mut total_duration = 0i64;
        for msg in &messages {
            if msg.is_response() {
                total_duration += msg.duration_ms;
                if !msg.error.is_empty() || msg.status_code >= 400 {
                    error_count += 1;
                } else {
                    success_count += 1;
                }
            }
        }
        let responses = error_count + success_count;
        let avg_duration_ms = if responses > 0 {
            total_duration / responses as i64
        } else {
            0
        };

        Summary {
            total_messages: messages.len(),
            total_insights: insights.len(),
            error_count,
            success_count,
            avg_duration_ms,
            method_counts: self.method_counts.clone(),
            agent_error_counts: self.agent_errors.clone(),
        }
    }
}
