use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TRACE_RUNNING: &str = "running";
pub const TRACE_COMPLETED: &str = "completed";
pub const TRACE_ERROR: &str = "error";

pub const DIRECTION_REQUEST: &str = "request";
pub const DIRECTION_RESPONSE: &str = "response";

pub const SEVERITY_ERROR: &str = "error";
pub const SEVERITY_WARNING: &str = "warning";
pub const SEVERITY_INFO: &str = "info";

pub const CATEGORY_SLOW_RESPONSE: &str = "slow_response";
pub const CATEGORY_ERROR: &str = "error";
pub const CATEGORY_PROTOCOL_VIOLATION: &str = "protocol_violation";
pub const CATEGORY_RETRY_LOOP: &str = "retry_loop";
pub const CATEGORY_BACKPRESSURE: &str = "analyzer_backpressure";

/// One invocation of the tool: the aggregate root for messages and insights.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trace {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub command: String,
    pub status: String,
}

/// A captured HTTP exchange half: one request or one response.
///
/// `request_id` is the correlation identifier — a request carries its own id,
/// its response carries the request's id. The JSON-RPC wire id (`rpc_id`) is
/// kept separately and is never used for pairing: it is not unique across
/// agents and notifications omit it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: String,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub direction: String,
    pub from_agent: String,
    pub to_agent: String,
    pub method: String,
    pub url: String,
    /// JSON object of header name → first value.
    pub headers: String,
    pub body: String,
    pub duration_ms: i64,
    pub status_code: i64,
    pub error: String,
    pub request_id: String,
    pub rpc_id: String,
    pub content_type: String,
    pub size: i64,
}

impl Message {
    pub fn is_request(&self) -> bool {
        self.direction == DIRECTION_REQUEST
    }

    pub fn is_response(&self) -> bool {
        self.direction == DIRECTION_RESPONSE
    }
}

/// A discovered A2A agent, keyed by URL. Not scoped to a trace.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Agent {
    pub id: String,
    pub url: String,
    pub name: String,
    pub description: String,
    pub version: String,
    /// JSON array of the card's skills.
    pub skills: String,
    pub first_seen: DateTime<Utc>,
}

/// An automatically derived observation about the trace. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Insight {
    pub id: String,
    pub trace_id: String,
    pub message_id: String,
    #[serde(rename = "type")]
    pub severity: String,
    pub category: String,
    pub title: String,
    /// JSON-serialized details map.
    pub details: String,
    pub timestamp: DateTime<Utc>,
}
