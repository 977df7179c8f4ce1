//! Pure, stateless classification of proxied traffic.
//!
//! Recognizes A2A JSON-RPC calls (POST + `application/json`) and agent-card
//! discovery (`GET …/.well-known/agent.json`), and extracts what the
//! analyzer and correlator need from the envelopes. Parse failures are never
//! fatal: the verdict simply carries empty fields.

use axum::http::Method;
use serde::Deserialize;
use serde_json::Value;

pub const AGENT_CARD_PATH: &str = "/.well-known/agent.json";

/// What the classifier concluded about one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verdict {
    pub is_a2a: bool,
    /// Extracted JSON-RPC method, e.g. `tasks/create`. Empty if none.
    pub method: String,
    /// Extracted JSON-RPC id, stringified. Empty for notifications.
    pub rpc_id: String,
}

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    method: String,
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// What the classifier concluded about one response body.
#[derive(Debug, Clone, Default)]
pub struct ResponseVerdict {
    /// The echoed JSON-RPC id, stringified. Empty if absent or unparseable.
    pub rpc_id: String,
    pub error: Option<RpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// The document published at `/.well-known/agent.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentCard {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub skills: Vec<Skill>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub push_notifications: bool,
    #[serde(default)]
    pub state_transition_history: bool,
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub struct Skill {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

/// Classify one inbound request.
///
/// Agent-card GETs are A2A regardless of content type — discovery clients
/// send no body and no `Content-Type`.
pub fn classify_request(method: &Method, path: &str, content_type: &str, body: &[u8]) -> Verdict {
    if method == Method::GET && path.ends_with(AGENT_CARD_PATH) {
        return Verdict {
            is_a2a: true,
            ..Verdict::default()
        };
    }

    if method != Method::POST || !content_type.contains("application/json") {
        return Verdict::default();
    }

    match serde_json::from_slice::<RpcRequest>(body) {
        Ok(envelope) => Verdict {
            is_a2a: true,
            method: envelope.method,
            rpc_id: format_rpc_id(envelope.id),
        },
        // A JSON POST with an unparseable body is still A2A traffic.
        Err(_) => Verdict {
            is_a2a: true,
            ..Verdict::default()
        },
    }
}

/// Classify one upstream response body.
pub fn classify_response(body: &[u8]) -> ResponseVerdict {
    match serde_json::from_slice::<RpcResponse>(body) {
        Ok(envelope) => ResponseVerdict {
            rpc_id: format_rpc_id(envelope.id),
            error: envelope.error,
        },
        Err(_) => ResponseVerdict::default(),
    }
}

/// Extract the JSON-RPC error object from a response body, if any.
pub fn rpc_error(body: &[u8]) -> Option<RpcError> {
    classify_response(body).error
}

/// Parse an agent card. A card without a name is not a card.
pub fn parse_agent_card(body: &[u8]) -> Option<AgentCard> {
    let card: AgentCard = serde_json::from_slice(body).ok()?;
    if card.name.is_empty() {
        return None;
    }
    Some(card)
}

/// Stringify a JSON-RPC id: strings verbatim, numbers in decimal.
fn format_rpc_id(id: Option<Value>) -> String {
    match id {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

/// Human-readable label for well-known A2A methods.
pub fn method_description(method: &str) -> &str {
    match method {
        "tasks/create" => "Create Task",
        "tasks/get" => "Get Task Status",
        "tasks/cancel" => "Cancel Task",
        "tasks/send" => "Send Message",
        "tasks/sendSubscribe" => "Send & Subscribe",
        "tasks/resubscribe" => "Resubscribe to Task",
        other => other,
    }
}
