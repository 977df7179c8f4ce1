//! Live fan-out of trace events to connected observers.
//!
//! Events are serialized once into a `{type, payload}` envelope and pushed
//! over a broadcast ring. An observer that falls a full ring behind is
//! dropped — publishers never wait on a slow session.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::store::models::{Agent, Insight, Message, Trace};

/// Ring capacity shared by all observer sessions.
const EVENT_BUFFER: usize = 1024;
/// Liveness ping cadence per session.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A session silent for this long is closed.
const READ_DEADLINE: Duration = Duration::from_secs(60);

/// One-to-many push of typed trace events.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn broadcast_message(&self, msg: &Message) {
        self.publish("message", msg);
    }

    pub fn broadcast_agent(&self, agent: &Agent) {
        self.publish("agent", agent);
    }

    pub fn broadcast_insight(&self, insight: &Insight) {
        self.publish("insight", insight);
    }

    pub fn broadcast_trace_status(&self, trace: &Trace) {
        self.publish("trace_status", trace);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, kind: &str, payload: impl Serialize) {
        let envelope = json!({ "type": kind, "payload": payload });
        // No subscribers is fine.
        let _ = self.tx.send(envelope.to_string());
    }
}

/// Drive one observer WebSocket session until it closes, stalls, lags, or
/// the tool shuts down.
pub async fn run_session(
    socket: axum::extract::ws::WebSocket,
    mut events: broadcast::Receiver<String>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    use axum::extract::ws::Message as WsMessage;

    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // consume the immediate first tick
    let mut last_heard = Instant::now();

    debug!("observer connected");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            event = events.recv() => {
                match event {
                    Ok(json) => {
                        if sink.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dropping slow observer");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_heard = Instant::now();
                        if let Some(reply) = control_reply(&text) {
                            if sink.send(WsMessage::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_))) => {
                        last_heard = Instant::now();
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        last_heard = Instant::now();
                    }
                    Some(Err(e)) => {
                        debug!(err = %e, "observer read error");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if last_heard.elapsed() > READ_DEADLINE {
                    debug!("observer timed out");
                    break;
                }
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    debug!("observer disconnected");
}

/// Answer an observer control frame. `ping` gets a `pong`; everything else
/// is ignored.
fn control_reply(text: &str) -> Option<String> {
    let frame: serde_json::Value = serde_json::from_str(text).ok()?;
    match frame.get("type").and_then(|t| t.as_str()) {
        Some("ping") => Some(json!({ "type": "pong" }).to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn ping_frame_gets_pong() {
        let reply = control_reply(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(reply, r#"{"type":"pong"}"#);
    }

    #[test]
    fn unknown_and_invalid_frames_are_ignored() {
        assert!(control_reply(r#"{"type":"replay"}"#).is_none());
        assert!(control_reply("not json").is_none());
        assert!(control_reply(r#"{"kind":"ping"}"#).is_none());
    }

    #[tokio::test]
    async fn envelope_carries_type_and_payload() {
        let hub = EventBroadcaster::new();
        let mut rx = hub.subscribe();

        let trace = Trace {
            id: "t1".to_string(),
            started_at: Utc::now(),
            command: "echo hi".to_string(),
            status: "running".to_string(),
        };
        hub.broadcast_trace_status(&trace);

        let raw = rx.recv().await.unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope["type"], "trace_status");
        assert_eq!(envelope["payload"]["id"], "t1");
        assert_eq!(envelope["payload"]["status"], "running");
    }

    #[tokio::test]
    async fn broadcast_without_observers_does_not_block() {
        let hub = EventBroadcaster::new();
        let trace = Trace {
            id: "t1".to_string(),
            started_at: Utc::now(),
            command: String::new(),
            status: "running".to_string(),
        };
        // Would panic or hang if the send were treated as an error.
        hub.broadcast_trace_status(&trace);
        assert_eq!(hub.observer_count(), 0);
    }
}
