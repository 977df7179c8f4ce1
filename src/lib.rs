pub mod analyzer;
pub mod api;
pub mod config;
pub mod hub;
pub mod process;
pub mod proxy;
pub mod store;

use analyzer::AnalyzerHandle;
use config::TraceConfig;
use hub::EventBroadcaster;
use store::models::{Agent, Message};
use store::Store;
use tracing::debug;

/// Shared application state handed to every request handler and worker.
pub struct AppContext {
    pub config: TraceConfig,
    pub store: Store,
    pub hub: EventBroadcaster,
    pub analyzer: AnalyzerHandle,
    /// Upstream HTTP client shared by all proxied requests.
    pub http: reqwest::Client,
    /// The trace this invocation writes into.
    pub trace_id: String,
    pub started_at: std::time::Instant,
    /// Flips to true when the tool is winding down; long-lived sessions
    /// watch it so observers get a clean close.
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

impl AppContext {
    /// Fan a freshly persisted message out to observers and the analyzer.
    pub fn publish_message(&self, msg: &Message) {
        self.hub.broadcast_message(msg);
        self.analyzer.observe(msg);
        debug!(
            direction = %msg.direction,
            method = %msg.method,
            url = %msg.url,
            duration_ms = msg.duration_ms,
            "captured message"
        );
    }

    /// Fan a discovered agent out to observers.
    pub fn publish_agent(&self, agent: &Agent) {
        self.hub.broadcast_agent(agent);
        debug!(name = %agent.name, url = %agent.url, "discovered agent");
    }
}
