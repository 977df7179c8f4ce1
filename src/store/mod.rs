pub mod models;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use uuid::Uuid;

use models::{Agent, Insight, Message, Trace, TRACE_RUNNING};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS traces (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    command TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running'
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    direction TEXT NOT NULL,
    from_agent TEXT NOT NULL DEFAULT '',
    to_agent TEXT NOT NULL DEFAULT '',
    method TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL DEFAULT '',
    headers TEXT NOT NULL DEFAULT '',
    body TEXT NOT NULL DEFAULT '',
    duration_ms INTEGER NOT NULL DEFAULT 0,
    status_code INTEGER NOT NULL DEFAULT 0,
    error TEXT NOT NULL DEFAULT '',
    request_id TEXT NOT NULL DEFAULT '',
    rpc_id TEXT NOT NULL DEFAULT '',
    content_type TEXT NOT NULL DEFAULT '',
    size INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (trace_id) REFERENCES traces(id)
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    url TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL DEFAULT '',
    skills TEXT NOT NULL DEFAULT '',
    first_seen TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS insights (
    id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    message_id TEXT NOT NULL DEFAULT '',
    severity TEXT NOT NULL,
    category TEXT NOT NULL,
    title TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '',
    timestamp TEXT NOT NULL,
    FOREIGN KEY (trace_id) REFERENCES traces(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_trace_id ON messages(trace_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_insights_trace_id ON insights(trace_id)
"#;

/// Append-only trace persistence over SQLite.
///
/// In-memory by default; file-backed (WAL) when a path is given. Writes are
/// serialized by the pool, reads observe every completed write.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(db_path: Option<&str>) -> Result<Self> {
        let pool = match db_path {
            // A pooled in-memory database must pin a single connection:
            // every new connection would otherwise open its own empty db.
            None => {
                let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(opts)
                    .await
                    .context("failed to open in-memory database")?
            }
            Some(path) => {
                let opts = SqliteConnectOptions::from_str(&format!("sqlite://{path}?mode=rwc"))?
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .create_if_missing(true);
                SqlitePool::connect_with(opts)
                    .await
                    .with_context(|| format!("failed to open database at {path}"))?
            }
        };

        let store = Self { pool };
        store.migrate().await.context("failed to run migrations")?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    // ─── Traces ──────────────────────────────────────────────────────────────

    pub async fn create_trace(&self, command: &str) -> Result<Trace> {
        let trace = Trace {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            command: command.to_string(),
            status: TRACE_RUNNING.to_string(),
        };
        sqlx::query("INSERT INTO traces (id, started_at, command, status) VALUES (?, ?, ?, ?)")
            .bind(&trace.id)
            .bind(trace.started_at)
            .bind(&trace.command)
            .bind(&trace.status)
            .execute(&self.pool)
            .await?;
        Ok(trace)
    }

    pub async fn update_trace_status(&self, trace_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE traces SET status = ? WHERE id = ?")
            .bind(status)
            .bind(trace_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_trace(&self, trace_id: &str) -> Result<Option<Trace>> {
        Ok(sqlx::query_as("SELECT * FROM traces WHERE id = ?")
            .bind(trace_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    // ─── Messages ────────────────────────────────────────────────────────────

    /// Append a message. Assigns a fresh id when the caller left it empty.
    pub async fn save_message(&self, msg: &mut Message) -> Result<()> {
        if msg.id.is_empty() {
            msg.id = Uuid::new_v4().to_string();
        }
        sqlx::query(
            "INSERT INTO messages (
                 id, trace_id, timestamp, direction, from_agent, to_agent,
                 method, url, headers, body, duration_ms, status_code, error,
                 request_id, rpc_id, content_type, size
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.id)
        .bind(&msg.trace_id)
        .bind(msg.timestamp)
        .bind(&msg.direction)
        .bind(&msg.from_agent)
        .bind(&msg.to_agent)
        .bind(&msg.method)
        .bind(&msg.url)
        .bind(&msg.headers)
        .bind(&msg.body)
        .bind(msg.duration_ms)
        .bind(msg.status_code)
        .bind(&msg.error)
        .bind(&msg.request_id)
        .bind(&msg.rpc_id)
        .bind(&msg.content_type)
        .bind(msg.size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All messages of a trace, oldest first. The rowid tiebreak keeps
    /// same-millisecond request/response pairs in insertion order.
    pub async fn get_messages(&self, trace_id: &str) -> Result<Vec<Message>> {
        Ok(
            sqlx::query_as("SELECT * FROM messages WHERE trace_id = ? ORDER BY timestamp ASC, rowid ASC")
                .bind(trace_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    // ─── Agents ──────────────────────────────────────────────────────────────

    /// Upsert on URL: card fields replace, id and first_seen stay.
    pub async fn save_agent(&self, agent: &mut Agent) -> Result<()> {
        if agent.id.is_empty() {
            agent.id = Uuid::new_v4().to_string();
        }
        sqlx::query(
            "INSERT INTO agents (id, url, name, description, version, skills, first_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(url) DO UPDATE SET
               name = excluded.name,
               description = excluded.description,
               version = excluded.version,
               skills = excluded.skills",
        )
        .bind(&agent.id)
        .bind(&agent.url)
        .bind(&agent.name)
        .bind(&agent.description)
        .bind(&agent.version)
        .bind(&agent.skills)
        .bind(agent.first_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agents(&self) -> Result<Vec<Agent>> {
        Ok(
            sqlx::query_as("SELECT * FROM agents ORDER BY first_seen DESC, rowid DESC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    // ─── Insights ────────────────────────────────────────────────────────────

    pub async fn save_insight(&self, insight: &mut Insight) -> Result<()> {
        if insight.id.is_empty() {
            insight.id = Uuid::new_v4().to_string();
        }
        sqlx::query(
            "INSERT INTO insights (id, trace_id, message_id, severity, category, title, details, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&insight.id)
        .bind(&insight.trace_id)
        .bind(&insight.message_id)
        .bind(&insight.severity)
        .bind(&insight.category)
        .bind(&insight.title)
        .bind(&insight.details)
        .bind(insight.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_insights(&self, trace_id: &str) -> Result<Vec<Insight>> {
        Ok(
            sqlx::query_as("SELECT * FROM insights WHERE trace_id = ? ORDER BY timestamp DESC, rowid DESC")
                .bind(trace_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    // ─── Export ──────────────────────────────────────────────────────────────

    /// Self-contained, pretty-printed trace document. A pure function of the
    /// store contents for this trace.
    pub async fn export_trace(&self, trace_id: &str) -> Result<Vec<u8>> {
        let trace = self.get_trace(trace_id).await?;
        let messages = self.get_messages(trace_id).await?;
        let insights = self.get_insights(trace_id).await?;

        let doc = serde_json::json!({
            "trace": trace,
            "messages": messages,
            "insights": insights,
        });
        Ok(serde_json::to_vec_pretty(&doc)?)
    }
}
