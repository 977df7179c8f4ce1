//! Control surface for UI observers: historical state over REST, live
//! events over `/ws`. CORS is wide open — the tool is local by design.

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::hub;
use crate::AppContext;

pub fn routes() -> Router<Arc<AppContext>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/trace", get(get_trace))
        .route("/api/messages", get(get_messages))
        .route("/api/agents", get(get_agents))
        .route("/api/insights", get(get_insights))
        .route("/api/summary", get(get_summary))
        .route("/api/export", get(export))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
}

pub async fn health() -> &'static str {
    "OK"
}

async fn get_trace(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.store.get_trace(&ctx.trace_id).await {
        Ok(Some(trace)) => Json(trace).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "trace not found").into_response(),
        Err(e) => internal(e),
    }
}

async fn get_messages(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.store.get_messages(&ctx.trace_id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => internal(e),
    }
}

async fn get_agents(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.store.get_agents().await {
        Ok(agents) => Json(agents).into_response(),
        Err(e) => internal(e),
    }
}

async fn get_insights(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.store.get_insights(&ctx.trace_id).await {
        Ok(insights) => Json(insights).into_response(),
        Err(e) => internal(e),
    }
}

async fn get_summary(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(ctx.analyzer.summary().await).into_response()
}

async fn export(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.store.export_trace(&ctx.trace_id).await {
        Ok(doc) => (
            [
                (header::CONTENT_TYPE, "application/json".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=trace-{}.json", ctx.trace_id),
                ),
            ],
            doc,
        )
            .into_response(),
        Err(e) => internal(e),
    }
}

async fn ws_upgrade(State(ctx): State<Arc<AppContext>>, ws: WebSocketUpgrade) -> Response {
    let events = ctx.hub.subscribe();
    let shutdown = ctx.shutdown.clone();
    ws.on_upgrade(move |socket| hub::run_session(socket, events, shutdown))
}

fn internal(err: anyhow::Error) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}
