//! The HTTP forward proxy.
//!
//! Listens on one TCP port. CONNECT requests become opaque byte tunnels
//! (no capture — TLS stays TLS). Everything else is buffered, captured as a
//! request message, relayed upstream, captured again as the paired response
//! message, and returned to the caller byte-identical.

pub mod classifier;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api;
use crate::store::models::{Agent, Message, DIRECTION_REQUEST, DIRECTION_RESPONSE};
use crate::AppContext;
use classifier::AGENT_CARD_PATH;

/// Overall deadline for one upstream request.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// How long a CONNECT dial may take before the tunnel is refused.
const TUNNEL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// The shared upstream client. Honors the parent's own proxy environment,
/// which the injected child environment never points back at us.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

/// The proxy-port router: capture fallback plus `/health`, and the full
/// control surface when it shares this listener.
pub fn build_router(ctx: Arc<AppContext>, include_api: bool) -> Router {
    let routes = if include_api {
        api::routes()
    } else {
        Router::new().route("/health", get(api::health))
    };
    routes.fallback(forward).with_state(ctx)
}

/// Accept loop. Each connection is served by hyper http1 with upgrades
/// enabled so CONNECT can hijack the stream; axum cannot route CONNECT, so
/// it is dispatched before the router.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "proxy listening");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                let router = router.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: hyper::Request<Incoming>| {
                        let router = router.clone();
                        async move {
                            if req.method() == Method::CONNECT {
                                Ok::<_, std::convert::Infallible>(tunnel(req).await)
                            } else {
                                router.oneshot(req.map(Body::new)).await
                            }
                        }
                    });
                    let io = TokioIo::new(stream);
                    if let Err(e) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!(peer = %peer, err = %e, "connection closed with error");
                    }
                });
            }
        }
    }

    info!("proxy stopped");
    Ok(())
}

/// CONNECT: dial the target, answer 200, then copy bytes both ways until
/// either side closes. Nothing inside the tunnel is captured.
async fn tunnel(req: hyper::Request<Incoming>) -> Response {
    let authority = match req.uri().authority() {
        Some(a) => a.to_string(),
        None => return (StatusCode::BAD_REQUEST, "CONNECT target missing").into_response(),
    };

    let dial = tokio::time::timeout(TUNNEL_DIAL_TIMEOUT, TcpStream::connect(&authority)).await;
    let mut upstream = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(target = %authority, err = %e, "tunnel dial failed");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
        Err(_) => {
            warn!(target = %authority, "tunnel dial timed out");
            return (StatusCode::SERVICE_UNAVAILABLE, "tunnel dial timed out").into_response();
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    debug!(target = %authority, err = %e, "tunnel closed");
                }
            }
            Err(e) => debug!(target = %authority, err = %e, "tunnel upgrade failed"),
        }
    });

    Response::new(Body::empty())
}

/// Capture-and-relay for every non-CONNECT request that misses the control
/// routes.
async fn forward(State(ctx): State<Arc<AppContext>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let target_url = match resolve_target(&parts) {
        Some(url) => url,
        None => {
            return (StatusCode::BAD_REQUEST, "cannot resolve target URL").into_response();
        }
    };
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to read request body: {e}"),
            )
                .into_response();
        }
    };

    let path = parts.uri.path().to_string();
    let content_type = header_value(&parts.headers, header::CONTENT_TYPE);
    let verdict = classifier::classify_request(&parts.method, &path, &content_type, &body_bytes);
    debug!(method = %parts.method, url = %target_url, a2a = verdict.is_a2a, "proxying");

    // The request message's own id doubles as the correlation key.
    let msg_id = Uuid::new_v4().to_string();
    let mut req_msg = Message {
        id: msg_id.clone(),
        trace_id: ctx.trace_id.clone(),
        timestamp: Utc::now(),
        direction: DIRECTION_REQUEST.to_string(),
        from_agent: String::new(),
        to_agent: extract_host(&target_url),
        method: verdict.method.clone(),
        url: target_url.clone(),
        headers: snapshot_headers(&parts.headers),
        body: String::from_utf8_lossy(&body_bytes).into_owned(),
        duration_ms: 0,
        status_code: 0,
        error: String::new(),
        request_id: msg_id,
        rpc_id: verdict.rpc_id,
        content_type,
        size: body_bytes.len() as i64,
    };
    if let Err(e) = ctx.store.save_message(&mut req_msg).await {
        warn!(err = %e, "failed to save request message");
    }
    ctx.publish_message(&req_msg);

    let start = Instant::now();
    let sent = ctx
        .http
        .request(parts.method.clone(), target_url.as_str())
        .headers(outbound_headers(&parts.headers))
        .body(body_bytes.clone())
        .send()
        .await;

    let upstream = match sent {
        Ok(resp) => resp,
        Err(e) => return upstream_failure(&ctx, &req_msg, start, e.to_string()).await,
    };
    let status = upstream.status();
    let resp_headers = upstream.headers().clone();
    let resp_body = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => return upstream_failure(&ctx, &req_msg, start, e.to_string()).await,
    };
    let duration_ms = start.elapsed().as_millis() as i64;

    let resp_verdict = classifier::classify_response(&resp_body);
    // A JSON-RPC error wins over the HTTP status text.
    let error = match &resp_verdict.error {
        Some(rpc_err) => rpc_err.message.clone(),
        None if status.as_u16() >= 400 => status
            .canonical_reason()
            .unwrap_or("HTTP error")
            .to_string(),
        None => String::new(),
    };

    let mut resp_msg = Message {
        id: String::new(),
        trace_id: ctx.trace_id.clone(),
        timestamp: Utc::now(),
        direction: DIRECTION_RESPONSE.to_string(),
        from_agent: req_msg.to_agent.clone(),
        to_agent: String::new(),
        method: req_msg.method.clone(),
        url: target_url.clone(),
        headers: snapshot_headers(&resp_headers),
        body: String::from_utf8_lossy(&resp_body).into_owned(),
        duration_ms,
        status_code: status.as_u16() as i64,
        error,
        request_id: req_msg.id.clone(),
        rpc_id: resp_verdict.rpc_id,
        content_type: header_value(&resp_headers, header::CONTENT_TYPE),
        size: resp_body.len() as i64,
    };
    if let Err(e) = ctx.store.save_message(&mut resp_msg).await {
        warn!(err = %e, "failed to save response message");
    }
    ctx.publish_message(&resp_msg);

    if path.ends_with(AGENT_CARD_PATH) && status.is_success() {
        if let Some(card) = classifier::parse_agent_card(&resp_body) {
            let url = if card.url.is_empty() {
                target_url.trim_end_matches(AGENT_CARD_PATH).to_string()
            } else {
                card.url.clone()
            };
            let mut agent = Agent {
                id: String::new(),
                url,
                name: card.name,
                description: card.description,
                version: card.version,
                skills: serde_json::to_string(&card.skills).unwrap_or_else(|_| "[]".to_string()),
                first_seen: Utc::now(),
            };
            match ctx.store.save_agent(&mut agent).await {
                Ok(()) => ctx.publish_agent(&agent),
                Err(e) => warn!(err = %e, "failed to save agent"),
            }
        }
    }

    relay(status, &resp_headers, resp_body)
}

/// Transport failure: synthesize the paired response message and answer 502.
async fn upstream_failure(
    ctx: &AppContext,
    req_msg: &Message,
    start: Instant,
    error: String,
) -> Response {
    let mut msg = Message {
        id: String::new(),
        trace_id: ctx.trace_id.clone(),
        timestamp: Utc::now(),
        direction: DIRECTION_RESPONSE.to_string(),
        from_agent: req_msg.to_agent.clone(),
        to_agent: String::new(),
        method: req_msg.method.clone(),
        url: req_msg.url.clone(),
        headers: "{}".to_string(),
        body: String::new(),
        duration_ms: start.elapsed().as_millis() as i64,
        status_code: 0,
        error: error.clone(),
        request_id: req_msg.id.clone(),
        rpc_id: String::new(),
        content_type: String::new(),
        size: 0,
    };
    if let Err(e) = ctx.store.save_message(&mut msg).await {
        warn!(err = %e, "failed to save synthetic response");
    }
    ctx.publish_message(&msg);

    (StatusCode::BAD_GATEWAY, format!("proxy error: {error}")).into_response()
}

/// Hand the buffered upstream response back to the caller. Framing headers
/// are recomputed by hyper for the already-decoded body; everything else
/// passes through untouched.
fn relay(status: StatusCode, headers: &HeaderMap, body: axum::body::Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    if let Some(out) = builder.headers_mut() {
        for (name, value) in headers {
            if name == header::TRANSFER_ENCODING || name == header::CONTENT_LENGTH {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
    }
    builder.body(Body::from(body)).unwrap_or_else(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to build response: {e}"),
        )
            .into_response()
    })
}

/// Absolute target URL: the request line in forward-proxy mode, otherwise
/// the Host header in transparent mode.
fn resolve_target(parts: &axum::http::request::Parts) -> Option<String> {
    if parts.uri.scheme().is_some() {
        return Some(parts.uri.to_string());
    }
    let host = parts.headers.get(header::HOST)?.to_str().ok()?;
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Some(format!("http://{host}{path_and_query}"))
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(&name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

/// Snapshot headers as a JSON object, first value per name.
fn snapshot_headers(headers: &HeaderMap) -> String {
    let mut map = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    serde_json::to_string(&map).unwrap_or_default()
}

/// Headers for the upstream request: hop-by-hop proxy headers stripped,
/// host and framing left for reqwest to recompute.
fn outbound_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in [
        "proxy-connection",
        "proxy-authenticate",
        "proxy-authorization",
        "host",
        "content-length",
        "transfer-encoding",
    ] {
        out.remove(name);
    }
    out
}

/// The host[:port] part of a URL, used as the agent label.
fn extract_host(url: &str) -> String {
    let rest = url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    match rest.find('/') {
        Some(idx) => rest[..idx].to_string(),
        None => rest.to_string(),
    }
}
