//! End-to-end proxy tests: a real upstream, a real proxy listener, and a
//! client configured to route through it.

use axum::extract::Request;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use a2a_trace::analyzer;
use a2a_trace::config::TraceConfig;
use a2a_trace::hub::EventBroadcaster;
use a2a_trace::proxy;
use a2a_trace::store::Store;
use a2a_trace::AppContext;

/// Boot the full capture pipeline on a free port. The returned sender keeps
/// the proxy's shutdown channel alive for the duration of the test.
async fn start_trace_app() -> (u16, Arc<AppContext>, watch::Sender<bool>) {
    let store = Store::new(None).await.unwrap();
    let trace = store.create_trace("test -- child").await.unwrap();
    let hub = EventBroadcaster::new();
    let analyzer = analyzer::spawn(
        store.clone(),
        hub.clone(),
        trace.id.clone(),
        analyzer::DEFAULT_SLOW_THRESHOLD_MS,
    );

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = Arc::new(AppContext {
        config: TraceConfig::new(port, None, None, false, false, vec!["true".to_string()]),
        store,
        hub,
        analyzer,
        http: proxy::build_client().unwrap(),
        trace_id: trace.id,
        started_at: Instant::now(),
        shutdown: shutdown_rx.clone(),
    });

    let router = proxy::build_router(ctx.clone(), true);
    tokio::spawn(proxy::serve(listener, router, shutdown_rx));

    (port, ctx, shutdown_tx)
}

async fn start_upstream(app: Router) -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn proxied_client(proxy_port: u16) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://127.0.0.1:{proxy_port}")).unwrap())
        .build()
        .unwrap()
}

#[tokio::test]
async fn pairs_request_and_response_with_correlation() {
    let upstream = start_upstream(Router::new().route(
        "/",
        post(|| async {
            (
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#,
            )
        }),
    ))
    .await;
    let (proxy_port, ctx, _shutdown) = start_trace_app().await;

    let resp = proxied_client(proxy_port)
        .post(format!("http://127.0.0.1:{upstream}/"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(r#"{"jsonrpc":"2.0","method":"tasks/create","id":7,"params":{}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.text().await.unwrap(),
        r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#
    );

    let messages = ctx.store.get_messages(&ctx.trace_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    let (req, rsp) = (&messages[0], &messages[1]);

    assert!(req.is_request());
    assert_eq!(req.method, "tasks/create");
    assert_eq!(req.rpc_id, "7");
    // A request correlates to itself.
    assert_eq!(req.request_id, req.id);

    assert!(rsp.is_response());
    assert_eq!(rsp.method, "tasks/create");
    assert_eq!(rsp.status_code, 200);
    assert_eq!(rsp.error, "");
    assert_eq!(rsp.request_id, req.id);
    assert!(rsp.timestamp >= req.timestamp);
    assert!(rsp.duration_ms >= 0);

    let summary = ctx.analyzer.summary().await;
    assert_eq!(summary.total_messages, 2);
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.error_count, 0);
}

#[tokio::test]
async fn upstream_refusal_synthesizes_response_and_502() {
    // Grab a port that is certainly closed.
    let closed_port = {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (proxy_port, ctx, _shutdown) = start_trace_app().await;

    let resp = proxied_client(proxy_port)
        .post(format!("http://127.0.0.1:{closed_port}/"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(r#"{"jsonrpc":"2.0","method":"tasks/create","id":1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);

    let messages = ctx.store.get_messages(&ctx.trace_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    let (req, rsp) = (&messages[0], &messages[1]);
    assert!(rsp.is_response());
    assert_eq!(rsp.status_code, 0);
    assert!(!rsp.error.is_empty());
    assert_eq!(rsp.request_id, req.id);

    // Drain the analyzer queue (the summary reply is ordered after the feed),
    // then check the derived insight.
    let summary = ctx.analyzer.summary().await;
    assert_eq!(summary.error_count, 1);
    let insights = ctx.store.get_insights(&ctx.trace_id).await.unwrap();
    let error = insights.iter().find(|i| i.category == "error").unwrap();
    assert_eq!(error.severity, "error");
}

#[tokio::test]
async fn discovers_agent_from_well_known_card() {
    let upstream = start_upstream(Router::new().route(
        "/.well-known/agent.json",
        get(|| async {
            (
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"name":"Bob","url":"http://agent.local","version":"1.0",
                    "skills":[{"id":"s1","name":"greet"}]}"#,
            )
        }),
    ))
    .await;
    let (proxy_port, ctx, _shutdown) = start_trace_app().await;

    let resp = proxied_client(proxy_port)
        .get(format!("http://127.0.0.1:{upstream}/.well-known/agent.json"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let agents = ctx.store.get_agents().await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, "Bob");
    assert_eq!(agents[0].url, "http://agent.local");
    assert!(agents[0].skills.contains("greet"));

    // The control surface shares the proxy listener and sees the agent too.
    let listed: serde_json::Value = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{proxy_port}/api/agents"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed[0]["name"], "Bob");
}

#[tokio::test]
async fn relays_body_bytes_and_headers_unchanged() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let body = payload.clone();
    let upstream = start_upstream(Router::new().route(
        "/blob",
        get(move || async move {
            (
                [
                    ("content-type", "application/octet-stream"),
                    ("x-upstream", "yes"),
                ],
                body,
            )
                .into_response()
        }),
    ))
    .await;
    let (proxy_port, ctx, _shutdown) = start_trace_app().await;

    let resp = proxied_client(proxy_port)
        .get(format!("http://127.0.0.1:{upstream}/blob"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("x-upstream").unwrap(), "yes");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), payload.as_slice());

    // Captured, even though the body is not A2A.
    let messages = ctx.store.get_messages(&ctx.trace_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].size, 4096);
}

#[tokio::test]
async fn strips_hop_by_hop_headers_before_forwarding() {
    let upstream = start_upstream(Router::new().route(
        "/",
        any(|req: Request| async move {
            let headers = req.headers();
            let seen = serde_json::json!({
                "proxy_connection": headers.contains_key("proxy-connection"),
                "proxy_authorization": headers.contains_key("proxy-authorization"),
                "x_custom": headers.contains_key("x-custom"),
            });
            ([(header::CONTENT_TYPE, "application/json")], seen.to_string())
        }),
    ))
    .await;
    let (proxy_port, _ctx, _shutdown) = start_trace_app().await;

    let seen: serde_json::Value = proxied_client(proxy_port)
        .get(format!("http://127.0.0.1:{upstream}/"))
        .header("proxy-connection", "keep-alive")
        .header("proxy-authorization", "Basic Zm9v")
        .header("x-custom", "kept")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(seen["proxy_connection"], false);
    assert_eq!(seen["proxy_authorization"], false);
    assert_eq!(seen["x_custom"], true);
}

#[tokio::test]
async fn slow_upstream_produces_slow_response_insight() {
    let upstream = start_upstream(Router::new().route(
        "/",
        post(|| async {
            tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
            (
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
            )
        }),
    ))
    .await;
    let (proxy_port, ctx, _shutdown) = start_trace_app().await;

    proxied_client(proxy_port)
        .post(format!("http://127.0.0.1:{upstream}/"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(r#"{"jsonrpc":"2.0","method":"tasks/get","id":1}"#)
        .send()
        .await
        .unwrap();

    let _ = ctx.analyzer.summary().await;
    let insights = ctx.store.get_insights(&ctx.trace_id).await.unwrap();
    let slow: Vec<_> = insights
        .iter()
        .filter(|i| i.category == "slow_response")
        .collect();
    assert_eq!(slow.len(), 1);
    assert_eq!(slow[0].severity, "warning");
    // Tied to the response message.
    let messages = ctx.store.get_messages(&ctx.trace_id).await.unwrap();
    assert_eq!(slow[0].message_id, messages[1].id);
}

#[tokio::test]
async fn fifth_identical_call_flags_a_retry_loop() {
    let upstream = start_upstream(Router::new().route(
        "/",
        post(|| async {
            (
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
            )
        }),
    ))
    .await;
    let (proxy_port, ctx, _shutdown) = start_trace_app().await;
    let client = proxied_client(proxy_port);

    for i in 0..5 {
        client
            .post(format!("http://127.0.0.1:{upstream}/"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(format!(
                r#"{{"jsonrpc":"2.0","method":"tasks/create","id":{i}}}"#
            ))
            .send()
            .await
            .unwrap();
    }

    let summary = ctx.analyzer.summary().await;
    assert_eq!(summary.method_counts.get("tasks/create"), Some(&5));

    let insights = ctx.store.get_insights(&ctx.trace_id).await.unwrap();
    let retries: Vec<_> = insights
        .iter()
        .filter(|i| i.category == "retry_loop")
        .collect();
    assert_eq!(retries.len(), 1);
    let details: serde_json::Value = serde_json::from_str(&retries[0].details).unwrap();
    assert_eq!(details["method"], "tasks/create");
    assert_eq!(details["call_count"], 5);
}

#[tokio::test]
async fn connect_tunnel_is_opaque() {
    // A raw TCP echo server stands in for a TLS upstream.
    let echo_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let echo_port = echo_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match echo_listener.accept().await {
                Ok(c) => c,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let (proxy_port, ctx, _shutdown) = start_trace_app().await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream
        .write_all(
            format!("CONNECT 127.0.0.1:{echo_port} HTTP/1.1\r\nHost: 127.0.0.1:{echo_port}\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut buf).await.unwrap();
        response.push(buf[0]);
    }
    let head = String::from_utf8_lossy(&response);
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected: {head}");

    // Arbitrary binary bytes flow both ways.
    let probe = [0x16u8, 0x03, 0x01, 0x00, 0xff, 0x00];
    stream.write_all(&probe).await.unwrap();
    let mut echoed = [0u8; 6];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, probe);

    // Nothing inside the tunnel is captured.
    let messages = ctx.store.get_messages(&ctx.trace_id).await.unwrap();
    assert!(messages.is_empty());
}
