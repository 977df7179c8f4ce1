use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use a2a_trace::analyzer::{self, Summary};
use a2a_trace::config::TraceConfig;
use a2a_trace::hub::EventBroadcaster;
use a2a_trace::process::Supervisor;
use a2a_trace::store::models::{TRACE_COMPLETED, TRACE_ERROR};
use a2a_trace::store::Store;
use a2a_trace::{api, proxy, AppContext};

/// How long servers and the child get to wind down after a signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "trace",
    about = "Transparent debugging proxy for A2A multi-agent systems",
    long_about = "Runs a command with HTTP proxy environment injected so all of its\n\
                  agent-to-agent traffic is captured, correlated, analyzed, and\n\
                  streamed live to observers.\n\n\
                  Usage: trace [flags] -- <command> [args...]",
    version
)]
struct Args {
    /// Proxy listen port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Control-surface port (default: same as the proxy port)
    #[arg(long)]
    ui_port: Option<u16>,

    /// SQLite database path (default: in-memory)
    #[arg(long)]
    db: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Disable the UI control surface
    #[arg(long)]
    no_ui: bool,

    /// Command to trace, after `--`
    #[arg(last = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    // Usage errors exit 1 like every other startup failure; --help and
    // --version exit 0.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let filter = if args.verbose {
        "a2a_trace=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    let config = TraceConfig::new(
        args.port,
        args.ui_port,
        args.db,
        args.verbose,
        args.no_ui,
        args.command,
    );

    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("trace: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(config: TraceConfig) -> Result<i32> {
    let store = Store::new(config.db_path.as_deref())
        .await
        .context("failed to initialize store")?;
    let trace = store
        .create_trace(&config.command_string())
        .await
        .context("failed to create trace")?;

    let hub = EventBroadcaster::new();
    let analyzer = analyzer::spawn(
        store.clone(),
        hub.clone(),
        trace.id.clone(),
        analyzer::DEFAULT_SLOW_THRESHOLD_MS,
    );
    let http = proxy::build_client()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        store: store.clone(),
        hub: hub.clone(),
        analyzer,
        http,
        trace_id: trace.id.clone(),
        started_at: Instant::now(),
        shutdown: shutdown_rx.clone(),
    });

    // Bind before spawning the child so its first request finds us listening.
    let proxy_listener = TcpListener::bind(("127.0.0.1", config.port))
        .await
        .with_context(|| format!("failed to bind proxy port {}", config.port))?;
    let router = proxy::build_router(ctx.clone(), config.shared_listener() && !config.no_ui);
    let proxy_task = tokio::spawn(proxy::serve(proxy_listener, router, shutdown_rx.clone()));

    let ui_task = if !config.shared_listener() && !config.no_ui {
        let listener = TcpListener::bind(("127.0.0.1", config.ui_port))
            .await
            .with_context(|| format!("failed to bind ui port {}", config.ui_port))?;
        info!(addr = %listener.local_addr()?, "control surface listening");
        let app = api::routes().with_state(ctx.clone());
        let mut shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
        }))
    } else {
        None
    };

    let supervisor = Arc::new(Supervisor::new(
        config.command.clone(),
        config.port,
        config.ui_port,
    )?);
    supervisor.start().await?;
    print_banner(&config, supervisor.pid());

    let mut wait_task = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.wait().await }
    });

    let (exit_code, trace_status) = tokio::select! {
        res = &mut wait_task => child_result(res),

        sig = wait_for_signal() => {
            info!(signal = sig, "signal received, stopping child");
            supervisor.stop();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut wait_task).await {
                Ok(res) => {
                    let _ = child_result(res);
                }
                Err(_) => {
                    warn!("child did not exit in time, killing");
                    supervisor.stop();
                    let _ = (&mut wait_task).await;
                }
            }
            (128 + sig, TRACE_COMPLETED)
        }
    };

    if let Err(e) = store.update_trace_status(&trace.id, trace_status).await {
        warn!(err = %e, "failed to update trace status");
    }
    if let Ok(Some(finished)) = store.get_trace(&trace.id).await {
        hub.broadcast_trace_status(&finished);
    }

    print_summary(&ctx.analyzer.summary().await);

    // Wind the servers down; observers get a clean close.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, proxy_task).await;
    if let Some(task) = ui_task {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, task).await;
    }

    Ok(exit_code)
}

fn child_result(
    res: std::result::Result<Result<i32>, tokio::task::JoinError>,
) -> (i32, &'static str) {
    match res {
        Ok(Ok(code)) => (code, TRACE_COMPLETED),
        Ok(Err(e)) => {
            error!(err = %e, "child process error");
            (1, TRACE_ERROR)
        }
        Err(e) => {
            error!(err = %e, "child wait task failed");
            (1, TRACE_ERROR)
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => libc::SIGINT,
        _ = sigterm.recv() => libc::SIGTERM,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
    tokio::signal::ctrl_c().await.ok();
    2
}

fn print_banner(config: &TraceConfig, pid: i32) {
    println!();
    println!("a2a-trace {}", env!("CARGO_PKG_VERSION"));
    println!("  proxy:   http://127.0.0.1:{}", config.port);
    if !config.no_ui {
        println!("  api:     http://127.0.0.1:{}", config.ui_port);
    }
    println!("  command: {} (pid {})", config.command_string(), pid);
    println!();
}

fn print_summary(summary: &Summary) {
    println!();
    println!("---------------- trace summary ----------------");
    println!("  messages:    {}", summary.total_messages);
    println!("  insights:    {}", summary.total_insights);
    println!("  errors:      {}", summary.error_count);
    println!("  avg latency: {} ms", summary.avg_duration_ms);
    println!("-----------------------------------------------");
    println!();
}
