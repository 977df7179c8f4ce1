//! Launches and owns the traced child process.
//!
//! The child runs with proxy environment injected so all of its outbound
//! HTTP flows through the tool; its stdout/stderr are forwarded to ours
//! line-by-line, and its exit code becomes the tool's.

use anyhow::{bail, Context, Result};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Environment keys the child must not inherit — every one of them is
/// replaced or cleared by the injected set.
const PROXY_ENV_KEYS: [&str; 9] = [
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "NO_PROXY",
    "no_proxy",
    "A2A_PROXY",
    "A2A_TRACE",
    "A2A_TRACE_UI",
];

pub struct Supervisor {
    command: Vec<String>,
    proxy_port: u16,
    ui_port: u16,
    /// Held by `wait()` once; `stop()` signals via pid instead.
    child: Mutex<Option<Child>>,
    pid: AtomicI32,
    started: AtomicBool,
    term_sent: AtomicBool,
}

impl Supervisor {
    pub fn new(command: Vec<String>, proxy_port: u16, ui_port: u16) -> Result<Self> {
        if command.is_empty() {
            bail!("no command specified");
        }
        Ok(Self {
            command,
            proxy_port,
            ui_port,
            child: Mutex::new(None),
            pid: AtomicI32::new(-1),
            started: AtomicBool::new(false),
            term_sent: AtomicBool::new(false),
        })
    }

    /// Spawn the child with the injected proxy environment. Fails if the
    /// supervisor was already started.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("process already started");
        }

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .env_clear()
            .envs(build_env(self.proxy_port, self.ui_port))
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start command: {}", self.command[0]))?;

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        self.pid.store(pid, Ordering::SeqCst);
        debug!(pid, command = %self.command.join(" "), "child started");

        let stdout = child.stdout.take().context("no stdout pipe")?;
        let stderr = child.stderr.take().context("no stderr pipe")?;
        tokio::spawn(forward_lines(stdout, false));
        tokio::spawn(forward_lines(stderr, true));

        *self.child.lock().await = Some(child);
        Ok(())
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// Wait for the child to exit and return its exit code. A signal death
    /// maps to `128 + signo`. Callable once.
    pub async fn wait(&self) -> Result<i32> {
        let mut child = match self.child.lock().await.take() {
            Some(c) => c,
            None => bail!("process not started"),
        };

        let status = child.wait().await.context("failed waiting for child")?;
        if let Some(code) = status.code() {
            return Ok(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Ok(128 + sig);
            }
        }
        Ok(-1)
    }

    /// Ask the child to terminate. The first call sends SIGTERM; a repeated
    /// call escalates to SIGKILL.
    pub fn stop(&self) {
        let pid = self.pid();
        if pid <= 0 {
            return;
        }
        let signal = if self.term_sent.swap(true, Ordering::SeqCst) {
            libc::SIGKILL
        } else {
            libc::SIGTERM
        };
        info!(pid, signal, "stopping child");
        unsafe {
            // The child may already be gone; ESRCH is fine.
            libc::kill(pid, signal);
        }
    }
}

/// The child environment: the parent's, minus every proxy-related key, plus
/// the injected proxy contract. `NO_PROXY` is cleared so localhost agents
/// are intercepted too.
fn build_env(proxy_port: u16, ui_port: u16) -> Vec<(String, String)> {
    let proxy_url = format!("http://127.0.0.1:{proxy_port}");
    let ui_url = format!("http://127.0.0.1:{ui_port}/ui");

    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(key, _)| !PROXY_ENV_KEYS.contains(&key.as_str()))
        .collect();

    for key in ["HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy"] {
        env.push((key.to_string(), proxy_url.clone()));
    }
    for key in ["NO_PROXY", "no_proxy"] {
        env.push((key.to_string(), String::new()));
    }
    env.push(("A2A_PROXY".to_string(), proxy_url));
    env.push(("A2A_TRACE".to_string(), "1".to_string()));
    env.push(("A2A_TRACE_UI".to_string(), ui_url));
    env
}

async fn forward_lines(pipe: impl AsyncRead + Unpin, is_stderr: bool) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if is_stderr {
                    eprintln!("{line}");
                } else {
                    println!("{line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(err = %e, "child output read error");
                break;
            }
        }
    }
}
