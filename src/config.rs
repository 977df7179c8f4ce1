#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Proxy listen port — the child's HTTP_PROXY points here.
    pub port: u16,
    /// Control-surface port; defaults to the proxy port (shared listener).
    pub ui_port: u16,
    /// SQLite database path. `None` keeps the trace in memory.
    pub db_path: Option<String>,
    pub verbose: bool,
    /// Disable the REST + WebSocket control surface.
    pub no_ui: bool,
    /// The traced command argv (never empty).
    pub command: Vec<String>,
}

impl TraceConfig {
    pub fn new(
        port: u16,
        ui_port: Option<u16>,
        db_path: Option<String>,
        verbose: bool,
        no_ui: bool,
        command: Vec<String>,
    ) -> Self {
        Self {
            port,
            ui_port: ui_port.unwrap_or(port),
            db_path,
            verbose,
            no_ui,
            command,
        }
    }

    /// True when the control surface shares the proxy listener.
    pub fn shared_listener(&self) -> bool {
        self.ui_port == self.port
    }

    pub fn command_string(&self) -> String {
        self.command.join(" ")
    }
}
