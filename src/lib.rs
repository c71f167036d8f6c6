pub mod host;
pub mod mcp_client;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use mcp_client::McpGateway;
use tokio::io::BufReader;

/// Return the platform-standard data directory for the gateway.
///
/// - macOS: `~/Library/Application Support/tool-gateway/`
/// - Windows: `{FOLDERID_RoamingAppData}\tool-gateway\`
/// - Linux: `$XDG_DATA_HOME/tool-gateway/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.tool-gateway/` only if none of the above can be resolved.
pub(crate) fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("tool-gateway");
    }
    home_fallback()
}

/// Return the platform-standard config directory for the gateway.
pub(crate) fn config_dir() -> PathBuf {
    if let Some(dir) = dirs::config_dir() {
        return dir.join("tool-gateway");
    }
    home_fallback()
}

fn home_fallback() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tool-gateway")
}

/// Initialize the tracing subscriber.
///
/// Stdout carries the host protocol, so logs go to `gateway.log` in the data
/// directory (rotated on every start, last 3 kept), or to stderr when the
/// file cannot be opened. `TOOL_GATEWAY_LOG_FORMAT=json` switches to JSON
/// lines.
fn init_tracing() -> Option<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("gateway.log");

    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path);

    let (writer, log_path) = match log_file {
        Ok(file) => (BoxMakeWriter::new(SyncedLogFile::new(file)), Some(log_path)),
        Err(e) => {
            eprintln!("tool-gateway: cannot open {}: {e}; logging to stderr", log_path.display());
            (BoxMakeWriter::new(std::io::stderr), None)
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tool_gateway=info,warn"));

    let json = std::env::var("TOOL_GATEWAY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        return None;
    }

    // Startup banner, so the right log file is easy to find
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== tool-gateway starting ==="
    );

    log_path
}

/// Shift `gateway.log` to `gateway.log.1`, `.1` to `.2`, and so on, keeping
/// at most `keep` old files. Gaps in the sequence are fine.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |n: u32| {
        let mut name = base_path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    };

    let _ = std::fs::remove_file(numbered(keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered(n), numbered(n + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// Log file shared by every tracing writer. Each write is flushed at once so
/// a killed gateway still leaves its last lines on disk.
#[derive(Clone)]
struct SyncedLogFile(Arc<Mutex<File>>);

impl SyncedLogFile {
    fn new(file: File) -> Self {
        Self(Arc::new(Mutex::new(file)))
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut file = self
            .0
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        op(&mut *file)
    }
}

impl io::Write for SyncedLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| {
            let written = file.write(buf)?;
            file.flush()?;
            Ok(written)
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SyncedLogFile {
    type Writer = SyncedLogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run the gateway host.
///
/// Loads the provider config (`config_path`, else `MCP_CONFIG_PATH`, else
/// the config directory), starts the providers, then serves line-delimited
/// JSON requests on stdin until EOF or Ctrl-C. Providers are always cleaned
/// up before returning.
pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    // Initialize tracing FIRST, before any tracing::info!() calls
    init_tracing();

    let gateway = match config_path {
        Some(path) => McpGateway::from_config_path(&path),
        None => McpGateway::from_env(),
    };

    let report = gateway.initialize().await;
    tracing::info!(
        ready = ?report.ready,
        failed = report.failures.len(),
        tools = report.tool_count,
        "gateway started"
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let served = tokio::select! {
        result = host::serve(&gateway, stdin, stdout) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            Ok(())
        }
    };

    let shutdown = gateway.cleanup().await;
    for step in shutdown.problems() {
        tracing::warn!(
            target_name = %step.target,
            action = %step.action,
            outcome = ?step.outcome,
            "provider did not shut down cleanly"
        );
    }

    served
}
