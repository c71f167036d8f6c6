//! Provider process lifecycle management.
//!
//! Handles spawning and terminating provider child processes. Each provider
//! runs as a separate OS process (in its own process group on unix)
//! communicating via JSON-RPC over stdio.

use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::config::ProviderConfig;
use super::errors::McpError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Explicit directory to prefix onto `PATH` for runtime-dependent providers.
pub const RUNTIME_PATH_ENV: &str = "TOOL_GATEWAY_RUNTIME_PATH";

/// Launchers that live in a toolchain directory which may be missing from
/// the host's default `PATH` (e.g. when started from a service manager).
const RUNTIME_COMMANDS: &[&str] = &[
    "node", "npx", "npm", "bun", "bunx", "deno", "uv", "uvx", "python", "python3",
];

/// Stderr lines kept per provider for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Max characters of stderr appended to an error message.
const STDERR_SUFFIX_MAX_CHARS: usize = 2000;

// ─── ProviderProcess ─────────────────────────────────────────────────────────

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// A spawned provider process.
pub struct ProviderProcess {
    /// Provider name from the config.
    pub name: String,
    /// OS process id (also the process group id on unix).
    pub pid: Option<u32>,
    child: Child,
    stderr_tail: StderrTail,
}

impl ProviderProcess {
    /// Hand the stdio pipes to a session. Returns `None` if already taken.
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        let stdin = self.child.stdin.take()?;
        let stdout = self.child.stdout.take()?;
        Some((stdin, stdout))
    }

    /// Check whether the process has exited.
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// The most recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    /// Format the stderr tail as an error-message suffix (empty if none).
    pub fn stderr_suffix(&self) -> String {
        let mut tail = self.stderr_tail();
        if tail.trim().is_empty() {
            return String::new();
        }
        if tail.chars().count() > STDERR_SUFFIX_MAX_CHARS {
            tail = tail.chars().take(STDERR_SUFFIX_MAX_CHARS).collect();
            tail.push_str("...(truncated)");
        }
        format!(" | stderr: {}", tail.trim())
    }
}

impl std::fmt::Debug for ProviderProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Result of launching every configured provider.
#[derive(Debug, Default)]
pub struct LaunchOutcome {
    pub processes: BTreeMap<String, ProviderProcess>,
    /// Providers that could not be spawned (the launch error kind).
    pub failures: Vec<(String, McpError)>,
}

/// How a terminated process was accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Exited on its own or after the graceful signal.
    Exited,
    /// Exited only after the forceful kill.
    Killed,
    /// Still not reaped when the kill wait elapsed.
    Unaccounted,
}

// ─── ProcessSupervisor ───────────────────────────────────────────────────────

/// Spawns provider processes with an adjusted environment and tracks the
/// stderr forwarders attached to them.
pub struct ProcessSupervisor {
    runtime_path: Option<PathBuf>,
    stderr_pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Create a supervisor, resolving the runtime search-path prefix once.
    pub fn new() -> Self {
        let runtime_path = resolve_runtime_path();
        if let Some(dir) = &runtime_path {
            tracing::info!(dir = %dir.display(), "runtime search path resolved");
        }
        Self::with_runtime_path(runtime_path)
    }

    /// Create a supervisor with an explicit runtime directory (or none).
    pub fn with_runtime_path(runtime_path: Option<PathBuf>) -> Self {
        Self {
            runtime_path,
            stderr_pumps: Mutex::new(Vec::new()),
        }
    }

    /// The directory prefixed onto `PATH` for runtime commands.
    pub fn runtime_path(&self) -> Option<&Path> {
        self.runtime_path.as_deref()
    }

    /// Spawn every configured provider.
    ///
    /// A provider that fails to spawn is recorded in `failures`; the others
    /// are still launched.
    pub fn launch(&self, configs: &BTreeMap<String, ProviderConfig>) -> LaunchOutcome {
        let mut outcome = LaunchOutcome::default();

        for (name, config) in configs {
            match self.spawn(name, config) {
                Ok(process) => {
                    outcome.processes.insert(name.clone(), process);
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "provider failed to launch");
                    outcome.failures.push((name.clone(), e));
                }
            }
        }

        outcome
    }

    /// Spawn a single provider process with piped stdio.
    pub fn spawn(&self, name: &str, config: &ProviderConfig) -> Result<ProviderProcess, McpError> {
        let program = self.resolve_program(&config.command);

        let mut std_cmd = std::process::Command::new(&program);
        std_cmd
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(search_path) = self.search_path_for(config) {
            std_cmd.env("PATH", search_path);
        }

        if let Some(dir) = &config.cwd {
            std_cmd.current_dir(dir);
        }

        // Own process group, so signals reach the provider's children too.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            std_cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", program.display()),
        })?;

        let pid = child.id();
        let stderr_tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            self.track_pump(forward_stderr(name.to_string(), stderr, stderr_tail.clone()));
        }

        tracing::info!(
            server = name,
            pid,
            command = %program.display(),
            "provider process spawned"
        );

        Ok(ProviderProcess {
            name: name.to_string(),
            pid,
            child,
            stderr_tail,
        })
    }

    /// Abort every stderr forwarder and wait for them to finish.
    pub async fn stop_stderr_forwarding(&self) {
        let pumps = match self.stderr_pumps.lock() {
            Ok(mut pumps) => std::mem::take(&mut *pumps),
            Err(_) => return,
        };

        for pump in pumps {
            pump.abort();
            let _ = pump.await;
        }
    }

    fn track_pump(&self, pump: JoinHandle<()>) {
        if let Ok(mut pumps) = self.stderr_pumps.lock() {
            pumps.retain(|p| !p.is_finished());
            pumps.push(pump);
        }
    }

    /// Use the runtime directory's copy of a bare runtime command if present.
    fn resolve_program(&self, command: &str) -> PathBuf {
        if let Some(dir) = self.runtime_path.as_deref() {
            if is_runtime_command(command) {
                let candidate = dir.join(command);
                if candidate.is_file() {
                    return candidate;
                }
            }
        }
        PathBuf::from(command)
    }

    /// `PATH` for the child: runtime dir first, then the provider's own
    /// `PATH` override or the host's. `None` when no prefix applies.
    fn search_path_for(&self, config: &ProviderConfig) -> Option<OsString> {
        let dir = self.runtime_path.as_deref()?;
        if !is_runtime_command(&config.command) {
            return None;
        }
        let base = config
            .env
            .get("PATH")
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"));
        prefix_search_path(dir, base)
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward a provider's stderr to the log, keeping a short tail.
fn forward_stderr(name: String, stderr: ChildStderr, tail: StderrTail) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %name, stderr = %line, "provider stderr");
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    })
}

// ─── Termination ─────────────────────────────────────────────────────────────

/// Stop a provider process with escalating force.
///
/// Already exited → `Exited` without signalling. Otherwise SIGTERM to the
/// process group and wait `grace`; then SIGKILL and wait `kill_wait`.
/// Never fails: problems are logged and reflected in the outcome.
pub async fn terminate(
    mut process: ProviderProcess,
    grace: Duration,
    kill_wait: Duration,
) -> TerminateOutcome {
    let name = process.name.clone();

    match process.child.try_wait() {
        Ok(Some(status)) => {
            tracing::debug!(server = %name, code = ?status.code(), "provider already exited");
            return TerminateOutcome::Exited;
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(server = %name, error = %e, "failed to poll provider status");
        }
    }

    send_graceful_signal(&mut process);

    match tokio::time::timeout(grace, process.child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(server = %name, code = ?status.code(), "provider exited");
            return TerminateOutcome::Exited;
        }
        Ok(Err(e)) => {
            tracing::warn!(server = %name, error = %e, "wait failed after graceful signal");
        }
        Err(_) => {
            tracing::warn!(
                server = %name,
                grace_ms = grace.as_millis() as u64,
                "provider did not exit within grace period"
            );
        }
    }

    force_kill(&mut process);

    match tokio::time::timeout(kill_wait, process.child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(server = %name, code = ?status.code(), "provider killed");
            TerminateOutcome::Killed
        }
        Ok(Err(e)) => {
            tracing::error!(server = %name, error = %e, "wait failed after kill");
            TerminateOutcome::Unaccounted
        }
        Err(_) => {
            tracing::error!(server = %name, pid = ?process.pid, "provider still running after kill");
            TerminateOutcome::Unaccounted
        }
    }
}

#[cfg(unix)]
fn signal_group(process: &ProviderProcess, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = process.pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        tracing::debug!(server = %process.name, pid, ?signal, error = ?e, "killpg failed");
    }
}

#[cfg(unix)]
fn send_graceful_signal(process: &mut ProviderProcess) {
    signal_group(process, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(not(unix))]
fn send_graceful_signal(process: &mut ProviderProcess) {
    // No graceful signal on this platform.
    if let Err(e) = process.child.start_kill() {
        tracing::debug!(server = %process.name, error = %e, "start_kill failed");
    }
}

fn force_kill(process: &mut ProviderProcess) {
    #[cfg(unix)]
    signal_group(process, nix::sys::signal::Signal::SIGKILL);

    if let Err(e) = process.child.start_kill() {
        tracing::debug!(server = %process.name, error = %e, "start_kill failed");
    }
}

// ─── Runtime Search Path ─────────────────────────────────────────────────────

/// Whether a command is a bare toolchain launcher (`npx`, `uvx`, ...).
pub fn is_runtime_command(command: &str) -> bool {
    let path = Path::new(command);
    if path.components().count() != 1 {
        return false;
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(command);
    RUNTIME_COMMANDS.contains(&stem)
}

/// Find a toolchain directory that is not already on the host `PATH`.
///
/// Resolution order:
/// 1. `TOOL_GATEWAY_RUNTIME_PATH`
/// 2. `NVM_BIN`
/// 3. Newest `~/.nvm/versions/node/*/bin`
/// 4. `/opt/homebrew/bin`, `/usr/local/bin`
pub fn resolve_runtime_path() -> Option<PathBuf> {
    let current: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();

    runtime_path_candidates()
        .into_iter()
        .find(|dir| dir.is_dir() && !current.contains(dir))
}

fn runtime_path_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    for var in [RUNTIME_PATH_ENV, "NVM_BIN"] {
        if let Some(dir) = std::env::var_os(var).filter(|v| !v.is_empty()) {
            candidates.push(PathBuf::from(dir));
        }
    }

    if let Some(home) = dirs::home_dir() {
        if let Some(dir) = newest_node_bin(&home.join(".nvm/versions/node")) {
            candidates.push(dir);
        }
    }

    candidates.push(PathBuf::from("/opt/homebrew/bin"));
    candidates.push(PathBuf::from("/usr/local/bin"));
    candidates
}

/// Pick `<versions_dir>/<highest vX.Y.Z>/bin`, comparing versions numerically.
fn newest_node_bin(versions_dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(versions_dir).ok()?;

    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let version = parse_node_version(&name)?;
            Some((version, entry.path().join("bin")))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, bin)| bin)
}

fn parse_node_version(name: &str) -> Option<(u32, u32, u32)> {
    let mut parts = name.strip_prefix('v')?.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor, patch))
}

/// Join `prefix` in front of an existing search path.
fn prefix_search_path(prefix: &Path, base: Option<OsString>) -> Option<OsString> {
    let mut dirs = vec![prefix.to_path_buf()];
    if let Some(base) = base {
        dirs.extend(std::env::split_paths(&base).filter(|d| d != prefix));
    }
    std::env::join_paths(dirs).ok()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
