//! Process runner - spawns the app's commands and hands their combined
//! output to a single consumer.
//!
//! Two backends share one [`ProcessHandle`]:
//! - piped: `tokio::process` with stdout and stderr merged into one stream
//! - pty: a pseudo-terminal from `portable-pty`, for children that only print
//!   progress output when attached to a terminal
//!
//! On unix the child leads its own process group, so stopping it also stops
//! whatever it spawned.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot, watch};

use super::error::SupervisorError;

/// Chunks buffered between the reader and the consumer before the reader waits.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const READ_BUF_SIZE: usize = 8192;
/// How long to wait for the exit after a force kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

// ─── Command & options ───────────────────────────────────────

/// A program and its arguments. No shell is involved, so a missing binary
/// surfaces as a spawn error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Build from an argv list; `None` if it is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Relative programs with a directory part (`env/bin/python`) resolve
    /// against the working directory; bare names go through `PATH`.
    fn resolve_program(&self, working_dir: &Path) -> PathBuf {
        let program = Path::new(&self.program);
        if program.is_relative() && program.components().count() > 1 {
            working_dir.join(program)
        } else {
            program.to_path_buf()
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub working_dir: PathBuf,
    /// Background process; `wait` is refused for it.
    pub daemon: bool,
    /// Attach the child to a pseudo-terminal.
    pub pty: bool,
    pub env: Vec<(String, String)>,
}

impl RunOptions {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            daemon: false,
            pty: false,
            env: Vec::new(),
        }
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

impl ExitInfo {
    pub(crate) fn unknown() -> Self {
        Self {
            code: None,
            success: false,
        }
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

// ─── Output stream ───────────────────────────────────────────

/// Ordered raw output of one process. There is exactly one of these per
/// handle and it ends when the process's output is closed.
pub struct OutputStream {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl OutputStream {
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

pub fn output_channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, OutputStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, OutputStream { rx })
}

// ─── Exit watch ──────────────────────────────────────────────

/// Cloneable view of a process's exit.
#[derive(Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitInfo>>,
}

impl ExitWatch {
    pub fn status(&self) -> Option<ExitInfo> {
        *self.rx.borrow()
    }

    /// Wait until the process exits.
    pub async fn exited(&mut self) -> ExitInfo {
        loop {
            if let Some(info) = self.status() {
                return info;
            }
            if self.rx.changed().await.is_err() {
                return self.status().unwrap_or_else(ExitInfo::unknown);
            }
        }
    }
}

// ─── Process handle ──────────────────────────────────────────

enum Control {
    Piped {
        kill_tx: Option<oneshot::Sender<()>>,
    },
    Pty {
        killer: Box<dyn ChildKiller + Send + Sync>,
        // Closing the master hangs up the child; keep it for the handle's life.
        _master: Box<dyn MasterPty + Send>,
    },
}

/// Exclusive owner of a running child. Dropping the handle kills the child.
pub struct ProcessHandle {
    command: String,
    pid: Option<u32>,
    daemon: bool,
    output: Option<OutputStream>,
    exit: ExitWatch,
    control: Control,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("daemon", &self.daemon)
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Take the output stream. Only the first call gets it.
    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub fn is_running(&self) -> bool {
        self.exit.status().is_none()
    }

    /// Kill whatever is left in the child's process group. Descendants can
    /// outlive the child and keep its output open.
    pub fn kill_process_group(&self) {
        if let Some(pid) = self.pid {
            signal_group(pid, true);
        }
    }

    fn terminate_gracefully(&self) {
        if let Some(pid) = self.pid {
            signal_group(pid, false);
        }
    }

    fn force_kill(&mut self) {
        if let Some(pid) = self.pid {
            signal_group(pid, true);
        }
        match &mut self.control {
            Control::Piped { kill_tx } => {
                if let Some(tx) = kill_tx.take() {
                    let _ = tx.send(());
                }
            }
            Control::Pty { killer, .. } => {
                let _ = killer.kill();
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::warn!("Dropping handle of live process '{}', killing it", self.command);
            self.force_kill();
        }
    }
}

// ─── Runner API ──────────────────────────────────────────────

/// Start `command`. Fails with [`SupervisorError::Spawn`] when the OS refuses
/// to start it; no handle exists in that case.
pub fn spawn(command: &CommandSpec, opts: &RunOptions) -> Result<ProcessHandle, SupervisorError> {
    let handle = if opts.pty {
        spawn_pty(command, opts)?
    } else {
        spawn_piped(command, opts)?
    };
    tracing::info!(
        "Started '{}' (pid {:?}, daemon: {}, pty: {})",
        handle.command,
        handle.pid,
        opts.daemon,
        opts.pty
    );
    Ok(handle)
}

/// Block until a one-shot process exits. Daemon handles are refused.
pub async fn wait(mut handle: ProcessHandle) -> Result<ExitInfo, SupervisorError> {
    if handle.daemon {
        return Err(SupervisorError::Internal(anyhow::anyhow!(
            "wait is not available for daemon process '{}'",
            handle.command
        )));
    }
    let info = handle.exit.exited().await;
    tracing::info!("'{}' finished with {}", handle.command, info);
    Ok(info)
}

/// Stop a process: polite signal, up to `grace` to exit, then force kill.
/// Bounded by `grace` plus a fixed kill timeout.
pub async fn stop(mut handle: ProcessHandle, grace: Duration) -> Result<ExitInfo, SupervisorError> {
    if let Some(info) = handle.exit.status() {
        return Ok(info);
    }

    tracing::info!("Stopping '{}' (pid {:?}, grace {:?})", handle.command, handle.pid, grace);
    handle.terminate_gracefully();

    let mut exit = handle.exit_watch();
    if let Ok(info) = tokio::time::timeout(grace, exit.exited()).await {
        tracing::info!("'{}' stopped gracefully ({})", handle.command, info);
        return Ok(info);
    }

    tracing::warn!("'{}' did not exit within {:?}, killing", handle.command, grace);
    handle.force_kill();
    match tokio::time::timeout(KILL_WAIT, exit.exited()).await {
        Ok(info) => Ok(info),
        Err(_) => Err(SupervisorError::Internal(anyhow::anyhow!(
            "process '{}' did not exit after kill",
            handle.command
        ))),
    }
}

// ─── Backends ────────────────────────────────────────────────

fn spawn_piped(command: &CommandSpec, opts: &RunOptions) -> Result<ProcessHandle, SupervisorError> {
    let label = command.to_string();
    let mut cmd = TokioCommand::new(command.resolve_program(&opts.working_dir));
    cmd.args(&command.args)
        .current_dir(&opts.working_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .env("PYTHONUNBUFFERED", "1")
        .kill_on_drop(true);
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);
    crate::utils::apply_creation_flags(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| SupervisorError::spawn(&label, e))?;
    let pid = child.id();

    let (out_tx, output) = output_channel(OUTPUT_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, out_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, out_tx));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    {
        let label = label.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on an explicit kill and when the handle is dropped.
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    tracing::error!("Failed to wait for '{}': {}", label, e);
                    ExitInfo::unknown()
                }
            };
            tracing::debug!("'{}' exited with {}", label, info);
            let _ = exit_tx.send(Some(info));
        });
    }

    Ok(ProcessHandle {
        command: label,
        pid,
        daemon: opts.daemon,
        output: Some(output),
        exit: ExitWatch { rx: exit_rx },
        control: Control::Piped {
            kill_tx: Some(kill_tx),
        },
    })
}

async fn pump<R: tokio::io::AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn pty_error(command: &str, e: anyhow::Error) -> SupervisorError {
    let source = match e.downcast::<std::io::Error>() {
        Ok(io) => io,
        Err(other) => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
    };
    SupervisorError::spawn(command, source)
}

fn spawn_pty(command: &CommandSpec, opts: &RunOptions) -> Result<ProcessHandle, SupervisorError> {
    let label = command.to_string();
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 120,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| pty_error(&label, e))?;

    let mut builder = CommandBuilder::new(command.resolve_program(&opts.working_dir));
    builder.args(&command.args);
    builder.cwd(&opts.working_dir);
    builder.env("TERM", "xterm-256color");
    builder.env("PYTHONUNBUFFERED", "1");
    for (key, value) in &opts.env {
        builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| pty_error(&label, e))?;
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    let mut reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(e) => {
            let _ = child.kill();
            return Err(pty_error(&label, e));
        }
    };

    let (out_tx, output) = output_channel(OUTPUT_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match std::io::Read::read(&mut reader, &mut buf) {
                // EIO once the child side closes
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (exit_tx, exit_rx) = watch::channel(None);
    {
        let label = label.clone();
        tokio::task::spawn_blocking(move || {
            let info = match child.wait() {
                Ok(status) => ExitInfo {
                    code: Some(status.exit_code() as i32),
                    success: status.success(),
                },
                Err(e) => {
                    tracing::error!("Failed to wait for '{}': {}", label, e);
                    ExitInfo::unknown()
                }
            };
            tracing::debug!("'{}' exited with {}", label, info);
            let _ = exit_tx.send(Some(info));
        });
    }

    Ok(ProcessHandle {
        command: label,
        pid,
        daemon: opts.daemon,
        output: Some(output),
        exit: ExitWatch { rx: exit_rx },
        control: Control::Pty {
            killer,
            _master: pair.master,
        },
    })
}

/// Signal the child's process group (unix) or process tree (windows).
#[cfg(unix)]
fn signal_group(pid: u32, force: bool) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let pgid = Pid::from_raw(pid as i32);
    if let Err(e) = signal::killpg(pgid, sig) {
        tracing::debug!("killpg({}, {:?}) failed: {}, signalling leader only", pid, sig, e);
        let _ = signal::kill(pgid, sig);
    }
}

#[cfg(windows)]
fn signal_group(pid: u32, force: bool) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let pid = pid.to_string();
    let mut args = vec!["/T", "/PID", pid.as_str()];
    if force {
        args.insert(0, "/F");
    }
    if let Err(e) = std::process::Command::new("taskkill")
        .args(&args)
        .creation_flags(CREATE_NO_WINDOW)
        .output()
    {
        tracing::warn!("taskkill for PID {} failed: {}", pid, e);
    }
}
