pub mod console;
pub mod error;
pub mod local_store;
pub mod menu;
pub mod process;
pub mod state_machine;
pub mod watcher;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LauncherConfig;
use console::{ConsoleBuffer, ConsoleLine};
use error::SupervisorError;
use local_store::{LocalRecord, LocalStore};
use menu::{MenuEntry, MenuTargets};
use process::{CommandSpec, ExitInfo, ExitWatch, OutputStream, ProcessHandle, RunOptions};
use state_machine::{LifecycleEvent, LifecycleState, LifecycleStore};
use watcher::{LineReader, WatchError, WatchRule};

/// How long to keep reading output once the app has exited.
const EXIT_OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Connect timeout when checking a recorded endpoint at startup.
const ENDPOINT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// The daemon currently owned by the supervisor.
struct RunningApp {
    generation: u64,
    handle: ProcessHandle,
    cancel: CancellationToken,
    pipeline: JoinHandle<()>,
}

/// Guarded by the writer lock. Every lifecycle write happens while holding it,
/// so a late `Ready` can never land after the `Stopped` of the same process.
#[derive(Default)]
struct Slot {
    app: Option<RunningApp>,
    next_generation: u64,
}

impl Slot {
    fn is_current(&self, generation: u64) -> bool {
        self.app.as_ref().map(|a| a.generation) == Some(generation)
    }
}

struct Shared {
    store: LifecycleStore,
    console: ConsoleBuffer,
    local: LocalStore,
    rule: WatchRule,
    slot: Mutex<Slot>,
    last_error: std::sync::Mutex<Option<String>>,
}

impl Shared {
    fn set_last_error(&self, err: &SupervisorError) {
        let mut last = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(err.to_string());
    }

    fn clear_last_error(&self) {
        let mut last = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last = None;
    }

    fn forget_endpoint(&self) {
        if let Err(e) = self.local.clear_url() {
            tracing::warn!("Failed to clear local record: {}", e);
        }
    }
}

/// Resolves once the launched app is ready, or with the reason it never got there.
pub struct Readiness {
    rx: oneshot::Receiver<Result<String, SupervisorError>>,
}

impl Readiness {
    pub async fn wait(self) -> Result<String, SupervisorError> {
        self.rx.await.unwrap_or(Err(SupervisorError::Cancelled))
    }
}

/// Drives install, launch and stop of a single app and keeps the lifecycle
/// store in step with the real process.
pub struct Supervisor {
    config: LauncherConfig,
    targets: MenuTargets,
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(config: LauncherConfig) -> Result<Self, SupervisorError> {
        config.validate()?;
        let rule = config.watch_rule()?;

        // Installed-ness is read from disk once; afterwards the store is authoritative.
        let initial = if config.env_path().is_dir() {
            LifecycleState::installed()
        } else {
            LifecycleState::default()
        };
        tracing::info!(
            "Supervisor for '{}' in {} starts as {:?}",
            config.title,
            config.app_dir.display(),
            initial.effective()
        );

        let local = LocalStore::new(config.local_record_path());
        // A recorded URL outlives the launcher only while something still serves it.
        match local.load() {
            Ok(LocalRecord { url: Some(url) })
                if local_store::endpoint_is_live(&url, ENDPOINT_PROBE_TIMEOUT) =>
            {
                tracing::warn!("Recorded endpoint {} still answers, keeping it", url);
            }
            _ => {
                if let Err(e) = local.clear_url() {
                    tracing::warn!("Failed to clear stale local record: {}", e);
                }
            }
        }

        Ok(Self {
            targets: config.menu_targets(),
            shared: Arc::new(Shared {
                store: LifecycleStore::with_state(initial),
                console: ConsoleBuffer::with_capacity(config.console_buffer_size),
                local,
                rule,
                slot: Mutex::new(Slot::default()),
                last_error: std::sync::Mutex::new(None),
            }),
            config,
        })
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    // ─── Queries ─────────────────────────────────────────────

    pub fn state(&self) -> Result<LifecycleState, SupervisorError> {
        Ok(self.shared.store.snapshot()?)
    }

    /// Menu for the last committed state. Never waits on the process.
    pub fn menu(&self) -> Result<Vec<MenuEntry>, SupervisorError> {
        Ok(menu::resolve(&self.state()?, &self.targets))
    }

    pub fn console_since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.shared.console.since(since_id)
    }

    pub fn console_recent(&self, count: usize) -> Vec<ConsoleLine> {
        self.shared.console.recent(count)
    }

    pub fn local_record(&self) -> Result<LocalRecord, SupervisorError> {
        Ok(self.shared.local.load()?)
    }

    /// Last failure of a background process (e.g. the app dying after it was ready).
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn running_pid(&self) -> Option<u32> {
        let slot = self.shared.slot.lock().await;
        slot.app.as_ref().and_then(|a| a.handle.pid())
    }

    // ─── Install ─────────────────────────────────────────────

    /// Run the install commands. The lifecycle ends in installed-idle on
    /// success and not-installed on any failure.
    ///
    /// The work runs in its own task: if the caller stops waiting, the install
    /// still finishes and its outcome is still committed.
    pub async fn install(&self) -> Result<(), SupervisorError> {
        self.start_install(false).await
    }

    /// Drop the installed flag, then install again.
    pub async fn reinstall(&self) -> Result<(), SupervisorError> {
        self.start_install(true).await
    }

    async fn start_install(&self, reinstall: bool) -> Result<(), SupervisorError> {
        let specs = self.config.install_specs()?;
        let task = {
            let _slot = self.shared.slot.lock().await;
            if reinstall {
                self.shared.store.transition(LifecycleEvent::Uninstalled)?;
            }
            self.shared.store.transition(LifecycleEvent::InstallStarted)?;
            tokio::spawn(run_install(self.shared.clone(), self.config.clone(), specs))
        };
        join_owned("install", task).await
    }

    // ─── Launch / stop ───────────────────────────────────────

    /// Start the app in the background and return immediately. The returned
    /// [`Readiness`] resolves after the endpoint is committed to the store.
    pub async fn launch(&self) -> Result<Readiness, SupervisorError> {
        let spec = self.config.launch_spec()?;
        let mut slot = self.shared.slot.lock().await;
        if slot.app.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        self.shared.store.transition(LifecycleEvent::LaunchStarted)?;
        self.shared.forget_endpoint();
        self.shared.clear_last_error();

        let opts = RunOptions::new(&self.config.app_dir)
            .daemon(true)
            .pty(self.config.pty);
        let mut handle = match process::spawn(&spec, &opts) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Launch failed: {}", e);
                self.shared.console.push_system(format!("Launch failed: {}", e));
                self.shared.set_last_error(&e);
                self.shared.store.transition(LifecycleEvent::Stopped)?;
                return Err(e);
            }
        };
        self.shared
            .console
            .push_system(format!("Started '{}' (pid {:?})", spec, handle.pid()));

        let Some(output) = handle.take_output() else {
            drop(handle);
            self.shared.store.transition(LifecycleEvent::Stopped)?;
            return Err(SupervisorError::Internal(anyhow::anyhow!(
                "output stream of '{}' already taken",
                spec
            )));
        };
        slot.next_generation += 1;
        let generation = slot.next_generation;
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let pipeline = tokio::spawn(run_pipeline(
            self.shared.clone(),
            generation,
            output,
            handle.exit_watch(),
            cancel.clone(),
            ready_tx,
        ));

        slot.app = Some(RunningApp {
            generation,
            handle,
            cancel,
            pipeline,
        });
        Ok(Readiness { rx: ready_rx })
    }

    /// Stop the running app: cancel the readiness watch, terminate the
    /// process (grace period, then kill) and return to installed-idle.
    ///
    /// Like install, the stop runs in its own task and always commits
    /// `Stopped`, even when the caller goes away during the grace period.
    pub async fn stop(&self) -> Result<ExitInfo, SupervisorError> {
        let task = tokio::spawn(stop_app(self.shared.clone(), self.config.stop_grace()));
        join_owned("stop", task).await
    }

    /// Stop the app if it runs. Called when the launcher exits.
    pub async fn shutdown(&self) {
        match self.stop().await {
            Ok(info) => tracing::info!("App stopped on shutdown ({})", info),
            Err(SupervisorError::NotRunning) => {}
            Err(e) => tracing::error!("Failed to stop app on shutdown: {}", e),
        }
    }
}

async fn join_owned<T>(
    what: &str,
    task: JoinHandle<Result<T, SupervisorError>>,
) -> Result<T, SupervisorError> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(SupervisorError::Internal(anyhow::anyhow!(
            "{} task failed: {}",
            what,
            e
        ))),
    }
}

fn console_reader(output: OutputStream, console: &ConsoleBuffer) -> LineReader {
    let console = console.clone();
    LineReader::new(output).with_tap(move |line| {
        console.push_output(line);
    })
}

async fn run_install(
    shared: Arc<Shared>,
    config: LauncherConfig,
    specs: Vec<CommandSpec>,
) -> Result<(), SupervisorError> {
    shared.clear_last_error();
    shared.console.push_system(format!("Installing {}", config.title));

    let result = run_install_commands(&shared, &config, &specs).await;
    if let Err(e) = &result {
        tracing::error!("Install failed: {}", e);
        shared.console.push_system(format!("Install failed: {}", e));
        shared.set_last_error(e);
    }

    {
        let _slot = shared.slot.lock().await;
        shared
            .store
            .transition(LifecycleEvent::InstallFinished(result.is_ok()))?;
    }
    result
}

async fn run_install_commands(
    shared: &Shared,
    config: &LauncherConfig,
    specs: &[CommandSpec],
) -> Result<(), SupervisorError> {
    let opts = RunOptions::new(&config.app_dir);
    for spec in specs {
        shared.console.push_system(format!("> {}", spec));
        let mut handle = process::spawn(spec, &opts)?;
        if let Some(output) = handle.take_output() {
            let mut lines = console_reader(output, &shared.console);
            lines.drain().await;
        }
        let info = process::wait(handle).await?;
        if !info.success {
            return Err(SupervisorError::InstallFailed {
                command: spec.to_string(),
                code: info.code,
            });
        }
    }
    for dir in &config.scaffold_dirs {
        std::fs::create_dir_all(config.app_dir.join(dir))?;
    }
    tracing::info!("Install of '{}' complete", config.title);
    Ok(())
}

async fn stop_app(shared: Arc<Shared>, grace: Duration) -> Result<ExitInfo, SupervisorError> {
    let (info, pipeline) = {
        let mut slot = shared.slot.lock().await;
        let app = slot.app.take().ok_or(SupervisorError::NotRunning)?;
        app.cancel.cancel();
        let info = process::stop(app.handle, grace).await;
        shared.store.transition(LifecycleEvent::Stopped)?;
        shared.forget_endpoint();
        (info, app.pipeline)
    };
    // The pipeline may be queued on the writer lock; it finds its
    // generation gone and exits.
    if let Err(e) = pipeline.await {
        tracing::warn!("Readiness pipeline ended abnormally: {}", e);
    }
    let info = info?;
    shared.console.push_system(format!("Stopped ({})", info));
    Ok(info)
}

/// Output → watcher → store, then exit observation for one launched process.
///
/// The child's exit is watched alongside its output: descendants may keep the
/// output open after the child itself is gone.
async fn run_pipeline(
    shared: Arc<Shared>,
    generation: u64,
    output: OutputStream,
    mut exit: ExitWatch,
    cancel: CancellationToken,
    ready_tx: oneshot::Sender<Result<String, SupervisorError>>,
) {
    let mut lines = console_reader(output, &shared.console);

    let watched = tokio::select! {
        biased;
        res = watcher::watch(&mut lines, &shared.rule, &cancel) => Some(res),
        _ = exit.exited() => None,
    };
    let watched = match watched {
        Some(res) => Some(res),
        // Output already in flight may still carry the ready line.
        None => tokio::time::timeout(
            EXIT_OUTPUT_GRACE,
            watcher::watch(&mut lines, &shared.rule, &cancel),
        )
        .await
        .ok(),
    };

    let readiness = match watched {
        Some(Ok(found)) => {
            let endpoint = found
                .captured(&shared.rule)
                .unwrap_or(found.matched.as_str())
                .to_string();
            commit_ready(&shared, generation, endpoint).await
        }
        Some(Err(WatchError::StreamClosedWithoutMatch)) => {
            tracing::error!("App output closed before it reported ready");
            Err(SupervisorError::StreamClosedWithoutMatch)
        }
        Some(Err(WatchError::Cancelled)) => Err(SupervisorError::Cancelled),
        None => {
            let info = exit.status().unwrap_or_else(ExitInfo::unknown);
            tracing::error!("App exited before it reported ready ({})", info);
            Err(SupervisorError::ProcessExitedUnexpectedly(info.to_string()))
        }
    };
    let ready = readiness.is_ok();
    let _ = ready_tx.send(readiness);

    if ready {
        // Keep the pipe flowing so the app never blocks on a full buffer.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = lines.drain() => {}
            _ = exit.exited() => {}
        }
    }

    let info = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        info = exit.exited() => info,
    };
    // Pick up the last lines unless descendants keep the output open.
    let _ = tokio::time::timeout(EXIT_OUTPUT_GRACE, lines.drain()).await;

    let mut slot = shared.slot.lock().await;
    if !slot.is_current(generation) {
        return;
    }
    if let Some(app) = slot.app.take() {
        app.handle.kill_process_group();
    }
    let err = SupervisorError::ProcessExitedUnexpectedly(info.to_string());
    tracing::error!("{}", err);
    shared.console.push_system(err.to_string());
    shared.set_last_error(&err);
    if let Err(e) = shared.store.transition(LifecycleEvent::Stopped) {
        tracing::error!("Failed to record exit: {}", e);
    }
    shared.forget_endpoint();
}

async fn commit_ready(
    shared: &Shared,
    generation: u64,
    endpoint: String,
) -> Result<String, SupervisorError> {
    let slot = shared.slot.lock().await;
    if !slot.is_current(generation) {
        return Err(SupervisorError::Cancelled);
    }
    shared
        .store
        .transition(LifecycleEvent::Ready(endpoint.clone()))?;
    if let Err(e) = shared.local.set_url(&endpoint) {
        tracing::warn!("Failed to persist endpoint: {}", e);
    }
    shared.console.push_system(format!("Ready at {}", endpoint));
    Ok(endpoint)
}
