use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::supervisor::error::SupervisorError;
use crate::supervisor::menu::MenuTargets;
use crate::supervisor::process::CommandSpec;
use crate::supervisor::watcher::WatchRule;

pub const DEFAULT_CONFIG_PATH: &str = "./launchkit.toml";
/// Directory under `app_dir` holding launcher-owned files.
pub const STATE_DIR_NAME: &str = ".launchkit";

/// Launcher configuration, read from `launchkit.toml`.
/// Every field has a default, so an empty file describes the stock
/// "venv + app.py" Gradio app.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LauncherConfig {
    pub title: String,
    /// Root of the app; every command runs here.
    pub app_dir: PathBuf,
    /// Environment directory relative to `app_dir`; its presence at startup
    /// means the app is installed.
    pub env_dir: String,
    /// Run in order; the first failure aborts the install.
    pub install_commands: Vec<Vec<String>>,
    /// Directories created under `app_dir` after a successful install.
    pub scaffold_dirs: Vec<String>,
    pub launch_command: Vec<String>,
    /// Attach the app to a pseudo-terminal.
    pub pty: bool,
    pub ready_pattern: String,
    pub capture_index: usize,
    pub stop_grace_secs: u64,
    pub listen_addr: String,
    pub install_script: String,
    pub start_script: String,
    pub console_buffer_size: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let python = venv_bin("python");
        let pip = venv_bin("pip");
        Self {
            title: "API Controller".to_string(),
            app_dir: PathBuf::from("."),
            env_dir: "env".to_string(),
            install_commands: vec![
                vec!["python".into(), "-m".into(), "venv".into(), "env".into()],
                vec![python.clone(), "-m".into(), "pip".into(), "install".into(), "--upgrade".into(), "pip".into()],
                vec![pip, "install".into(), "gradio".into(), "requests".into()],
            ],
            scaffold_dirs: vec!["recordings".to_string()],
            launch_command: vec![python, "app.py".into()],
            pty: true,
            ready_pattern: r"(http://\S+)".to_string(),
            capture_index: 1,
            stop_grace_secs: 10,
            listen_addr: "127.0.0.1:57480".to_string(),
            install_script: "install.js".to_string(),
            start_script: "start.js".to_string(),
            console_buffer_size: crate::supervisor::console::DEFAULT_CONSOLE_BUFFER,
        }
    }
}

/// Path of an executable inside the `env` venv for this platform.
fn venv_bin(name: &str) -> String {
    if cfg!(windows) {
        format!("env/Scripts/{}", name)
    } else {
        format!("env/bin/{}", name)
    }
}

impl LauncherConfig {
    /// Load from `LAUNCHKIT_CONFIG` or `./launchkit.toml`. A missing file
    /// yields the defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("LAUNCHKIT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        let cfg = Self::from_toml(&s)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn from_toml(s: &str) -> Result<Self, SupervisorError> {
        let cfg: Self = toml::from_str(s).map_err(|e| SupervisorError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        self.watch_rule()?;
        self.launch_spec()?;
        self.install_specs()?;
        Ok(())
    }

    pub fn watch_rule(&self) -> Result<WatchRule, SupervisorError> {
        let rule = WatchRule::new(&self.ready_pattern, self.capture_index).map_err(|e| {
            SupervisorError::InvalidConfig(format!("ready_pattern '{}': {}", self.ready_pattern, e))
        })?;
        if self.capture_index >= rule.pattern.captures_len() {
            return Err(SupervisorError::InvalidConfig(format!(
                "capture_index {} but ready_pattern has {} group(s)",
                self.capture_index,
                rule.pattern.captures_len() - 1
            )));
        }
        Ok(rule)
    }

    pub fn launch_spec(&self) -> Result<CommandSpec, SupervisorError> {
        CommandSpec::from_argv(&self.launch_command)
            .ok_or_else(|| SupervisorError::InvalidConfig("launch_command is empty".to_string()))
    }

    pub fn install_specs(&self) -> Result<Vec<CommandSpec>, SupervisorError> {
        self.install_commands
            .iter()
            .enumerate()
            .map(|(i, argv)| {
                CommandSpec::from_argv(argv).ok_or_else(|| {
                    SupervisorError::InvalidConfig(format!("install_commands[{}] is empty", i))
                })
            })
            .collect()
    }

    pub fn env_path(&self) -> PathBuf {
        self.app_dir.join(&self.env_dir)
    }

    pub fn local_record_path(&self) -> PathBuf {
        self.app_dir.join(STATE_DIR_NAME).join("local.json")
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn menu_targets(&self) -> MenuTargets {
        MenuTargets {
            install: self.install_script.clone(),
            start: self.start_script.clone(),
        }
    }
}
