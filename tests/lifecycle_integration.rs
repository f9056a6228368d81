//! End-to-end lifecycle checks against real child processes.
#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use launchkit::config::LauncherConfig;
use launchkit::supervisor::error::SupervisorError;
use launchkit::supervisor::state_machine::EffectiveState;
use launchkit::supervisor::Supervisor;

const GRADIO_PATTERN: &str = r"Running on local URL:  http://(.*)";

fn sh(script: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into()]
}

fn config(dir: &Path, install: &str, launch: &str) -> LauncherConfig {
    LauncherConfig {
        app_dir: dir.to_path_buf(),
        install_commands: vec![sh(install)],
        launch_command: sh(launch),
        pty: false,
        ready_pattern: GRADIO_PATTERN.to_string(),
        capture_index: 1,
        stop_grace_secs: 2,
        ..LauncherConfig::default()
    }
}

async fn wait_for(sup: &Supervisor, expected: EffectiveState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = sup.state().unwrap().effective();
        if current == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {:?}, still {:?}",
            expected,
            current
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn labels(sup: &Supervisor) -> Vec<String> {
    sup.menu().unwrap().into_iter().map(|e| e.label).collect()
}

#[tokio::test]
async fn install_launch_ready_stop() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(config(
        dir.path(),
        "echo installing; mkdir -p env",
        "echo foo; sleep 0.2; echo 'Running on local URL:  http://127.0.0.1:7860'; echo bar; exec sleep 30",
    ))
    .unwrap();
    assert_eq!(labels(&sup), ["Install"]);

    sup.install().await.unwrap();
    assert!(dir.path().join("env").is_dir());
    assert!(dir.path().join("recordings").is_dir());
    assert_eq!(labels(&sup), ["Launch", "Reinstall"]);

    let readiness = sup.launch().await.unwrap();
    let endpoint = readiness.wait().await.unwrap();
    assert_eq!(endpoint, "127.0.0.1:7860");

    // the transition is committed before readiness resolves
    let menu = sup.menu().unwrap();
    assert_eq!(menu.len(), 2);
    assert_eq!(menu[0].label, "Open");
    assert!(menu[0].is_default);
    assert_eq!(menu[0].target, "127.0.0.1:7860");
    assert_eq!(menu[1].label, "Terminal");
    assert!(!menu[1].is_default);
    assert_eq!(sup.local_record().unwrap().url.as_deref(), Some("127.0.0.1:7860"));

    let console: Vec<String> = sup.console_since(0).into_iter().map(|l| l.content).collect();
    assert!(console.iter().any(|l| l == "foo"));

    sup.stop().await.unwrap();
    assert_eq!(sup.state().unwrap().effective(), EffectiveState::InstalledIdle);
    assert!(sup.state().unwrap().endpoint.is_none());
    let menu = sup.menu().unwrap();
    assert_eq!(labels(&sup), ["Launch", "Reinstall"]);
    assert!(menu.iter().all(|e| !e.target.contains("7860")));
    assert_eq!(sup.local_record().unwrap().url, None);
}

#[tokio::test]
async fn failed_install_returns_to_not_installed() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(config(dir.path(), "echo boom 1>&2; exit 2", "true")).unwrap();

    let err = sup.install().await.unwrap_err();
    match err {
        SupervisorError::InstallFailed { code, .. } => assert_eq!(code, Some(2)),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(sup.state().unwrap().effective(), EffectiveState::NotInstalled);
    assert_eq!(labels(&sup), ["Install"]);
    assert!(sup.console_since(0).iter().any(|l| l.content == "boom"));
}

#[tokio::test]
async fn missing_install_binary_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), "true", "true");
    cfg.install_commands = vec![vec!["no-such-installer-7860".into()]];
    let sup = Supervisor::new(cfg).unwrap();

    assert!(matches!(sup.install().await, Err(SupervisorError::Spawn { .. })));
    assert_eq!(sup.state().unwrap().effective(), EffectiveState::NotInstalled);
}

#[tokio::test]
async fn exit_before_ready_reports_closed_stream() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(config(dir.path(), "true", "echo starting; exit 1")).unwrap();
    sup.install().await.unwrap();

    let err = sup.launch().await.unwrap().wait().await.unwrap_err();
    assert!(matches!(err, SupervisorError::StreamClosedWithoutMatch), "got {:?}", err);

    // the dead daemon must not keep the lifecycle in `running`
    wait_for(&sup, EffectiveState::InstalledIdle).await;
    assert!(sup.last_error().unwrap().contains("exited unexpectedly"));
    assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));
}

#[tokio::test]
async fn crash_after_ready_clears_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), "true", "echo 'serving http://127.0.0.1:9000/'; sleep 0.3; exit 0");
    cfg.ready_pattern = r"(http://\S+)".to_string();
    let sup = Supervisor::new(cfg).unwrap();
    sup.install().await.unwrap();

    let endpoint = sup.launch().await.unwrap().wait().await.unwrap();
    assert_eq!(endpoint, "http://127.0.0.1:9000/");

    wait_for(&sup, EffectiveState::InstalledIdle).await;
    assert!(sup.menu().unwrap().iter().all(|e| e.target != endpoint));
    assert_eq!(sup.local_record().unwrap().url, None);
}

#[tokio::test]
async fn stop_cancels_pending_readiness() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Arc::new(Supervisor::new(config(dir.path(), "true", "echo warming up; exec sleep 30")).unwrap());
    sup.install().await.unwrap();

    let readiness = sup.launch().await.unwrap();
    assert_eq!(sup.state().unwrap().effective(), EffectiveState::Running);
    assert_eq!(labels(&sup), ["Terminal"]);

    let waiter = tokio::spawn(readiness.wait());
    sup.stop().await.unwrap();

    let res = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    assert!(matches!(res, Err(SupervisorError::Cancelled)), "got {:?}", res);
    assert_eq!(sup.state().unwrap().effective(), EffectiveState::InstalledIdle);
}

#[tokio::test]
async fn relaunch_after_stop_and_double_launch() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(config(
        dir.path(),
        "true",
        "echo 'Running on local URL:  http://127.0.0.1:7860'; exec sleep 30",
    ))
    .unwrap();
    sup.install().await.unwrap();

    let first = sup.launch().await.unwrap();
    assert!(matches!(sup.launch().await, Err(SupervisorError::AlreadyRunning)));
    first.wait().await.unwrap();
    let first_pid = sup.running_pid().await;
    sup.stop().await.unwrap();

    let second = sup.launch().await.unwrap();
    // no stale endpoint between relaunch and readiness
    let state = sup.state().unwrap();
    if state.effective() == EffectiveState::Running {
        assert!(state.endpoint.is_none());
    }
    assert_eq!(second.wait().await.unwrap(), "127.0.0.1:7860");
    assert_ne!(sup.running_pid().await, first_pid);
    sup.shutdown().await;
    assert_eq!(sup.state().unwrap().effective(), EffectiveState::InstalledIdle);
}

#[tokio::test]
async fn pty_launch_detects_readiness() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(
        dir.path(),
        "true",
        "printf 'Loading 50%%\\rLoading 100%%\\n'; echo 'Running on local URL:  http://127.0.0.1:7861'; exec sleep 30",
    );
    cfg.pty = true;
    let sup = Supervisor::new(cfg).unwrap();
    sup.install().await.unwrap();

    let endpoint = sup.launch().await.unwrap().wait().await.unwrap();
    assert_eq!(endpoint.trim_end(), "127.0.0.1:7861");
    sup.stop().await.unwrap();
    assert_eq!(sup.state().unwrap().effective(), EffectiveState::InstalledIdle);
}

#[tokio::test]
async fn reinstall_from_idle() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(config(dir.path(), "mkdir -p env", "true")).unwrap();
    sup.install().await.unwrap();
    sup.reinstall().await.unwrap();
    assert_eq!(sup.state().unwrap().effective(), EffectiveState::InstalledIdle);
}

#[tokio::test]
async fn concurrent_menu_reads_are_never_torn() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Arc::new(
        Supervisor::new(config(
            dir.path(),
            "true",
            "echo 'Running on local URL:  http://127.0.0.1:7860'; exec sleep 30",
        ))
        .unwrap(),
    );
    sup.install().await.unwrap();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let sup = sup.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let menu = sup.menu().unwrap();
                    assert!(!menu.is_empty());
                    assert_eq!(menu.iter().filter(|e| e.is_default).count(), 1);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    sup.launch().await.unwrap().wait().await.unwrap();
    sup.stop().await.unwrap();
    for r in readers {
        r.await.unwrap();
    }
}

#[tokio::test]
async fn abandoned_stop_still_returns_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(config(
        dir.path(),
        "true",
        "trap '' TERM; echo 'Running on local URL:  http://127.0.0.1:7860'; exec sleep 30",
    ))
    .unwrap();
    sup.install().await.unwrap();
    sup.launch().await.unwrap().wait().await.unwrap();

    // the caller gives up during the grace period
    let res = tokio::time::timeout(Duration::from_millis(300), sup.stop()).await;
    assert!(res.is_err());

    wait_for(&sup, EffectiveState::InstalledIdle).await;
    assert!(sup.state().unwrap().endpoint.is_none());
    assert_eq!(labels(&sup), ["Launch", "Reinstall"]);
    assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));

    let again = sup.launch().await.unwrap();
    assert_eq!(again.wait().await.unwrap(), "127.0.0.1:7860");
    sup.shutdown().await;
}

#[tokio::test]
async fn abandoned_install_still_commits_its_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(config(dir.path(), "sleep 1; mkdir -p env", "true")).unwrap();

    let res = tokio::time::timeout(Duration::from_millis(300), sup.install()).await;
    assert!(res.is_err());
    assert_eq!(sup.state().unwrap().effective(), EffectiveState::Installing);

    wait_for(&sup, EffectiveState::InstalledIdle).await;
    assert!(dir.path().join("env").is_dir());
    sup.reinstall().await.unwrap();
    assert_eq!(sup.state().unwrap().effective(), EffectiveState::InstalledIdle);
}

#[tokio::test]
async fn exit_is_seen_while_a_descendant_holds_the_output() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(config(dir.path(), "true", "echo starting; sleep 20 & exit 1")).unwrap();
    sup.install().await.unwrap();

    let readiness = sup.launch().await.unwrap();
    let res = tokio::time::timeout(Duration::from_secs(5), readiness.wait())
        .await
        .expect("readiness must resolve once the app is gone");
    assert!(
        matches!(res, Err(SupervisorError::ProcessExitedUnexpectedly(_))),
        "got {:?}",
        res
    );

    wait_for(&sup, EffectiveState::InstalledIdle).await;
    assert!(sup.last_error().unwrap().contains("exited unexpectedly"));
    assert!(sup.console_since(0).iter().any(|l| l.content == "starting"));
}
