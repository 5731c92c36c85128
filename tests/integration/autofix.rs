#[path = "common/mod.rs"]
mod common;

use std::{fs, process::Command as StdCommand, sync::Arc, time::Duration};

use common::{STARTING, exited, harness, harness_with, pgrep, running, set_all_healthy};
use keypath_lifecycle::{
    autofix::AutoFixAction,
    command::CommandOutput,
    config::load_config,
    descriptor::ServiceId,
    diagnose::FailureKind,
    privilege::PrivilegedExecutor,
    test_utils::{RecordingExecutor, ShellExecutor},
};

#[tokio::test]
async fn restart_unhealthy_is_a_no_op_when_everything_is_healthy() {
    let executor = Arc::new(RecordingExecutor::default());
    let h = harness(executor.clone());
    set_all_healthy(&h.runner);

    let outcome = h
        .engine
        .perform_auto_fix_detailed(AutoFixAction::RestartUnhealthyServices)
        .await;
    assert!(outcome.attempted);
    assert!(outcome.resolved);
    assert!(executor.scripts().is_empty());
    assert_eq!(h.runner.count("launchctl kickstart"), 0);
    assert_eq!(h.runner.count("launchctl print"), 3);
}

#[tokio::test]
async fn restart_unhealthy_kickstarts_only_failed_services() {
    let h = harness_with(|runner| {
        let executor = RecordingExecutor::default().on_execute(move |script| {
            if script.contains("kickstart -k system/com.keypath.kanata") {
                runner.service_status(ServiceId::Kanata, &running(500));
            }
        });
        Arc::new(executor) as Arc<dyn PrivilegedExecutor>
    });
    set_all_healthy(&h.runner);
    h.runner.service_status(ServiceId::Kanata, &exited(1));

    assert!(
        h.engine
            .perform_auto_fix(AutoFixAction::RestartUnhealthyServices)
            .await
    );
    assert_eq!(
        h.engine.monitor().status(ServiceId::Kanata).await.pid,
        Some(500)
    );
}

#[tokio::test]
async fn restart_unhealthy_installs_unloaded_services_first() {
    let scripts = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let seen = scripts.clone();
    let h = harness_with(move |runner| {
        let executor = RecordingExecutor::default().on_execute(move |script| {
            seen.lock().unwrap().push(script.to_string());
            if script.contains("bootstrap system") {
                runner.service_status(ServiceId::Kanata, &running(600));
            }
        });
        Arc::new(executor) as Arc<dyn PrivilegedExecutor>
    });
    h.runner.service_status(ServiceId::VhidDaemon, &running(601));
    h.runner.service_status(ServiceId::VhidManager, &exited(0));

    let outcome = h
        .engine
        .perform_auto_fix_detailed(AutoFixAction::RestartUnhealthyServices)
        .await;
    assert!(outcome.attempted);
    assert!(outcome.resolved);

    let scripts = scripts.lock().unwrap();
    assert_eq!(scripts.len(), 1, "expected only the install batch: {scripts:?}");
    assert_eq!(scripts[0].matches("bootstrap system").count(), 3);
    assert!(!scripts[0].contains("kickstart"));
}

#[tokio::test]
async fn freshly_loaded_services_get_their_warmup_before_any_kickstart() {
    let scripts = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let seen = scripts.clone();
    let h = harness_with(move |runner| {
        let executor = RecordingExecutor::default().on_execute(move |script| {
            seen.lock().unwrap().push(script.to_string());
            if script.contains("bootstrap system") {
                runner.respond_sequence(
                    &format!("launchctl print {}", ServiceId::Kanata.target()),
                    vec![
                        CommandOutput::success(STARTING),
                        CommandOutput::success(STARTING),
                        CommandOutput::success(running(700)),
                    ],
                );
                runner.service_status(ServiceId::VhidDaemon, &running(701));
                runner.service_status(ServiceId::VhidManager, &exited(0));
            }
        });
        Arc::new(executor) as Arc<dyn PrivilegedExecutor>
    });

    let outcome = h
        .engine
        .perform_auto_fix_detailed(AutoFixAction::RestartUnhealthyServices)
        .await;
    assert!(outcome.attempted);
    assert!(outcome.resolved, "{}", outcome.detail);

    let scripts = scripts.lock().unwrap();
    assert_eq!(scripts.len(), 1, "expected only the install batch: {scripts:?}");
    assert!(!scripts[0].contains("kickstart"));
    assert!(!scripts[0].contains("bootout"));
}

#[tokio::test]
async fn failed_restart_keeps_causes_seen_before_the_restart() {
    let h = harness_with(|runner| {
        let executor = RecordingExecutor::default().on_execute(move |script| {
            if script.contains("kickstart -k system/com.keypath.kanata") {
                runner.service_status(ServiceId::Kanata, STARTING);
            }
        });
        Arc::new(executor) as Arc<dyn PrivilegedExecutor>
    });
    set_all_healthy(&h.runner);
    h.runner.service_status(ServiceId::Kanata, &exited(1));

    let outcome = h
        .engine
        .perform_auto_fix_detailed(AutoFixAction::RestartUnhealthyServices)
        .await;
    assert!(outcome.attempted);
    assert!(!outcome.resolved);

    let exit = outcome
        .diagnoses
        .iter()
        .find(|d| d.kind == FailureKind::UnexpectedExit)
        .expect("exit seen before the restart");
    assert_eq!(exit.service, ServiceId::Kanata);
    assert_eq!(exit.evidence.as_deref(), Some("last exit code = 1"));
    assert!(outcome.diagnoses.iter().all(|d| d.kind != FailureKind::Unknown));
}

#[tokio::test]
async fn unresolved_restart_still_reports_attempted_with_guidance() {
    let executor = Arc::new(RecordingExecutor::default());
    let h = harness(executor.clone());
    set_all_healthy(&h.runner);
    h.runner.service_status(ServiceId::Kanata, &exited(1));
    fs::write(
        h.path("kanata.log"),
        "[ERROR] IOHIDDeviceOpen error: (iokit/common) not permitted\n",
    )
    .unwrap();

    let outcome = h
        .engine
        .perform_auto_fix_detailed(AutoFixAction::RestartUnhealthyServices)
        .await;
    assert!(outcome.attempted);
    assert!(!outcome.resolved);
    assert_eq!(executor.scripts().len(), 1);
    assert!(executor.scripts()[0].contains("kickstart -k system/com.keypath.kanata"));
    assert!(!executor.scripts()[0].contains("vhiddaemon"));

    let capture = outcome
        .diagnoses
        .iter()
        .find(|d| d.kind == FailureKind::CapturePermissionMissing)
        .expect("capture permission diagnosis");
    assert!(capture.requires_user_action);
    assert!(outcome.diagnoses.iter().any(|d| d.kind == FailureKind::UnexpectedExit));
}

#[tokio::test]
async fn declined_restart_is_not_attempted() {
    let executor = Arc::new(RecordingExecutor::with_output(CommandOutput::failure(
        1,
        "execution error: User canceled. (-128)",
    )));
    let h = harness(executor);
    set_all_healthy(&h.runner);
    h.runner.service_status(ServiceId::VhidDaemon, &exited(1));

    assert!(
        !h.engine
            .perform_auto_fix(AutoFixAction::RestartUnhealthyServices)
            .await
    );
}

#[tokio::test]
async fn concurrent_fixes_never_overlap() {
    let executor =
        Arc::new(RecordingExecutor::default().with_delay(Duration::from_millis(100)));
    let h = harness(executor.clone());
    set_all_healthy(&h.runner);

    let (first, second) = tokio::join!(
        h.engine.perform_auto_fix(AutoFixAction::RestartVirtualHidDaemon),
        h.engine.perform_auto_fix(AutoFixAction::RestartVirtualHidDaemon),
    );
    assert!(first && second);

    let executions = executor.executions();
    assert_eq!(executions.len(), 2);
    assert_eq!(executor.max_in_flight(), 1);
    assert!(executions[0].finished <= executions[1].started);
}

#[tokio::test]
async fn terminate_without_conflicts_does_nothing() {
    let executor = Arc::new(RecordingExecutor::default());
    let h = harness(executor.clone());

    let outcome = h
        .engine
        .perform_auto_fix_detailed(AutoFixAction::TerminateConflictingProcesses)
        .await;
    assert!(outcome.resolved);
    assert!(executor.scripts().is_empty());
}

#[tokio::test]
async fn terminate_kills_detected_processes() {
    let bin = tempfile::tempdir().unwrap();
    let bin_path = bin.path().to_path_buf();
    let h = harness_with(move |_| {
        Arc::new(ShellExecutor::new(bin_path)) as Arc<dyn PrivilegedExecutor>
    });
    let mut child = StdCommand::new("sleep").arg("30").spawn().unwrap();
    pgrep(
        &h.runner,
        "karabiner_grabber",
        &format!("{} karabiner_grabber\n", child.id()),
    );

    let outcome = h
        .engine
        .perform_auto_fix_detailed(AutoFixAction::TerminateConflictingProcesses)
        .await;
    let status = child.wait().unwrap();
    assert!(!status.success());
    assert!(outcome.attempted);
    assert!(outcome.resolved, "{}", outcome.detail);
}

#[tokio::test]
async fn surviving_conflicts_are_diagnosed_for_the_user() {
    let executor = Arc::new(RecordingExecutor::default());
    let h = harness(executor.clone());
    let mut child = StdCommand::new("sleep").arg("30").spawn().unwrap();
    pgrep(
        &h.runner,
        "karabiner_grabber",
        &format!("{} karabiner_grabber\n", child.id()),
    );

    let outcome = h
        .engine
        .perform_auto_fix_detailed(AutoFixAction::TerminateConflictingProcesses)
        .await;
    child.kill().unwrap();
    child.wait().unwrap();

    assert!(outcome.attempted);
    assert!(!outcome.resolved);
    assert_eq!(executor.scripts().len(), 1);
    let survivors = outcome
        .diagnoses
        .iter()
        .find(|d| d.kind == FailureKind::ConflictPersists)
        .expect("survivor diagnosis");
    assert!(survivors.requires_user_action);
    assert!(survivors.evidence.as_deref().unwrap().contains(&child.id().to_string()));
    assert!(survivors.remediation.contains("manually"));
}

#[tokio::test]
async fn create_config_file_applies_once() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    assert!(h.engine.can_auto_fix(AutoFixAction::CreateConfigFile));

    assert!(h.engine.perform_auto_fix(AutoFixAction::CreateConfigFile).await);
    let text = fs::read_to_string(h.path("keypath.kbd")).unwrap();
    assert!(text.contains("defcfg"));
    assert!(!h.engine.can_auto_fix(AutoFixAction::CreateConfigFile));
}

#[tokio::test]
async fn enable_tcp_server_persists_port_and_reloads_engine() {
    let executor = Arc::new(RecordingExecutor::default());
    let h = harness(executor.clone());
    set_all_healthy(&h.runner);
    assert!(h.engine.can_auto_fix(AutoFixAction::EnableTcpServer));

    assert!(h.engine.perform_auto_fix(AutoFixAction::EnableTcpServer).await);

    let saved = load_config(Some(h.path("lifecycle.yaml").as_path())).unwrap();
    assert_eq!(saved.tcp_port, Some(37001));
    assert!(
        h.engine
            .render_unit(ServiceId::Kanata)
            .unwrap()
            .contains("<string>--port</string>")
    );
    let scripts = executor.scripts();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("bootstrap system"));
    assert!(scripts[0].contains("com.keypath.kanata.plist"));
    assert!(!scripts[0].contains("vhiddaemon"));
    assert!(!h.engine.can_auto_fix(AutoFixAction::EnableTcpServer));
}

#[tokio::test]
async fn install_capability_tracks_unit_files() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    assert!(h.engine.can_auto_fix(AutoFixAction::InstallLaunchDaemonServices));
    assert!(!h.engine.can_auto_fix(AutoFixAction::RestartVirtualHidDaemon));
    assert!(!h.engine.can_auto_fix(AutoFixAction::RegenerateServiceConfiguration));

    let installer = h.engine.installer();
    fs::create_dir_all(h.path("LaunchDaemons")).unwrap();
    for id in ServiceId::ALL {
        fs::write(installer.target_path(id), installer.render(id).unwrap()).unwrap();
    }
    assert!(!h.engine.can_auto_fix(AutoFixAction::InstallLaunchDaemonServices));
    assert!(!h.engine.can_auto_fix(AutoFixAction::RepairVhidDaemonServices));
    assert!(!h.engine.can_auto_fix(AutoFixAction::RegenerateServiceConfiguration));
    assert!(h.engine.can_auto_fix(AutoFixAction::RestartVirtualHidDaemon));

    fs::write(installer.target_path(ServiceId::Kanata), "stale").unwrap();
    assert!(h.engine.can_auto_fix(AutoFixAction::RegenerateServiceConfiguration));
}

#[tokio::test]
async fn driver_fix_requires_mismatch_and_bundled_package() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    assert!(!h.engine.can_auto_fix(AutoFixAction::FixDriverVersionMismatch));

    fs::write(h.path("driver.pkg"), "pkg").unwrap();
    assert!(h.engine.can_auto_fix(AutoFixAction::FixDriverVersionMismatch));

    fs::write(
        h.path("Info.plist"),
        "<plist><dict><key>CFBundleShortVersionString</key><string>5.0.0</string></dict></plist>",
    )
    .unwrap();
    assert!(!h.engine.can_auto_fix(AutoFixAction::FixDriverVersionMismatch));
}

#[tokio::test]
async fn adopt_orphan_writes_unit_without_loading() {
    let executor = Arc::new(RecordingExecutor::default());
    let h = harness(executor.clone());

    assert!(h.engine.perform_auto_fix(AutoFixAction::AdoptOrphanedProcess).await);
    let scripts = executor.scripts();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("com.keypath.kanata.plist"));
    assert!(!scripts[0].contains("launchctl"));
}

#[tokio::test]
async fn log_rotation_capability_and_install() {
    let executor = Arc::new(RecordingExecutor::default());
    let h = harness(executor.clone());
    assert!(h.engine.can_auto_fix(AutoFixAction::InstallLogRotation));

    assert!(h.engine.perform_auto_fix(AutoFixAction::InstallLogRotation).await);
    assert!(executor.scripts()[0].contains("com.keypath.kanata.conf"));
}
