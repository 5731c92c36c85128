#[path = "common/mod.rs"]
mod common;

use std::{env, fs, os::unix::fs::PermissionsExt, path::Path, sync::Arc};

use common::{harness, harness_with, stub_calls, write_stub};
use keypath_lifecycle::{
    command::CommandOutput,
    descriptor::ServiceId,
    error::InstallError,
    installer::LoadMode,
    privilege::PrivilegedExecutor,
    test_utils::{RecordingExecutor, ShellExecutor, env_lock},
};

/// Every test here holds the env lock because one of them points `TMPDIR`
/// somewhere unusable.
fn shell_harness(bin: &Path) -> common::Harness {
    let bin = bin.to_path_buf();
    harness_with(move |_| Arc::new(ShellExecutor::new(bin)) as Arc<dyn PrivilegedExecutor>)
}

#[tokio::test]
async fn install_all_twice_is_idempotent() {
    let _guard = env_lock();
    let bin = tempfile::tempdir().unwrap();
    write_stub(bin.path(), "launchctl", 0);
    write_stub(bin.path(), "chown", 0);
    let h = shell_harness(bin.path());
    let installer = h.engine.installer();

    assert!(installer.install_all().await);
    let first: Vec<String> = ServiceId::ALL
        .iter()
        .map(|id| fs::read_to_string(installer.target_path(*id)).unwrap())
        .collect();

    assert!(installer.install_all().await);
    let second: Vec<String> = ServiceId::ALL
        .iter()
        .map(|id| fs::read_to_string(installer.target_path(*id)).unwrap())
        .collect();

    assert_eq!(first, second);
    for id in ServiceId::ALL {
        assert!(installer.is_current(id), "{} drifted", id.label());
    }

    let launchctl = stub_calls(bin.path(), "launchctl");
    let bootstraps = launchctl
        .iter()
        .filter(|call| call.starts_with("bootstrap system "))
        .count();
    assert_eq!(bootstraps, 6);
    assert!(launchctl.iter().all(|call| !call.starts_with("bootout")));
    assert!(launchctl.iter().any(|call| call == "enable system/com.keypath.kanata"));
    assert_eq!(stub_calls(bin.path(), "chown").len(), 6);
}

/// `launchctl` stand-in whose `bootstrap` fails the way it does for a unit
/// that is already loaded.
fn write_loaded_launchctl(bin_dir: &Path) {
    let path = bin_dir.join("launchctl");
    let log = bin_dir.join("launchctl.calls");
    fs::write(
        &path,
        format!(
            "#!/bin/sh\necho \"$@\" >> '{}'\nif [ \"$1\" = bootstrap ]; then\n  echo 'Bootstrap failed: 5: Input/output error' >&2\n  exit 5\nfi\nexit 0\n",
            log.display()
        ),
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn reinstalling_loaded_units_leaves_them_running() {
    let _guard = env_lock();
    let bin = tempfile::tempdir().unwrap();
    write_loaded_launchctl(bin.path());
    write_stub(bin.path(), "chown", 0);
    let h = shell_harness(bin.path());

    assert!(h.engine.installer().install_all().await);

    let launchctl = stub_calls(bin.path(), "launchctl");
    assert!(launchctl.iter().all(|call| !call.starts_with("bootout")));
    assert!(launchctl.iter().any(|call| call == "print system/com.keypath.kanata"));
    assert_eq!(
        launchctl.iter().filter(|call| call.starts_with("enable ")).count(),
        3
    );
}

#[tokio::test]
async fn reload_boots_out_before_bootstrapping() {
    let _guard = env_lock();
    let bin = tempfile::tempdir().unwrap();
    write_stub(bin.path(), "launchctl", 0);
    write_stub(bin.path(), "chown", 0);
    let h = shell_harness(bin.path());

    h.engine
        .installer()
        .try_install(&[ServiceId::Kanata], LoadMode::Reload)
        .await
        .unwrap();

    let launchctl = stub_calls(bin.path(), "launchctl");
    assert_eq!(launchctl[0], "bootout system/com.keypath.kanata");
    assert!(launchctl[1].starts_with("bootstrap system "));
    assert_eq!(launchctl[2], "enable system/com.keypath.kanata");
}

#[tokio::test]
async fn failing_step_aborts_the_batch() {
    let _guard = env_lock();
    let bin = tempfile::tempdir().unwrap();
    write_stub(bin.path(), "launchctl", 0);
    write_stub(bin.path(), "chown", 1);
    let h = shell_harness(bin.path());

    let err = h
        .engine
        .installer()
        .try_install(&ServiceId::ALL, LoadMode::Load)
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::Privileged { status: Some(1), .. }));
    assert_eq!(stub_calls(bin.path(), "chown").len(), 1);
    assert!(stub_calls(bin.path(), "launchctl").is_empty());
    assert!(!h.engine.install_all().await);
}

#[tokio::test]
async fn install_files_only_never_loads() {
    let _guard = env_lock();
    let bin = tempfile::tempdir().unwrap();
    write_stub(bin.path(), "launchctl", 0);
    write_stub(bin.path(), "chown", 0);
    let h = shell_harness(bin.path());
    let installer = h.engine.installer();

    assert!(installer.install_files_only(&[ServiceId::Kanata]).await);
    assert!(installer.is_installed(ServiceId::Kanata));
    assert!(!installer.is_installed(ServiceId::VhidDaemon));
    assert!(stub_calls(bin.path(), "launchctl").is_empty());
}

#[tokio::test]
async fn log_rotation_is_installed_once() {
    let _guard = env_lock();
    let bin = tempfile::tempdir().unwrap();
    write_stub(bin.path(), "chown", 0);
    let h = shell_harness(bin.path());
    let installer = h.engine.installer();

    assert!(!installer.log_rotation_installed());
    assert!(installer.install_log_rotation().await);
    assert!(installer.log_rotation_installed());
    let entry = fs::read_to_string(installer.log_rotation_path()).unwrap();
    assert!(entry.contains(&h.path("kanata.log").display().to_string()));
}

#[tokio::test]
async fn staging_failure_skips_privileged_call() {
    let _guard = env_lock();
    let executor = Arc::new(RecordingExecutor::default());
    let h = harness(executor.clone());

    let previous = env::var_os("TMPDIR");
    unsafe {
        env::set_var("TMPDIR", h.path("missing/scratch"));
    }
    let result = h.engine.installer().try_install(&ServiceId::ALL, LoadMode::Load).await;
    match previous {
        Some(value) => unsafe { env::set_var("TMPDIR", value) },
        None => unsafe { env::remove_var("TMPDIR") },
    }

    assert!(matches!(result, Err(InstallError::Staging(_))));
    assert!(executor.scripts().is_empty());
}

#[tokio::test]
async fn declined_elevation_reports_failure_with_output() {
    let _guard = env_lock();
    let executor = Arc::new(RecordingExecutor::with_output(CommandOutput::failure(
        1,
        "execution error: User canceled. (-128)",
    )));
    let h = harness(executor.clone());

    let err = h
        .engine
        .installer()
        .try_install(&ServiceId::ALL, LoadMode::Load)
        .await
        .unwrap_err();
    match err {
        InstallError::Privileged { stderr, .. } => assert!(stderr.contains("(-128)")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.scripts().len(), 1);
    assert!(executor.executions()[0].prompt.contains("KeyPath"));
}
