#[path = "common/mod.rs"]
mod common;

use std::{sync::Arc, time::Duration};

use common::{STARTING, exited, harness, running, set_all_healthy};
use keypath_lifecycle::{
    command::CommandOutput,
    descriptor::ServiceId,
    status::{OverallHealth, ServicePhase},
    test_utils::RecordingExecutor,
};

#[tokio::test]
async fn warmup_window_suppresses_then_expires() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    h.runner.service_status(ServiceId::Kanata, STARTING);
    let monitor = h.engine.monitor();

    monitor.mark_restarted(&[ServiceId::Kanata]);
    h.clock.advance(Duration::from_millis(500));
    let status = monitor.status(ServiceId::Kanata).await;
    assert!(status.healthy);
    assert!(status.warming_up);
    assert_eq!(status.phase, ServicePhase::Starting);

    h.clock.advance(Duration::from_secs(3));
    let status = monitor.status(ServiceId::Kanata).await;
    assert!(!status.healthy);
    assert!(!status.warming_up);
    assert_eq!(status.phase, ServicePhase::Unhealthy);
}

#[tokio::test]
async fn classification_is_deterministic_for_identical_input() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    h.runner.service_status(ServiceId::VhidDaemon, &exited(1));

    let first = h.engine.monitor().status(ServiceId::VhidDaemon).await;
    let second = h.engine.monitor().status(ServiceId::VhidDaemon).await;
    assert_eq!(first, second);
    assert!(first.loaded);
    assert!(!first.healthy);
    assert_eq!(first.last_exit_code, Some(1));
}

#[tokio::test]
async fn run_once_manager_is_healthy_after_clean_exit_only() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    h.runner.service_status(ServiceId::VhidManager, &exited(0));
    assert!(h.engine.monitor().status(ServiceId::VhidManager).await.healthy);

    h.runner.service_status(ServiceId::VhidManager, &exited(78));
    let status = h.engine.monitor().status(ServiceId::VhidManager).await;
    assert!(!status.healthy);
    assert_eq!(status.phase, ServicePhase::Unhealthy);

    h.runner.service_status(ServiceId::Kanata, &exited(0));
    assert!(!h.engine.monitor().status(ServiceId::Kanata).await.healthy);
}

#[tokio::test]
async fn unregistered_service_is_unloaded_not_unhealthy() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    h.runner.respond(
        "launchctl print system/com.keypath.kanata",
        CommandOutput::failure(113, "Could not find service \"com.keypath.kanata\" in domain for system"),
    );

    let snapshot = h.engine.get_service_status().await;
    let kanata = snapshot.get(ServiceId::Kanata).unwrap();
    assert!(!kanata.loaded);
    assert!(!kanata.healthy);
    assert_eq!(kanata.phase, ServicePhase::Unloaded);
    assert_eq!(snapshot.overall_health, OverallHealth::Failing);
    assert_eq!(snapshot.unloaded(), ServiceId::ALL.to_vec());
}

#[tokio::test]
async fn snapshot_reports_healthy_and_degraded() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    set_all_healthy(&h.runner);
    let snapshot = h.engine.get_service_status().await;
    assert!(snapshot.all_healthy());
    assert_eq!(snapshot.overall_health, OverallHealth::Healthy);

    h.runner.service_status(ServiceId::VhidDaemon, STARTING);
    h.engine.monitor().mark_restarted(&[ServiceId::VhidDaemon]);
    let snapshot = h.engine.get_service_status().await;
    assert!(snapshot.all_healthy());
    assert_eq!(snapshot.overall_health, OverallHealth::Degraded);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["overall_health"], "degraded");
    assert_eq!(json["services"][1]["phase"], "starting");
}

#[tokio::test]
async fn wait_until_healthy_exits_early_on_recovery() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    h.runner.respond_sequence(
        "launchctl print system/com.keypath.kanata",
        vec![
            CommandOutput::success(STARTING),
            CommandOutput::success(STARTING),
            CommandOutput::success(running(9)),
        ],
    );

    let recovered = h
        .engine
        .monitor()
        .wait_until_healthy(&[ServiceId::Kanata], Duration::from_secs(5), Duration::from_millis(10))
        .await;
    assert!(recovered);
    assert_eq!(h.runner.count("launchctl print system/com.keypath.kanata"), 3);
}

#[tokio::test]
async fn wait_until_healthy_ignores_warmup_grace_and_times_out() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    h.runner.service_status(ServiceId::Kanata, STARTING);
    h.engine.monitor().mark_restarted(&[ServiceId::Kanata]);

    let started = tokio::time::Instant::now();
    let recovered = h
        .engine
        .monitor()
        .wait_until_healthy(&[ServiceId::Kanata], Duration::from_millis(100), Duration::from_millis(20))
        .await;
    assert!(!recovered);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn list_dialect_is_understood() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    h.runner.service_status(
        ServiceId::VhidDaemon,
        "{\n\t\"LimitLoadToSessionType\" = \"System\";\n\t\"Label\" = \"com.keypath.karabiner-vhiddaemon\";\n\t\"PID\" = 412;\n\t\"LastExitStatus\" = 0;\n};\n",
    );

    let status = h.engine.monitor().status(ServiceId::VhidDaemon).await;
    assert_eq!(status.pid, Some(412));
    assert!(status.healthy);
    assert_eq!(status.phase, ServicePhase::Healthy);
}
