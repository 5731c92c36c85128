#[path = "common/mod.rs"]
mod common;

use std::{fs, sync::Arc};

use common::{harness, harness_with_config, pgrep};
use keypath_lifecycle::{
    command::CommandOutput,
    conflict::{SystemConflict, deduplicate},
    privilege::PrivilegedExecutor,
    test_utils::RecordingExecutor,
};

#[tokio::test]
async fn own_managed_instance_is_not_a_conflict() {
    let h = harness_with_config(
        |config| config.config_path = "/keypath/keypath.kbd".into(),
        |_| Arc::new(RecordingExecutor::default()) as Arc<dyn PrivilegedExecutor>,
    );
    pgrep(&h.runner, "kanata", "1234 /usr/bin/kanata --cfg /keypath/keypath.kbd\n");

    let result = h.engine.detect_conflicts().await;
    assert!(result.is_clear(), "unexpected conflicts: {:?}", result.conflicts);
    assert!(!result.can_auto_resolve);
}

#[tokio::test]
async fn duplicate_pid_rows_collapse_to_one_conflict() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    pgrep(
        &h.runner,
        "karabiner_grabber",
        "10 /Library/Application Support/org.pqrs/Karabiner-Elements/bin/karabiner_grabber\n\
         10 karabiner_grabber --respawned\n",
    );

    let result = h.engine.detect_conflicts().await;
    assert_eq!(result.conflicts, vec![SystemConflict::GrabberRunning { pid: 10 }]);
    assert!(result.can_auto_resolve);
    assert_eq!(result.pids(), vec![10]);
}

#[tokio::test]
async fn passes_run_in_fixed_order_and_first_classification_wins() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    pgrep(&h.runner, "kanata", "55 /opt/kanata --cfg /tmp/other.kbd\n");
    pgrep(&h.runner, "karabiner_grabber", "77 /usr/local/bin/karabiner_grabber\n");
    pgrep(
        &h.runner,
        "Karabiner-VirtualHIDDevice",
        "77 /usr/local/bin/karabiner_grabber --vhid Karabiner-VirtualHIDDevice-Daemon\n\
         88 /Applications/.Karabiner-VirtualHIDDevice-Manager.app/Contents/MacOS/Karabiner-VirtualHIDDevice-Manager activate\n",
    );

    let result = h.engine.detect_conflicts().await;
    assert_eq!(
        result.conflicts,
        vec![
            SystemConflict::ProcessRunning {
                pid: 55,
                command: "/opt/kanata --cfg /tmp/other.kbd".into(),
            },
            SystemConflict::GrabberRunning { pid: 77 },
            SystemConflict::VirtualHidDeviceRunning {
                pid: 88,
                process_name: "Karabiner-VirtualHIDDevice-Manager".into(),
            },
        ]
    );

    let calls = h.runner.calls();
    let order: Vec<&str> = calls.iter().map(String::as_str).collect();
    assert_eq!(
        order,
        vec![
            "pgrep -fl kanata",
            "pgrep -fl karabiner_grabber",
            "pgrep -fl Karabiner-VirtualHIDDevice",
        ]
    );
}

#[tokio::test]
async fn disabled_marker_suppresses_grabber_and_vhid_scans() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    fs::write(h.path("grabber-disabled"), "").unwrap();
    pgrep(&h.runner, "karabiner_grabber", "10 karabiner_grabber\n");

    let result = h.engine.detect_conflicts().await;
    assert!(result.is_clear());
    assert_eq!(h.runner.count("pgrep -fl karabiner_grabber"), 0);
    assert_eq!(h.runner.count("pgrep -fl Karabiner-VirtualHIDDevice"), 0);
    assert_eq!(h.runner.count("pgrep -fl kanata"), 1);
}

#[tokio::test]
async fn scanner_own_invocation_yields_nothing() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    pgrep(&h.runner, "kanata", "4242 pgrep -fl kanata\n");

    assert!(h.engine.detect_conflicts().await.is_clear());
}

#[tokio::test]
async fn tool_errors_degrade_to_empty_result() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    h.runner.respond(
        "pgrep -fl kanata",
        CommandOutput::failure(3, "pgrep: invalid option"),
    );

    let result = h.engine.detect_conflicts().await;
    assert!(result.is_clear());
    assert_eq!(result.summary, "No conflicts detected");
}

#[tokio::test]
async fn exclusive_device_access_blocks_auto_resolution() {
    let h = harness(Arc::new(RecordingExecutor::default()));
    fs::write(
        h.path("kanata.log"),
        "[INFO] entering the event loop\n\
         [ERROR] IOHIDDeviceOpen error: exclusive access and device already open device: \"Keychron K2\"\n",
    )
    .unwrap();
    pgrep(&h.runner, "karabiner_grabber", "31 karabiner_grabber\n");

    let result = h.engine.detect_conflicts().await;
    assert_eq!(
        result.conflicts.last(),
        Some(&SystemConflict::ExclusiveDeviceAccess {
            device: "Keychron K2".into(),
        })
    );
    assert!(!result.can_auto_resolve);

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["conflicts"][0]["kind"], "grabber_running");
    assert_eq!(json["conflicts"][1]["kind"], "exclusive_device_access");
}

#[test]
fn deduplicate_properties_hold_for_mixed_input() {
    let input = vec![
        SystemConflict::VirtualHidDaemonRunning { pid: 5 },
        SystemConflict::ExclusiveDeviceAccess { device: "a".into() },
        SystemConflict::GrabberRunning { pid: 5 },
        SystemConflict::ProcessRunning {
            pid: 6,
            command: "kanata".into(),
        },
        SystemConflict::ExclusiveDeviceAccess { device: "b".into() },
        SystemConflict::VirtualHidDeviceRunning {
            pid: 6,
            process_name: "x".into(),
        },
    ];
    let output = deduplicate(input.clone());

    assert!(output.len() <= input.len());
    let mut pids: Vec<u32> = output.iter().filter_map(SystemConflict::pid).collect();
    let before = pids.len();
    pids.dedup();
    assert_eq!(pids.len(), before);
    assert_eq!(
        output,
        vec![
            input[0].clone(),
            input[1].clone(),
            input[3].clone(),
            input[4].clone(),
        ]
    );
}
