mod support;

use std::time::Duration;

use chrono::Utc;
use netfleet_core::model::{
    ChildUpgradeReport, ChildUpgradeState, Connectivity, Device, DeviceFamily, FirmwareDescriptor,
    TaskStatus,
};

use support::*;

fn fleet() -> Vec<Device> {
    let mut olt = Device::new("olt-1", "UF-OLT", DeviceFamily::EdgeOs);
    olt.connectivity = Connectivity::Connected;
    let mut onu = Device::new("onu-1", "UF-Nano", DeviceFamily::Onu);
    onu.connectivity = Connectivity::Connected;
    onu.parent_id = Some("olt-1".into());
    onu.firmware_version = Some("v4.0.0".into());
    vec![olt, onu]
}

fn onu_firmware() -> FirmwareDescriptor {
    FirmwareDescriptor::new("4.1.0", "https://cdn.example.net/onu/4.1.0.bin")
}

fn report(status: ChildUpgradeState, error: Option<&str>) -> ChildUpgradeReport {
    ChildUpgradeReport {
        child_id: "onu-1".into(),
        status,
        progress: Some(0.5),
        error: error.map(str::to_string),
        changed_at: Utc::now(),
        firmware_version: None,
        connectivity: None,
    }
}

async fn wait_for_trigger(h: &Harness) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.runtime.onu_triggers.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("onu upgrade was never triggered");
}

#[tokio::test]
async fn finished_child_report_completes_after_verification() {
    let devices = store(fleet());
    let h = Harness::new(devices.clone(), ScriptedRuntime::new(|_, _| Ok(String::new())), fast_profile());

    let task = h.submit("onu-1", onu_firmware(), Some("alice")).await;
    wait_for_trigger(&h).await;
    let (parent, onu, url) = h.runtime.onu_triggers.lock()[0].clone();
    assert_eq!((parent.as_str(), onu.as_str()), ("olt-1", "onu-1"));
    assert_eq!(url, "https://cdn.example.net/onu/4.1.0.bin");

    devices.report_child_upgrade("olt-1", report(ChildUpgradeState::Upgrading, None));
    h.wait_for_status(&task.id, TaskStatus::InProgress).await;
    devices.set_firmware_version("onu-1", "v4.1.0");
    devices.report_child_upgrade("olt-1", report(ChildUpgradeState::Finished, None));
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.progress, 1.0);
    assert_eq!(h.runtime.status("onu-1"), Some(TaskStatus::Success));
    let children = h.runtime.board.children_of("olt-1");
    assert_eq!(children["onu-1"].status, TaskStatus::Success);
}

#[tokio::test]
async fn failed_child_report_uses_the_reported_error() {
    let devices = store(fleet());
    let h = Harness::new(devices.clone(), ScriptedRuntime::new(|_, _| Ok(String::new())), fast_profile());

    let task = h.submit("onu-1", onu_firmware(), None).await;
    wait_for_trigger(&h).await;
    devices.report_child_upgrade(
        "olt-1",
        report(ChildUpgradeState::Failed, Some("Image checksum mismatch")),
    );
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Image checksum mismatch"));
}

#[tokio::test]
async fn failed_child_report_without_error_uses_default_message() {
    let devices = store(fleet());
    let h = Harness::new(devices.clone(), ScriptedRuntime::new(|_, _| Ok(String::new())), fast_profile());

    let task = h.submit("onu-1", onu_firmware(), None).await;
    wait_for_trigger(&h).await;
    devices.report_child_upgrade("olt-1", report(ChildUpgradeState::Failed, None));
    h.settle().await;

    assert_eq!(h.task(&task.id).error.as_deref(), Some("ONU upgrade has failed"));
}

#[tokio::test]
async fn reports_older_than_the_task_are_ignored() {
    let devices = store(fleet());
    let mut stale = report(ChildUpgradeState::Failed, Some("left over from last week"));
    stale.changed_at = Utc::now() - chrono::Duration::hours(1);
    devices.report_child_upgrade("olt-1", stale);
    let h = Harness::new(devices.clone(), ScriptedRuntime::new(|_, _| Ok(String::new())), fast_profile());

    let task = h.submit("onu-1", onu_firmware(), None).await;
    wait_for_trigger(&h).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.task(&task.id).status, TaskStatus::InProgress);

    devices.set_firmware_version("onu-1", "v4.1.0");
    devices.report_child_upgrade("olt-1", report(ChildUpgradeState::Finished, None));
    h.settle().await;
    assert_eq!(h.task(&task.id).status, TaskStatus::Success);
}

#[tokio::test]
async fn onu_version_may_lag_the_finished_report() {
    let devices = store(fleet());
    let h = Harness::new(devices.clone(), ScriptedRuntime::new(|_, _| Ok(String::new())), fast_profile());

    let task = h.submit("onu-1", onu_firmware(), None).await;
    wait_for_trigger(&h).await;
    let mut finished = report(ChildUpgradeState::Finished, None);
    finished.firmware_version = Some("v4.1.0".into());
    devices.report_child_upgrade("olt-1", finished);
    // the ONU record is refreshed after its parent
    tokio::time::sleep(Duration::from_millis(100)).await;
    devices.set_firmware_version("onu-1", "v4.1.0");
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Success, "{:?}", task.error);
}

#[tokio::test]
async fn onu_that_never_reports_the_target_fails_verification() {
    let devices = store(fleet());
    let h = Harness::new(devices.clone(), ScriptedRuntime::new(|_, _| Ok(String::new())), fast_profile());

    let task = h.submit("onu-1", onu_firmware(), None).await;
    wait_for_trigger(&h).await;
    devices.report_child_upgrade("olt-1", report(ChildUpgradeState::Finished, None));
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap_or_default();
    assert!(error.starts_with("Firmware version mismatch"), "{error}");
}

#[tokio::test]
async fn onu_without_parent_fails() {
    let mut orphan = Device::new("onu-9", "UF-Nano", DeviceFamily::Onu);
    orphan.connectivity = Connectivity::Connected;
    let devices = store([orphan]);
    let h = Harness::new(devices, ScriptedRuntime::new(|_, _| Ok(String::new())), fast_profile());

    let task = h.submit("onu-9", onu_firmware(), None).await;
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("ONU onu-9 has no parent device"));
}
