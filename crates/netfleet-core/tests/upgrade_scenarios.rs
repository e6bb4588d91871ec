mod support;

use std::time::Duration;

use netfleet_core::model::{Connectivity, TaskStatus};
use netfleet_core::ports::CommandError;
use netfleet_core::upgrade::ProfileOverride;

use support::*;

fn lifecycle_kinds(h: &Harness) -> Vec<&'static str> {
    h.events
        .kinds()
        .into_iter()
        .filter(|k| *k != "enqueued")
        .collect()
}

#[tokio::test]
async fn upgrade_failed_marker_fails_the_task() {
    let devices = store([router("2.0.9")]);
    let runtime = ScriptedRuntime::new(|_, command| {
        if is_log_read(command) {
            Ok("Downloading...\n*UPGRADE FAILED*\n".to_string())
        } else {
            Ok(String::new())
        }
    });
    let h = Harness::new(devices, runtime, fast_profile());

    let task = h.submit("dev-1", target(), Some("alice")).await;
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Device upgrade has failed"));
    assert!(task.end_time.is_some());
    assert_eq!(h.runtime.status("dev-1"), Some(TaskStatus::Failed));
    assert_eq!(
        h.runtime.board.get("dev-1").unwrap().error.as_deref(),
        Some("Device upgrade has failed")
    );
    assert_eq!(h.runtime.log_reads(), 1, "markers are never retried");
    assert_eq!(lifecycle_kinds(&h), vec!["start", "fail"]);
}

#[tokio::test]
async fn clean_reboot_with_target_version_succeeds() {
    let devices = store([router("2.0.9")]);
    let runtime = reboot_after_reads(devices.clone(), 3);
    let h = Harness::new(devices.clone(), runtime, fast_profile());
    simulate_reboot(devices.clone(), "dev-1", "EdgeRouter.ER-e50.v2.1.0.5580000", Duration::from_millis(40));

    let task = h.submit("dev-1", target(), None).await;
    let sampler = {
        let tasks = h.tasks.clone();
        let id = task.id.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let t = tasks.get(&id).unwrap();
                seen.push(t.progress);
                if t.status.is_terminal() {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };
    h.settle().await;
    let progress = sampler.await.unwrap();

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.progress, 1.0);
    assert!(task.error.is_none());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(h.runtime.status("dev-1"), Some(TaskStatus::Success));

    let commands = h.runtime.commands.lock().clone();
    let launch = &commands[0].1;
    assert!(is_launch(launch));
    assert!(launch.contains("'https://fw.example.net/firmwares/er-x/2.1.0.tar'"));
    assert_eq!(lifecycle_kinds(&h), vec!["start", "complete"]);
}

#[tokio::test]
async fn version_mismatch_after_reconnect_fails() {
    let devices = store([router("2.0.9")]);
    let runtime = reboot_after_reads(devices.clone(), 2);
    let h = Harness::new(devices.clone(), runtime, fast_profile());
    simulate_reboot(devices.clone(), "dev-1", "v2.0.9", Duration::from_millis(20));

    let task = h.submit("dev-1", target(), None).await;
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert!(error.contains("2.1.0") && error.contains("2.0.9"), "{error}");
    assert_eq!(h.runtime.status("dev-1"), Some(TaskStatus::Failed));
}

#[tokio::test]
async fn device_that_never_reconnects_times_out() {
    let devices = store([router("2.0.9")]);
    let runtime = reboot_after_reads(devices.clone(), 2);
    let h = Harness::new(devices.clone(), runtime, fast_profile());

    let task = h.submit("dev-1", target(), None).await;
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Waiting for device to connect timeout"));
    assert_eq!(h.runtime.status("dev-1"), Some(TaskStatus::Failed));
}

#[tokio::test]
async fn canceling_a_running_upgrade_records_the_user() {
    let devices = store([router("2.0.9")]);
    let runtime = ScriptedRuntime::new(|_, _| Ok(String::new()));
    let profile = ProfileOverride {
        timeout: Some(Duration::from_secs(30)),
        ..fast_profile()
    };
    let h = Harness::new(devices, runtime, profile);

    let task = h.submit("dev-1", target(), Some("alice")).await;
    h.wait_for_status(&task.id, TaskStatus::InProgress).await;
    assert_eq!(h.runtime.status("dev-1"), Some(TaskStatus::InProgress));

    let canceled = h.manager.cancel_task(&task, Some("bob")).await.unwrap();
    h.settle().await;

    assert_eq!(canceled.status, TaskStatus::Canceled);
    let stored = h.task(&task.id);
    assert_eq!(stored.status, TaskStatus::Canceled);
    assert_eq!(stored.user_id.as_deref(), Some("bob"));
    assert!(stored.end_time.is_some());
    assert_eq!(h.runtime.status("dev-1"), Some(TaskStatus::Canceled));

    let cancel = h
        .events
        .entries()
        .into_iter()
        .find(|e| e.kind == "cancel")
        .unwrap();
    assert_eq!(cancel.canceled_by.as_deref(), Some("bob"));
    assert!(!lifecycle_kinds(&h).contains(&"fail"));
}

#[tokio::test]
async fn poll_stage_has_a_hard_timeout() {
    let devices = store([router("2.0.9")]);
    let runtime = ScriptedRuntime::new(|_, _| Ok(String::new()));
    let profile = ProfileOverride {
        timeout: Some(Duration::from_millis(150)),
        ..fast_profile()
    };
    let h = Harness::new(devices, runtime, profile);

    let task = h.submit("dev-1", target(), None).await;
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Device upgrade timeout"));
}

#[tokio::test]
async fn losing_the_channel_counts_as_the_device_dropping_off() {
    let devices = store([router("2.1.0")]);
    let runtime = ScriptedRuntime::new(|_, command| {
        if is_log_read(command) {
            Err(CommandError::Channel("connection reset".into()))
        } else {
            Ok(String::new())
        }
    });
    let h = Harness::new(devices, runtime, fast_profile());

    let task = h.submit("dev-1", target(), None).await;
    h.settle().await;

    assert_eq!(h.task(&task.id).status, TaskStatus::Success);
    assert_eq!(h.runtime.log_reads(), 4);
}

#[tokio::test]
async fn lost_channel_waits_for_the_repository_to_see_the_reboot() {
    let devices = store([router("2.0.9")]);
    let runtime = ScriptedRuntime::new(|_, command| {
        if is_log_read(command) {
            Err(CommandError::Channel("connection reset".into()))
        } else {
            Ok(String::new())
        }
    });
    let h = Harness::new(devices.clone(), runtime, fast_profile());
    simulate_reboot(devices.clone(), "dev-1", "2.1.0", Duration::from_millis(100));

    let task = h.submit("dev-1", target(), None).await;
    // the inventory notices the reboot well after the channel dropped
    let lagging = devices.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        lagging.set_connectivity("dev-1", Connectivity::Disconnected);
    });
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Success, "{:?}", task.error);
    assert_eq!(h.runtime.log_reads(), 4);
}

#[tokio::test]
async fn launch_retries_transient_channel_errors_only() {
    let devices = store([router("2.0.9")]);
    let mut launches = 0;
    let runtime = ScriptedRuntime::new(move |_, command| {
        if is_launch(command) {
            launches += 1;
            if launches < 3 {
                return Err(CommandError::Channel("timeout".into()));
            }
            return Ok(String::new());
        }
        Ok("*DOWNLOAD FAILED*\n".to_string())
    });
    let h = Harness::new(devices, runtime, fast_profile());

    let task = h.submit("dev-1", target(), None).await;
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.error.as_deref(), Some("Firmware download has failed"));
    let launched = h
        .runtime
        .commands
        .lock()
        .iter()
        .filter(|(_, c)| is_launch(c))
        .count();
    assert_eq!(launched, 3);
}

#[tokio::test]
async fn remote_launch_failure_is_terminal() {
    let devices = store([router("2.0.9")]);
    let runtime = ScriptedRuntime::new(|_, _| {
        Err(CommandError::Remote {
            status: 127,
            output: "sh: not found".into(),
        })
    });
    let h = Harness::new(devices, runtime, fast_profile());

    let task = h.submit("dev-1", target(), None).await;
    h.settle().await;

    let task = h.task(&task.id);
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .error
        .unwrap()
        .starts_with("Failed to start device upgrade"));
    assert_eq!(h.runtime.commands.lock().len(), 1);
}

#[tokio::test]
async fn already_running_upgrade_is_reported() {
    let devices = store([router("2.0.9")]);
    let runtime = ScriptedRuntime::new(|_, command| {
        if is_log_read(command) {
            Ok("*ALREADY IN PROGRESS*\n".to_string())
        } else {
            Ok(String::new())
        }
    });
    let h = Harness::new(devices.clone(), runtime, fast_profile());

    let task = h.submit("dev-1", target(), None).await;
    h.settle().await;

    assert_eq!(
        h.task(&task.id).error.as_deref(),
        Some("Device upgrade is already in progress")
    );
    assert_eq!(
        devices.get("dev-1").unwrap().connectivity,
        Connectivity::Connected
    );
}
