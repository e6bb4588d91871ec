mod support;

use std::sync::Arc;

use async_trait::async_trait;
use netfleet_core::memory::MemoryTaskStore;
use netfleet_core::model::{
    Connectivity, Device, DeviceFamily, DeviceUpgradeStatus, Task, TaskFilter, TaskPatch,
    TaskStatus,
};
use netfleet_core::ports::{DeviceRuntime, TaskRepository};
use netfleet_core::StatusReaper;

use support::*;

#[tokio::test]
async fn orphaned_live_statuses_are_cleared() {
    let devices = store(["dev-1", "dev-2", "dev-3", "dev-4"].map(|id| {
        let mut d = Device::new(id, "ER-X", DeviceFamily::EdgeOs);
        d.connectivity = Connectivity::Connected;
        d
    }));
    let runtime = Arc::new(ScriptedRuntime::new(|_, _| Ok(String::new())));
    let tasks = Arc::new(MemoryTaskStore::default());
    let fw = target();

    // dev-1: stuck in progress after a crash, no task
    runtime.board.set("dev-1", DeviceUpgradeStatus::in_progress(&fw, 300_000));
    // dev-2: queued and backed by a live task
    runtime.board.set("dev-2", DeviceUpgradeStatus::queued(&fw));
    let live = Task::firmware_upgrade(devices.get("dev-2").unwrap().snapshot(), fw.clone(), None);
    tasks.insert(&live).await.unwrap();
    // dev-3: terminal statuses stay for display
    runtime.board.set("dev-3", DeviceUpgradeStatus::success(&fw, 300_000));
    // dev-4: queued, but its task already finished
    runtime.board.set("dev-4", DeviceUpgradeStatus::queued(&fw));
    let mut done = Task::firmware_upgrade(devices.get("dev-4").unwrap().snapshot(), fw.clone(), None);
    done.status = TaskStatus::Canceled;
    tasks.insert(&done).await.unwrap();

    let reaper = StatusReaper::new(tasks, devices, runtime.clone());
    let cleared = reaper.sweep_once().await.unwrap();

    assert_eq!(cleared, vec!["dev-1".to_string(), "dev-4".to_string()]);
    assert!(runtime.board.get("dev-1").is_none());
    assert!(runtime.board.get("dev-4").is_none());
    assert_eq!(runtime.status("dev-2"), Some(TaskStatus::Queued));
    assert_eq!(runtime.status("dev-3"), Some(TaskStatus::Success));

    assert!(reaper.sweep_once().await.unwrap().is_empty());
}

/// Task store that admits a task for `dev-1` right after answering a query.
struct AdmitsDuringQuery {
    inner: MemoryTaskStore,
    runtime: Arc<ScriptedRuntime>,
    admit: Task,
}

#[async_trait]
impl TaskRepository for AdmitsDuringQuery {
    async fn find_all(&self, filter: &TaskFilter) -> anyhow::Result<Vec<Task>> {
        let found = self.inner.find_all(filter).await?;
        self.inner.insert(&self.admit).await?;
        self.runtime
            .update_upgrade_status("dev-1", DeviceUpgradeStatus::queued(&target()));
        Ok(found)
    }

    async fn insert(&self, task: &Task) -> anyhow::Result<Task> {
        self.inner.insert(task).await
    }

    async fn update(&self, patch: &TaskPatch) -> anyhow::Result<Task> {
        self.inner.update(patch).await
    }
}

#[tokio::test]
async fn statuses_written_during_a_sweep_survive() {
    let devices = store([router("2.0.9")]);
    let runtime = Arc::new(ScriptedRuntime::new(|_, _| Ok(String::new())));
    // a stale in-progress entry makes the sweep query the task store
    runtime
        .board
        .set("dev-1", DeviceUpgradeStatus::in_progress(&target(), 300_000));
    let admit = Task::firmware_upgrade(devices.get("dev-1").unwrap().snapshot(), target(), None);
    let tasks = Arc::new(AdmitsDuringQuery {
        inner: MemoryTaskStore::default(),
        runtime: runtime.clone(),
        admit,
    });

    let reaper = StatusReaper::new(tasks, devices, runtime.clone());
    assert!(reaper.sweep_once().await.unwrap().is_empty());
    assert_eq!(runtime.status("dev-1"), Some(TaskStatus::Queued));
}
