//! Single-process implementations of the repository ports.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::model::{
    ChildUpgradeReport, Connectivity, Device, DeviceUpgradeStatus, Task, TaskFilter, TaskPatch,
};
use crate::ports::{DeviceRepository, EventLog, TaskRepository};

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<BTreeMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskStore {
    async fn find_all(&self, filter: &TaskFilter) -> anyhow::Result<Vec<Task>> {
        let mut found: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn insert(&self, task: &Task) -> anyhow::Result<Task> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            bail!("task {} already exists", task.id);
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(task.clone())
    }

    async fn update(&self, patch: &TaskPatch) -> anyhow::Result<Task> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&patch.id)
            .ok_or_else(|| anyhow!("task {} does not exist", patch.id))?;
        task.apply(patch);
        Ok(task.clone())
    }
}

/// Device inventory kept in memory; writers simulate controller updates.
#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<HashMap<String, Device>>,
}

impl MemoryDeviceStore {
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let store = Self::default();
        for device in devices {
            store.upsert(device);
        }
        store
    }

    pub fn upsert(&self, device: Device) {
        self.devices.write().insert(device.id.clone(), device);
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices.read().get(id).cloned()
    }

    /// Apply `f` to the stored device; returns false when it does not exist.
    pub fn modify(&self, id: &str, f: impl FnOnce(&mut Device)) -> bool {
        match self.devices.write().get_mut(id) {
            Some(device) => {
                f(device);
                true
            }
            None => false,
        }
    }

    pub fn set_connectivity(&self, id: &str, connectivity: Connectivity) -> bool {
        self.modify(id, |d| d.connectivity = connectivity)
    }

    pub fn set_firmware_version(&self, id: &str, version: &str) -> bool {
        self.modify(id, |d| d.firmware_version = Some(version.to_string()))
    }

    /// Replace the parent's report for `report.child_id`.
    pub fn report_child_upgrade(&self, parent_id: &str, report: ChildUpgradeReport) -> bool {
        self.modify(parent_id, |parent| {
            parent.child_upgrades.retain(|r| r.child_id != report.child_id);
            parent.child_upgrades.push(report);
        })
    }
}

#[async_trait]
impl DeviceRepository for MemoryDeviceStore {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Device>> {
        Ok(self.get(id))
    }

    async fn list(&self) -> anyhow::Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }
}

/// Ephemeral per-device upgrade projection shared by runtime implementations.
#[derive(Default)]
pub struct UpgradeStatusBoard {
    statuses: RwLock<HashMap<String, DeviceUpgradeStatus>>,
    // parent id -> onu id -> status
    children: RwLock<HashMap<String, BTreeMap<String, DeviceUpgradeStatus>>>,
}

impl UpgradeStatusBoard {
    pub fn get(&self, device_id: &str) -> Option<DeviceUpgradeStatus> {
        self.statuses.read().get(device_id).cloned()
    }

    pub fn set(&self, device_id: &str, status: DeviceUpgradeStatus) {
        self.statuses.write().insert(device_id.to_string(), status);
    }

    pub fn set_child(&self, parent_id: &str, onu_id: &str, status: DeviceUpgradeStatus) {
        self.children
            .write()
            .entry(parent_id.to_string())
            .or_default()
            .insert(onu_id.to_string(), status.clone());
        self.set(onu_id, status);
    }

    pub fn children_of(&self, parent_id: &str) -> BTreeMap<String, DeviceUpgradeStatus> {
        self.children
            .read()
            .get(parent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self, device_id: &str) {
        self.statuses.write().remove(device_id);
        let mut children = self.children.write();
        for onus in children.values_mut() {
            onus.remove(device_id);
        }
        children.retain(|_, onus| !onus.is_empty());
    }

    /// Devices that currently carry a status.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.statuses.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub kind: &'static str,
    pub task: Task,
    pub canceled_by: Option<String>,
}

/// Event log that keeps entries in memory for inspection.
#[derive(Default)]
pub struct RecordingEventLog {
    entries: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventLog {
    pub fn entries(&self) -> Vec<RecordedEvent> {
        self.entries.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.entries.lock().iter().map(|e| e.kind).collect()
    }

    fn record(&self, kind: &'static str, task: &Task, canceled_by: Option<&str>) {
        self.entries.lock().push(RecordedEvent {
            kind,
            task: task.clone(),
            canceled_by: canceled_by.map(str::to_string),
        });
    }
}

impl EventLog for RecordingEventLog {
    fn log_task_enqueued(&self, task: &Task) {
        self.record("enqueued", task, None);
    }

    fn log_task_start(&self, task: &Task, _device: Option<&Device>) {
        self.record("start", task, None);
    }

    fn log_task_complete(&self, task: &Task, _device: Option<&Device>) {
        self.record("complete", task, None);
    }

    fn log_task_fail(&self, task: &Task, _device: Option<&Device>) {
        self.record("fail", task, None);
    }

    fn log_task_cancel(&self, task: &Task, _device: Option<&Device>, user_id: Option<&str>) {
        self.record("cancel", task, user_id);
    }
}
