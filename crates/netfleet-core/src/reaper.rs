//! Clears device upgrade statuses that no live task backs.
//!
//! A status can outlive its task when the process dies between the task's
//! terminal write and the worker's final device update, or when a task record
//! was removed out of band.

use std::collections::HashSet;
use std::sync::Arc;

use crate::model::TaskFilter;
use crate::ports::{DeviceRepository, DeviceRuntime, TaskRepository};

pub struct StatusReaper {
    tasks: Arc<dyn TaskRepository>,
    devices: Arc<dyn DeviceRepository>,
    runtime: Arc<dyn DeviceRuntime>,
}

impl StatusReaper {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        devices: Arc<dyn DeviceRepository>,
        runtime: Arc<dyn DeviceRuntime>,
    ) -> Self {
        Self {
            tasks,
            devices,
            runtime,
        }
    }

    /// One sweep; returns the ids of devices whose status was cleared.
    ///
    /// Statuses are read before the live tasks, so a task admitted mid-sweep
    /// cannot lose the status it just wrote.
    pub async fn sweep_once(&self) -> anyhow::Result<Vec<String>> {
        let mut candidates = Vec::new();
        for device in self.devices.list().await? {
            match self.runtime.upgrade_status(&device.id) {
                Some(status) if status.is_live() => candidates.push((device.id, status)),
                _ => {}
            }
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let live: HashSet<String> = self
            .tasks
            .find_all(&TaskFilter::live())
            .await?
            .iter()
            .map(|t| t.device_id().to_string())
            .collect();

        let mut cleared = Vec::new();
        for (device_id, status) in candidates {
            if live.contains(&device_id) {
                continue;
            }
            // rewritten since the snapshot
            if self.runtime.upgrade_status(&device_id).as_ref() != Some(&status) {
                continue;
            }
            self.runtime.clear_upgrade_status(&device_id);
            tracing::info!(%device_id, status = %status.status, "cleared stale upgrade status");
            cleared.push(device_id);
        }
        Ok(cleared)
    }
}
