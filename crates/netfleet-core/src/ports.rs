//! Contracts for the collaborators the engine consumes.
//!
//! Repositories, the device command channel, firmware metadata, settings and the
//! audit log all sit behind these traits; `memory` provides single-process
//! implementations and `netfleet-kernel` the SQLite-backed ones.

use async_trait::async_trait;
use url::Url;

use crate::model::{
    Device, DeviceSnapshot, DeviceUpgradeStatus, FirmwareDescriptor, Task, TaskFilter, TaskPatch,
};

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn find_all(&self, filter: &TaskFilter) -> anyhow::Result<Vec<Task>>;
    /// Persist a new task record.
    async fn insert(&self, task: &Task) -> anyhow::Result<Task>;
    /// Merge a partial update into the record with `patch.id`; returns the stored task.
    async fn update(&self, patch: &TaskPatch) -> anyhow::Result<Task>;
}

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Device>>;
    async fn list(&self) -> anyhow::Result<Vec<Device>>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    /// Transport-level failure (dropped session, refused connection); retryable.
    #[error("channel error: {0}")]
    Channel(String),
    /// The command ran and reported failure.
    #[error("command exited with status {status}: {output}")]
    Remote { status: i32, output: String },
    /// No live handle for the device.
    #[error("device {0} is not available")]
    Unavailable(String),
}

impl CommandError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CommandError::Channel(_))
    }
}

/// Live device operations plus the in-memory upgrade status projection.
#[async_trait]
pub trait DeviceRuntime: Send + Sync {
    /// Run a shell command on the device and return its standard output.
    async fn run_command(&self, device_id: &str, command: &str) -> Result<String, CommandError>;

    /// Ask an aggregation device to upgrade one of its ONUs.
    async fn upgrade_onu(
        &self,
        parent_id: &str,
        onu_id: &str,
        firmware_url: &str,
    ) -> Result<(), CommandError>;

    fn upgrade_status(&self, device_id: &str) -> Option<DeviceUpgradeStatus>;

    fn update_upgrade_status(&self, device_id: &str, status: DeviceUpgradeStatus);

    /// ONU statuses are attached to the parent's record as well as the ONU's own.
    fn update_onu_upgrade_status(&self, parent_id: &str, onu_id: &str, status: DeviceUpgradeStatus);

    fn clear_upgrade_status(&self, device_id: &str);
}

#[async_trait]
pub trait FirmwareLookup: Send + Sync {
    async fn resolve(&self, model: &str, version: &str)
        -> anyhow::Result<Option<FirmwareDescriptor>>;
}

/// Fire-and-forget audit sink. Implementations must never block or fail the caller.
pub trait EventLog: Send + Sync {
    fn log_task_enqueued(&self, task: &Task);
    fn log_task_start(&self, task: &Task, device: Option<&Device>);
    fn log_task_complete(&self, task: &Task, device: Option<&Device>);
    fn log_task_fail(&self, task: &Task, device: Option<&Device>);
    fn log_task_cancel(&self, task: &Task, device: Option<&Device>, user_id: Option<&str>);
}

pub trait SettingsProvider: Send + Sync {
    /// Base URL the device can reach firmware images under.
    fn firmware_base_url(&self, device: &DeviceSnapshot) -> Option<Url>;
}
