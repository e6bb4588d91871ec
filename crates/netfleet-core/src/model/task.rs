use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::device::DeviceSnapshot;
use super::firmware::FirmwareDescriptor;

/// Durable lifecycle state of a task.
///
/// Allowed transitions: `Queued -> InProgress -> {Success, Failed, Canceled}`
/// and `Queued -> Canceled`. The same set of values doubles as the device-side
/// upgrade projection (see [`super::DeviceUpgradeStatus`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Success,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub const LIVE: [TaskStatus; 2] = [TaskStatus::Queued, TaskStatus::InProgress];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "inProgress",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Queued or in progress.
    pub fn is_live(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::InProgress)
                | (TaskStatus::Queued, TaskStatus::Canceled)
                | (TaskStatus::InProgress, TaskStatus::Success)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Canceled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "inProgress" => Ok(TaskStatus::InProgress),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            other => Err(UnknownVariant::new("task status", other)),
        }
    }
}

/// Task type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    FirmwareUpgrade,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::FirmwareUpgrade => "firmwareUpgrade",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firmwareUpgrade" => Ok(TaskKind::FirmwareUpgrade),
            other => Err(UnknownVariant::new("task kind", other)),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct UnknownVariant {
    what: &'static str,
    value: String,
}

impl UnknownVariant {
    pub(crate) fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Work item carried by a firmware upgrade task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradePayload {
    pub device: DeviceSnapshot,
    pub firmware: FirmwareDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum TaskPayload {
    FirmwareUpgrade(UpgradePayload),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::FirmwareUpgrade(_) => TaskKind::FirmwareUpgrade,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            TaskPayload::FirmwareUpgrade(p) => &p.device.id,
        }
    }
}

/// A durable unit of orchestrated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    /// Fraction in [0, 1]; exactly 1.0 once the task succeeded.
    pub progress: f64,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Who initiated the task; `None` for system-triggered work.
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(payload: TaskPayload, user_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: payload.kind(),
            status: TaskStatus::Queued,
            payload,
            progress: 0.0,
            error: None,
            start_time: None,
            end_time: None,
            user_id,
            created_at: Utc::now(),
        }
    }

    pub fn firmware_upgrade(
        device: DeviceSnapshot,
        firmware: FirmwareDescriptor,
        user_id: Option<String>,
    ) -> Self {
        Self::new(
            TaskPayload::FirmwareUpgrade(UpgradePayload { device, firmware }),
            user_id,
        )
    }

    pub fn device_id(&self) -> &str {
        self.payload.device_id()
    }

    /// Merge a partial update into this record.
    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
        if let Some(start) = patch.start_time {
            self.start_time = Some(start);
        }
        if let Some(end) = patch.end_time {
            self.end_time = Some(end);
        }
        if let Some(user) = &patch.user_id {
            self.user_id = Some(user.clone());
        }
    }
}

/// Partial task update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub id: String,
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
}

impl TaskPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// Query filter for task lookups; empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub ids: Option<Vec<String>>,
    pub statuses: Option<Vec<TaskStatus>>,
    pub kind: Option<TaskKind>,
    pub device_id: Option<String>,
}

impl TaskFilter {
    pub fn live() -> Self {
        Self {
            statuses: Some(TaskStatus::LIVE.to_vec()),
            ..Self::default()
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            ids: Some(vec![id.into()]),
            ..Self::default()
        }
    }

    pub fn with_statuses(statuses: &[TaskStatus]) -> Self {
        Self {
            statuses: Some(statuses.to_vec()),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &task.id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if task.kind != kind {
                return false;
            }
        }
        if let Some(device_id) = &self.device_id {
            if task.device_id() != device_id {
                return false;
            }
        }
        true
    }
}
