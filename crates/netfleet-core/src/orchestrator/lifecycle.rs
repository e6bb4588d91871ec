use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::model::{Device, Task, TaskFilter, TaskPatch, TaskStatus};
use crate::ports::{DeviceRepository, EventLog, TaskRepository};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {id} is {status}; progress is only recorded while in progress")]
    NotInProgress { id: String, status: TaskStatus },
    #[error("no queue accepts task {id} ({kind})")]
    Unroutable { id: String, kind: String },
    #[error(transparent)]
    Queue(#[from] super::queue::QueueError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Status reporting surface handed to workers.
#[async_trait]
pub trait TaskReporter: Send + Sync {
    async fn start_task(&self, task_id: &str) -> Result<Task, TaskError>;
    async fn update_progress(&self, task_id: &str, progress: f64) -> Result<Task, TaskError>;
    async fn complete_task(&self, task_id: &str) -> Result<Task, TaskError>;
    async fn fail_task(&self, task_id: &str, error: &str) -> Result<Task, TaskError>;
}

/// Durable task transitions plus their audit entries.
///
/// Every write checks the stored status first; writes are serialized so a
/// late worker report cannot overwrite a concurrent cancel.
pub struct TaskLifecycle {
    tasks: Arc<dyn TaskRepository>,
    devices: Arc<dyn DeviceRepository>,
    events: Arc<dyn EventLog>,
    writes: Mutex<()>,
}

impl TaskLifecycle {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        devices: Arc<dyn DeviceRepository>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            tasks,
            devices,
            events,
            writes: Mutex::new(()),
        }
    }

    pub fn tasks(&self) -> &Arc<dyn TaskRepository> {
        &self.tasks
    }

    pub fn events(&self) -> &Arc<dyn EventLog> {
        &self.events
    }

    pub async fn load(&self, task_id: &str) -> Result<Task, TaskError> {
        self.tasks
            .find_all(&TaskFilter::by_id(task_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    async fn device_for(&self, task: &Task) -> Option<Device> {
        match self.devices.find_by_id(task.device_id()).await {
            Ok(device) => device,
            Err(err) => {
                tracing::debug!(task_id = %task.id, error = %err, "device lookup for audit failed");
                None
            }
        }
    }

    async fn transition(&self, task_id: &str, patch: TaskPatch) -> Result<Task, TaskError> {
        let Some(next) = patch.status else {
            return Err(TaskError::Store(anyhow::anyhow!(
                "transition for {task_id} without a target status"
            )));
        };
        let current = self.load(task_id).await?;
        if !current.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                id: task_id.to_string(),
                from: current.status,
                to: next,
            });
        }
        Ok(self.tasks.update(&patch).await?)
    }

    pub async fn start(&self, task_id: &str) -> Result<Task, TaskError> {
        let task = {
            let _guard = self.writes.lock().await;
            let patch = TaskPatch::new(task_id)
                .status(TaskStatus::InProgress)
                .progress(0.0)
                .started_at(Utc::now());
            self.transition(task_id, patch).await?
        };
        let device = self.device_for(&task).await;
        self.events.log_task_start(&task, device.as_ref());
        Ok(task)
    }

    /// Record progress; values are clamped to [0, 1] and never move backwards.
    pub async fn update_progress(&self, task_id: &str, progress: f64) -> Result<Task, TaskError> {
        let _guard = self.writes.lock().await;
        let current = self.load(task_id).await?;
        if current.status != TaskStatus::InProgress {
            return Err(TaskError::NotInProgress {
                id: task_id.to_string(),
                status: current.status,
            });
        }
        if progress.is_nan() {
            return Ok(current);
        }
        let next = progress.clamp(0.0, 1.0).max(current.progress);
        if next <= current.progress {
            return Ok(current);
        }
        Ok(self
            .tasks
            .update(&TaskPatch::new(task_id).progress(next))
            .await?)
    }

    pub async fn complete(&self, task_id: &str) -> Result<Task, TaskError> {
        let task = {
            let _guard = self.writes.lock().await;
            let patch = TaskPatch::new(task_id)
                .status(TaskStatus::Success)
                .progress(1.0)
                .ended_at(Utc::now());
            self.transition(task_id, patch).await?
        };
        let device = self.device_for(&task).await;
        self.events.log_task_complete(&task, device.as_ref());
        Ok(task)
    }

    pub async fn fail(&self, task_id: &str, error: &str) -> Result<Task, TaskError> {
        let task = {
            let _guard = self.writes.lock().await;
            let patch = TaskPatch::new(task_id)
                .status(TaskStatus::Failed)
                .error(error)
                .ended_at(Utc::now());
            self.transition(task_id, patch).await?
        };
        let device = self.device_for(&task).await;
        self.events.log_task_fail(&task, device.as_ref());
        Ok(task)
    }

    /// Persist a cancellation. `user_id` is `None` for system-initiated cancels.
    pub async fn cancel(&self, task_id: &str, user_id: Option<&str>) -> Result<Task, TaskError> {
        let task = {
            let _guard = self.writes.lock().await;
            let patch = TaskPatch::new(task_id)
                .status(TaskStatus::Canceled)
                .ended_at(Utc::now())
                .user(user_id.map(str::to_string));
            self.transition(task_id, patch).await?
        };
        let device = self.device_for(&task).await;
        self.events.log_task_cancel(&task, device.as_ref(), user_id);
        Ok(task)
    }
}

#[async_trait]
impl TaskReporter for TaskLifecycle {
    async fn start_task(&self, task_id: &str) -> Result<Task, TaskError> {
        self.start(task_id).await
    }

    async fn update_progress(&self, task_id: &str, progress: f64) -> Result<Task, TaskError> {
        TaskLifecycle::update_progress(self, task_id, progress).await
    }

    async fn complete_task(&self, task_id: &str) -> Result<Task, TaskError> {
        self.complete(task_id).await
    }

    async fn fail_task(&self, task_id: &str, error: &str) -> Result<Task, TaskError> {
        self.fail(task_id, error).await
    }
}
