use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::lifecycle::{TaskError, TaskLifecycle, TaskReporter};
use super::queue::{CancelOutcome, QueueRoute};
use crate::model::{Task, TaskFilter, TaskStatus};

/// What `start_queue` did with the records it found.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    /// Tasks interrupted by the previous run and canceled on the system's behalf.
    pub canceled: Vec<String>,
    /// Queued tasks put back on their queues, oldest first.
    pub requeued: Vec<String>,
}

/// Routes tasks to queues and owns every durable status transition.
pub struct TaskManager {
    lifecycle: Arc<TaskLifecycle>,
    queues: Vec<Arc<dyn QueueRoute>>,
    // serializes admission (intake, recovery) against cancellation
    admission: Mutex<()>,
}

impl TaskManager {
    pub fn new(lifecycle: Arc<TaskLifecycle>) -> Self {
        Self {
            lifecycle,
            queues: Vec::new(),
            admission: Mutex::new(()),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueRoute>) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn lifecycle(&self) -> &Arc<TaskLifecycle> {
        &self.lifecycle
    }

    fn route(&self, task: &Task) -> Result<&Arc<dyn QueueRoute>, TaskError> {
        self.queues
            .iter()
            .find(|q| q.can_process(task))
            .ok_or_else(|| TaskError::Unroutable {
                id: task.id.clone(),
                kind: task.kind.to_string(),
            })
    }

    fn is_admitted(&self, task_id: &str) -> bool {
        self.queues.iter().any(|q| q.contains(task_id))
    }

    /// Hand a task to the first queue that claims it.
    pub async fn enqueue_task(&self, task: &Task) -> Result<(), TaskError> {
        let queue = self.route(task)?;
        queue.enqueue_task(task).await?;
        tracing::info!(task_id = %task.id, queue = queue.name(), device_id = %task.device_id(), "task enqueued");
        self.lifecycle.events().log_task_enqueued(task);
        Ok(())
    }

    /// Cancel a live task and persist the cancellation.
    ///
    /// `user_id` is recorded as the canceling user; `None` marks a system cancel.
    pub async fn cancel_task(&self, task: &Task, user_id: Option<&str>) -> Result<Task, TaskError> {
        let _admission = self.admission.lock().await;
        self.cancel_locked(task, user_id).await
    }

    async fn cancel_locked(&self, task: &Task, user_id: Option<&str>) -> Result<Task, TaskError> {
        let current = self.lifecycle.load(&task.id).await?;
        if current.status.is_terminal() {
            return Err(TaskError::InvalidTransition {
                id: task.id.clone(),
                from: current.status,
                to: TaskStatus::Canceled,
            });
        }
        let outcome = match self.route(&current) {
            Ok(queue) => queue
                .cancel_task(&current)
                .await
                .unwrap_or(CancelOutcome::Unknown),
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "canceling task without a queue");
                CancelOutcome::Unknown
            }
        };
        let canceled = self.lifecycle.cancel(&task.id, user_id).await?;
        tracing::info!(
            task_id = %task.id,
            ?outcome,
            initiator = user_id.unwrap_or("system"),
            "task canceled"
        );
        Ok(canceled)
    }

    pub async fn start_task(&self, task_id: &str) -> Result<Task, TaskError> {
        self.lifecycle.start(task_id).await
    }

    pub async fn update_progress(&self, task_id: &str, progress: f64) -> Result<Task, TaskError> {
        self.lifecycle.update_progress(task_id, progress).await
    }

    pub async fn complete_task(&self, task_id: &str) -> Result<Task, TaskError> {
        self.lifecycle.complete(task_id).await
    }

    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<Task, TaskError> {
        self.lifecycle.fail(task_id, error).await
    }

    /// Startup recovery.
    ///
    /// Tasks left in progress by a previous run are canceled as the system;
    /// queued ones are re-enqueued in creation order.
    pub async fn start_queue(&self) -> Result<RecoveryReport, TaskError> {
        let _admission = self.admission.lock().await;
        let mut report = RecoveryReport::default();

        let interrupted = self
            .lifecycle
            .tasks()
            .find_all(&TaskFilter::with_statuses(&[TaskStatus::InProgress]))
            .await?;
        for task in interrupted {
            match self.cancel_locked(&task, None).await {
                Ok(_) => report.canceled.push(task.id.clone()),
                Err(err) => {
                    tracing::warn!(task_id = %task.id, error = %err, "failed to cancel interrupted task")
                }
            }
        }

        let mut queued = self
            .lifecycle
            .tasks()
            .find_all(&TaskFilter::with_statuses(&[TaskStatus::Queued]))
            .await?;
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for task in queued {
            self.enqueue_task(&task).await?;
            report.requeued.push(task.id.clone());
        }

        tracing::info!(
            canceled = report.canceled.len(),
            requeued = report.requeued.len(),
            "task queues recovered"
        );
        Ok(report)
    }

    /// Admit queued tasks that were persisted by another process.
    pub async fn enqueue_pending(&self) -> Result<Vec<String>, TaskError> {
        let _admission = self.admission.lock().await;
        let mut queued = self
            .lifecycle
            .tasks()
            .find_all(&TaskFilter::with_statuses(&[TaskStatus::Queued]))
            .await?;
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut admitted = Vec::new();
        for task in queued {
            if self.is_admitted(&task.id) {
                continue;
            }
            match self.enqueue_task(&task).await {
                Ok(()) => admitted.push(task.id.clone()),
                Err(err @ TaskError::Unroutable { .. }) => {
                    tracing::warn!(task_id = %task.id, error = %err, "task cannot be routed; canceling it");
                    self.lifecycle.cancel(&task.id, None).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(admitted)
    }

    pub fn pause_queues(&self) {
        for queue in &self.queues {
            queue.pause();
        }
    }

    pub fn resume_queues(&self) {
        for queue in &self.queues {
            queue.resume();
        }
    }
}

#[async_trait]
impl TaskReporter for TaskManager {
    async fn start_task(&self, task_id: &str) -> Result<Task, TaskError> {
        TaskManager::start_task(self, task_id).await
    }

    async fn update_progress(&self, task_id: &str, progress: f64) -> Result<Task, TaskError> {
        TaskManager::update_progress(self, task_id, progress).await
    }

    async fn complete_task(&self, task_id: &str) -> Result<Task, TaskError> {
        TaskManager::complete_task(self, task_id).await
    }

    async fn fail_task(&self, task_id: &str, error: &str) -> Result<Task, TaskError> {
        TaskManager::fail_task(self, task_id, error).await
    }
}
